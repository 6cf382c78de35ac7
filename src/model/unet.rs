use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::Initializer;
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

use crate::error::{Error, Result};
use crate::model::blocks::{center_crop, reflect_pad, DoubleConv, UpConv};
use crate::model::geometry::{Geometry, Padding};
use crate::training::config::NetworkConfig;

/// How a decoder stage combines the cropped skip feature with its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipMerge {
    /// `[skip, upsampled]` along the channel axis.
    Concat,
    /// Elementwise sum (FusionNet style).
    Sum,
}

/// Encoder features waiting for their decoder stage.
///
/// Pushed in encoder order and popped in reverse: the deepest encoder stage
/// feeds the first decoder stage.
struct SkipStack<B: Backend> {
    features: Vec<Tensor<B, 4>>,
}

impl<B: Backend> SkipStack<B> {
    fn with_capacity(stages: usize) -> Self {
        Self {
            features: Vec::with_capacity(stages),
        }
    }

    fn push(&mut self, feature: Tensor<B, 4>) {
        self.features.push(feature);
    }

    /// Pops the latest skip feature, center-cropped to `height x width`.
    fn pop_cropped(&mut self, height: usize, width: usize, channels: usize) -> Tensor<B, 4> {
        let skip = self
            .features
            .pop()
            .expect("decoder consumed more skip features than the encoder produced");
        let [_, skip_channels, _, _] = skip.dims();
        assert_eq!(
            skip_channels, channels,
            "skip feature channels do not match the upsampled feature"
        );
        center_crop(skip, height, width)
    }

    fn len(&self) -> usize {
        self.features.len()
    }
}

#[derive(Debug, Clone)]
pub struct UNetConfig {
    pub in_channels: usize,
    pub base_width: usize,
    pub geometry: Geometry,
    pub skip_merge: SkipMerge,
    pub residual: bool,
}

impl UNetConfig {
    /// Builds the network, checking geometry and channel progression first.
    pub fn init<B: Backend>(&self, device: &B::Device, config: &NetworkConfig) -> Result<UNet<B>> {
        let geometry = self.geometry;
        geometry.verify()?;
        if geometry.pad >= geometry.output_size {
            return Err(Error::Geometry(format!(
                "reflect padding {} needs a patch larger than {}",
                geometry.pad, geometry.output_size
            )));
        }
        if self.base_width == 0 {
            return Err(Error::InvalidConfig("base width must be positive".to_string()));
        }
        if self.residual && geometry.padding == Padding::Valid {
            return Err(Error::InvalidConfig(
                "residual double convs need same padding".to_string(),
            ));
        }

        let stages = geometry.stage_count;
        let mut encoder = Vec::with_capacity(stages);
        let mut skip_widths = Vec::with_capacity(stages);
        let mut channels = self.in_channels;
        for stage in 0..stages {
            let width = self.base_width << stage;
            encoder.push(DoubleConv::new(
                device,
                channels,
                width,
                geometry.padding,
                self.residual,
                config,
            ));
            skip_widths.push(width);
            channels = width;
        }

        let max_width = self.base_width << stages;
        let bottleneck = DoubleConv::new(
            device,
            channels,
            max_width,
            geometry.padding,
            self.residual,
            config,
        );
        channels = max_width;

        let mut up = Vec::with_capacity(stages);
        let mut decoder = Vec::with_capacity(stages);
        for stage in 0..stages {
            let width = max_width >> (stage + 1);
            let skip = skip_widths.pop().ok_or_else(|| {
                Error::Geometry(format!("no skip feature for decoder stage {}", stage))
            })?;
            if skip != width {
                return Err(Error::ChannelMismatch {
                    stage,
                    skip,
                    upsampled: width,
                });
            }
            up.push(UpConv::new(device, channels, width, config));
            let merged = match self.skip_merge {
                SkipMerge::Concat => skip + width,
                SkipMerge::Sum => width,
            };
            decoder.push(DoubleConv::new(
                device,
                merged,
                width,
                geometry.padding,
                self.residual,
                config,
            ));
            channels = width;
        }

        let head = Conv2dConfig::new([channels, 1], [1, 1])
            .with_initializer(Initializer::Normal {
                mean: 0.0,
                std: config.init_stddev,
            })
            .init(device);

        log::info!(
            "UNet: {} stages, widths {}..{}, input {} -> output {} (pad {}), {:?} skips",
            stages,
            self.base_width,
            max_width,
            geometry.input_size,
            geometry.output_size,
            geometry.pad,
            self.skip_merge
        );

        Ok(UNet {
            encoder,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            bottleneck,
            up,
            decoder,
            head,
            pad: geometry.pad,
            output_size: geometry.output_size,
            in_channels: self.in_channels,
            sum_skips: self.skip_merge == SkipMerge::Sum,
        })
    }
}

#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    encoder: Vec<DoubleConv<B>>,
    pool: MaxPool2d,
    bottleneck: DoubleConv<B>,
    up: Vec<UpConv<B>>,
    decoder: Vec<DoubleConv<B>>,
    head: Conv2d<B>,
    pad: usize,
    output_size: usize,
    in_channels: usize,
    sum_skips: bool,
}

impl<B: Backend> UNet<B> {
    /// Raw logits `[N, 1, P, P]` for an image batch `[N, C, P, P]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, height, width] = images.dims();
        assert_eq!(channels, self.in_channels, "unexpected input channel count");
        assert!(
            height == self.output_size && width == self.output_size,
            "network expects {0}x{0} patches, got {1}x{2}",
            self.output_size,
            height,
            width
        );

        let mut x = reflect_pad(images, self.pad);
        let mut skips = SkipStack::with_capacity(self.encoder.len());

        for block in &self.encoder {
            x = block.forward(x);
            skips.push(x.clone());
            x = self.pool.forward(x);
        }
        assert_eq!(skips.len(), self.encoder.len());

        x = self.bottleneck.forward(x);

        for (up, block) in self.up.iter().zip(&self.decoder) {
            x = up.forward(x);
            let [_, _, h, w] = x.dims();
            let skip = skips.pop_cropped(h, w, up.out_channels());
            x = if self.sum_skips {
                skip + x
            } else {
                Tensor::cat(vec![skip, x], 1)
            };
            x = block.forward(x);
        }
        assert_eq!(skips.len(), 0, "unconsumed skip features after decoding");

        self.head.forward(x)
    }

    /// Sigmoid probabilities with the same spatial size as the input.
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        sigmoid(self.forward(images))
    }

    /// Mean over conv layers of `weight * ||w||^2 / 2`. The 1x1 head is not regularized.
    pub fn regularization(&self, weight: f64) -> Tensor<B, 1> {
        let mut terms: Vec<Tensor<B, 1>> = Vec::new();
        for block in self.encoder.iter().chain([&self.bottleneck]).chain(&self.decoder) {
            terms.extend(block.l2_terms());
        }
        terms.extend(self.up.iter().map(|up| up.l2()));
        Tensor::cat(terms, 0).mean() * weight
    }

    pub fn patch_size(&self) -> usize {
        self.output_size
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn stage_count(&self) -> usize {
        self.encoder.len()
    }

    pub fn device(&self) -> B::Device {
        self.head.weight.device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn config(stages: usize, padding: Padding, output: usize) -> UNetConfig {
        UNetConfig {
            in_channels: 3,
            base_width: 4,
            geometry: Geometry::new(output, stages, padding).unwrap(),
            skip_merge: SkipMerge::Concat,
            residual: false,
        }
    }

    #[test]
    fn small_valid_unet_keeps_patch_size() {
        let device = Default::default();
        let net: UNet<TestBackend> = config(2, Padding::Valid, 28)
            .init(&device, &NetworkConfig::default())
            .unwrap();
        let images = Tensor::<TestBackend, 4>::random([2, 3, 28, 28], Distribution::Default, &device);
        assert_eq!(net.forward(images.clone()).dims(), [2, 1, 28, 28]);

        let probs: Vec<f32> = net.predict(images).into_data().to_vec().unwrap();
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn residual_requires_same_padding() {
        let mut cfg = config(1, Padding::Valid, 28);
        cfg.residual = true;
        let result = cfg.init::<TestBackend>(&Default::default(), &NetworkConfig::default());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn sum_merge_with_same_padding() {
        let device = Default::default();
        let mut cfg = config(2, Padding::Same, 16);
        cfg.skip_merge = SkipMerge::Sum;
        cfg.residual = true;
        let net: UNet<TestBackend> = cfg.init(&device, &NetworkConfig::default()).unwrap();
        let images = Tensor::<TestBackend, 4>::random([1, 3, 16, 16], Distribution::Default, &device);
        assert_eq!(net.forward(images).dims(), [1, 1, 16, 16]);
    }

    #[test]
    fn regularization_is_a_positive_scalar() {
        let device = Default::default();
        let net: UNet<TestBackend> = config(1, Padding::Valid, 28)
            .init(&device, &NetworkConfig::default())
            .unwrap();
        let penalty: f32 = net.regularization(0.001).into_scalar().elem();
        assert!(penalty > 0.0);
    }
}
