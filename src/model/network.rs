use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::transforms::{InputFlows, Pipeline};
use crate::error::{Error, Result};
use crate::inference::{InferenceEngine, InstanceDecoder};
use crate::model::geometry::{Geometry, Padding};
use crate::model::unet::{SkipMerge, UNet, UNetConfig};
use crate::training::config::NetworkConfig;
use crate::types::{Image, InstanceMask};

/// The closed set of trainable segmentation models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Single double conv and a 1x1 head, no down/upsampling.
    Basic,
    /// Same-padding U-Net.
    SimpleUnet,
    /// Valid-padding U-Net with mirror-padded input and cropped skips.
    Unet,
    /// Same-padding U-Net with residual blocks and summed skips.
    SimpleFusion,
}

struct Layout {
    padding: Padding,
    stage_count: usize,
    skip_merge: SkipMerge,
    residual: bool,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Basic,
        ModelKind::SimpleUnet,
        ModelKind::Unet,
        ModelKind::SimpleFusion,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Basic => "basic",
            ModelKind::SimpleUnet => "simple_unet",
            ModelKind::Unet => "unet",
            ModelKind::SimpleFusion => "simple_fusion",
        }
    }

    pub fn default_patch_size(&self) -> usize {
        match self {
            ModelKind::Unet => 228,
            ModelKind::Basic | ModelKind::SimpleUnet | ModelKind::SimpleFusion => 224,
        }
    }

    fn layout(&self, config: &NetworkConfig) -> Layout {
        match self {
            ModelKind::Basic => Layout {
                padding: Padding::Same,
                stage_count: 0,
                skip_merge: SkipMerge::Concat,
                residual: false,
            },
            ModelKind::SimpleUnet => Layout {
                padding: Padding::Same,
                stage_count: config.stage_count,
                skip_merge: SkipMerge::Concat,
                residual: false,
            },
            ModelKind::Unet => Layout {
                padding: Padding::Valid,
                stage_count: config.stage_count,
                skip_merge: SkipMerge::Concat,
                residual: false,
            },
            ModelKind::SimpleFusion => Layout {
                padding: Padding::Same,
                stage_count: config.stage_count,
                skip_merge: SkipMerge::Sum,
                residual: true,
            },
        }
    }

    pub fn geometry(&self, config: &NetworkConfig) -> Result<Geometry> {
        let layout = self.layout(config);
        Geometry::new(config.patch_size(), layout.stage_count, layout.padding)
    }

    /// Builds the network for this model. Geometry and channel errors are fatal here.
    pub fn build<B: Backend>(&self, config: &NetworkConfig, device: &B::Device) -> Result<UNet<B>> {
        log::info!("constructing network model: {}", self.name());
        let layout = self.layout(config);
        UNetConfig {
            in_channels: config.channels(),
            base_width: config.base_width,
            geometry: self.geometry(config)?,
            skip_merge: layout.skip_merge,
            residual: layout.residual,
        }
        .init(device, config)
    }

    /// Data pipelines feeding this model.
    pub fn input_flow(&self, config: &NetworkConfig) -> InputFlows {
        let patch = config.patch_size();
        let weights = config.pixel_weights.then_some(config.boundary_weight);
        InputFlows {
            train: Pipeline {
                patch_size: patch,
                resize_if_small: true,
                random_crop: true,
                flips: true,
                weight_map: weights,
                color_jitter: config.color_jitter,
                instance_size: config.instance_size,
            },
            valid: Pipeline {
                patch_size: patch,
                resize_if_small: true,
                random_crop: true,
                flips: false,
                weight_map: weights,
                color_jitter: None,
                instance_size: None,
            },
            valid_full: Pipeline::full_image(patch),
            test: Pipeline::full_image(patch),
        }
    }

    /// Prepares a full image for [`ModelKind::inference`].
    pub fn preprocess(&self, config: &NetworkConfig, image: &Image) -> Result<Image> {
        crate::data::transforms::resize_short_edge_if_small(image, config.patch_size())
    }

    /// Tiled inference followed by instance decoding.
    pub fn inference<B: Backend>(
        &self,
        network: &UNet<B>,
        engine: &InferenceEngine,
        decoder: &InstanceDecoder,
        image: &Image,
    ) -> Result<Vec<InstanceMask>> {
        let merged = engine.infer(network, image)?;
        Ok(decoder.decode(&merged))
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| Error::InvalidConfig(format!("model name({}) is not valid", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn parses_every_model_name() {
        for kind in ModelKind::ALL {
            assert_eq!(kind.name().parse::<ModelKind>().unwrap(), kind);
        }
        assert!("fusionnet".parse::<ModelKind>().is_err());
    }

    #[test]
    fn every_kind_builds_a_consistent_network() {
        let device = Default::default();
        for kind in ModelKind::ALL {
            let config = NetworkConfig {
                model: kind,
                patch_size: Some(if kind == ModelKind::Unet { 28 } else { 16 }),
                stage_count: 2,
                base_width: 4,
                ..NetworkConfig::default()
            };
            let net = kind.build::<NdArray>(&config, &device).unwrap();
            assert_eq!(net.patch_size(), config.patch_size());
            let expected_stages = if kind == ModelKind::Basic { 0 } else { 2 };
            assert_eq!(net.stage_count(), expected_stages);
        }
    }

    #[test]
    fn unet_rejects_patch_with_odd_intermediate_size() {
        let config = NetworkConfig {
            patch_size: Some(230),
            stage_count: 2,
            ..NetworkConfig::default()
        };
        let result = ModelKind::Unet.build::<NdArray>(&config, &Default::default());
        assert!(matches!(result, Err(Error::Geometry(_))));
    }

    #[test]
    fn unet_rejects_patch_smaller_than_its_mirror_padding() {
        // 20 with three stages needs 44 pixels of padding per side
        let config = NetworkConfig {
            patch_size: Some(20),
            stage_count: 3,
            ..NetworkConfig::default()
        };
        let result = ModelKind::Unet.build::<NdArray>(&config, &Default::default());
        assert!(matches!(result, Err(Error::Geometry(_))));
    }
}
