use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, PaddingConfig2d};
use burn::prelude::*;

use crate::model::geometry::Padding;
use crate::training::config::NetworkConfig;

/// Exponential linear unit with `alpha = 1`.
pub fn elu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let negative = x.clone().clamp_max(0.0).exp() - 1.0;
    x.clamp_min(0.0) + negative
}

/// Squared L2 norm of a kernel, halved.
pub fn l2_penalty<B: Backend, const D: usize>(weight: Tensor<B, D>) -> Tensor<B, 1> {
    (weight.clone() * weight).sum() / 2.0
}

/// 3x3 convolution, batch norm, ELU.
#[derive(Module, Debug)]
pub struct ConvUnit<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> ConvUnit<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        padding: Padding,
        config: &NetworkConfig,
    ) -> Self {
        let padding = match padding {
            Padding::Valid => PaddingConfig2d::Valid,
            Padding::Same => PaddingConfig2d::Same,
        };

        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(padding)
                .with_bias(false)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: config.init_stddev,
                })
                .init(device),
            bn: BatchNormConfig::new(out_channels)
                .with_momentum(1.0 - config.bn_decay)
                .with_epsilon(config.bn_epsilon)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        elu(x)
    }

    pub fn l2(&self) -> Tensor<B, 1> {
        l2_penalty(self.conv.weight.val())
    }
}

/// Two conv units with dropout in between.
///
/// With `residual` the output of the first unit is added to the second,
/// which only works when both keep the spatial size (same padding).
#[derive(Module, Debug)]
pub struct DoubleConv<B: Backend> {
    first: ConvUnit<B>,
    dropout: Dropout,
    second: ConvUnit<B>,
    residual: bool,
    out_channels: usize,
}

impl<B: Backend> DoubleConv<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        padding: Padding,
        residual: bool,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            first: ConvUnit::new(device, in_channels, out_channels, padding, config),
            dropout: DropoutConfig::new(1.0 - config.dropout_keep).init(),
            second: ConvUnit::new(device, out_channels, out_channels, padding, config),
            residual,
            out_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let first = self.first.forward(x);
        let second = self.second.forward(self.dropout.forward(first.clone()));
        if self.residual {
            first + second
        } else {
            second
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn l2_terms(&self) -> [Tensor<B, 1>; 2] {
        [self.first.l2(), self.second.l2()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    #[test]
    fn elu_matches_closed_form() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-1.0, 0.0, 2.0], &device);
        let y: Vec<f32> = elu(x).into_data().to_vec().unwrap();
        assert!((y[0] - ((-1.0f32).exp() - 1.0)).abs() < 1e-6);
        assert_eq!(y[1], 0.0);
        assert_eq!(y[2], 2.0);
    }

    #[test]
    fn valid_double_conv_shrinks_by_four() {
        let device = Default::default();
        let config = NetworkConfig::default();
        let block = DoubleConv::<TestBackend>::new(&device, 3, 8, Padding::Valid, false, &config);
        let x = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.5f32; 3 * 12 * 12], [1, 3, 12, 12]),
            &device,
        );
        assert_eq!(block.forward(x).dims(), [1, 8, 8, 8]);
    }
}
