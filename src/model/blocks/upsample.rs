use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer};
use burn::prelude::*;

use super::conv::{elu, l2_penalty};
use crate::training::config::NetworkConfig;

/// Learned 2x upsampling: 2x2 transposed conv with stride 2, batch norm, ELU.
///
/// [B, C_in, H, W] -> [B, C_out, 2H, 2W]
#[derive(Module, Debug)]
pub struct UpConv<B: Backend> {
    deconv: ConvTranspose2d<B>,
    bn: BatchNorm<B, 2>,
    out_channels: usize,
}

impl<B: Backend> UpConv<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            deconv: ConvTranspose2dConfig::new([in_channels, out_channels], [2, 2])
                .with_stride([2, 2])
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
            out_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.deconv.forward(x);
        let x = self.bn.forward(x);
        elu(x)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn l2(&self) -> Tensor<B, 1> {
        l2_penalty(self.deconv.weight.val())
    }
}
