use burn::prelude::*;

use super::unet::UNet;

/// Sigmoid cross-entropy on logits, optionally weighted per pixel,
/// plus the network's L2 penalty.
#[derive(Debug, Clone)]
pub struct SegmentationLoss {
    pub use_weights: bool,
    pub l2_weight: f64,
}

impl SegmentationLoss {
    pub fn new(use_weights: bool, l2_weight: f64) -> Self {
        Self {
            use_weights,
            l2_weight,
        }
    }

    /// Elementwise `max(x, 0) - x * z + ln(1 + exp(-|x|))`.
    pub fn elementwise<B: Backend>(logits: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 4> {
        let softplus = logits.clone().abs().neg().exp().log1p();
        logits.clone().clamp_min(0.0) - logits * targets + softplus
    }

    /// Reduced cross-entropy. Weighted losses are averaged over non-zero weights.
    pub fn cross_entropy<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 4>,
        weights: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 1> {
        let [b, c, h, w] = logits.dims();
        let [tb, tc, th, tw] = targets.dims();
        assert!(
            [b, c, h, w] == [tb, tc, th, tw],
            "logits {:?} and targets {:?} differ in shape",
            [b, c, h, w],
            [tb, tc, th, tw]
        );

        let losses = Self::elementwise(logits, targets);
        match (self.use_weights, weights) {
            (true, Some(weights)) => {
                let nonzero = weights.clone().not_equal_elem(0.0).float().sum().clamp_min(1.0);
                (losses * weights).sum() / nonzero
            }
            (true, None) => {
                log::warn!("pixel weighting enabled but batch carries no weight map");
                losses.mean()
            }
            (false, _) => losses.mean(),
        }
    }

    pub fn compute<B: Backend>(
        &self,
        network: &UNet<B>,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 4>,
        weights: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 1> {
        let data_loss = self.cross_entropy(logits, targets, weights);
        log::debug!("  cross-entropy dims: {:?}", data_loss.dims());
        data_loss + network.regularization(self.l2_weight)
    }
}
