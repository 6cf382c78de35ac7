//! Patch geometry of the encoder-decoder.
//!
//! With valid convolutions every double conv eats 4 pixels, so the network
//! input must be larger than the requested output. [`compute_input_size`]
//! walks the stack backwards to find that size; [`Geometry::trace`] walks it
//! forwards again so construction can check both agree.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pixels lost by one double conv (two 3x3 valid convolutions).
pub const DOUBLE_CONV_MARGIN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    Valid,
    Same,
}

/// Input size a valid-padding U-Net needs to produce `output_size` pixels.
///
/// Every halving step must see an even size.
pub fn compute_input_size(output_size: usize, stage_count: usize) -> Result<usize> {
    if output_size == 0 {
        return Err(Error::Geometry("output size must be positive".to_string()));
    }
    let mut size = output_size;
    for stage in 0..stage_count {
        if size % 2 != 0 {
            return Err(Error::Geometry(format!(
                "size {} at stage {} is not divisible by 2 (output {}, {} stages)",
                size, stage, output_size, stage_count
            )));
        }
        size = (size + DOUBLE_CONV_MARGIN) / 2;
    }
    size += DOUBLE_CONV_MARGIN;
    for _ in 0..stage_count {
        size = size * 2 + DOUBLE_CONV_MARGIN;
    }
    Ok(size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub output_size: usize,
    pub input_size: usize,
    /// Symmetric reflect padding applied on each side of H and W.
    pub pad: usize,
    pub stage_count: usize,
    pub padding: Padding,
}

impl Geometry {
    pub fn new(output_size: usize, stage_count: usize, padding: Padding) -> Result<Self> {
        let input_size = match padding {
            Padding::Valid => compute_input_size(output_size, stage_count)?,
            Padding::Same => {
                let factor = 1usize << stage_count;
                if output_size == 0 || output_size % factor != 0 {
                    return Err(Error::Geometry(format!(
                        "same-padding output {} must be a positive multiple of {}",
                        output_size, factor
                    )));
                }
                output_size
            }
        };
        let margin = input_size - output_size;
        if margin % 2 != 0 {
            return Err(Error::Geometry(format!(
                "input {} and output {} differ by an odd margin",
                input_size, output_size
            )));
        }
        Ok(Self {
            output_size,
            input_size,
            pad: margin / 2,
            stage_count,
            padding,
        })
    }

    /// Re-derives the output size by simulating the forward pass on `input_size`.
    pub fn trace(&self) -> Result<usize> {
        let margin = match self.padding {
            Padding::Valid => DOUBLE_CONV_MARGIN,
            Padding::Same => 0,
        };
        let shrink = |size: usize, what: &str| {
            size.checked_sub(margin)
                .filter(|s| *s > 0)
                .ok_or_else(|| Error::Geometry(format!("{} collapses at size {}", what, size)))
        };

        let mut size = self.input_size;
        let mut skips = Vec::with_capacity(self.stage_count);
        for stage in 0..self.stage_count {
            size = shrink(size, "encoder double conv")?;
            if size % 2 != 0 {
                return Err(Error::Geometry(format!(
                    "pooling input {} at encoder stage {} is odd",
                    size, stage
                )));
            }
            skips.push(size);
            size /= 2;
        }
        size = shrink(size, "bottleneck")?;
        for stage in 0..self.stage_count {
            size *= 2;
            let skip = skips.pop().ok_or_else(|| {
                Error::Geometry(format!("no skip feature left for decoder stage {}", stage))
            })?;
            if skip < size {
                return Err(Error::Geometry(format!(
                    "skip feature {} smaller than upsampled {} at decoder stage {}",
                    skip, size, stage
                )));
            }
            size = shrink(size, "decoder double conv")?;
        }
        Ok(size)
    }

    /// Fails unless the forward trace lands exactly on `output_size`.
    pub fn verify(&self) -> Result<()> {
        let traced = self.trace()?;
        if traced != self.output_size {
            return Err(Error::Geometry(format!(
                "input {} yields output {}, expected {}",
                self.input_size, traced, self.output_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_size_for_default_patch() {
        assert_eq!(compute_input_size(228, 3).unwrap(), 316);
        assert_eq!(compute_input_size(228, 3).unwrap(), 316);
        assert_eq!(compute_input_size(228, 4).unwrap(), 412);
        assert_eq!(compute_input_size(228, 0).unwrap(), 232);
    }

    #[test]
    fn odd_intermediate_size_is_rejected() {
        // 230 -> 117 is odd at the second halving
        assert!(matches!(compute_input_size(230, 2), Err(Error::Geometry(_))));
        assert!(compute_input_size(0, 1).is_err());
    }

    #[test]
    fn forward_trace_matches_requested_output() {
        for stages in 0..=4 {
            let geometry = Geometry::new(228, stages, Padding::Valid).unwrap();
            assert_eq!((geometry.input_size - 228) % 2, 0);
            assert_eq!(geometry.trace().unwrap(), 228);
        }
        let geometry = Geometry::new(228, 3, Padding::Valid).unwrap();
        assert_eq!(geometry.pad, 44);
    }

    #[test]
    fn same_padding_requires_divisible_patch() {
        let geometry = Geometry::new(224, 3, Padding::Same).unwrap();
        assert_eq!(geometry.input_size, 224);
        assert_eq!(geometry.pad, 0);
        geometry.verify().unwrap();
        assert!(Geometry::new(228, 3, Padding::Same).is_err());
    }
}
