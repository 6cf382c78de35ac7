use burn::prelude::*;
use burn::tensor::TensorData;

use super::window::{sliding_windows, Window};
use crate::error::{Error, Result};
use crate::model::UNet;
use crate::training::config::InferenceConfig;
use crate::types::{Image, ProbabilityMap};

/// Anything that maps a batch of square patches to per-pixel confidences.
///
/// `patches` is `[count, channels, patch, patch]` row-major; the result is
/// `[count, 1, patch, patch]`.
pub trait PatchPredictor {
    fn patch_size(&self) -> usize;

    fn predict_patches(&self, patches: Vec<f32>, count: usize, channels: usize) -> Result<Vec<f32>>;
}

impl<B: Backend> PatchPredictor for UNet<B> {
    fn patch_size(&self) -> usize {
        UNet::patch_size(self)
    }

    fn predict_patches(&self, patches: Vec<f32>, count: usize, channels: usize) -> Result<Vec<f32>> {
        let patch = UNet::patch_size(self);
        if channels != self.in_channels() {
            return Err(Error::Window(format!(
                "image has {} channels, network expects {}",
                channels,
                self.in_channels()
            )));
        }
        let input = Tensor::<B, 4>::from_data(
            TensorData::new(patches, [count, channels, patch, patch]),
            &self.device(),
        );
        self.predict(input)
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| Error::Tensor(format!("{:?}", e)))
    }
}

/// Writes `output` (a `patch x patch` confidence tile) into `merged`,
/// keeping the larger value wherever windows overlap.
pub fn merge_window(merged: &mut ProbabilityMap, window: &Window, output: &[f32], patch: usize) {
    let (rows, cols) = window.indices();
    for (py, y) in rows.enumerate() {
        for (px, x) in cols.clone().enumerate() {
            let value = output[py * patch + px];
            let cell = merged.get_pixel_mut(x as u32, y as u32);
            if value > cell[0] {
                cell[0] = value;
            }
        }
    }
}

/// Sliding-window inference over arbitrarily large images.
#[derive(Debug, Clone)]
pub struct InferenceEngine {
    pub overlap: f64,
    /// Windows per forward pass.
    pub batch_size: usize,
}

impl InferenceEngine {
    pub fn new(overlap: f64, batch_size: usize) -> Result<Self> {
        if !(0.0..1.0).contains(&overlap) {
            return Err(Error::InvalidConfig(format!("overlap {} outside [0, 1)", overlap)));
        }
        if batch_size == 0 {
            return Err(Error::InvalidConfig("inference batch size must be positive".to_string()));
        }
        Ok(Self {
            overlap,
            batch_size,
        })
    }

    pub fn from_config(config: &InferenceConfig) -> Result<Self> {
        Self::new(config.overlap, config.batch_size)
    }

    /// Full-resolution probability map for `image`.
    pub fn infer<P: PatchPredictor + ?Sized>(&self, predictor: &P, image: &Image) -> Result<ProbabilityMap> {
        let patch = predictor.patch_size();
        let (height, width) = (image.height(), image.width());
        let windows = sliding_windows(height, width, patch, self.overlap)?;
        log::debug!(
            "inference on {}x{} image: {} windows of {}",
            height,
            width,
            windows.len(),
            patch
        );

        let mut merged = ProbabilityMap::new(width as u32, height as u32);
        let tile = patch * patch;
        for chunk in windows.chunks(self.batch_size) {
            let mut patches = Vec::with_capacity(chunk.len() * image.channels() * tile);
            for window in chunk {
                image.write_patch(window.x, window.y, patch, &mut patches);
            }
            let outputs = predictor.predict_patches(patches, chunk.len(), image.channels())?;
            if outputs.len() != chunk.len() * tile {
                return Err(Error::Window(format!(
                    "predictor returned {} values for {} windows of {}x{}",
                    outputs.len(),
                    chunk.len(),
                    patch,
                    patch
                )));
            }
            for (window, output) in chunk.iter().zip(outputs.chunks(tile)) {
                merge_window(&mut merged, window, output, patch);
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Emits the mean of each patch's first channel everywhere in the tile.
    struct MeanPredictor {
        patch: usize,
        calls: RefCell<usize>,
    }

    impl PatchPredictor for MeanPredictor {
        fn patch_size(&self) -> usize {
            self.patch
        }

        fn predict_patches(&self, patches: Vec<f32>, count: usize, channels: usize) -> Result<Vec<f32>> {
            *self.calls.borrow_mut() += 1;
            let tile = self.patch * self.patch;
            let mut out = Vec::with_capacity(count * tile);
            for patch in patches.chunks(channels * tile) {
                let mean = patch[..tile].iter().sum::<f32>() / tile as f32;
                out.extend(std::iter::repeat(mean).take(tile));
            }
            Ok(out)
        }
    }

    #[test]
    fn overlapping_windows_keep_the_maximum() {
        let mut merged = ProbabilityMap::new(3, 1);
        let left = Window { x: 0, y: 0, width: 2, height: 1 };
        let right = Window { x: 1, y: 0, width: 2, height: 1 };
        merge_window(&mut merged, &left, &[0.8, 0.8], 2);
        merge_window(&mut merged, &right, &[0.3, 0.3], 2);
        assert_eq!(merged.into_raw(), vec![0.8, 0.8, 0.3]);

        let mut merged = ProbabilityMap::new(3, 1);
        merge_window(&mut merged, &left, &[0.2, 0.2], 2);
        merge_window(&mut merged, &right, &[0.6, 0.6], 2);
        assert_eq!(merged.into_raw(), vec![0.2, 0.6, 0.6]);
    }

    #[test]
    fn infer_covers_the_full_image_in_batches() {
        let mut data = vec![0.0f32; 8 * 8];
        for y in 0..8 {
            for x in 4..8 {
                data[y * 8 + x] = 1.0;
            }
        }
        let image = Image::new(8, 8, 1, data).unwrap();
        let predictor = MeanPredictor {
            patch: 4,
            calls: RefCell::new(0),
        };
        let engine = InferenceEngine::new(0.5, 2).unwrap();
        let merged = engine.infer(&predictor, &image).unwrap();

        assert_eq!(merged.dimensions(), (8, 8));
        // 3 x 3 windows in batches of 2
        assert_eq!(*predictor.calls.borrow(), 5);
        // column 2 is covered by a half-bright window (x = 2) and dark ones
        assert_eq!(merged.get_pixel(2, 0)[0], 0.5);
        assert_eq!(merged.get_pixel(0, 0)[0], 0.0);
        assert_eq!(merged.get_pixel(7, 7)[0], 1.0);
    }

    #[test]
    fn small_image_is_zero_padded_to_the_patch() {
        let image = Image::new(2, 2, 1, vec![1.0; 4]).unwrap();
        let predictor = MeanPredictor {
            patch: 4,
            calls: RefCell::new(0),
        };
        let merged = InferenceEngine::new(0.5, 8).unwrap().infer(&predictor, &image).unwrap();
        assert_eq!(merged.into_raw(), vec![0.25; 4]);
    }
}
