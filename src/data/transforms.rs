use image::imageops;
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use rand::Rng;

use crate::data::dataset::CellSample;
use crate::error::{Error, Result};
use crate::types::{Image, InstanceMask};

/// Augmentation and target preparation for one data flow.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub patch_size: usize,
    /// Upscale so the short edge reaches `patch_size`.
    pub resize_if_small: bool,
    pub random_crop: bool,
    /// Random left-right and up-down flips.
    pub flips: bool,
    /// Boundary weight for the loss map; `None` disables weighting.
    pub weight_map: Option<f32>,
    /// Strength of the random brightness, contrast and saturation shift.
    pub color_jitter: Option<f32>,
    /// Rescale so the mean instance side length approaches this many pixels.
    pub instance_size: Option<f32>,
}

/// Bounds on the rescaling done by [`normalize_instance_size`].
pub const MIN_SIZE_SCALE: f64 = 0.5;
pub const MAX_SIZE_SCALE: f64 = 2.0;

/// The four flows a model is fed with.
#[derive(Debug, Clone)]
pub struct InputFlows {
    pub train: Pipeline,
    /// Random patches for the validation loss.
    pub valid: Pipeline,
    /// Whole images for the validation metric.
    pub valid_full: Pipeline,
    pub test: Pipeline,
}

/// Network-ready patch: image plus foreground target and optional weights,
/// each `patch x patch` per channel.
#[derive(Debug, Clone)]
pub struct SegmentationInput {
    pub image: Image,
    pub mask: Vec<f32>,
    pub weights: Option<Vec<f32>>,
}

impl Pipeline {
    /// Resize-if-small only; the image keeps its full extent.
    pub fn full_image(patch_size: usize) -> Self {
        Self {
            patch_size,
            resize_if_small: true,
            random_crop: false,
            flips: false,
            weight_map: None,
            color_jitter: None,
            instance_size: None,
        }
    }

    /// Photometric and geometric augmentation; masks follow the image.
    pub fn augment<R: Rng + ?Sized>(&self, mut sample: CellSample, rng: &mut R) -> Result<CellSample> {
        if let Some(strength) = self.color_jitter {
            sample.image = random_color(&sample.image, strength, rng)?;
        }
        if let Some(target) = self.instance_size {
            sample = normalize_instance_size(sample, target)?;
        }
        if self.resize_if_small {
            sample = resize_sample_if_small(sample, self.patch_size)?;
        }
        if self.random_crop {
            sample = random_crop(sample, self.patch_size, rng)?;
        }
        if self.flips {
            if rng.gen_bool(0.5) {
                sample.image.flip_horizontal();
                for mask in sample.masks.iter_mut() {
                    *mask = InstanceMask::from_gray(imageops::flip_horizontal(mask.as_gray()));
                }
            }
            if rng.gen_bool(0.5) {
                sample.image.flip_vertical();
                for mask in sample.masks.iter_mut() {
                    *mask = InstanceMask::from_gray(imageops::flip_vertical(mask.as_gray()));
                }
            }
        }
        Ok(sample)
    }

    /// Augments a sample and builds its training targets.
    pub fn apply<R: Rng + ?Sized>(&self, sample: CellSample, rng: &mut R) -> Result<SegmentationInput> {
        let sample = self.augment(sample, rng)?;
        let (height, width) = sample.size();
        let (mask, weights) = match self.weight_map {
            Some(boundary) => {
                let (mask, weights) = eroded_targets(&sample.masks, width, height, boundary);
                (mask, Some(weights))
            }
            None => (union_mask(&sample.masks, width, height), None),
        };
        Ok(SegmentationInput {
            image: sample.image,
            mask,
            weights,
        })
    }
}

/// Upscales so that `min(height, width) >= size`, keeping the aspect ratio.
pub fn resize_short_edge_if_small(image: &Image, size: usize) -> Result<Image> {
    match short_edge_target(image.height(), image.width(), size) {
        Some((height, width)) => image.resize(height, width),
        None => Ok(image.clone()),
    }
}

/// [`resize_short_edge_if_small`] applied to the image and its masks.
pub fn resize_sample_if_small(sample: CellSample, size: usize) -> Result<CellSample> {
    let (height, width) = sample.size();
    let Some((new_h, new_w)) = short_edge_target(height, width, size) else {
        return Ok(sample);
    };
    log::debug!("{}: resizing {}x{} -> {}x{}", sample.id, height, width, new_h, new_w);
    resize_sample(sample, new_h, new_w)
}

fn resize_sample(sample: CellSample, height: usize, width: usize) -> Result<CellSample> {
    Ok(CellSample {
        image: sample.image.resize(height, width)?,
        masks: sample
            .masks
            .iter()
            .map(|m| m.resize(width as u32, height as u32))
            .filter(|m| !m.is_empty())
            .collect(),
        id: sample.id,
    })
}

/// Rescales image and masks so that the mean of `sqrt(area)` over the
/// instances moves to `target`. The factor is clamped to
/// [`MIN_SIZE_SCALE`]..=[`MAX_SIZE_SCALE`]; unlabeled samples pass through.
pub fn normalize_instance_size(sample: CellSample, target: f32) -> Result<CellSample> {
    let sides: Vec<f64> = sample
        .masks
        .iter()
        .filter(|m| !m.is_empty())
        .map(|m| (m.area() as f64).sqrt())
        .collect();
    if sides.is_empty() || target <= 0.0 {
        return Ok(sample);
    }
    let mean = sides.iter().sum::<f64>() / sides.len() as f64;
    let scale = (target as f64 / mean).clamp(MIN_SIZE_SCALE, MAX_SIZE_SCALE);
    if (scale - 1.0).abs() < 0.05 {
        return Ok(sample);
    }

    let (height, width) = sample.size();
    let scaled = |dim: usize| ((dim as f64 * scale).round() as usize).max(1);
    log::debug!("{}: mean instance side {:.1}, scaling by {:.2}", sample.id, mean, scale);
    resize_sample(sample, scaled(height), scaled(width))
}

/// Random brightness offset, contrast around the image mean and, for color
/// images, saturation around the per-pixel gray level. Each factor is drawn
/// within `strength` of identity; the result is clamped to `[0, 1]`.
pub fn random_color<R: Rng + ?Sized>(image: &Image, strength: f32, rng: &mut R) -> Result<Image> {
    if strength <= 0.0 {
        return Ok(image.clone());
    }
    let brightness = rng.gen_range(-strength..=strength);
    let contrast = rng.gen_range(1.0 - strength..=1.0 + strength);
    let saturation = rng.gen_range(1.0 - strength..=1.0 + strength);

    let (height, width, channels) = (image.height(), image.width(), image.channels());
    let plane = height * width;
    let mut data = image.data().to_vec();
    if channels == 3 {
        for i in 0..plane {
            let gray = (data[i] + data[plane + i] + data[2 * plane + i]) / 3.0;
            for c in 0..3 {
                let v = &mut data[c * plane + i];
                *v = gray + (*v - gray) * saturation;
            }
        }
    }
    let mean = data.iter().sum::<f32>() / data.len() as f32;
    for v in data.iter_mut() {
        *v = ((*v - mean) * contrast + mean + brightness).clamp(0.0, 1.0);
    }
    Image::new(height, width, channels, data)
}

fn short_edge_target(height: usize, width: usize, size: usize) -> Option<(usize, usize)> {
    let short = height.min(width);
    if short >= size || short == 0 {
        return None;
    }
    let scale = size as f64 / short as f64;
    let scaled = |dim: usize| ((dim as f64 * scale).round() as usize).max(size);
    Some((scaled(height), scaled(width)))
}

/// Uniformly placed `size x size` crop of image and masks.
pub fn random_crop<R: Rng + ?Sized>(sample: CellSample, size: usize, rng: &mut R) -> Result<CellSample> {
    let (height, width) = sample.size();
    if height < size || width < size {
        return Err(Error::Window(format!(
            "{}: cannot crop {} from {}x{}",
            sample.id, size, height, width
        )));
    }
    let y = rng.gen_range(0..=height - size);
    let x = rng.gen_range(0..=width - size);
    let image = sample.image.crop(y, x, size, size)?;
    let masks = sample
        .masks
        .iter()
        .map(|m| {
            InstanceMask::from_gray(
                imageops::crop_imm(m.as_gray(), x as u32, y as u32, size as u32, size as u32)
                    .to_image(),
            )
        })
        .filter(|m| !m.is_empty())
        .collect();
    Ok(CellSample {
        id: sample.id,
        image,
        masks,
    })
}

/// Binary foreground of all instances, row-major `height x width`.
pub fn union_mask(masks: &[InstanceMask], width: usize, height: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; width * height];
    for mask in masks {
        for (x, y, p) in mask.as_gray().enumerate_pixels() {
            if p[0] != 0 {
                out[y as usize * width + x as usize] = 1.0;
            }
        }
    }
    out
}

/// Targets with every instance shrunk by one pixel, so touching objects
/// stay apart in the label. The removed rim gets `boundary` weight, the rest 1.
pub fn eroded_targets(
    masks: &[InstanceMask],
    width: usize,
    height: usize,
    boundary: f32,
) -> (Vec<f32>, Vec<f32>) {
    let mut target = vec![0.0f32; width * height];
    for mask in masks {
        let eroded = erode(mask.as_gray(), Norm::LInf, 1);
        for (x, y, p) in eroded.enumerate_pixels() {
            if p[0] != 0 {
                target[y as usize * width + x as usize] = 1.0;
            }
        }
    }
    let full = union_mask(masks, width, height);
    let weights = full
        .iter()
        .zip(&target)
        .map(|(&f, &t)| if f > 0.0 && t == 0.0 { boundary } else { 1.0 })
        .collect();
    (target, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn square(size: u32, x: u32, y: u32, side: u32) -> InstanceMask {
        InstanceMask::from_pixels(
            size,
            size,
            (y..y + side).flat_map(move |py| (x..x + side).map(move |px| (px, py))),
        )
    }

    fn sample(size: usize, masks: Vec<InstanceMask>) -> CellSample {
        CellSample {
            id: "s".to_string(),
            image: Image::zeros(size, size, 3).unwrap(),
            masks,
        }
    }

    #[test]
    fn small_images_grow_to_the_patch() {
        let image = Image::zeros(100, 150, 3).unwrap();
        let resized = resize_short_edge_if_small(&image, 228).unwrap();
        assert_eq!((resized.height(), resized.width()), (228, 342));

        let large = Image::zeros(300, 400, 1).unwrap();
        let same = resize_short_edge_if_small(&large, 228).unwrap();
        assert_eq!((same.height(), same.width()), (300, 400));
    }

    #[test]
    fn train_flow_yields_patch_sized_targets() {
        let pipeline = Pipeline {
            patch_size: 16,
            resize_if_small: true,
            random_crop: true,
            flips: true,
            weight_map: Some(5.0),
            color_jitter: Some(0.2),
            instance_size: Some(6.0),
        };
        let input = pipeline
            .apply(sample(12, vec![square(12, 2, 2, 6)]), &mut StdRng::seed_from_u64(3))
            .unwrap();
        assert_eq!((input.image.height(), input.image.width()), (16, 16));
        assert_eq!(input.mask.len(), 256);
        let weights = input.weights.unwrap();
        assert_eq!(weights.len(), 256);
        assert!(weights.iter().any(|&w| w == 5.0));
        assert!(input.mask.iter().any(|&m| m == 1.0));
    }

    #[test]
    fn erosion_separates_touching_instances() {
        let left = square(8, 0, 0, 4);
        let right = square(8, 4, 0, 4);
        let (target, weights) = eroded_targets(&[left, right], 8, 8, 5.0);
        // column 3 and 4 are the shared border
        assert_eq!(target[8 + 3], 0.0);
        assert_eq!(target[8 + 4], 0.0);
        assert_eq!(weights[8 + 3], 5.0);
        assert_eq!(target[8 + 1], 1.0);
        assert_eq!(weights[8 * 6], 1.0);
    }

    #[test]
    fn color_jitter_stays_in_range() {
        let data: Vec<f32> = (0..3 * 64).map(|i| (i % 17) as f32 / 16.0).collect();
        let image = Image::new(8, 8, 3, data).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let jittered = random_color(&image, 0.3, &mut rng).unwrap();
        assert_eq!(jittered.channels(), 3);
        assert!(jittered.data().iter().all(|v| (0.0..=1.0).contains(v)));
        assert_ne!(jittered.data(), image.data());
        assert_eq!(random_color(&image, 0.0, &mut rng).unwrap(), image);
    }

    #[test]
    fn small_instances_are_scaled_up_to_the_target() {
        let scaled = normalize_instance_size(sample(16, vec![square(16, 2, 2, 4)]), 8.0).unwrap();
        assert_eq!(scaled.size(), (32, 32));
        assert_eq!(scaled.masks.len(), 1);
        assert_eq!(scaled.masks[0].area(), 64);

        // far from the target: the factor is clamped
        let clamped = normalize_instance_size(sample(16, vec![square(16, 0, 0, 2)]), 40.0).unwrap();
        assert_eq!(clamped.size(), (32, 32));

        let unlabeled = normalize_instance_size(sample(16, vec![]), 8.0).unwrap();
        assert_eq!(unlabeled.size(), (16, 16));
    }

    #[test]
    fn crop_rejects_too_small_images() {
        let result = random_crop(sample(8, vec![]), 16, &mut StdRng::seed_from_u64(0));
        assert!(result.is_err());
    }
}
