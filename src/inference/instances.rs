//! Turning a merged probability map into separate object masks.
//!
//! Foreground is `p > cutoff`, split into 4-connected components. With the
//! separator enabled, confident cores (`p > cutoff_instance`) act as seeds and
//! are grown back over the foreground by priority flooding: the frontier
//! pixel with the highest probability is claimed first, ties broken by raster
//! index. Foreground components that contain no seed are kept whole.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::training::config::InferenceConfig;
use crate::types::{InstanceMask, ProbabilityMap};

#[derive(Debug, Clone)]
pub struct InstanceDecoder {
    pub cutoff: f32,
    pub cutoff_instance: f32,
    pub use_separator: bool,
    /// Regions smaller than this many pixels are dropped as noise.
    pub min_area: u64,
}

impl Default for InstanceDecoder {
    fn default() -> Self {
        Self::from_config(&InferenceConfig::default())
    }
}

struct FloodPixel {
    prob: f32,
    index: usize,
    label: u32,
}

impl PartialEq for FloodPixel {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FloodPixel {}

impl PartialOrd for FloodPixel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloodPixel {
    // max-heap: higher probability first, then lower raster index, then lower label
    fn cmp(&self, other: &Self) -> Ordering {
        self.prob
            .total_cmp(&other.prob)
            .then_with(|| other.index.cmp(&self.index))
            .then_with(|| other.label.cmp(&self.label))
    }
}

impl InstanceDecoder {
    pub fn new(cutoff: f32, cutoff_instance: f32, use_separator: bool, min_area: u64) -> Self {
        Self {
            cutoff,
            cutoff_instance,
            use_separator,
            min_area,
        }
    }

    pub fn from_config(config: &InferenceConfig) -> Self {
        Self::new(
            config.cutoff,
            config.cutoff_instance,
            config.use_separator,
            config.min_area,
        )
    }

    /// Instances ordered by their first pixel in raster order.
    pub fn decode(&self, map: &ProbabilityMap) -> Vec<InstanceMask> {
        let (width, height) = map.dimensions();
        let probs = map.as_raw();

        let foreground = threshold(map, self.cutoff);
        let labels = if self.use_separator {
            self.separate(map, &foreground)
        } else {
            connected_components(&foreground, Connectivity::Four, Luma([0u8])).into_raw()
        };

        let instances = collect_regions(&labels, width, height, self.min_area);
        log::debug!(
            "decoded {} instances from {}x{} map ({} foreground pixels)",
            instances.len(),
            width,
            height,
            probs.iter().filter(|&&p| p > self.cutoff).count()
        );
        instances
    }

    /// Label image where every seed has been flooded over its foreground.
    fn separate(&self, map: &ProbabilityMap, foreground: &GrayImage) -> Vec<u32> {
        let (width, height) = map.dimensions();
        let (w, h) = (width as usize, height as usize);
        let probs = map.as_raw();
        let fg = foreground.as_raw();

        let seeds = GrayImage::from_fn(width, height, |x, y| {
            let idx = y as usize * w + x as usize;
            Luma([if fg[idx] != 0 && probs[idx] > self.cutoff_instance { 255 } else { 0 }])
        });
        let mut labels = connected_components(&seeds, Connectivity::Four, Luma([0u8])).into_raw();
        let seed_count = labels.iter().copied().max().unwrap_or(0);

        let mut heap = BinaryHeap::new();
        let push_neighbours = |heap: &mut BinaryHeap<FloodPixel>, labels: &[u32], idx: usize, label: u32| {
            let (x, y) = (idx % w, idx / w);
            let mut visit = |n: usize| {
                if fg[n] != 0 && labels[n] == 0 {
                    heap.push(FloodPixel {
                        prob: probs[n],
                        index: n,
                        label,
                    });
                }
            };
            if x > 0 {
                visit(idx - 1);
            }
            if x + 1 < w {
                visit(idx + 1);
            }
            if y > 0 {
                visit(idx - w);
            }
            if y + 1 < h {
                visit(idx + w);
            }
        };

        for idx in 0..labels.len() {
            if labels[idx] != 0 {
                push_neighbours(&mut heap, &labels, idx, labels[idx]);
            }
        }
        while let Some(pixel) = heap.pop() {
            if labels[pixel.index] != 0 {
                continue;
            }
            labels[pixel.index] = pixel.label;
            push_neighbours(&mut heap, &labels, pixel.index, pixel.label);
        }

        // foreground never reached by a seed keeps its own component
        let components = connected_components(foreground, Connectivity::Four, Luma([0u8])).into_raw();
        for (label, component) in labels.iter_mut().zip(components) {
            if *label == 0 && component != 0 {
                *label = seed_count + component;
            }
        }
        labels
    }
}

fn threshold(map: &ProbabilityMap, cutoff: f32) -> GrayImage {
    GrayImage::from_fn(map.width(), map.height(), |x, y| {
        Luma([if map.get_pixel(x, y)[0] > cutoff { 255 } else { 0 }])
    })
}

/// One mask per non-zero label, in order of first raster appearance.
fn collect_regions(labels: &[u32], width: u32, height: u32, min_area: u64) -> Vec<InstanceMask> {
    let mut slot = HashMap::new();
    let mut pixels: Vec<Vec<(u32, u32)>> = Vec::new();
    for (idx, &label) in labels.iter().enumerate() {
        if label == 0 {
            continue;
        }
        let i = *slot.entry(label).or_insert_with(|| {
            pixels.push(Vec::new());
            pixels.len() - 1
        });
        pixels[i].push(((idx % width as usize) as u32, (idx / width as usize) as u32));
    }

    pixels
        .into_iter()
        .filter(|region| region.len() as u64 >= min_area)
        .map(|region| InstanceMask::from_pixels(width, height, region))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_from(rows: &[&[f32]]) -> ProbabilityMap {
        let height = rows.len() as u32;
        let width = rows[0].len() as u32;
        ProbabilityMap::from_raw(width, height, rows.concat()).unwrap()
    }

    #[test]
    fn all_zero_map_has_no_instances() {
        let map = ProbabilityMap::new(16, 16);
        for cutoff in [0.0001, 0.5, 1.0] {
            let decoder = InstanceDecoder::new(cutoff, 0.9, true, 0);
            assert!(decoder.decode(&map).is_empty());
        }
    }

    #[test]
    fn separate_blobs_come_out_in_raster_order() {
        let map = map_from(&[
            &[0.0, 0.0, 0.0, 0.9, 0.9],
            &[0.8, 0.8, 0.0, 0.9, 0.0],
            &[0.8, 0.0, 0.0, 0.0, 0.0],
        ]);
        let instances = InstanceDecoder::new(0.5, 0.9, false, 0).decode(&map);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].first_pixel(), Some((3, 0)));
        assert_eq!(instances[0].area(), 3);
        assert_eq!(instances[1].area(), 3);
    }

    #[test]
    fn min_area_drops_specks() {
        let map = map_from(&[&[0.9, 0.0, 0.9, 0.9]]);
        let instances = InstanceDecoder::new(0.5, 0.9, false, 2).decode(&map);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].first_pixel(), Some((2, 0)));
    }

    #[test]
    fn separator_splits_touching_objects_at_the_valley() {
        // two confident cores joined by a weaker bridge
        let map = map_from(&[&[0.95, 0.95, 0.7, 0.6, 0.7, 0.95, 0.95]]);
        let merged = InstanceDecoder::new(0.5, 0.9, false, 0).decode(&map);
        assert_eq!(merged.len(), 1);

        let split = InstanceDecoder::new(0.5, 0.9, true, 0).decode(&map);
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].area() + split[1].area(), 7);
        assert!(split[0].contains(2, 0));
        assert!(split[1].contains(4, 0));
    }

    #[test]
    fn separator_keeps_unseeded_components() {
        let map = map_from(&[&[0.95, 0.0, 0.6, 0.6]]);
        let instances = InstanceDecoder::new(0.5, 0.9, true, 0).decode(&map);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].area(), 2);
    }
}
