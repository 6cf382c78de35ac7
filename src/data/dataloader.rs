use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::dataset::CellDataset;
use crate::data::transforms::{Pipeline, SegmentationInput};
use crate::error::{Error, Result};

/// CPU-side batch of patches, channel-major per sample.
#[derive(Debug, Clone)]
pub struct SegmentationBatch {
    /// `[N, C, P, P]`
    pub images: Vec<f32>,
    /// `[N, 1, P, P]`
    pub masks: Vec<f32>,
    /// `[N, 1, P, P]`, present when the flow builds weight maps.
    pub weights: Option<Vec<f32>>,
    pub count: usize,
    pub channels: usize,
    pub patch_size: usize,
}

impl SegmentationBatch {
    pub fn from_inputs(inputs: Vec<SegmentationInput>) -> Result<Self> {
        let first = inputs
            .first()
            .ok_or_else(|| Error::Dataset("cannot batch zero samples".to_string()))?;
        let channels = first.image.channels();
        let patch_size = first.image.height();
        let with_weights = first.weights.is_some();
        let tile = patch_size * patch_size;

        let count = inputs.len();
        let mut images = Vec::with_capacity(count * channels * tile);
        let mut masks = Vec::with_capacity(count * tile);
        let mut weights = with_weights.then(|| Vec::with_capacity(count * tile));
        for input in inputs {
            let img = &input.image;
            if img.channels() != channels || img.height() != patch_size || img.width() != patch_size {
                return Err(Error::Dataset(format!(
                    "batch mixes {}x{}x{} with {}x{}x{} patches",
                    img.channels(),
                    img.height(),
                    img.width(),
                    channels,
                    patch_size,
                    patch_size
                )));
            }
            images.extend_from_slice(img.data());
            masks.extend(input.mask);
            match (&mut weights, input.weights) {
                (Some(all), Some(w)) => all.extend(w),
                (None, None) => {}
                _ => return Err(Error::Dataset("batch mixes weighted and unweighted samples".to_string())),
            }
        }

        Ok(Self {
            images,
            masks,
            weights,
            count,
            channels,
            patch_size,
        })
    }

    /// `(images, masks, weights)` on `device`.
    pub fn to_tensors<B: Backend>(
        &self,
        device: &B::Device,
    ) -> (Tensor<B, 4>, Tensor<B, 4>, Option<Tensor<B, 4>>) {
        let (n, p) = (self.count, self.patch_size);
        let images = Tensor::from_data(TensorData::new(self.images.clone(), [n, self.channels, p, p]), device);
        let masks = Tensor::from_data(TensorData::new(self.masks.clone(), [n, 1, p, p]), device);
        let weights = self
            .weights
            .as_ref()
            .map(|w| Tensor::from_data(TensorData::new(w.clone(), [n, 1, p, p]), device));
        (images, masks, weights)
    }
}

/// One pass over a dataset, batches built by background workers.
///
/// Workers pull batch indices from a shared counter and push finished
/// batches into a bounded channel, so at most `prefetch` batches wait in
/// memory. Order of arrival is not deterministic.
pub struct PrefetchLoader {
    receiver: Option<Receiver<SegmentationBatch>>,
    workers: Vec<JoinHandle<()>>,
    num_batches: usize,
}

impl PrefetchLoader {
    pub fn new(
        dataset: Arc<CellDataset>,
        pipeline: Pipeline,
        batch_size: usize,
        num_workers: usize,
        prefetch: usize,
        seed: u64,
    ) -> Self {
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        let batches: Arc<Vec<Vec<usize>>> = Arc::new(
            order
                .chunks(batch_size.max(1))
                .map(|c| c.to_vec())
                .collect(),
        );
        let num_batches = batches.len();
        let next = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = sync_channel(prefetch.max(1));

        let workers = (0..num_workers.max(1))
            .map(|worker| {
                let dataset = Arc::clone(&dataset);
                let pipeline = pipeline.clone();
                let batches = Arc::clone(&batches);
                let next = Arc::clone(&next);
                let sender = sender.clone();
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1 + worker as u64));
                std::thread::spawn(move || loop {
                    let b = next.fetch_add(1, Ordering::SeqCst);
                    let Some(indices) = batches.get(b) else {
                        break;
                    };
                    let inputs: Vec<SegmentationInput> = indices
                        .iter()
                        .filter_map(|&idx| {
                            dataset
                                .get(idx)
                                .and_then(|sample| pipeline.apply(sample, &mut rng))
                                .map_err(|e| log::warn!("skipping sample {}: {}", idx, e))
                                .ok()
                        })
                        .collect();
                    if inputs.is_empty() {
                        continue;
                    }
                    match SegmentationBatch::from_inputs(inputs) {
                        Ok(batch) => {
                            // receiver gone: the consumer stopped early
                            if sender.send(batch).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("dropping batch {}: {}", b, e),
                    }
                })
            })
            .collect();

        Self {
            receiver: Some(receiver),
            workers,
            num_batches,
        }
    }

    /// Upper bound on the batches this pass yields.
    pub fn len(&self) -> usize {
        self.num_batches
    }

    pub fn is_empty(&self) -> bool {
        self.num_batches == 0
    }
}

impl Iterator for PrefetchLoader {
    type Item = SegmentationBatch;

    fn next(&mut self) -> Option<Self::Item> {
        // ends once every worker has dropped its sender
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for PrefetchLoader {
    fn drop(&mut self) {
        self.receiver.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::warn!("data loader worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Image;

    fn input(value: f32, weighted: bool) -> SegmentationInput {
        SegmentationInput {
            image: Image::new(2, 2, 1, vec![value; 4]).unwrap(),
            mask: vec![1.0, 0.0, 0.0, 1.0],
            weights: weighted.then(|| vec![1.0; 4]),
        }
    }

    #[test]
    fn batches_stack_samples_in_order() {
        let batch = SegmentationBatch::from_inputs(vec![input(0.1, true), input(0.2, true)]).unwrap();
        assert_eq!(batch.count, 2);
        assert_eq!(batch.images.len(), 8);
        assert_eq!(batch.images[4], 0.2);
        assert_eq!(batch.weights.as_ref().map(|w| w.len()), Some(8));

        let device = Default::default();
        let (images, masks, weights) = batch.to_tensors::<burn::backend::NdArray>(&device);
        assert_eq!(images.dims(), [2, 1, 2, 2]);
        assert_eq!(masks.dims(), [2, 1, 2, 2]);
        assert!(weights.is_some());
    }

    #[test]
    fn rejects_mixed_weighting() {
        assert!(SegmentationBatch::from_inputs(vec![input(0.1, true), input(0.2, false)]).is_err());
        assert!(SegmentationBatch::from_inputs(vec![]).is_err());
    }
}
