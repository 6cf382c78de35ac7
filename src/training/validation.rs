//! Dataset-level scoring: tiled inference per image, then the matching
//! metric spread over a bounded worker pool.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::data::dataset::CellDataset;
use crate::data::submission::overlay;
use crate::data::transforms::Pipeline;
use crate::error::{Error, Result};
use crate::inference::{InferenceEngine, InstanceDecoder, PatchPredictor};
use crate::training::metrics::{score, ConfusionCounts, ThresholdList};
use crate::types::{Image, InstanceMask};

/// Predicted and ground truth instances of one image, ready to be scored.
#[derive(Debug, Clone)]
pub struct ScoringTask {
    pub id: String,
    pub predicted: Vec<InstanceMask>,
    pub ground_truth: Vec<InstanceMask>,
}

#[derive(Debug, Clone)]
pub struct ImageResult {
    pub id: String,
    pub counts: ConfusionCounts,
    /// `None` when the image has neither predictions nor ground truth.
    pub score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Counts summed over every scored image.
    pub counts: ConfusionCounts,
    pub per_image: Vec<ImageResult>,
    /// Images that failed to load or infer.
    pub skipped: usize,
}

impl ValidationReport {
    pub fn evaluated(&self) -> usize {
        self.per_image.len()
    }

    /// Score over the accumulated counts; used for checkpoint selection.
    pub fn mean_iou(&self) -> Option<f64> {
        self.counts.mean_iou()
    }

    /// Mean of per-image scores, images without a score excluded.
    pub fn mean_image_score(&self) -> Option<f64> {
        let scores: Vec<f64> = self.per_image.iter().filter_map(|r| r.score).collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }
}

/// Bounded pool for the matching metric.
///
/// Created once (`new`), drained per validation run (`score_all` blocks until
/// every task is done) and shut down on drop.
pub struct MetricPool {
    pool: ThreadPool,
    thresholds: ThresholdList,
}

impl MetricPool {
    pub fn new(num_threads: usize, thresholds: ThresholdList) -> Result<Self> {
        if num_threads == 0 {
            return Err(Error::InvalidConfig("metric pool needs at least one thread".to_string()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("metric-{}", i))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("cannot start metric pool: {}", e)))?;
        Ok(Self { pool, thresholds })
    }

    pub fn thresholds(&self) -> &ThresholdList {
        &self.thresholds
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Scores every task; per-image results keep the input order.
    pub fn score_all(&self, tasks: &[ScoringTask]) -> ValidationReport {
        let thresholds = &self.thresholds;
        let per_image: Vec<ImageResult> = self.pool.install(|| {
            tasks
                .par_iter()
                .map(|task| {
                    let counts = score(thresholds, &task.predicted, &task.ground_truth);
                    ImageResult {
                        id: task.id.clone(),
                        score: counts.image_score(),
                        counts,
                    }
                })
                .collect()
        });
        let counts = self.pool.install(|| {
            per_image
                .par_iter()
                .map(|r| r.counts.clone())
                .reduce(|| ConfusionCounts::zeros(thresholds.len()), ConfusionCounts::merge)
        });
        ValidationReport {
            counts,
            per_image,
            skipped: 0,
        }
    }
}

/// Runs inference and decoding over a labeled dataset and scores the result.
pub struct Evaluator<'a> {
    pub pool: &'a MetricPool,
    pub engine: InferenceEngine,
    pub decoder: InstanceDecoder,
    /// Preprocessing for whole images, normally [`Pipeline::full_image`].
    pub pipeline: Pipeline,
    /// When set, each scored image is saved here with its predictions drawn
    /// over it, named `<id>_<score>.png`.
    pub image_dir: Option<PathBuf>,
}

impl<'a> Evaluator<'a> {
    pub fn evaluate<P: PatchPredictor + ?Sized>(
        &self,
        predictor: &P,
        dataset: &CellDataset,
    ) -> ValidationReport {
        // full-image flows never draw from the rng
        let mut rng = StdRng::seed_from_u64(0);
        let mut tasks = Vec::with_capacity(dataset.len());
        let mut images = Vec::new();
        let mut skipped = 0;
        for idx in 0..dataset.len() {
            let prepared = dataset
                .get(idx)
                .and_then(|sample| self.pipeline.augment(sample, &mut rng))
                .and_then(|sample| {
                    let merged = self.engine.infer(predictor, &sample.image)?;
                    let task = ScoringTask {
                        predicted: self.decoder.decode(&merged),
                        ground_truth: sample.masks,
                        id: sample.id,
                    };
                    Ok((task, sample.image))
                });
            match prepared {
                Ok((task, image)) => {
                    if self.image_dir.is_some() {
                        images.push(image);
                    }
                    tasks.push(task);
                }
                Err(e) => {
                    log::warn!("validation image {} skipped: {}", idx, e);
                    skipped += 1;
                }
            }
        }

        let mut report = self.pool.score_all(&tasks);
        report.skipped = skipped;
        if let Some(dir) = &self.image_dir {
            save_scored_images(dir, &tasks, &images, &report);
        }
        report
    }
}

/// Best effort: failures are logged and do not affect the report.
fn save_scored_images(dir: &Path, tasks: &[ScoringTask], images: &[Image], report: &ValidationReport) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        log::warn!("cannot create {}: {}", dir.display(), e);
        return;
    }
    for ((task, image), result) in tasks.iter().zip(images).zip(&report.per_image) {
        let score = result
            .score
            .map_or_else(|| "none".to_string(), |s| format!("{:.3}", s));
        let path = dir.join(format!("{}_{}.png", task.id, score));
        let rendered = DynamicImage::ImageRgb8(overlay(image, &task.predicted));
        if let Err(e) = rendered.save(&path) {
            log::warn!("cannot save {}: {}", path.display(), e);
        }
    }
}
