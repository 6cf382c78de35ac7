use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};

use crate::data::{CellDataset, InputFlows, PrefetchLoader, SegmentationBatch};
use crate::error::{Error, Result};
use crate::inference::{InferenceEngine, InstanceDecoder};
use crate::model::{SegmentationLoss, UNet};
use crate::training::checkpoint::CheckpointStore;
use crate::training::config::TrainingConfig;
use crate::training::early_stopping::EarlyRejection;
use crate::training::metrics::ThresholdList;
use crate::training::state::TrainingState;
use crate::training::validation::{Evaluator, MetricPool, ValidationReport};

/// `<tag>_<model>_lr=<lr>_epoch=<n>_bs=<n>`; the tag defaults to a timestamp.
pub fn run_name(config: &TrainingConfig, tag: Option<&str>) -> String {
    let tag = match tag {
        Some(tag) => tag.to_string(),
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().to_string())
            .unwrap_or_else(|_| "run".to_string()),
    };
    format!(
        "{}_{}_lr={:.4}_epoch={}_bs={}",
        tag, config.network.model, config.learning_rate, config.epochs, config.batch_size
    )
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// Epochs actually completed.
    pub epochs: usize,
    pub best_valid_loss: Option<f32>,
    pub best_score: f64,
    /// Validation of the restored best model after training.
    pub final_report: ValidationReport,
}

pub struct Trainer<B: AutodiffBackend> {
    pub model: UNet<B>,
    optimizer: OptimizerAdaptor<Adam, UNet<B>, B>,
    loss_fn: SegmentationLoss,
    flows: InputFlows,
    config: TrainingConfig,
    device: B::Device,
    state: Arc<TrainingState>,
    valid_image_dir: Option<PathBuf>,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        let model = config.network.model.build(&config.network, &device)?;
        Ok(Self::with_model(config, model, device))
    }

    /// Continues from an existing (for example restored) network.
    pub fn with_model(config: TrainingConfig, model: UNet<B>, device: B::Device) -> Self {
        let loss_fn = SegmentationLoss::new(config.network.pixel_weights, config.network.l2_weight);
        let flows = config.network.model.input_flow(&config.network);
        // L2 is part of the loss, so no weight decay here
        let optimizer = AdamConfig::new().init();

        Self {
            model,
            optimizer,
            loss_fn,
            flows,
            config,
            device,
            state: Arc::new(TrainingState::new()),
            valid_image_dir: None,
        }
    }

    /// Directory for the scored overlays written by the final validation.
    pub fn set_valid_image_dir<P: Into<PathBuf>>(&mut self, dir: P) {
        self.valid_image_dir = Some(dir.into());
    }

    /// Handle for requesting a stop from another thread.
    pub fn state(&self) -> Arc<TrainingState> {
        Arc::clone(&self.state)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// One optimizer step. Non-finite losses skip the update.
    pub fn train_step(&mut self, batch: &SegmentationBatch) -> f32 {
        let (images, masks, weights) = batch.to_tensors::<B>(&self.device);
        let logits = self.model.forward(images);
        let loss = self.loss_fn.compute(&self.model, logits, masks, weights);
        let loss_value = loss.clone().into_scalar().elem::<f32>();

        if !loss_value.is_finite() {
            log::warn!("non-finite loss {}, skipping update", loss_value);
            return loss_value;
        }

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);

        loss_value
    }

    /// Mean training loss over one pass of `dataset`.
    pub fn train_epoch(&mut self, dataset: &Arc<CellDataset>, epoch: usize) -> Result<f32> {
        let loader = PrefetchLoader::new(
            Arc::clone(dataset),
            self.flows.train.clone(),
            self.config.batch_size,
            self.config.loader_workers,
            self.config.prefetch,
            self.config.seed.wrapping_add(epoch as u64),
        );

        let mut total = 0.0f32;
        let mut count = 0usize;
        for batch in loader {
            let loss = self.train_step(&batch);
            if loss.is_finite() {
                total += loss;
                count += 1;
            }
        }
        if count == 0 {
            return Err(Error::Dataset(format!("epoch {} produced no usable batches", epoch + 1)));
        }
        Ok(total / count as f32)
    }

    /// Mean loss of the inference network over `valid_repeats` random-crop passes.
    pub fn validation_loss(&self, dataset: &Arc<CellDataset>, epoch: usize) -> Option<f32> {
        let model = self.model.valid();
        let mut losses = Vec::new();
        for repeat in 0..self.config.valid_repeats.max(1) {
            let loader = PrefetchLoader::new(
                Arc::clone(dataset),
                self.flows.valid.clone(),
                self.config.batch_size,
                self.config.loader_workers,
                self.config.prefetch,
                self.config
                    .seed
                    .wrapping_add((epoch * 1000 + repeat) as u64)
                    .wrapping_mul(31),
            );
            for batch in loader {
                let (images, masks, weights) = batch.to_tensors::<B::InnerBackend>(&self.device);
                let logits = model.forward(images);
                let loss = self.loss_fn.compute(&model, logits, masks, weights);
                losses.push(loss.into_scalar().elem::<f32>());
            }
        }
        if losses.is_empty() {
            None
        } else {
            Some(losses.iter().sum::<f32>() / losses.len() as f32)
        }
    }

    /// Full-image inference and matching over `dataset` with the current weights.
    pub fn evaluate(&self, pool: &MetricPool, dataset: &CellDataset) -> Result<ValidationReport> {
        self.evaluate_saving(pool, dataset, None)
    }

    fn evaluate_saving(
        &self,
        pool: &MetricPool,
        dataset: &CellDataset,
        image_dir: Option<PathBuf>,
    ) -> Result<ValidationReport> {
        let evaluator = Evaluator {
            pool,
            engine: InferenceEngine::from_config(&self.config.inference)?,
            decoder: InstanceDecoder::from_config(&self.config.inference),
            pipeline: self.flows.valid_full.clone(),
            image_dir,
        };
        let model = self.model.valid();
        Ok(evaluator.evaluate(&model, dataset))
    }

    /// Runs the whole schedule, then restores the best checkpoint and
    /// validates it.
    pub fn train<S: CheckpointStore<B>>(
        &mut self,
        train: CellDataset,
        valid: CellDataset,
        store: &mut S,
    ) -> Result<TrainingOutcome> {
        let cfg = self.config.clone();
        let train = Arc::new(train);
        let valid_patches = Arc::new(valid.clone());
        let pool = MetricPool::new(cfg.metric_workers, ThresholdList::new(cfg.thresholds.clone())?)?;
        let mut rejection = EarlyRejection::new(cfg.early_rejection);
        let mut best_valid_loss: Option<f32> = None;
        let mut epochs_run = 0;

        log::info!(
            "training {} for {} epochs: {} train / {} valid images, batch {}",
            cfg.network.model,
            cfg.epochs,
            train.len(),
            valid.len(),
            cfg.batch_size
        );

        let pb = ProgressBar::new(cfg.epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        self.state.start();
        for e in 0..cfg.epochs {
            if self.state.should_stop() {
                log::info!("interrupted. stop training, start to validate.");
                break;
            }
            self.state.set_epoch(e + 1);
            let epoch_start = Instant::now();

            let train_loss = self.train_epoch(&train, e)?;
            epochs_run = e + 1;
            log::info!(
                "training epoch {} loss={:.4} ({:.1}s)",
                e + 1,
                train_loss,
                epoch_start.elapsed().as_secs_f32()
            );

            if let Some(reason) = rejection.check_loss(e, train_loss) {
                log::info!("{}, stop at {}", reason, e);
                break;
            }

            let on_interval = (e + 1) % cfg.valid_interval == 0;
            let mut valid_loss = None;
            if train_loss < cfg.loss_gate && on_interval {
                valid_loss = self.validation_loss(&valid_patches, e);
                if let Some(loss) = valid_loss {
                    log::info!("validation loss={:.4}", loss);
                    if best_valid_loss.map_or(true, |best| loss < best) {
                        best_valid_loss = Some(loss);
                    }
                }
            }

            let mut message = format!("loss={:.4}", train_loss);
            if valid_loss.is_some_and(|l| l < cfg.metric_gate) && e > cfg.metric_min_epoch && on_interval {
                let report = self.evaluate(&pool, &valid)?;
                match report.mean_iou() {
                    Some(score) => {
                        log::info!(
                            "validation metric: {:.5} ({} images, {} skipped)",
                            score,
                            report.evaluated(),
                            report.skipped
                        );
                        message = format!("{} mIoU={:.4}", message, score);
                        if let Err(err) = store.handle(score, &self.model, e + 1) {
                            log::warn!("failed to save checkpoint: {}", err);
                        }
                        if let Some(reason) = rejection.check_score(e, score) {
                            log::info!("{}, stop at {}", reason, e);
                            pb.inc(1);
                            break;
                        }
                    }
                    None => log::warn!("validation metric undefined: nothing predicted or labeled"),
                }
            }

            pb.set_message(message);
            pb.inc(1);
        }
        pb.finish_with_message("training finished");

        match store.best() {
            Some(best) => {
                log::info!(
                    "training is done. evaluating the best model (step {}, score {:.4})",
                    best.step,
                    best.score
                );
                match store.restore(self.model.clone(), &self.device) {
                    Ok(model) => self.model = model,
                    Err(err) => log::warn!("error while loading the best model: {}", err),
                }
            }
            None => log::warn!("no checkpoint was kept, evaluating the last model"),
        }

        log::info!("start to test on validation set (may take a while)");
        let final_report = self.evaluate_saving(&pool, &valid, self.valid_image_dir.clone())?;
        for result in &final_report.per_image {
            match result.score {
                Some(score) => log::info!("{}: score={:.3}", result.id, score),
                None => log::info!("{}: no instances", result.id),
            }
        }
        log::info!(
            "validation ends. score={:.4} mIoU={:.4}",
            final_report.mean_image_score().unwrap_or(0.0),
            final_report.mean_iou().unwrap_or(0.0)
        );
        log::info!(
            "done. epoch={} best_loss_val={:.4} best_mIOU={:.4}",
            epochs_run,
            best_valid_loss.unwrap_or(f32::NAN),
            rejection.best_score()
        );
        self.state.finish();

        Ok(TrainingOutcome {
            epochs: epochs_run,
            best_valid_loss,
            best_score: rejection.best_score(),
            final_report,
        })
    }
}
