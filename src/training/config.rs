use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::ModelKind;

/// Network hyperparameters. Built once and passed to every component that
/// needs them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub model: ModelKind,
    /// Output patch size; `None` takes the model's default.
    pub patch_size: Option<usize>,
    pub stage_count: usize,
    pub base_width: usize,
    /// RGB input when true, grayscale otherwise.
    pub color: bool,
    pub dropout_keep: f64,
    pub bn_decay: f64,
    pub bn_epsilon: f64,
    pub init_stddev: f64,
    pub l2_weight: f64,
    /// Weight the loss with a per-pixel boundary map.
    pub pixel_weights: bool,
    /// Weight given to background pixels between touching instances.
    pub boundary_weight: f32,
    /// Color augmentation strength for training patches.
    pub color_jitter: Option<f32>,
    /// Target mean instance side (pixels) for training rescaling.
    pub instance_size: Option<f32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::Unet,
            patch_size: None,
            stage_count: 3,
            base_width: 16,
            color: true,
            dropout_keep: 0.9,
            bn_decay: 0.9,
            bn_epsilon: 0.001,
            init_stddev: 0.01,
            l2_weight: 0.001,
            pixel_weights: true,
            boundary_weight: 5.0,
            color_jitter: Some(0.1),
            instance_size: Some(20.0),
        }
    }
}

impl NetworkConfig {
    pub fn patch_size(&self) -> usize {
        self.patch_size
            .unwrap_or_else(|| self.model.default_patch_size())
    }

    pub fn channels(&self) -> usize {
        if self.color {
            3
        } else {
            1
        }
    }
}

/// Sliding-window and instance decoding parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub overlap: f64,
    /// Windows per forward pass.
    pub batch_size: usize,
    pub cutoff: f32,
    pub cutoff_instance: f32,
    pub use_separator: bool,
    pub min_area: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            overlap: 0.5,
            batch_size: 8,
            cutoff: 0.5,
            cutoff_instance: 0.9,
            use_separator: false,
            min_area: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // Dataset
    pub train_dir: String,
    pub test_dir: Option<String>,
    pub valid_fraction: f64,
    pub seed: u64,

    // Model
    pub network: NetworkConfig,
    pub inference: InferenceConfig,

    // Training
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub loader_workers: usize,
    pub prefetch: usize,

    // Validation
    pub valid_interval: usize,
    pub valid_repeats: usize,
    /// Validation loss is only computed while the training loss is below this.
    pub loss_gate: f32,
    /// The IoU metric is only computed while the validation loss is below this.
    pub metric_gate: f32,
    pub metric_min_epoch: usize,
    pub metric_workers: usize,
    pub thresholds: Vec<f64>,

    // Early rejection
    pub early_rejection: bool,

    // Checkpointing
    pub save_dir: String,
    pub num_to_keep: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_dir: "data/stage1_train".to_string(),
            test_dir: None,
            valid_fraction: 0.1,
            seed: 42,
            network: NetworkConfig::default(),
            inference: InferenceConfig::default(),
            epochs: 600,
            batch_size: 16,
            learning_rate: 0.0001,
            loader_workers: 4,
            prefetch: 20,
            valid_interval: 10,
            valid_repeats: 5,
            loss_gate: 0.20,
            metric_gate: 0.16,
            metric_min_epoch: 50,
            metric_workers: 8,
            thresholds: default_thresholds(),
            early_rejection: false,
            save_dir: "runs/train".to_string(),
            num_to_keep: 100,
        }
    }
}

/// IoU cutoffs `0.50, 0.55, ..., 0.95`.
pub fn default_thresholds() -> Vec<f64> {
    (0..10).map(|i| 0.5 + 0.05 * i as f64).collect()
}

impl TrainingConfig {
    pub fn from_yaml(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TrainingConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.inference.batch_size == 0 {
            return Err(Error::InvalidConfig("batch sizes must be positive".to_string()));
        }
        if self.valid_interval == 0 {
            return Err(Error::InvalidConfig("valid_interval must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.inference.overlap) {
            return Err(Error::InvalidConfig(format!(
                "overlap {} outside [0, 1)",
                self.inference.overlap
            )));
        }
        if self.thresholds.is_empty() || self.thresholds.iter().any(|t| !(0.0..=1.0).contains(t)) {
            return Err(Error::InvalidConfig(
                "thresholds must be a non-empty list inside [0, 1]".to_string(),
            ));
        }
        if self.network.color_jitter.is_some_and(|s| !(0.0..1.0).contains(&s)) {
            return Err(Error::InvalidConfig("color_jitter must be inside [0, 1)".to_string()));
        }
        if self.network.instance_size.is_some_and(|s| s <= 0.0) {
            return Err(Error::InvalidConfig("instance_size must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.valid_fraction) {
            return Err(Error::InvalidConfig(format!(
                "valid_fraction {} outside [0, 1)",
                self.valid_fraction
            )));
        }
        Ok(())
    }
}
