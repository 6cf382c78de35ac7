pub mod checkpoint;
pub mod config;
pub mod early_stopping;
pub mod metrics;
pub mod state;
pub mod trainer;
pub mod validation;

pub use checkpoint::{load_model, save_model, BestCheckpointSaver, CheckpointEntry, CheckpointStore};
pub use config::{InferenceConfig, NetworkConfig, TrainingConfig};
pub use early_stopping::{EarlyRejection, Rejection};
pub use metrics::{iou_matrix, score, ConfusionCounts, ThresholdList};
pub use state::TrainingState;
pub use trainer::{run_name, Trainer, TrainingOutcome};
pub use validation::{Evaluator, ImageResult, MetricPool, ScoringTask, ValidationReport};
