pub mod data;
pub mod error;
pub mod inference;
pub mod model;
pub mod training;
pub mod types;

// Re-exports for convenience
pub use data::{CellDataset, CellSample, InputFlows, Pipeline, PrefetchLoader, SegmentationBatch, Submission};
pub use error::{Error, Result};
pub use inference::{InferenceEngine, InstanceDecoder, PatchPredictor, Window};
pub use model::{compute_input_size, Geometry, ModelKind, Padding, SegmentationLoss, UNet};
pub use training::{
    BestCheckpointSaver, CheckpointStore, ConfusionCounts, MetricPool, NetworkConfig, ThresholdList, Trainer,
    TrainingConfig,
};
pub use types::{Image, InstanceMask, ProbabilityMap};
