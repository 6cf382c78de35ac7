pub mod dataloader;
pub mod dataset;
pub mod submission;
pub mod transforms;

pub use dataloader::{PrefetchLoader, SegmentationBatch};
pub use dataset::{CellDataset, CellSample};
pub use submission::{overlay, rle_encode, write_submission, Submission};
pub use transforms::{InputFlows, Pipeline, SegmentationInput};
