pub mod blocks;
pub mod geometry;
pub mod loss;
pub mod network;
pub mod unet;

pub use geometry::{compute_input_size, Geometry, Padding};
pub use loss::SegmentationLoss;
pub use network::ModelKind;
pub use unet::{SkipMerge, UNet, UNetConfig};
