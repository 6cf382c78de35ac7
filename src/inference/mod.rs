pub mod engine;
pub mod instances;
pub mod window;

pub use engine::{merge_window, InferenceEngine, PatchPredictor};
pub use instances::InstanceDecoder;
pub use window::{sliding_windows, Window};
