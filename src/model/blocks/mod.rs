pub mod conv;
pub mod spatial;
pub mod upsample;

pub use conv::{ConvUnit, DoubleConv};
pub use spatial::{center_crop, reflect_pad};
pub use upsample::UpConv;
