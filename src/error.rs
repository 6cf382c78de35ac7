use thiserror::Error;

/// Errors produced by network construction, inference and evaluation.
#[derive(Debug, Error)]
pub enum Error {
    /// Patch size and stage count do not describe a buildable network.
    #[error("Geometry Error: {0}")]
    Geometry(String),

    /// The channel progression of encoder and decoder does not line up.
    #[error("Channel Mismatch at decoder stage {stage}: skip has {skip} channels, upsampled has {upsampled}")]
    ChannelMismatch {
        stage: usize,
        skip: usize,
        upsampled: usize,
    },

    #[error("Invalid Config: {0}")]
    InvalidConfig(String),

    #[error("Empty Image: {height}x{width}")]
    EmptyImage { height: usize, width: usize },

    #[error("Window Error: {0}")]
    Window(String),

    #[error("Tensor Error: {0}")]
    Tensor(String),

    #[error("Dataset Error: {0}")]
    Dataset(String),

    #[error("Record Error: {0}")]
    Record(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image Error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Yaml Error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
