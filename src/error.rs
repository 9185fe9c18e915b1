use thiserror::Error;

/// Errors raised by the streaming/snapshot core.
#[derive(Error, Debug)]
pub enum NeuroLayerError {
    #[error("Invalid filter configuration: {0}")]
    InvalidFilterConfig(String),

    #[error("Filter failure: {0}")]
    FilterFailure(String),

    #[error("Invalid probe geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid snapshot duration: {0} ms")]
    InvalidSnapshotDuration(f64),

    #[error("Stream stalled: needed {needed} samples, file holds {available}")]
    StreamStalled { needed: u64, available: u64 },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Backing file not available: {0}")]
    SourceUnavailable(String),

    #[error("Acquisition control error: {0}")]
    Control(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NeuroLayerError>;

impl From<ndarray::ShapeError> for NeuroLayerError {
    fn from(e: ndarray::ShapeError) -> Self {
        NeuroLayerError::ShapeMismatch(e.to_string())
    }
}
