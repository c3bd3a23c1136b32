use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PixelsError {
    #[error("Decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Segmentation failed: {0}")]
    SegmentationFailure(String),

    #[error("Segmentation timed out after {0:?}")]
    SegmentationTimeout(Duration),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl PixelsError {
    /// Segmentation errors are the only ones a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PixelsError::SegmentationFailure(_) | PixelsError::SegmentationTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PixelsError>;
