//! Thumbnail cache error types.

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Entry not found in cache.
    #[error("Thumbnail not found: {0}")]
    NotFound(String),
    /// Failed to encode a thumbnail.
    #[error("Encode error: {0}")]
    EncodeError(String),
    /// Failed to decode cached bytes.
    #[error("Decode error: {0}")]
    DecodeError(String),
    /// I/O error during cache operation.
    #[error("IO error: {0}")]
    IoError(String),
    /// The on-disk index could not be parsed.
    #[error("Invalid index: {0}")]
    InvalidIndex(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<image::ImageError> for CacheError {
    fn from(err: image::ImageError) -> Self {
        Self::EncodeError(err.to_string())
    }
}
