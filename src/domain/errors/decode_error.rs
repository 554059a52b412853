//! Image decoding error types.

use std::path::PathBuf;

use thiserror::Error;

/// Decoder failure variants.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The source file does not exist.
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// No decoder understands the file.
    #[error("unsupported image format")]
    UnsupportedFormat,

    /// The file was recognized but its contents are broken.
    #[error("corrupted image data: {0}")]
    Corrupted(String),

    /// The RAW container carries no decodable preview.
    #[error("no embedded preview found")]
    NoEmbeddedPreview,

    #[error("io error: {0}")]
    #[allow(missing_docs)]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Maps an `image` crate error, keeping I/O and format failures apart.
    #[must_use]
    pub fn from_image(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(io) => Self::Io(io),
            image::ImageError::Unsupported(_) => Self::UnsupportedFormat,
            other => Self::Corrupted(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_error_mapping() {
        let err = image::ImageError::IoError(std::io::Error::other("boom"));
        assert!(matches!(DecodeError::from_image(err), DecodeError::Io(_)));

        let err = image::ImageError::Unsupported(
            image::error::UnsupportedError::from_format_and_kind(
                image::error::ImageFormatHint::Unknown,
                image::error::UnsupportedErrorKind::Format(image::error::ImageFormatHint::Unknown),
            ),
        );
        assert!(matches!(
            DecodeError::from_image(err),
            DecodeError::UnsupportedFormat
        ));
    }
}
