//! Port for pluggable image decoders.

use std::path::Path;

use crate::domain::entities::ImageRequest;
use crate::domain::errors::DecodeError;

/// Result of a successful decode.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Decoded pixels, possibly already reduced towards the requested size.
    pub image: image::DynamicImage,
    /// Dimensions of the source image before any reduction.
    pub full_size: (u32, u32),
}

impl DecodedImage {
    /// Wraps an image whose full size equals its own dimensions.
    #[must_use]
    pub fn full(image: image::DynamicImage) -> Self {
        let full_size = (image.width(), image.height());
        Self { image, full_size }
    }
}

/// A decoder backend.
///
/// `dim` is the longest edge the caller needs, or `None` for full
/// resolution; decoders may use it as a hint. `scratch` is a buffer owned by
/// the calling worker and reused across jobs.
pub trait ImageDecoder: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Returns true if this decoder claims the file.
    fn can_handle(&self, path: &Path) -> bool;

    /// Decodes the file the request points at.
    ///
    /// # Errors
    /// Returns a [`DecodeError`] when the file cannot be decoded.
    fn decode(
        &self,
        request: &ImageRequest,
        dim: Option<u32>,
        scratch: &mut Vec<u8>,
    ) -> Result<DecodedImage, DecodeError>;
}
