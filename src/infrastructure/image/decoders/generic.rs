//! Best-effort fallback through the `image` crate's format detection.

use std::path::Path;

use tracing::trace;

use crate::domain::entities::ImageRequest;
use crate::domain::errors::DecodeError;
use crate::domain::ports::{DecodedImage, ImageDecoder};

/// Decodes anything the `image` crate recognizes by content.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericDecoder;

impl ImageDecoder for GenericDecoder {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn can_handle(&self, path: &Path) -> bool {
        image::ImageFormat::from_path(path).is_ok()
    }

    fn decode(
        &self,
        request: &ImageRequest,
        _dim: Option<u32>,
        _scratch: &mut Vec<u8>,
    ) -> Result<DecodedImage, DecodeError> {
        let path = request.file_system_path();
        if !path.exists() {
            return Err(DecodeError::NotFound(path.to_path_buf()));
        }
        let image = image::ImageReader::open(path)?
            .with_guessed_format()?
            .decode()
            .map_err(DecodeError::from_image)?;
        trace!(path = %path.display(), width = image.width(), height = image.height(), "Generic decode");
        Ok(DecodedImage::full(image))
    }
}
