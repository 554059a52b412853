//! JPEG fast path.

use std::io::Cursor;
use std::path::Path;

use image::DynamicImage;
use image::codecs::jpeg::JpegDecoder as ImageJpegDecoder;
use tracing::trace;

use crate::domain::entities::ImageRequest;
use crate::domain::errors::DecodeError;
use crate::domain::ports::{DecodedImage, ImageDecoder};

use super::{looks_like_jpeg, read_into};

/// Decodes JPEG files from the worker's scratch buffer.
///
/// When the caller needs far fewer pixels than the file holds, the result is
/// reduced to twice the requested edge right away so the later resize works
/// on a small image.
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegDecoder;

impl JpegDecoder {
    /// Decodes JPEG bytes already in memory.
    ///
    /// # Errors
    /// Returns [`DecodeError::Corrupted`] if the bytes are not a valid JPEG.
    pub fn decode_bytes(bytes: &[u8], dim: Option<u32>) -> Result<DecodedImage, DecodeError> {
        let decoder = ImageJpegDecoder::new(Cursor::new(bytes)).map_err(DecodeError::from_image)?;
        let image = DynamicImage::from_decoder(decoder).map_err(DecodeError::from_image)?;
        let full_size = (image.width(), image.height());

        let image = match dim {
            Some(dim) if image.width().max(image.height()) > dim.saturating_mul(2) => {
                let edge = dim.saturating_mul(2);
                trace!(from = ?full_size, edge, "Reducing decoded JPEG");
                image.thumbnail(edge, edge)
            }
            _ => image,
        };
        Ok(DecodedImage { image, full_size })
    }
}

impl ImageDecoder for JpegDecoder {
    fn name(&self) -> &'static str {
        "jpeg"
    }

    fn can_handle(&self, path: &Path) -> bool {
        looks_like_jpeg(path)
    }

    fn decode(
        &self,
        request: &ImageRequest,
        dim: Option<u32>,
        scratch: &mut Vec<u8>,
    ) -> Result<DecodedImage, DecodeError> {
        read_into(request.file_system_path(), scratch)?;
        Self::decode_bytes(scratch, dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{FileIdentity, TargetSize};
    use tempfile::TempDir;

    fn write_jpeg(path: &Path, width: u32, height: u32) -> Result<(), Box<dyn std::error::Error>> {
        DynamicImage::new_rgb8(width, height).save_with_format(path, image::ImageFormat::Jpeg)?;
        Ok(())
    }

    #[test]
    fn test_decodes_full_size() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = dir.path().join("a.jpg");
        write_jpeg(&path, 120, 80)?;

        let request = ImageRequest::new(FileIdentity::new(&path), TargetSize::Full, 0, None);
        let mut scratch = Vec::new();
        let decoded = JpegDecoder.decode(&request, None, &mut scratch)?;
        assert_eq!(decoded.full_size, (120, 80));
        assert_eq!(decoded.image.width(), 120);
        assert!(!scratch.is_empty());
        Ok(())
    }

    #[test]
    fn test_reduces_when_hint_is_small() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = dir.path().join("big.jpg");
        write_jpeg(&path, 800, 600)?;

        let request = ImageRequest::new(FileIdentity::new(&path), TargetSize::square(100), 0, None);
        let decoded = JpegDecoder.decode(&request, Some(100), &mut Vec::new())?;
        assert_eq!(decoded.full_size, (800, 600));
        assert_eq!(decoded.image.width(), 200);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let request = ImageRequest::new(FileIdentity::new("/nonexistent/a.jpg"), TargetSize::Full, 0, None);
        let result = JpegDecoder.decode(&request, None, &mut Vec::new());
        assert!(matches!(result, Err(DecodeError::NotFound(_))));
    }

    #[test]
    fn test_garbage_is_corrupted() {
        let result = JpegDecoder::decode_bytes(b"\xff\xd8\xffnot a jpeg", None);
        assert!(result.is_err());
    }
}
