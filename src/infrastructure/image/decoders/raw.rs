//! Embedded-preview decoder for camera RAW files.
//!
//! RAW containers carry one or more JPEG previews. Instead of demosaicing the
//! sensor data, the largest preview that decodes is used.

use std::io::Cursor;
use std::path::Path;

use image::ImageDecoder as _;
use image::codecs::jpeg::JpegDecoder as ImageJpegDecoder;
use tracing::{debug, trace};

use crate::domain::entities::{ImageRequest, extension_of};
use crate::domain::errors::DecodeError;
use crate::domain::ports::{DecodedImage, ImageDecoder};

use super::jpeg::JpegDecoder;
use super::read_into;

/// Extensions claimed by [`RawPreviewDecoder`].
pub const RAW_EXTENSIONS: &[&str] = &[
    "arw", "bay", "cr2", "cr3", "crw", "cs1", "dc2", "dcr", "dng", "erf", "kdc", "mos", "mrw",
    "nef", "nrw", "orf", "pef", "raf", "rdc", "rw2", "sr2", "srf", "x3f",
];

/// Companion extensions that make a RAW file redundant when
/// `skip_with_sibling` is set.
const SIBLING_EXTENSIONS: &[&str] = &["jpg", "JPG", "tif", "TIF", "png", "PNG"];

/// Upper bound on preview candidates inspected per file.
const MAX_CANDIDATES: usize = 16;

/// Decodes the largest embedded JPEG preview of a RAW file.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawPreviewDecoder {
    skip_with_sibling: bool,
}

impl RawPreviewDecoder {
    /// Creates the decoder. With `skip_with_sibling`, RAW files that have a
    /// JPEG, TIFF or PNG next to them with the same base name are not claimed.
    #[must_use]
    pub const fn new(skip_with_sibling: bool) -> Self {
        Self { skip_with_sibling }
    }

    fn has_sibling(path: &Path) -> bool {
        SIBLING_EXTENSIONS
            .iter()
            .any(|ext| path.with_extension(ext).exists())
    }
}

impl ImageDecoder for RawPreviewDecoder {
    fn name(&self) -> &'static str {
        "raw-preview"
    }

    fn can_handle(&self, path: &Path) -> bool {
        let is_raw = extension_of(path).is_some_and(|ext| RAW_EXTENSIONS.contains(&ext.as_str()));
        if !is_raw {
            return false;
        }
        if self.skip_with_sibling && Self::has_sibling(path) {
            trace!(path = %path.display(), "Skipping RAW file with a sibling image");
            return false;
        }
        true
    }

    fn decode(
        &self,
        request: &ImageRequest,
        dim: Option<u32>,
        scratch: &mut Vec<u8>,
    ) -> Result<DecodedImage, DecodeError> {
        read_into(request.file_system_path(), scratch)?;
        let start = largest_preview(scratch).ok_or(DecodeError::NoEmbeddedPreview)?;
        debug!(file = %request.identity(), offset = start, "Using embedded RAW preview");
        // The preview is the best size information available.
        JpegDecoder::decode_bytes(&scratch[start..], dim)
    }
}

/// Returns the offset of the embedded JPEG with the most pixels.
///
/// Only headers are parsed; candidates whose header does not parse are
/// skipped.
#[must_use]
pub fn largest_preview(data: &[u8]) -> Option<usize> {
    data.windows(3)
        .enumerate()
        .filter(|(_, window)| *window == [0xFF, 0xD8, 0xFF])
        .map(|(offset, _)| offset)
        .take(MAX_CANDIDATES)
        .filter_map(|offset| {
            let decoder = ImageJpegDecoder::new(Cursor::new(&data[offset..])).ok()?;
            let (width, height) = decoder.dimensions();
            Some((u64::from(width) * u64::from(height), offset))
        })
        .max_by_key(|(pixels, offset)| (*pixels, std::cmp::Reverse(*offset)))
        .map(|(_, offset)| offset)
}
