//! Decoder backends.

mod generic;
mod jpeg;
mod raw;

use std::path::Path;

pub use generic::GenericDecoder;
pub use jpeg::JpegDecoder;
pub use raw::{RAW_EXTENSIONS, RawPreviewDecoder};

use crate::domain::entities::extension_of;

/// Extensions handed to the video thumbnailer instead of the decoders.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "3gp", "avi", "flv", "m2ts", "m4v", "mkv", "mov", "mp4", "mpeg", "mpg", "mts", "ogv", "webm",
    "wmv",
];

/// Returns true if `path` names a video file.
#[must_use]
pub fn is_video(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Returns true if `path` should take the JPEG fast path.
#[must_use]
pub fn looks_like_jpeg(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| matches!(ext.as_str(), "jpg" | "jpeg" | "jpe"))
}

/// Reads the whole file at `path` into `scratch`, reusing its allocation.
pub(crate) fn read_into(path: &Path, scratch: &mut Vec<u8>) -> Result<(), crate::domain::DecodeError> {
    use std::io::Read;

    scratch.clear();
    let mut file = std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            crate::domain::DecodeError::NotFound(path.to_path_buf())
        } else {
            e.into()
        }
    })?;
    file.read_to_end(scratch)?;
    Ok(())
}
