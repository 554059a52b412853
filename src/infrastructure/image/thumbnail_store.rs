//! Standardized per-file thumbnails in two size buckets.
//!
//! Each thumbnail is a single file under `<root>/<bucket>/` named after a
//! hash of the source URI. The file starts with a small JSON header that
//! records the source's modification time so stale entries can be detected.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, trace, warn};

use crate::domain::entities::FileIdentity;
use crate::domain::errors::{CacheError, CacheResult};

use super::transform;

const MAGIC: &[u8; 4] = b"KTHB";
const THUMB_EXTENSION: &str = "thumb";
const SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

/// Standardized thumbnail size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThumbnailBucket {
    /// 128 pixel edge.
    Normal,
    /// 256 pixel edge.
    Large,
}

impl ThumbnailBucket {
    /// Both buckets, smallest first.
    pub const ALL: [Self; 2] = [Self::Normal, Self::Large];

    /// Returns the longest edge of thumbnails in this bucket.
    #[must_use]
    pub const fn edge(self) -> u32 {
        match self {
            Self::Normal => 128,
            Self::Large => 256,
        }
    }

    /// Returns the directory name of this bucket.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Large => "large",
        }
    }

    /// Picks the bucket that serves a request of `max_edge`.
    ///
    /// Sizes above the large bucket and full-size requests have none.
    #[must_use]
    pub const fn for_max_edge(max_edge: Option<u32>) -> Option<Self> {
        match max_edge {
            Some(edge) if edge <= 128 => Some(Self::Normal),
            Some(edge) if edge <= 256 => Some(Self::Large),
            _ => None,
        }
    }
}

/// Metadata stored in front of every thumbnail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailMetadata {
    /// `file://` URI of the source.
    pub uri: String,
    /// Source modification time in seconds since the epoch.
    pub mtime: u64,
    /// Source size in bytes.
    pub size: u64,
    /// Full width of the source image.
    pub image_width: u32,
    /// Full height of the source image.
    pub image_height: u32,
    /// Writer identification.
    pub software: String,
}

/// A thumbnail read back from the store.
#[derive(Debug, Clone)]
pub struct StoredThumbnail {
    /// Decoded thumbnail pixels.
    pub image: DynamicImage,
    /// Header of the stored file.
    pub metadata: ThumbnailMetadata,
}

/// Directory of standardized thumbnails.
#[derive(Debug, Clone)]
pub struct FileThumbnailStore {
    root: PathBuf,
}

impl FileThumbnailStore {
    /// Creates a store rooted at `root`. Directories are created on first write.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file that holds the `bucket` thumbnail of `identity`.
    #[must_use]
    pub fn path_for(&self, identity: &FileIdentity, bucket: ThumbnailBucket) -> PathBuf {
        self.root
            .join(bucket.dir_name())
            .join(format!("{}.{THUMB_EXTENSION}", thumbnail_key(identity)))
    }

    /// Loads the `bucket` thumbnail of `identity` if it is still fresh.
    #[must_use]
    pub fn load_valid(
        &self,
        identity: &FileIdentity,
        bucket: ThumbnailBucket,
    ) -> Option<StoredThumbnail> {
        let path = self.path_for(identity, bucket);
        let bytes = std::fs::read(&path).ok()?;
        let (metadata, payload) = match parse(&bytes) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable thumbnail");
                return None;
            }
        };

        if !Self::is_fresh(&metadata, identity.as_path()) {
            debug!(file = %identity, "Stored thumbnail is stale");
            return None;
        }

        match image::load_from_memory_with_format(payload, image::ImageFormat::Png) {
            Ok(image) => {
                trace!(file = %identity, bucket = bucket.dir_name(), "Thumbnail store hit");
                Some(StoredThumbnail { image, metadata })
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to decode stored thumbnail");
                None
            }
        }
    }

    /// Returns true if `metadata` still describes `source`.
    ///
    /// A missing source is accepted so thumbnails of offline media survive.
    #[must_use]
    pub fn is_fresh(metadata: &ThumbnailMetadata, source: &Path) -> bool {
        match modification_time(source) {
            Some(mtime) => mtime == metadata.mtime,
            None => !source.exists(),
        }
    }

    /// Writes `image` scaled to `bucket` as the thumbnail of `identity`.
    ///
    /// # Errors
    /// Returns an error if encoding or writing fails.
    pub fn store(
        &self,
        identity: &FileIdentity,
        bucket: ThumbnailBucket,
        image: &DynamicImage,
        full_size: (u32, u32),
    ) -> CacheResult<()> {
        let source = identity.as_path();
        let file_meta = std::fs::metadata(source)
            .map_err(|e| CacheError::IoError(format!("Failed to stat source: {e}")))?;
        let metadata = ThumbnailMetadata {
            uri: identity.uri(),
            mtime: modification_time(source).unwrap_or_default(),
            size: file_meta.len(),
            image_width: full_size.0,
            image_height: full_size.1,
            software: SOFTWARE.to_string(),
        };

        let edge = bucket.edge();
        let scaled = if image.width() > edge || image.height() > edge {
            transform::scale_to_fit(image, (edge, edge))
        } else {
            image.clone()
        };

        let mut payload = Vec::new();
        scaled
            .write_to(&mut Cursor::new(&mut payload), image::ImageFormat::Png)
            .map_err(|e| CacheError::EncodeError(format!("Failed to encode thumbnail: {e}")))?;

        let header = serde_json::to_vec(&metadata)
            .map_err(|e| CacheError::EncodeError(format!("Failed to encode header: {e}")))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| CacheError::EncodeError("Thumbnail header too large".to_string()))?;

        let path = self.path_for(identity, bucket);
        let dir = path
            .parent()
            .ok_or_else(|| CacheError::IoError("Thumbnail path has no parent".to_string()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| CacheError::IoError(format!("Failed to create thumbnail dir: {e}")))?;

        let mut temp = NamedTempFile::new_in(dir)
            .map_err(|e| CacheError::IoError(format!("Failed to create temp file: {e}")))?;
        temp.write_all(MAGIC)?;
        temp.write_all(&header_len.to_le_bytes())?;
        temp.write_all(&header)?;
        temp.write_all(&payload)?;
        temp.persist(&path)
            .map_err(|e| CacheError::IoError(format!("Failed to persist thumbnail: {e}")))?;

        debug!(file = %identity, bucket = bucket.dir_name(), "Stored thumbnail");
        Ok(())
    }

    /// Writes `image` into every bucket it can fill.
    ///
    /// A bucket is skipped when `image` is smaller than the bucket edge and
    /// not the full-resolution source, so a reduced decode never ends up in
    /// a larger bucket. Returns the number of buckets written.
    ///
    /// # Errors
    /// Returns the first error encountered.
    pub fn store_all(
        &self,
        identity: &FileIdentity,
        image: &DynamicImage,
        full_size: (u32, u32),
    ) -> CacheResult<usize> {
        let longest = image.width().max(image.height());
        let full_resolution = longest >= full_size.0.max(full_size.1);
        let mut written = 0;
        for bucket in ThumbnailBucket::ALL {
            if longest < bucket.edge() && !full_resolution {
                trace!(file = %identity, bucket = bucket.dir_name(), longest, "Image too small for bucket");
                continue;
            }
            self.store(identity, bucket, image, full_size)?;
            written += 1;
        }
        Ok(written)
    }

    /// Deletes every thumbnail this store wrote.
    ///
    /// Only `.thumb` files are touched, so other files sharing the bucket
    /// directories survive. Returns the number of files removed.
    ///
    /// # Errors
    /// Returns an error if a bucket directory cannot be read.
    pub fn clear(&self) -> CacheResult<usize> {
        let mut removed = 0;
        for bucket in ThumbnailBucket::ALL {
            let dir = self.root.join(bucket.dir_name());
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(CacheError::IoError(format!(
                        "Failed to read {}: {e}",
                        dir.display()
                    )));
                }
            };
            for path in entries.filter_map(|entry| entry.ok().map(|entry| entry.path())) {
                if path.extension().is_none_or(|ext| ext != THUMB_EXTENSION) {
                    continue;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove thumbnail"),
                }
            }
        }
        info!(removed, root = %self.root.display(), "Cleared thumbnail store");
        Ok(removed)
    }

    /// Removes the thumbnails of `identity` from every bucket.
    pub fn remove(&self, identity: &FileIdentity) {
        for bucket in ThumbnailBucket::ALL {
            let path = self.path_for(identity, bucket);
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Failed to remove thumbnail");
            }
        }
    }
}

/// Returns the hex key of the thumbnail file for `identity`.
#[must_use]
pub fn thumbnail_key(identity: &FileIdentity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.uri().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

fn modification_time(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

fn parse(bytes: &[u8]) -> CacheResult<(ThumbnailMetadata, &[u8])> {
    let rest = bytes
        .strip_prefix(MAGIC.as_slice())
        .ok_or_else(|| CacheError::DecodeError("Bad thumbnail magic".to_string()))?;
    let (len_bytes, rest) = rest
        .split_first_chunk::<4>()
        .ok_or_else(|| CacheError::DecodeError("Truncated thumbnail header".to_string()))?;
    let header_len = u32::from_le_bytes(*len_bytes) as usize;
    if rest.len() < header_len {
        return Err(CacheError::DecodeError("Truncated thumbnail header".to_string()));
    }
    let (header, payload) = rest.split_at(header_len);
    let metadata = serde_json::from_slice(header)
        .map_err(|e| CacheError::DecodeError(format!("Bad thumbnail header: {e}")))?;
    Ok((metadata, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;
    use test_case::test_case;

    fn source_file(dir: &TempDir, name: &str) -> Result<FileIdentity, Box<dyn std::error::Error>> {
        let path = dir.path().join(name);
        std::fs::write(&path, b"not really an image")?;
        Ok(FileIdentity::new(path))
    }

    #[test_case(Some(64), Some(ThumbnailBucket::Normal) ; "small")]
    #[test_case(Some(128), Some(ThumbnailBucket::Normal) ; "normal_edge")]
    #[test_case(Some(200), Some(ThumbnailBucket::Large) ; "between")]
    #[test_case(Some(256), Some(ThumbnailBucket::Large) ; "large_edge")]
    #[test_case(Some(257), None ; "exact")]
    #[test_case(None, None ; "full")]
    fn test_bucket_for_max_edge(edge: Option<u32>, expected: Option<ThumbnailBucket>) {
        assert_eq!(ThumbnailBucket::for_max_edge(edge), expected);
    }

    #[test]
    fn test_store_and_load_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = FileThumbnailStore::new(dir.path().join("thumbs"));
        let identity = source_file(&dir, "photo.jpg")?;

        let image = DynamicImage::new_rgb8(400, 300);
        store.store_all(&identity, &image, (4000, 3000))?;

        let normal = store
            .load_valid(&identity, ThumbnailBucket::Normal)
            .ok_or("missing normal thumbnail")?;
        assert_eq!((normal.image.width(), normal.image.height()), (128, 96));
        assert_eq!((normal.metadata.image_width, normal.metadata.image_height), (4000, 3000));
        assert_eq!(normal.metadata.uri, identity.uri());

        let large = store
            .load_valid(&identity, ThumbnailBucket::Large)
            .ok_or("missing large thumbnail")?;
        assert_eq!(large.image.width(), 256);
        Ok(())
    }

    #[test]
    fn test_modified_source_invalidates_thumbnail() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = FileThumbnailStore::new(dir.path().join("thumbs"));
        let identity = source_file(&dir, "photo.jpg")?;
        store.store(&identity, ThumbnailBucket::Normal, &DynamicImage::new_rgb8(10, 10), (10, 10))?;
        assert!(store.load_valid(&identity, ThumbnailBucket::Normal).is_some());

        let file = std::fs::OpenOptions::new().write(true).open(identity.as_path())?;
        file.set_modified(SystemTime::now() + Duration::from_secs(3600))?;

        assert!(store.load_valid(&identity, ThumbnailBucket::Normal).is_none());
        Ok(())
    }

    #[test]
    fn test_missing_source_keeps_thumbnail() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = FileThumbnailStore::new(dir.path().join("thumbs"));
        let identity = source_file(&dir, "offline.jpg")?;
        store.store(&identity, ThumbnailBucket::Large, &DynamicImage::new_rgb8(10, 10), (10, 10))?;

        std::fs::remove_file(identity.as_path())?;
        assert!(store.load_valid(&identity, ThumbnailBucket::Large).is_some());
        Ok(())
    }

    #[test]
    fn test_remove_deletes_both_buckets() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = FileThumbnailStore::new(dir.path().join("thumbs"));
        let identity = source_file(&dir, "photo.jpg")?;
        store.store_all(&identity, &DynamicImage::new_rgb8(10, 10), (10, 10))?;

        store.remove(&identity);
        for bucket in ThumbnailBucket::ALL {
            assert!(!store.path_for(&identity, bucket).exists());
        }
        Ok(())
    }

    #[test]
    fn test_reduced_image_skips_larger_bucket() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = FileThumbnailStore::new(dir.path().join("thumbs"));
        let identity = source_file(&dir, "photo.jpg")?;

        let written = store.store_all(&identity, &DynamicImage::new_rgb8(128, 96), (800, 600))?;

        assert_eq!(written, 1);
        assert!(store.load_valid(&identity, ThumbnailBucket::Normal).is_some());
        assert!(!store.path_for(&identity, ThumbnailBucket::Large).exists());
        Ok(())
    }

    #[test]
    fn test_clear_empties_both_buckets() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = FileThumbnailStore::new(dir.path().join("thumbs"));
        let identity = source_file(&dir, "photo.jpg")?;
        store.store_all(&identity, &DynamicImage::new_rgb8(300, 200), (300, 200))?;
        let foreign = store.root().join("normal").join("other.png");
        std::fs::write(&foreign, b"kept")?;

        assert_eq!(store.clear()?, 2);
        assert_eq!(store.clear()?, 0);
        assert!(foreign.exists());
        for bucket in ThumbnailBucket::ALL {
            assert!(store.load_valid(&identity, bucket).is_none());
        }
        Ok(())
    }

    #[test]
    fn test_corrupt_file_is_ignored() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let store = FileThumbnailStore::new(dir.path().join("thumbs"));
        let identity = source_file(&dir, "photo.jpg")?;
        let path = store.path_for(&identity, ThumbnailBucket::Normal);
        std::fs::create_dir_all(path.parent().ok_or("no parent")?)?;
        std::fs::write(&path, b"garbage")?;

        assert!(store.load_valid(&identity, ThumbnailBucket::Normal).is_none());
        Ok(())
    }

    #[test]
    fn test_key_is_stable_hex() {
        let key = thumbnail_key(&FileIdentity::new("/photos/a.jpg"));
        assert_eq!(key.len(), 32);
        assert_eq!(key, thumbnail_key(&FileIdentity::new("/photos/./a.jpg")));
    }
}
