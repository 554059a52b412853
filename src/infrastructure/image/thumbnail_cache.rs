//! Persistent thumbnail store backed by append-only blob files.
//!
//! Encoded thumbnails are appended to `thumb-<n>` files in the cache
//! directory. The `thumbnailindex` file maps each file identity to the blob
//! file, offset and length holding its bytes. The index is kept in memory as a
//! persisted part plus an unsaved delta so most saves only append records.
//!
//! Index layout (little-endian):
//!
//! ```text
//! magic "THMBIDX\0" | version u32 | thumbnail_size u32 | current_file u32
//! | current_offset u64 | record_count u32
//! record: key_len u32 | key bytes | file u32 | offset u64 | length u32
//! ```
//!
//! Version 1 files lack the `thumbnail_size` field. Later records override
//! earlier ones with the same key.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex, RwLock};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, trace, warn};

use crate::domain::entities::FileIdentity;
use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::ThumbnailPresence;

use super::memory_cache::{CacheStats, MemoryImageCache};
use super::transform;

const MAGIC: &[u8; 8] = b"THMBIDX\0";
const VERSION: u32 = 2;
const COMPATIBLE_VERSION: u32 = 1;
const HEADER_SIZE: usize = 32;
const V1_HEADER_SIZE: usize = 28;
const INDEX_FILE: &str = "thumbnailindex";
const BLOB_PREFIX: &str = "thumb-";

/// Tunables of a [`ThumbnailCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Directory holding the index and blob files.
    pub directory: PathBuf,
    /// Longest edge of stored thumbnails. A change discards the cache.
    pub thumbnail_size: u32,
    /// Size at which a new blob file is started.
    pub max_blob_size: u64,
    /// Unsaved entries that trigger an immediate save.
    pub save_threshold: usize,
    /// Quiet period after a mutation before a background save.
    pub save_debounce: Duration,
    /// JPEG quality of stored thumbnails.
    pub jpeg_quality: u8,
    /// Decoded thumbnails kept in memory by [`ThumbnailCache::lookup_image`].
    pub memory_entries: usize,
}

impl CacheOptions {
    /// Creates options with default tunables for `directory`.
    #[must_use]
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            thumbnail_size: 256,
            max_blob_size: 32 * 1024 * 1024,
            save_threshold: 100,
            save_debounce: Duration::from_secs(1),
            jpeg_quality: 85,
            memory_entries: super::memory_cache::DEFAULT_CACHE_SIZE,
        }
    }
}

/// Why a cache started cold although an index file was present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The index was written by an unknown format version.
    VersionMismatch,
    /// The index was written for another thumbnail size.
    SizeChanged,
    /// The index could not be parsed.
    Corrupt,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VersionMismatch => write!(f, "index version mismatch"),
            Self::SizeChanged => write!(f, "thumbnail size changed"),
            Self::Corrupt => write!(f, "index corrupt"),
        }
    }
}

/// Location of one thumbnail inside the blob files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheEntry {
    file_index: u32,
    offset: u64,
    length: u32,
}

#[derive(Debug, Default)]
struct IndexState {
    saved: HashMap<String, CacheEntry>,
    unsaved: HashMap<String, CacheEntry>,
    needs_full_save: bool,
    removal_epoch: u64,
    generation: u64,
}

impl IndexState {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.unsaved
            .get(key)
            .or_else(|| self.saved.get(key))
            .copied()
    }

    fn len(&self) -> usize {
        self.saved.len()
            + self
                .unsaved
                .keys()
                .filter(|key| !self.saved.contains_key(*key))
                .count()
    }

    fn merged(&self) -> Vec<(String, CacheEntry)> {
        let mut all: HashMap<&String, CacheEntry> =
            self.saved.iter().map(|(k, v)| (k, *v)).collect();
        all.extend(self.unsaved.iter().map(|(k, v)| (k, *v)));
        let mut records: Vec<(String, CacheEntry)> =
            all.into_iter().map(|(k, v)| (k.clone(), v)).collect();
        records.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        records
    }
}

#[derive(Debug, Default)]
struct BlobWriter {
    current_file: u32,
    current_offset: u64,
    handle: Option<File>,
    generation: u64,
}

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct SaveTimer {
    state: Mutex<TimerState>,
    wake: Condvar,
}

impl SaveTimer {
    fn schedule(&self, delay: Duration) {
        self.state.lock().deadline = Some(Instant::now() + delay);
        self.wake.notify_one();
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wake.notify_one();
    }

    fn run(&self, cache: &Weak<ThumbnailCache>) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.deadline {
                None => self.wake.wait(&mut state),
                Some(deadline) if Instant::now() >= deadline => {
                    state.deadline = None;
                    drop(state);
                    let Some(cache) = cache.upgrade() else {
                        return;
                    };
                    if let Err(e) = cache.save() {
                        warn!(error = %e, "Debounced thumbnail cache save failed");
                    }
                    drop(cache);
                    state = self.state.lock();
                }
                Some(deadline) => {
                    let _ = self.wake.wait_until(&mut state, deadline);
                }
            }
        }
    }
}

/// Zero-copy view of one stored thumbnail.
pub struct CachedThumbnail {
    mmap: Mmap,
    range: Range<usize>,
}

impl Deref for CachedThumbnail {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.mmap[self.range.clone()]
    }
}

impl std::fmt::Debug for CachedThumbnail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedThumbnail")
            .field("len", &self.range.len())
            .finish()
    }
}

/// Counters reported by [`ThumbnailCache::stats`].
#[derive(Debug, Clone)]
pub struct ThumbnailCacheStats {
    /// Number of cached thumbnails.
    pub entries: usize,
    /// Entries not yet written to the index file.
    pub unsaved: usize,
    /// Blob file currently appended to.
    pub current_file: u32,
    /// Write offset in the current blob file.
    pub current_offset: u64,
    /// Decoded-thumbnail memory cache counters.
    pub memory: CacheStats,
}

impl std::fmt::Display for ThumbnailCacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} thumbnails ({} unsaved) in {} blob file(s), {} bytes in current file; memory: {}",
            self.entries,
            self.unsaved,
            self.current_file + 1,
            self.current_offset,
            self.memory
        )
    }
}

/// Thumbnail cache keyed by file identity.
///
/// Three independent locks: `index` guards the in-memory maps, `writer`
/// serializes appends to the shared blob file handle, and `save_lock`
/// collapses concurrent saves. No call path holds `index` while taking
/// `writer`.
pub struct ThumbnailCache {
    options: CacheOptions,
    index: RwLock<IndexState>,
    writer: Mutex<BlobWriter>,
    save_lock: Mutex<()>,
    memory: MemoryImageCache,
    invalidation: Option<InvalidationReason>,
    timer: Arc<SaveTimer>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThumbnailCache {
    /// Opens the cache in `options.directory`, loading the index if present.
    ///
    /// An index with an unknown version, another thumbnail size or broken
    /// contents is discarded and the cache starts empty; see
    /// [`Self::invalidation`].
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the save timer
    /// thread cannot be started.
    pub fn open(options: CacheOptions) -> CacheResult<Arc<Self>> {
        std::fs::create_dir_all(&options.directory)
            .map_err(|e| CacheError::IoError(format!("Failed to create cache dir: {e}")))?;

        let loaded = load_index(&options);
        let (index, mut writer, invalidation) = match loaded {
            Ok(Some((index, writer))) => (index, writer, None),
            Ok(None) => (IndexState::default(), BlobWriter::default(), None),
            Err(reason) => {
                warn!(dir = %options.directory.display(), %reason, "Discarding thumbnail cache");
                remove_blob_files(&options.directory);
                let index = IndexState {
                    needs_full_save: true,
                    ..IndexState::default()
                };
                (index, BlobWriter::default(), Some(reason))
            }
        };

        let on_disk = blob_path(&options.directory, writer.current_file)
            .metadata()
            .map(|m| m.len())
            .unwrap_or(0);
        writer.current_offset = writer.current_offset.max(on_disk);

        info!(
            dir = %options.directory.display(),
            entries = index.len(),
            current_file = writer.current_file,
            "Opened thumbnail cache"
        );

        let timer = Arc::new(SaveTimer::default());
        let cache = Arc::new(Self {
            memory: MemoryImageCache::new(options.memory_entries),
            options,
            index: RwLock::new(index),
            writer: Mutex::new(writer),
            save_lock: Mutex::new(()),
            invalidation,
            timer: timer.clone(),
            timer_thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&cache);
        let handle = std::thread::Builder::new()
            .name("thumbnail-cache-save".to_string())
            .spawn(move || timer.run(&weak))
            .map_err(|e| CacheError::IoError(format!("Failed to start save timer: {e}")))?;
        *cache.timer_thread.lock() = Some(handle);

        Ok(cache)
    }

    /// Returns the options the cache was opened with.
    #[must_use]
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Returns why the on-disk cache was discarded at open, if it was.
    ///
    /// An explicit [`Self::flush`] is never reported.
    #[must_use]
    pub const fn invalidation(&self) -> Option<InvalidationReason> {
        self.invalidation
    }

    /// Stores the thumbnail of `identity`.
    ///
    /// Images larger than the configured thumbnail size are scaled down
    /// first. The bytes are written before the index entry is recorded.
    ///
    /// # Errors
    /// Returns an error if encoding or the blob write fails.
    pub fn insert(&self, identity: &FileIdentity, image: &DynamicImage) -> CacheResult<()> {
        let bytes = self.encode(image)?;
        let length = u32::try_from(bytes.len())
            .map_err(|_| CacheError::EncodeError("Thumbnail too large".to_string()))?;

        let (entry, generation) = {
            let mut writer = self.writer.lock();
            let (file_index, offset) = self.append(&mut writer, &bytes).inspect_err(|e| {
                warn!(file = %identity, error = %e, "Failed to write thumbnail blob");
            })?;
            let entry = CacheEntry {
                file_index,
                offset,
                length,
            };
            (entry, writer.generation)
        };

        let unsaved = {
            let mut index = self.index.write();
            if index.generation != generation {
                debug!(file = %identity, "Cache flushed during insert, dropping entry");
                return Ok(());
            }
            index.unsaved.insert(identity.as_str().to_string(), entry);
            index.unsaved.len()
        };
        self.memory.evict(identity);
        trace!(file = %identity, file_index = entry.file_index, offset = entry.offset, length, "Inserted thumbnail");

        if unsaved >= self.options.save_threshold {
            if let Err(e) = self.save() {
                warn!(error = %e, "Thumbnail cache save failed");
            }
        } else {
            self.timer.schedule(self.options.save_debounce);
        }
        Ok(())
    }

    /// Returns the stored bytes of `identity`, mapped from the blob file.
    ///
    /// Entries that point past the end of their blob file are treated as
    /// absent.
    #[must_use]
    pub fn lookup(&self, identity: &FileIdentity) -> Option<CachedThumbnail> {
        let entry = self.index.read().get(identity.as_str())?;
        let path = blob_path(&self.options.directory, entry.file_index);
        let file = File::open(&path)
            .map_err(|e| debug!(path = %path.display(), error = %e, "Blob file unavailable"))
            .ok()?;
        // SAFETY: blob files are only ever appended to, never truncated in
        // place; a flush unlinks them, which keeps existing mappings valid.
        let mmap = unsafe { Mmap::map(&file) }.ok()?;

        let start = usize::try_from(entry.offset).ok()?;
        let end = start.checked_add(entry.length as usize)?;
        if end > mmap.len() {
            warn!(file = %identity, end, blob_len = mmap.len(), "Thumbnail entry points past blob end");
            return None;
        }
        Some(CachedThumbnail {
            mmap,
            range: start..end,
        })
    }

    /// Returns the decoded thumbnail of `identity`.
    #[must_use]
    pub fn lookup_image(&self, identity: &FileIdentity) -> Option<Arc<DynamicImage>> {
        if let Some(image) = self.memory.get(identity) {
            return Some(image);
        }
        let bytes = self.lookup(identity)?;
        match image::load_from_memory_with_format(&bytes, image::ImageFormat::Jpeg) {
            Ok(decoded) => {
                let decoded = Arc::new(decoded);
                self.memory.put(identity.clone(), decoded.clone());
                Some(decoded)
            }
            Err(e) => {
                warn!(file = %identity, error = %e, "Failed to decode cached thumbnail");
                None
            }
        }
    }

    /// Returns true if a thumbnail of `identity` is cached. No blob I/O.
    #[must_use]
    pub fn contains(&self, identity: &FileIdentity) -> bool {
        let index = self.index.read();
        index.unsaved.contains_key(identity.as_str()) || index.saved.contains_key(identity.as_str())
    }

    /// Forgets the thumbnail of `identity`. Blob bytes are not reclaimed.
    pub fn remove_thumbnail(&self, identity: &FileIdentity) {
        self.remove_thumbnails(std::iter::once(identity));
    }

    /// Forgets the thumbnails of every identity in `identities`.
    pub fn remove_thumbnails<'a>(&self, identities: impl IntoIterator<Item = &'a FileIdentity>) {
        let mut removed = 0usize;
        {
            let mut index = self.index.write();
            for identity in identities {
                let unsaved = index.unsaved.remove(identity.as_str()).is_some();
                let saved = index.saved.remove(identity.as_str()).is_some();
                if saved {
                    index.needs_full_save = true;
                }
                if saved || unsaved {
                    removed += 1;
                    index.removal_epoch += 1;
                }
                self.memory.evict(identity);
            }
        }
        if removed > 0 {
            debug!(count = removed, "Removed thumbnails");
            self.timer.schedule(self.options.save_debounce);
        }
    }

    /// Returns the number of cached thumbnails.
    #[must_use]
    pub fn size(&self) -> usize {
        self.index.read().len()
    }

    /// Returns true if no thumbnail is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns cache counters.
    #[must_use]
    pub fn stats(&self) -> ThumbnailCacheStats {
        let (entries, unsaved) = {
            let index = self.index.read();
            (index.len(), index.unsaved.len())
        };
        let (current_file, current_offset) = {
            let writer = self.writer.lock();
            (writer.current_file, writer.current_offset)
        };
        ThumbnailCacheStats {
            entries,
            unsaved,
            current_file,
            current_offset,
            memory: self.memory.stats(),
        }
    }

    /// Writes pending index changes to disk.
    ///
    /// Appends only the unsaved records when possible, otherwise rewrites the
    /// whole index through a temporary file.
    ///
    /// # Errors
    /// Returns an error if the index file cannot be written.
    pub fn save(&self) -> CacheResult<()> {
        let _saving = self.save_lock.lock();
        self.save_locked()
    }

    /// Deletes every blob file and empties the index.
    ///
    /// The cache stays usable. Calling it on an empty cache is harmless.
    ///
    /// # Errors
    /// Returns an error if the empty index cannot be saved.
    pub fn flush(&self) -> CacheResult<()> {
        let _saving = self.save_lock.lock();
        {
            let mut writer = self.writer.lock();
            writer.handle = None;
            writer.current_file = 0;
            writer.current_offset = 0;
            writer.generation += 1;
            remove_blob_files(&self.options.directory);

            let mut index = self.index.write();
            index.saved.clear();
            index.unsaved.clear();
            index.needs_full_save = true;
            index.removal_epoch += 1;
            index.generation = writer.generation;
        }
        self.memory.clear();
        info!(dir = %self.options.directory.display(), "Flushed thumbnail cache");
        self.save_locked()
    }

    fn encode(&self, image: &DynamicImage) -> CacheResult<Vec<u8>> {
        let edge = self.options.thumbnail_size;
        let scaled;
        let source = if image.width() > edge || image.height() > edge {
            scaled = transform::scale_to_fit(image, (edge, edge));
            &scaled
        } else {
            image
        };

        let mut bytes = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut bytes, self.options.jpeg_quality);
        source.to_rgb8().write_with_encoder(encoder)?;
        Ok(bytes)
    }

    fn append(&self, writer: &mut BlobWriter, bytes: &[u8]) -> CacheResult<(u32, u64)> {
        let length = bytes.len() as u64;
        if writer.current_offset > 0
            && writer.current_offset + length > self.options.max_blob_size
        {
            writer.handle = None;
            writer.current_file += 1;
            writer.current_offset = 0;
            debug!(file_index = writer.current_file, "Starting new blob file");
        }

        if writer.handle.is_none() {
            let path = blob_path(&self.options.directory, writer.current_file);
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|e| CacheError::IoError(format!("Failed to open blob file: {e}")))?;
            writer.handle = Some(file);
        }

        let offset = writer.current_offset;
        let Some(handle) = writer.handle.as_mut() else {
            return Err(CacheError::IoError("Blob file not open".to_string()));
        };
        if let Err(e) = write_at(handle, offset, bytes) {
            writer.handle = None;
            return Err(CacheError::IoError(format!("Failed to write blob: {e}")));
        }
        writer.current_offset += length;
        Ok((writer.current_file, offset))
    }

    fn save_locked(&self) -> CacheResult<()> {
        let (records, full, epoch) = {
            let index = self.index.read();
            if !index.needs_full_save && index.unsaved.is_empty() {
                return Ok(());
            }
            let index_exists = self.index_path().exists();
            if index.needs_full_save || !index_exists {
                (index.merged(), true, index.removal_epoch)
            } else {
                let mut records: Vec<(String, CacheEntry)> =
                    index.unsaved.iter().map(|(k, v)| (k.clone(), *v)).collect();
                records.sort_unstable_by(|a, b| a.0.cmp(&b.0));
                (records, false, index.removal_epoch)
            }
        };
        let position = {
            let writer = self.writer.lock();
            (writer.current_file, writer.current_offset)
        };

        let result = if full {
            self.write_full(&records, position)
        } else {
            self.write_incremental(&records, position)
        };
        if let Err(e) = result {
            error!(error = %e, full, "Failed to save thumbnail index");
            return Err(e);
        }

        let mut index = self.index.write();
        for (key, entry) in &records {
            if index.unsaved.get(key) == Some(entry) {
                index.unsaved.remove(key);
                index.saved.insert(key.clone(), *entry);
            }
        }
        if full && index.removal_epoch == epoch {
            index.needs_full_save = false;
        }
        debug!(records = records.len(), full, "Saved thumbnail index");
        Ok(())
    }

    fn write_full(&self, records: &[(String, CacheEntry)], position: (u32, u64)) -> CacheResult<()> {
        let count = record_count(records.len())?;
        let temp = NamedTempFile::new_in(&self.options.directory)?;
        let mut out = BufWriter::new(temp);
        out.write_all(MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        out.write_all(&self.options.thumbnail_size.to_le_bytes())?;
        out.write_all(&position.0.to_le_bytes())?;
        out.write_all(&position.1.to_le_bytes())?;
        out.write_all(&count.to_le_bytes())?;
        for (key, entry) in records {
            write_record(&mut out, key, *entry)?;
        }
        let temp = out
            .into_inner()
            .map_err(|e| CacheError::IoError(format!("Failed to flush index: {e}")))?;
        temp.persist(self.index_path())
            .map_err(|e| CacheError::IoError(format!("Failed to replace index: {e}")))?;
        Ok(())
    }

    fn write_incremental(
        &self,
        records: &[(String, CacheEntry)],
        position: (u32, u64),
    ) -> CacheResult<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.index_path())?;
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        let existing = parse_header(&header)
            .ok()
            .filter(|header| header.version == VERSION)
            .ok_or_else(|| CacheError::InvalidIndex("Index header changed on disk".to_string()))?;
        let count = record_count(existing.record_count as usize + records.len())?;

        file.seek(SeekFrom::End(0))?;
        let mut out = BufWriter::new(&mut file);
        for (key, entry) in records {
            write_record(&mut out, key, *entry)?;
        }
        out.flush()?;
        drop(out);

        file.seek(SeekFrom::Start(16))?;
        file.write_all(&position.0.to_le_bytes())?;
        file.write_all(&position.1.to_le_bytes())?;
        file.write_all(&count.to_le_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn index_path(&self) -> PathBuf {
        self.options.directory.join(INDEX_FILE)
    }
}

impl ThumbnailPresence for ThumbnailCache {
    fn contains(&self, identity: &FileIdentity) -> bool {
        Self::contains(self, identity)
    }
}

impl Drop for ThumbnailCache {
    fn drop(&mut self) {
        self.timer.shutdown();
        if let Some(handle) = self.timer_thread.lock().take()
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            warn!("Thumbnail cache save timer panicked");
        }
        if let Err(e) = self.save() {
            error!(error = %e, "Final thumbnail cache save failed");
        }
    }
}

impl std::fmt::Debug for ThumbnailCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailCache")
            .field("directory", &self.options.directory)
            .field("entries", &self.size())
            .finish_non_exhaustive()
    }
}

fn blob_path(dir: &Path, file_index: u32) -> PathBuf {
    dir.join(format!("{BLOB_PREFIX}{file_index}"))
}

fn remove_blob_files(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let is_blob = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix(BLOB_PREFIX))
            .is_some_and(|suffix| suffix.parse::<u32>().is_ok());
        if is_blob && let Err(e) = std::fs::remove_file(entry.path()) {
            warn!(path = %entry.path().display(), error = %e, "Failed to remove blob file");
        }
    }
}

fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.flush()
}

fn record_count(len: usize) -> CacheResult<u32> {
    u32::try_from(len).map_err(|_| CacheError::InvalidIndex("Too many records".to_string()))
}

fn write_record(out: &mut impl Write, key: &str, entry: CacheEntry) -> CacheResult<()> {
    let key_len = u32::try_from(key.len())
        .map_err(|_| CacheError::InvalidIndex("Key too long".to_string()))?;
    out.write_all(&key_len.to_le_bytes())?;
    out.write_all(key.as_bytes())?;
    out.write_all(&entry.file_index.to_le_bytes())?;
    out.write_all(&entry.offset.to_le_bytes())?;
    out.write_all(&entry.length.to_le_bytes())?;
    Ok(())
}

struct IndexHeader {
    version: u32,
    thumbnail_size: Option<u32>,
    current_file: u32,
    current_offset: u64,
    record_count: u32,
    header_len: usize,
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)?.try_into().ok().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8)?.try_into().ok().map(u64::from_le_bytes)
    }

    const fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

fn parse_header(bytes: &[u8]) -> Result<IndexHeader, InvalidationReason> {
    let mut reader = ByteReader::new(bytes);
    if reader.take(MAGIC.len()) != Some(MAGIC.as_slice()) {
        return Err(InvalidationReason::Corrupt);
    }
    let version = reader.u32().ok_or(InvalidationReason::Corrupt)?;
    let thumbnail_size = match version {
        VERSION => Some(reader.u32().ok_or(InvalidationReason::Corrupt)?),
        COMPATIBLE_VERSION => None,
        _ => return Err(InvalidationReason::VersionMismatch),
    };
    let current_file = reader.u32().ok_or(InvalidationReason::Corrupt)?;
    let current_offset = reader.u64().ok_or(InvalidationReason::Corrupt)?;
    let record_count = reader.u32().ok_or(InvalidationReason::Corrupt)?;
    Ok(IndexHeader {
        version,
        thumbnail_size,
        current_file,
        current_offset,
        record_count,
        header_len: if version == VERSION {
            HEADER_SIZE
        } else {
            V1_HEADER_SIZE
        },
    })
}

fn load_index(
    options: &CacheOptions,
) -> Result<Option<(IndexState, BlobWriter)>, InvalidationReason> {
    let path = options.directory.join(INDEX_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read thumbnail index");
            return Err(InvalidationReason::Corrupt);
        }
    };

    let header = parse_header(&bytes)?;
    if let Some(size) = header.thumbnail_size
        && size != options.thumbnail_size
    {
        info!(stored = size, configured = options.thumbnail_size, "Thumbnail size changed");
        return Err(InvalidationReason::SizeChanged);
    }

    let mut reader = ByteReader::new(&bytes);
    reader.take(header.header_len).ok_or(InvalidationReason::Corrupt)?;
    let mut saved = HashMap::with_capacity(header.record_count as usize);
    for _ in 0..header.record_count {
        let key_len = reader.u32().ok_or(InvalidationReason::Corrupt)? as usize;
        let key = reader
            .take(key_len)
            .and_then(|k| std::str::from_utf8(k).ok())
            .ok_or(InvalidationReason::Corrupt)?;
        let entry = CacheEntry {
            file_index: reader.u32().ok_or(InvalidationReason::Corrupt)?,
            offset: reader.u64().ok_or(InvalidationReason::Corrupt)?,
            length: reader.u32().ok_or(InvalidationReason::Corrupt)?,
        };
        saved.insert(key.to_string(), entry);
    }
    if !reader.is_at_end() {
        debug!(path = %path.display(), "Ignoring trailing bytes after index records");
    }

    let index = IndexState {
        saved,
        needs_full_save: header.version != VERSION,
        ..IndexState::default()
    };
    let writer = BlobWriter {
        current_file: header.current_file,
        current_offset: header.current_offset,
        ..BlobWriter::default()
    };
    Ok(Some((index, writer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> CacheOptions {
        CacheOptions {
            save_debounce: Duration::from_secs(3600),
            ..CacheOptions::new(dir.path().to_path_buf())
        }
    }

    fn id(n: usize) -> FileIdentity {
        FileIdentity::new(format!("/photos/img-{n}.jpg"))
    }

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    #[test]
    fn test_insert_then_lookup() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let cache = ThumbnailCache::open(options(&dir))?;
        cache.insert(&id(1), &gradient(64, 48))?;

        assert!(cache.contains(&id(1)));
        let bytes = cache.lookup(&id(1)).ok_or("missing thumbnail")?;
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (64, 48));

        let image = cache.lookup_image(&id(1)).ok_or("missing decoded thumbnail")?;
        assert_eq!(image.width(), 64);
        assert!(cache.lookup(&id(2)).is_none());
        Ok(())
    }

    #[test]
    fn test_oversized_image_is_scaled_down() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let cache = ThumbnailCache::open(CacheOptions {
            thumbnail_size: 32,
            ..options(&dir)
        })?;
        cache.insert(&id(1), &gradient(128, 64))?;
        let image = cache.lookup_image(&id(1)).ok_or("missing thumbnail")?;
        assert_eq!((image.width(), image.height()), (32, 16));
        Ok(())
    }

    #[test]
    fn test_persistence_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        {
            let cache = ThumbnailCache::open(options(&dir))?;
            for n in 0..5 {
                cache.insert(&id(n), &gradient(16, 16))?;
            }
            cache.save()?;
        }

        let cache = ThumbnailCache::open(options(&dir))?;
        assert_eq!(cache.invalidation(), None);
        assert_eq!(cache.size(), 5);
        for n in 0..5 {
            assert!(cache.contains(&id(n)));
        }
        assert!(cache.lookup(&id(3)).is_some());
        Ok(())
    }

    #[test]
    fn test_incremental_save_appends_records() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let index_path = dir.path().join(INDEX_FILE);
        {
            let cache = ThumbnailCache::open(options(&dir))?;
            cache.insert(&id(1), &gradient(16, 16))?;
            cache.save()?;
            let first_len = std::fs::metadata(&index_path)?.len();

            cache.insert(&id(2), &gradient(16, 16))?;
            cache.insert(&id(1), &gradient(8, 8))?;
            cache.save()?;
            assert!(std::fs::metadata(&index_path)?.len() > first_len);
        }

        let cache = ThumbnailCache::open(options(&dir))?;
        assert_eq!(cache.size(), 2);
        let image = cache.lookup_image(&id(1)).ok_or("missing thumbnail")?;
        assert_eq!(image.width(), 8);
        Ok(())
    }

    #[test]
    fn test_drop_saves_pending_entries() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        {
            let cache = ThumbnailCache::open(options(&dir))?;
            cache.insert(&id(1), &gradient(16, 16))?;
        }
        let cache = ThumbnailCache::open(options(&dir))?;
        assert!(cache.contains(&id(1)));
        Ok(())
    }

    #[test]
    fn test_threshold_triggers_save() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let cache = ThumbnailCache::open(CacheOptions {
            save_threshold: 2,
            ..options(&dir)
        })?;
        cache.insert(&id(1), &gradient(8, 8))?;
        assert!(!dir.path().join(INDEX_FILE).exists());
        cache.insert(&id(2), &gradient(8, 8))?;
        assert!(dir.path().join(INDEX_FILE).exists());
        assert_eq!(cache.stats().unsaved, 0);
        Ok(())
    }

    #[test]
    fn test_debounced_save() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let cache = ThumbnailCache::open(CacheOptions {
            save_debounce: Duration::from_millis(20),
            ..options(&dir)
        })?;
        cache.insert(&id(1), &gradient(8, 8))?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.stats().unsaved > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cache.stats().unsaved, 0);
        assert!(dir.path().join(INDEX_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_flush_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let cache = ThumbnailCache::open(options(&dir))?;
        cache.insert(&id(1), &gradient(8, 8))?;
        cache.save()?;

        cache.flush()?;
        assert_eq!(cache.size(), 0);
        assert!(!cache.contains(&id(1)));
        assert!(!blob_path(dir.path(), 0).exists());
        cache.flush()?;
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.invalidation(), None);

        cache.insert(&id(2), &gradient(8, 8))?;
        assert!(cache.lookup(&id(2)).is_some());
        Ok(())
    }

    #[test]
    fn test_removal_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        {
            let cache = ThumbnailCache::open(options(&dir))?;
            cache.insert(&id(1), &gradient(8, 8))?;
            cache.insert(&id(2), &gradient(8, 8))?;
            cache.save()?;
            cache.remove_thumbnails([&id(1)]);
            assert!(!cache.contains(&id(1)));
            cache.save()?;
        }
        let cache = ThumbnailCache::open(options(&dir))?;
        assert!(!cache.contains(&id(1)));
        assert!(cache.contains(&id(2)));
        Ok(())
    }

    #[test]
    fn test_blob_files_roll_over() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let cache = ThumbnailCache::open(CacheOptions {
            max_blob_size: 1024,
            ..options(&dir)
        })?;
        for n in 0..6 {
            cache.insert(&id(n), &gradient(32, 32))?;
        }
        assert!(cache.stats().current_file > 0);
        assert!(blob_path(dir.path(), 1).exists());
        for n in 0..6 {
            let bytes = cache.lookup(&id(n)).ok_or("missing thumbnail")?;
            assert!(image::load_from_memory(&bytes).is_ok());
        }
        Ok(())
    }

    #[test]
    fn test_unknown_version_starts_cold() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 24]);
        std::fs::write(dir.path().join(INDEX_FILE), bytes)?;
        std::fs::write(blob_path(dir.path(), 0), b"stale")?;

        let cache = ThumbnailCache::open(options(&dir))?;
        assert_eq!(cache.invalidation(), Some(InvalidationReason::VersionMismatch));
        assert!(cache.is_empty());
        assert!(!blob_path(dir.path(), 0).exists());
        Ok(())
    }

    #[test]
    fn test_size_change_starts_cold() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        {
            let cache = ThumbnailCache::open(options(&dir))?;
            cache.insert(&id(1), &gradient(8, 8))?;
            cache.save()?;
        }
        let cache = ThumbnailCache::open(CacheOptions {
            thumbnail_size: 128,
            ..options(&dir)
        })?;
        assert_eq!(cache.invalidation(), Some(InvalidationReason::SizeChanged));
        assert!(!cache.contains(&id(1)));
        Ok(())
    }

    #[test]
    fn test_garbage_index_starts_cold() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join(INDEX_FILE), b"nonsense")?;
        let cache = ThumbnailCache::open(options(&dir))?;
        assert_eq!(cache.invalidation(), Some(InvalidationReason::Corrupt));
        Ok(())
    }

    fn write_v1_index(dir: &Path, key: &str, entry: CacheEntry) -> Result<(), Box<dyn std::error::Error>> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&COMPATIBLE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&u64::from(entry.length).to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        write_record(&mut bytes, key, entry)?;
        std::fs::write(dir.join(INDEX_FILE), bytes)?;
        Ok(())
    }

    #[test]
    fn test_version_one_index_is_upgraded() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let mut jpeg = Vec::new();
        gradient(8, 8)
            .to_rgb8()
            .write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, 80))?;
        std::fs::write(blob_path(dir.path(), 0), &jpeg)?;
        let entry = CacheEntry {
            file_index: 0,
            offset: 0,
            length: u32::try_from(jpeg.len())?,
        };
        write_v1_index(dir.path(), id(1).as_str(), entry)?;

        {
            let cache = ThumbnailCache::open(options(&dir))?;
            assert_eq!(cache.invalidation(), None);
            assert!(cache.lookup_image(&id(1)).is_some());
            cache.save()?;
        }
        let bytes = std::fs::read(dir.path().join(INDEX_FILE))?;
        assert_eq!(parse_header(&bytes).ok().map(|h| h.version), Some(VERSION));
        Ok(())
    }

    #[test]
    fn test_entry_past_blob_end_is_absent() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        std::fs::write(blob_path(dir.path(), 0), b"short")?;
        let entry = CacheEntry {
            file_index: 0,
            offset: 2,
            length: 100,
        };
        write_v1_index(dir.path(), id(1).as_str(), entry)?;

        let cache = ThumbnailCache::open(options(&dir))?;
        assert!(cache.contains(&id(1)));
        assert!(cache.lookup(&id(1)).is_none());
        Ok(())
    }

    #[test]
    fn test_writer_resumes_after_existing_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        {
            let cache = ThumbnailCache::open(options(&dir))?;
            cache.insert(&id(1), &gradient(8, 8))?;
            cache.save()?;
            // Bytes written after the last save must not be overwritten.
            cache.insert(&id(2), &gradient(8, 8))?;
            let stats = cache.stats();
            std::mem::forget(cache);
            assert!(stats.current_offset > 0);
        }
        let cache = ThumbnailCache::open(options(&dir))?;
        let on_disk = std::fs::metadata(blob_path(dir.path(), 0))?.len();
        assert_eq!(cache.stats().current_offset, on_disk);
        assert!(!cache.contains(&id(2)));
        Ok(())
    }

    #[test]
    fn test_presence_port() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let cache = ThumbnailCache::open(options(&dir))?;
        cache.insert(&id(1), &gradient(8, 8))?;
        let presence: Arc<dyn ThumbnailPresence> = cache.clone();
        assert!(presence.contains(&id(1)));
        assert!(!presence.contains(&id(2)));
        Ok(())
    }
}
