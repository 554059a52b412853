//! Batch generation of cached thumbnails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::domain::entities::{FileIdentity, ImageRequest, Priority, StopAction, TargetSize};
use crate::domain::errors::CacheResult;
use crate::domain::ports::{ClientHandle, ImageClient, ThumbnailPresence};
use crate::infrastructure::image::{AsyncLoader, FileThumbnailStore, ThumbnailCache};

/// A file to build a thumbnail for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildItem {
    /// Catalog identity of the file.
    pub identity: FileIdentity,
    /// Rotation stored in the catalog.
    pub angle: i32,
}

impl BuildItem {
    /// Creates an unrotated item.
    #[must_use]
    pub fn new(identity: FileIdentity) -> Self {
        Self { identity, angle: 0 }
    }
}

/// Snapshot of a build's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildProgress {
    /// Requests submitted for the current build.
    pub total: usize,
    /// Requests delivered or cancelled so far.
    pub done: usize,
    /// Deliveries that ended in the placeholder image.
    pub failed: usize,
    /// True between scheduling and cancellation.
    pub building: bool,
}

impl BuildProgress {
    /// Returns true once every submitted request has come back.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.done >= self.total
    }
}

#[derive(Default)]
struct BuildState {
    progress: BuildProgress,
    full_sizes: HashMap<FileIdentity, (u32, u32)>,
}

#[derive(Default)]
struct BuildTracker {
    state: Mutex<BuildState>,
}

impl ImageClient for BuildTracker {
    fn pixmap_loaded(&self, request: &ImageRequest, _image: &image::DynamicImage) {
        let mut state = self.state.lock();
        state.progress.done += 1;
        if !request.loaded_ok() {
            state.progress.failed += 1;
        }
        if let Some(full_size) = request.full_size() {
            state
                .full_sizes
                .insert(request.identity().clone(), full_size);
        }
    }

    fn request_canceled(&self, _request: &ImageRequest) {
        self.state.lock().progress.done += 1;
    }
}

/// Schedules thumbnail requests for whole collections.
///
/// Acts as the loader client of its own requests, counting deliveries and
/// recording the full image sizes the decoders report.
pub struct ThumbnailBuilder {
    cache: Arc<ThumbnailCache>,
    store: Option<Arc<FileThumbnailStore>>,
    tracker: Arc<BuildTracker>,
    client: ClientHandle,
}

impl ThumbnailBuilder {
    /// Creates a builder that fills `cache`.
    #[must_use]
    pub fn new(cache: Arc<ThumbnailCache>) -> Self {
        let tracker = Arc::new(BuildTracker::default());
        let client = ClientHandle::new(tracker.clone());
        Self {
            cache,
            store: None,
            tracker,
            client,
        }
    }

    /// Also discards thumbnails of `store` when rebuilding.
    #[must_use]
    pub fn with_store(mut self, store: Option<Arc<FileThumbnailStore>>) -> Self {
        self.store = store;
        self
    }

    /// Returns the client handle the builder's requests carry.
    #[must_use]
    pub const fn client(&self) -> &ClientHandle {
        &self.client
    }

    /// Discards every cached thumbnail and rebuilds thumbnails for `items`.
    ///
    /// # Errors
    /// Returns an error if the cache or the store cannot be cleared.
    pub fn build_all(&self, loader: &AsyncLoader, items: Vec<BuildItem>) -> CacheResult<usize> {
        self.cache.flush()?;
        if let Some(store) = &self.store {
            store.clear()?;
        }
        Ok(self.schedule(loader, items))
    }

    /// Builds thumbnails for the items the cache does not hold yet.
    pub fn build_missing(&self, loader: &AsyncLoader, items: Vec<BuildItem>) -> usize {
        let total = items.len();
        let needed: Vec<_> = items
            .into_iter()
            .filter(|item| !self.cache.contains(&item.identity))
            .collect();
        debug!(total, needed = needed.len(), "Collected missing thumbnails");
        self.schedule(loader, needed)
    }

    /// Drops the cached thumbnails of `items` and builds them again.
    pub fn rebuild(&self, loader: &AsyncLoader, items: Vec<BuildItem>) -> usize {
        self.cache
            .remove_thumbnails(items.iter().map(|item| &item.identity));
        if let Some(store) = &self.store {
            for item in &items {
                store.remove(&item.identity);
            }
        }
        self.schedule(loader, items)
    }

    /// Submits a build request for every item, cancelling a running build.
    ///
    /// Returns the number of requests the loader accepted.
    pub fn schedule(&self, loader: &AsyncLoader, items: Vec<BuildItem>) -> usize {
        if items.is_empty() {
            return 0;
        }
        if self.progress().building {
            self.cancel(loader);
        }

        {
            let mut state = self.tracker.state.lock();
            state.progress = BuildProgress {
                total: items.len(),
                building: true,
                ..BuildProgress::default()
            };
        }

        let size = TargetSize::square(self.cache.options().thumbnail_size);
        let presence: Arc<dyn ThumbnailPresence> = self.cache.clone();
        let mut accepted = 0;
        for item in items {
            let request = ImageRequest::preload(
                item.identity,
                size,
                item.angle,
                Some(self.client.clone()),
                presence.clone(),
            )
            .with_thumbnail_request(true)
            .with_priority(Priority::BuildThumbnails);
            if loader.load(request) {
                accepted += 1;
            }
        }

        let mut state = self.tracker.state.lock();
        state.progress.total = accepted;
        info!(requests = accepted, "Building thumbnails");
        accepted
    }

    /// Stops every request of the current build.
    pub fn cancel(&self, loader: &AsyncLoader) {
        loader.stop(&self.client, StopAction::StopAll);
        self.tracker.state.lock().progress.building = false;
        debug!("Thumbnail build cancelled");
    }

    /// Returns the current progress.
    #[must_use]
    pub fn progress(&self) -> BuildProgress {
        self.tracker.state.lock().progress
    }

    /// Takes the full image sizes reported since the last call.
    pub fn take_full_sizes(&self) -> HashMap<FileIdentity, (u32, u32)> {
        std::mem::take(&mut self.tracker.state.lock().full_sizes)
    }
}

/// Expands `paths` into build items, descending into directories.
///
/// Files for which `accepts` returns false are skipped. Items come back
/// sorted by identity.
pub fn collect_build_items(paths: &[PathBuf], accepts: impl Fn(&Path) -> bool) -> Vec<BuildItem> {
    let mut items = Vec::new();
    let mut pending = paths.to_vec();
    while let Some(path) = pending.pop() {
        if path.is_dir() {
            match std::fs::read_dir(&path) {
                Ok(entries) => pending.extend(entries.filter_map(|e| e.ok().map(|e| e.path()))),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read directory"),
            }
        } else if accepts(&path) {
            match FileIdentity::try_new(&path) {
                Some(identity) => items.push(BuildItem::new(identity)),
                None => warn!(path = %path.display(), "Skipping file with non UTF-8 path"),
            }
        } else {
            debug!(path = %path.display(), "Skipping unsupported file");
        }
    }
    items.sort_by(|a, b| a.identity.cmp(&b.identity));
    items.dedup();
    items
}

impl std::fmt::Debug for ThumbnailBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailBuilder")
            .field("client", &self.client)
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}
