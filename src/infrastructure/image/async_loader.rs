//! Image loading coordinator.
//!
//! Requests enter through [`AsyncLoader::load`], wait in a [`RequestQueue`]
//! and are decoded by a fixed pool of worker threads. Results travel back
//! over a channel and are handed to clients by [`AsyncLoader::dispatch_pending`]
//! or [`AsyncLoader::dispatch_next`] on the thread that owns the loader.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use image::DynamicImage;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::domain::entities::{
    ImageRequest, RequestId, RequestKey, RequestKind, StopAction, TargetSize, VideoJobPriority,
};
use crate::domain::errors::LoaderError;
use crate::domain::ports::{ClientHandle, VideoThumbnailer};

use super::decoder_registry::DecoderRegistry;
use super::decoders;
use super::events::LoaderEvent;
use super::request_queue::RequestQueue;
use super::thumbnail_cache::ThumbnailCache;
use super::thumbnail_store::FileThumbnailStore;
use super::transform;
use super::worker::{DecodePipeline, Worker};

/// Placeholder size used for failed full-resolution requests.
const FULL_SIZE_PLACEHOLDER: (u32, u32) = (512, 512);

/// Upper bound of the default worker count.
const MAX_DEFAULT_WORKERS: usize = 16;

/// Configuration for the image loader.
#[derive(Debug, Clone)]
pub struct ImageLoaderConfig {
    /// Number of decoding threads.
    pub worker_threads: usize,
}

impl Default for ImageLoaderConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_count(),
        }
    }
}

/// Returns one less than the detected core count, clamped to `1..=16`.
#[must_use]
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    cores.saturating_sub(1).clamp(1, MAX_DEFAULT_WORKERS)
}

pub(crate) struct LoaderState {
    queue: RequestQueue,
    current_loading: HashMap<RequestId, RequestKey>,
}

/// State shared between the loader and its workers.
pub(crate) struct LoaderShared {
    state: Mutex<LoaderState>,
    sleepers: Condvar,
    exit_requested: AtomicBool,
}

impl LoaderShared {
    /// Blocks until a request is available and marks it as being decoded.
    ///
    /// Returns the exit sentinel once shutdown has been requested and the
    /// queue is empty.
    pub(crate) fn next(&self) -> ImageRequest {
        let mut state = self.state.lock();
        loop {
            let exiting = self.exit_requested.load(Ordering::Acquire);
            if let Some(request) = state.queue.pop_next(exiting) {
                if !request.is_exit() {
                    state.current_loading.insert(request.id(), request.key());
                }
                return request;
            }
            self.sleepers.wait(&mut state);
        }
    }
}

/// Owns the worker pool and delivers decoded images to clients.
pub struct AsyncLoader {
    shared: Arc<LoaderShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    events: mpsc::UnboundedReceiver<LoaderEvent>,
    cache: Option<Arc<ThumbnailCache>>,
    video: Option<Arc<dyn VideoThumbnailer>>,
    placeholders: HashMap<(u32, u32), DynamicImage>,
}

impl std::fmt::Debug for AsyncLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLoader")
            .field("workers", &self.workers.lock().len())
            .field("queued", &self.queued_count())
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl AsyncLoader {
    /// Creates a loader and starts its worker threads.
    ///
    /// Thumbnail requests are stored into `cache` on delivery. Workers
    /// consult and fill `store` for bounded requests.
    ///
    /// # Errors
    /// Returns [`LoaderError::Spawn`] if a worker thread cannot be started.
    pub fn new(
        config: &ImageLoaderConfig,
        decoders: Arc<DecoderRegistry>,
        cache: Option<Arc<ThumbnailCache>>,
        store: Option<Arc<FileThumbnailStore>>,
    ) -> Result<Self, LoaderError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LoaderShared {
            state: Mutex::new(LoaderState {
                queue: RequestQueue::new(event_tx.clone()),
                current_loading: HashMap::new(),
            }),
            sleepers: Condvar::new(),
            exit_requested: AtomicBool::new(false),
        });

        let loader = Self {
            shared: shared.clone(),
            workers: Mutex::new(Vec::with_capacity(config.worker_threads)),
            events: event_rx,
            cache,
            video: None,
            placeholders: HashMap::new(),
        };

        for index in 0..config.worker_threads {
            let pipeline = DecodePipeline::new(decoders.clone(), store.clone());
            let worker = Worker::new(index, shared.clone(), event_tx.clone(), pipeline);
            let handle = worker.spawn().map_err(LoaderError::Spawn)?;
            loader.workers.lock().push(handle);
        }

        info!(
            workers = config.worker_threads,
            decoders = ?decoders.names(),
            "Image loader started"
        );
        Ok(loader)
    }

    /// Routes video files to `thumbnailer` instead of the decoders.
    #[must_use]
    pub fn with_video_thumbnailer(mut self, thumbnailer: Arc<dyn VideoThumbnailer>) -> Self {
        self.video = Some(thumbnailer);
        self
    }

    /// Submits a request.
    ///
    /// A request equal to one that is already queued, or being decoded for a
    /// client that still wants it, is discarded. Returns false if the loader is shutting down, or if the
    /// request is for a video and no video thumbnailer accepted it.
    pub fn load(&self, request: ImageRequest) -> bool {
        if request.is_exit() {
            return false;
        }
        if !matches!(request.kind(), RequestKind::VideoRescale { .. })
            && decoders::is_video(request.identity().as_path())
        {
            return self.load_video(request);
        }

        let key = request.key();
        let mut state = self.shared.state.lock();
        if self.shared.exit_requested.load(Ordering::Acquire) {
            debug!(file = %request.identity(), "Rejecting request during shutdown");
            return false;
        }
        // A cancelled twin still decoding will not deliver to its client, so
        // it does not stand in for this request.
        let in_flight = state.current_loading.iter().any(|(id, loading)| {
            *loading == key && (!key.has_client() || state.queue.is_active(*id))
        });
        if in_flight {
            trace!(file = %request.identity(), "Discarding request already being decoded");
            return true;
        }
        let added = state.queue.add_request(request);
        drop(state);

        if added {
            self.shared.sleepers.notify_one();
        }
        true
    }

    fn load_video(&self, request: ImageRequest) -> bool {
        if self.shared.exit_requested.load(Ordering::Acquire) {
            return false;
        }
        let Some(video) = &self.video else {
            debug!(file = %request.identity(), "No video thumbnailer configured");
            return false;
        };
        let priority = VideoJobPriority::from(request.priority());
        trace!(file = %request.identity(), ?priority, "Forwarding video request");
        video.submit(request, priority)
    }

    /// Cancels requests of `client` covered by `action`.
    pub fn stop(&self, client: &ClientHandle, action: StopAction) {
        self.shared
            .state
            .lock()
            .queue
            .cancel_requests(client, action);
        if let Some(video) = &self.video {
            video.cancel(client.id(), action);
        }
    }

    /// Returns the number of requests being decoded.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.state.lock().current_loading.len()
    }

    /// Returns the number of requests waiting for a worker.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Returns true once [`Self::request_exit`] has been called.
    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.shared.exit_requested.load(Ordering::Acquire)
    }

    /// Stops the worker pool.
    ///
    /// Queued requests are cancelled, requests being decoded finish, and
    /// every worker thread is joined. Later calls to [`Self::load`] return
    /// false.
    pub fn request_exit(&self) {
        {
            let mut state = self.shared.state.lock();
            if !self.shared.exit_requested.swap(true, Ordering::AcqRel) {
                let dropped = state.queue.clear_pending();
                info!(dropped, "Image loader shutting down");
            }
        }
        self.shared.sleepers.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!("Image loader worker panicked");
            }
        }
    }

    /// Delivers every event that has already arrived.
    ///
    /// Returns the number of events handled.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.deliver(event);
            handled += 1;
        }
        handled
    }

    /// Waits for the next event and delivers it.
    ///
    /// Returns false if no more events can arrive.
    pub async fn dispatch_next(&mut self) -> bool {
        match self.events.recv().await {
            Some(event) => {
                self.deliver(event);
                true
            }
            None => false,
        }
    }

    fn deliver(&mut self, event: LoaderEvent) {
        match event {
            LoaderEvent::Loaded { request, image } => self.deliver_loaded(request, image),
            LoaderEvent::Canceled(request) => {
                if let Some(client) = request.client() {
                    trace!(file = %request.identity(), "Delivering cancellation");
                    client.request_canceled(&request);
                }
            }
        }
    }

    fn deliver_loaded(&mut self, request: ImageRequest, image: Option<DynamicImage>) {
        let still_needed = {
            let mut state = self.shared.state.lock();
            let valid = state.queue.is_request_still_valid(&request);
            state.queue.remove_request(&request);
            state.current_loading.remove(&request.id());
            valid
        };

        let image = match image {
            Some(image) if request.loaded_ok() => image,
            _ => self.placeholder(request.size()).clone(),
        };

        if request.is_thumbnail_request()
            && let Some(cache) = &self.cache
            && let Err(e) = cache.insert(request.identity(), &image)
        {
            warn!(file = %request.identity(), error = %e, "Failed to cache thumbnail");
        }

        match request.client() {
            Some(client) if still_needed => client.pixmap_loaded(&request, &image),
            Some(_) => trace!(file = %request.identity(), "Discarding result of cancelled request"),
            None => {}
        }
    }

    fn placeholder(&mut self, size: TargetSize) -> &DynamicImage {
        let (width, height) = size.dimensions().unwrap_or(FULL_SIZE_PLACEHOLDER);
        self.placeholders
            .entry((width, height))
            .or_insert_with(|| transform::broken_image(width, height))
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        self.request_exit();
    }
}
