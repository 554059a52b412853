//! Decoding threads.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use image::DynamicImage;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::domain::entities::ImageRequest;
use crate::domain::ports::ImageDecoder;

use super::async_loader::LoaderShared;
use super::decoder_registry::DecoderRegistry;
use super::decoders::{self, GenericDecoder, JpegDecoder};
use super::events::LoaderEvent;
use super::thumbnail_store::{FileThumbnailStore, ThumbnailBucket};
use super::transform;

/// Scratch buffers above this size are released after the job.
const SCRATCH_RETAIN: usize = 64 * 1024 * 1024;

/// Decode, rotate and scale steps run for every request.
///
/// Owns the worker's scratch buffer, which is reused across jobs.
pub struct DecodePipeline {
    decoders: Arc<DecoderRegistry>,
    store: Option<Arc<FileThumbnailStore>>,
    scratch: Vec<u8>,
}

impl DecodePipeline {
    /// Creates a pipeline over `decoders`, optionally backed by `store`.
    #[must_use]
    pub fn new(decoders: Arc<DecoderRegistry>, store: Option<Arc<FileThumbnailStore>>) -> Self {
        Self {
            decoders,
            store,
            scratch: Vec::new(),
        }
    }

    /// Produces the pixels for `request`.
    ///
    /// Sets the request's full size and `loaded_ok` flag. Returns `None` when
    /// every decoder failed.
    pub fn process(&mut self, request: &mut ImageRequest) -> Option<DynamicImage> {
        let image = self.produce(request);
        request.set_loaded_ok(image.is_some());
        if self.scratch.capacity() > SCRATCH_RETAIN {
            self.scratch = Vec::new();
        }
        image
    }

    fn produce(&mut self, request: &mut ImageRequest) -> Option<DynamicImage> {
        let mut image = match self.stored_thumbnail(request) {
            Some(image) => image,
            None => {
                let image = self.decode(request)?;
                self.store_thumbnail(request, &image);
                image
            }
        };

        if request.angle() != 0 && !request.is_pre_rotated() {
            let (rotated, swapped) = transform::rotate(image, request.angle());
            image = rotated;
            if swapped && let Some((width, height)) = request.full_size() {
                request.set_full_size((height, width));
            }
        }

        if let Some(bounds) = request.size().dimensions()
            && transform::should_scale(
                (image.width(), image.height()),
                Some(bounds),
                request.upscale_allowed(),
            )
        {
            image = transform::scale_to_fit(&image, bounds);
        }

        Some(image)
    }

    fn stored_thumbnail(&self, request: &mut ImageRequest) -> Option<DynamicImage> {
        let store = self.store.as_ref()?;
        let bucket = ThumbnailBucket::for_max_edge(request.size().max_edge())?;
        let stored = store.load_valid(request.identity(), bucket)?;
        request.set_full_size((stored.metadata.image_width, stored.metadata.image_height));
        Some(stored.image)
    }

    fn decode(&mut self, request: &mut ImageRequest) -> Option<DynamicImage> {
        let path = request.file_system_path();
        if !path.exists() {
            debug!(file = %request.identity(), path = %path.display(), "Source file missing");
            return None;
        }

        let dim = self.decode_edge(request);
        let attempt = if decoders::looks_like_jpeg(path) {
            JpegDecoder.decode(request, dim, &mut self.scratch)
        } else {
            self.decoders.decode(request, dim, &mut self.scratch)
        };

        let decoded = match attempt {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(file = %request.identity(), error = %e, "Falling back to generic decoder");
                match GenericDecoder.decode(request, None, &mut self.scratch) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!(file = %request.identity(), error = %e, "Failed to decode image");
                        return None;
                    }
                }
            }
        };

        request.set_full_size(decoded.full_size);
        Some(decoded.image)
    }

    /// Returns the size hint handed to the decoders.
    ///
    /// Thumbnail requests that fill the store are decoded large enough for
    /// every bucket, not just for the requested size.
    fn decode_edge(&self, request: &ImageRequest) -> Option<u32> {
        let dim = request.size().max_edge()?;
        if self.store.is_some() && request.is_thumbnail_request() {
            Some(dim.max(ThumbnailBucket::Large.edge()))
        } else {
            Some(dim)
        }
    }

    fn store_thumbnail(&self, request: &ImageRequest, image: &DynamicImage) {
        let Some(store) = &self.store else {
            return;
        };
        if !request.is_thumbnail_request() {
            return;
        }
        let full_size = request
            .full_size()
            .unwrap_or((image.width(), image.height()));
        if let Err(e) = store.store_all(request.identity(), image, full_size) {
            warn!(file = %request.identity(), error = %e, "Failed to store thumbnail");
        }
    }
}

/// One decoding thread of an [`super::AsyncLoader`].
pub(crate) struct Worker {
    index: usize,
    shared: Arc<LoaderShared>,
    events: mpsc::UnboundedSender<LoaderEvent>,
    pipeline: DecodePipeline,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        shared: Arc<LoaderShared>,
        events: mpsc::UnboundedSender<LoaderEvent>,
        pipeline: DecodePipeline,
    ) -> Self {
        Self {
            index,
            shared,
            events,
            pipeline,
        }
    }

    /// Starts the thread.
    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("image-loader-{}", self.index))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        debug!(worker = self.index, "Image loader worker started");
        loop {
            let mut request = self.shared.next();
            if request.is_exit() {
                break;
            }
            trace!(worker = self.index, file = %request.identity(), "Decoding");
            let image = self.pipeline.process(&mut request);
            if self
                .events
                .send(LoaderEvent::Loaded { request, image })
                .is_err()
            {
                debug!(worker = self.index, "Loader gone, dropping result");
                break;
            }
        }
        debug!(worker = self.index, "Image loader worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{FileIdentity, TargetSize};
    use crate::domain::ports::mock::FakeDecoder;
    use std::path::Path;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) -> FileIdentity {
        let path = dir.path().join(name);
        std::fs::write(&path, b"not really an image").unwrap();
        FileIdentity::new(path)
    }

    fn save_png(path: &Path, width: u32, height: u32) {
        DynamicImage::new_rgb8(width, height).save(path).unwrap();
    }

    fn registry_with(decoder: Arc<FakeDecoder>) -> Arc<DecoderRegistry> {
        let mut registry = DecoderRegistry::new();
        registry.register(decoder);
        Arc::new(registry)
    }

    #[test]
    fn test_rotates_then_scales_into_box() {
        let dir = TempDir::new().unwrap();
        let decoder = Arc::new(FakeDecoder::reducing("fake", "xyz", (4000, 3000), (400, 300)));
        let mut pipeline = DecodePipeline::new(registry_with(decoder), None);
        let mut request = ImageRequest::new(
            touch(&dir, "photo.xyz"),
            TargetSize::bounded(200, 150),
            90,
            None,
        );

        let image = pipeline.process(&mut request).unwrap();

        assert!(request.loaded_ok());
        assert_eq!(request.full_size(), Some((3000, 4000)));
        assert!(image.width() <= 200 && image.height() <= 150);
        assert_eq!((image.width(), image.height()), (113, 150));
    }

    #[test]
    fn test_pre_rotated_image_is_not_rotated() {
        let dir = TempDir::new().unwrap();
        let decoder = Arc::new(FakeDecoder::succeeding("fake", "xyz", (40, 30)));
        let mut pipeline = DecodePipeline::new(registry_with(decoder), None);
        let mut request = ImageRequest::new(touch(&dir, "raw.xyz"), TargetSize::Full, 90, None)
            .with_pre_rotated(true);

        let image = pipeline.process(&mut request).unwrap();
        assert_eq!((image.width(), image.height()), (40, 30));
        assert_eq!(request.full_size(), Some((40, 30)));
    }

    #[test]
    fn test_small_image_is_not_upscaled_unless_allowed() {
        let dir = TempDir::new().unwrap();
        let decoder = Arc::new(FakeDecoder::succeeding("fake", "xyz", (50, 40)));
        let mut pipeline = DecodePipeline::new(registry_with(decoder), None);
        let identity = touch(&dir, "small.xyz");

        let mut plain = ImageRequest::new(identity.clone(), TargetSize::square(100), 0, None);
        let image = pipeline.process(&mut plain).unwrap();
        assert_eq!((image.width(), image.height()), (50, 40));

        let mut upscaled =
            ImageRequest::new(identity, TargetSize::square(100), 0, None).with_upscale(true);
        let image = pipeline.process(&mut upscaled).unwrap();
        assert_eq!((image.width(), image.height()), (100, 80));
    }

    #[test]
    fn test_missing_file_fails_without_decoding() {
        let decoder = Arc::new(FakeDecoder::succeeding("fake", "xyz", (10, 10)));
        let mut pipeline = DecodePipeline::new(registry_with(decoder.clone()), None);
        let mut request = ImageRequest::new(
            FileIdentity::new("/nonexistent/photo.xyz"),
            TargetSize::square(64),
            0,
            None,
        );

        assert!(pipeline.process(&mut request).is_none());
        assert!(!request.loaded_ok());
        assert_eq!(decoder.calls(), 0);
    }

    #[test]
    fn test_generic_fallback_after_decoder_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("picture.png");
        save_png(&path, 30, 20);
        let decoder = Arc::new(FakeDecoder::failing("broken", "png"));
        let mut pipeline = DecodePipeline::new(registry_with(decoder.clone()), None);
        let mut request = ImageRequest::new(FileIdentity::new(&path), TargetSize::Full, 0, None);

        let image = pipeline.process(&mut request).unwrap();
        assert_eq!(decoder.calls(), 1);
        assert_eq!((image.width(), image.height()), (30, 20));
        assert_eq!(request.full_size(), Some((30, 20)));
    }

    #[test]
    fn test_jpeg_fast_path_skips_registry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        DynamicImage::new_rgb8(64, 48).to_rgb8().save(&path).unwrap();
        let decoder = Arc::new(FakeDecoder::succeeding("fake", "jpg", (1, 1)));
        let mut pipeline = DecodePipeline::new(registry_with(decoder.clone()), None);
        let mut request = ImageRequest::new(FileIdentity::new(&path), TargetSize::Full, 0, None);

        let image = pipeline.process(&mut request).unwrap();
        assert_eq!(decoder.calls(), 0);
        assert_eq!((image.width(), image.height()), (64, 48));
    }

    #[test]
    fn test_thumbnail_request_is_served_from_store_next_time() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileThumbnailStore::new(dir.path().join("store")));
        let decoder = Arc::new(FakeDecoder::succeeding("fake", "xyz", (600, 400)));
        let mut pipeline = DecodePipeline::new(registry_with(decoder.clone()), Some(store.clone()));
        let identity = touch(&dir, "photo.xyz");

        let mut first = ImageRequest::new(identity.clone(), TargetSize::square(128), 0, None)
            .with_thumbnail_request(true);
        pipeline.process(&mut first).unwrap();
        assert_eq!(decoder.calls(), 1);
        for bucket in ThumbnailBucket::ALL {
            assert!(store.path_for(&identity, bucket).exists());
        }

        let mut second = ImageRequest::new(identity, TargetSize::square(128), 0, None);
        let image = pipeline.process(&mut second).unwrap();
        assert_eq!(decoder.calls(), 1);
        assert_eq!(second.full_size(), Some((600, 400)));
        assert_eq!(image.width().max(image.height()), 128);
    }

    #[test]
    fn test_small_thumbnail_fills_large_bucket_at_full_edge() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        DynamicImage::new_rgb8(800, 600).to_rgb8().save(&path).unwrap();
        let store = Arc::new(FileThumbnailStore::new(dir.path().join("store")));
        let mut pipeline = DecodePipeline::new(Arc::new(DecoderRegistry::new()), Some(store.clone()));
        let identity = FileIdentity::new(&path);

        let mut small = ImageRequest::new(identity.clone(), TargetSize::square(64), 0, None)
            .with_thumbnail_request(true);
        let image = pipeline.process(&mut small).unwrap();
        assert_eq!((image.width(), image.height()), (64, 48));

        let large = store.load_valid(&identity, ThumbnailBucket::Large).unwrap();
        assert_eq!((large.image.width(), large.image.height()), (256, 192));

        let mut bigger = ImageRequest::new(identity, TargetSize::square(256), 0, None);
        let image = pipeline.process(&mut bigger).unwrap();
        assert_eq!((image.width(), image.height()), (256, 192));
        assert_eq!(bigger.full_size(), Some((800, 600)));
    }

    #[test]
    fn test_full_size_request_bypasses_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileThumbnailStore::new(dir.path().join("store")));
        let decoder = Arc::new(FakeDecoder::succeeding("fake", "xyz", (600, 400)));
        let mut pipeline = DecodePipeline::new(registry_with(decoder.clone()), Some(store));
        let identity = touch(&dir, "photo.xyz");

        let mut thumb = ImageRequest::new(identity.clone(), TargetSize::square(256), 0, None)
            .with_thumbnail_request(true);
        pipeline.process(&mut thumb).unwrap();

        let mut full = ImageRequest::new(identity, TargetSize::Full, 0, None);
        let image = pipeline.process(&mut full).unwrap();
        assert_eq!(decoder.calls(), 2);
        assert_eq!((image.width(), image.height()), (600, 400));
    }
}
