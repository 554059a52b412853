//! Messages posted from workers and the queue back to the loader's owner.

use crate::domain::entities::ImageRequest;

/// Event drained by [`super::AsyncLoader::dispatch_pending`].
#[derive(Debug)]
pub enum LoaderEvent {
    /// A worker finished a request. `image` is `None` when every decoder failed.
    Loaded {
        /// The request, handed back by the worker.
        request: ImageRequest,
        /// Decoded, rotated and scaled pixels.
        image: Option<image::DynamicImage>,
    },
    /// A request was dropped before decoding.
    Canceled(ImageRequest),
}

