//! Port for components that receive decoded images.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::entities::ImageRequest;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Receiver of loader results.
///
/// Callbacks run on the thread that drives the loader's event delivery and
/// must not block.
pub trait ImageClient: Send + Sync {
    /// Called with the decoded (or placeholder) image for `request`.
    fn pixmap_loaded(&self, request: &ImageRequest, image: &image::DynamicImage);

    /// Called when `request` was dropped before it was decoded.
    fn request_canceled(&self, _request: &ImageRequest) {}
}

/// Identity of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

/// Shared handle to a client, compared by identity.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    client: Arc<dyn ImageClient>,
}

impl ClientHandle {
    /// Wraps a client and assigns it a fresh identity.
    #[must_use]
    pub fn new(client: Arc<dyn ImageClient>) -> Self {
        Self {
            id: ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)),
            client,
        }
    }

    /// Returns the client identity.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Forwards a decoded image to the client.
    pub fn pixmap_loaded(&self, request: &ImageRequest, image: &image::DynamicImage) {
        self.client.pixmap_loaded(request, image);
    }

    /// Forwards a cancellation to the client.
    pub fn request_canceled(&self, request: &ImageRequest) {
        self.client.request_canceled(request);
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientHandle {}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
