//! Image decode job descriptor.
//!
//! A request is owned by exactly one party at a time: the component that built
//! it, the loader queue, a worker, and finally the loader again while the
//! result is delivered. It moves between them by value.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{FileIdentity, Priority};
use crate::domain::ports::{ClientHandle, ClientId, ThumbnailPresence};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one request object.
///
/// Two value-equal requests still have distinct ids; the id tracks the
/// object through the queue's active set and the loader's in-flight set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Requested output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TargetSize {
    /// Full resolution, no scaling.
    #[default]
    Full,
    /// Fit within the given box.
    Bounded {
        /// Maximum width in pixels.
        width: u32,
        /// Maximum height in pixels.
        height: u32,
    },
}

impl TargetSize {
    /// Creates a bounding box size.
    #[must_use]
    pub const fn bounded(width: u32, height: u32) -> Self {
        Self::Bounded { width, height }
    }

    /// Creates a square bounding box.
    #[must_use]
    pub const fn square(edge: u32) -> Self {
        Self::Bounded {
            width: edge,
            height: edge,
        }
    }

    /// Returns the box dimensions, or `None` for full size.
    #[must_use]
    pub const fn dimensions(self) -> Option<(u32, u32)> {
        match self {
            Self::Full => None,
            Self::Bounded { width, height } => Some((width, height)),
        }
    }

    /// Returns the longer edge of the box, or `None` for full size.
    #[must_use]
    pub fn max_edge(self) -> Option<u32> {
        self.dimensions().map(|(w, h)| w.max(h))
    }
}

/// Kind-specific part of a request.
#[derive(Clone)]
pub enum RequestKind {
    /// Plain image or thumbnail request.
    Image,
    /// Preload request that becomes unnecessary once the thumbnail cache
    /// already holds the file.
    Preload {
        /// Cache consulted by [`ImageRequest::still_needed`].
        cache: Arc<dyn ThumbnailPresence>,
    },
    /// Video request whose pixels come from a pre-rendered still frame.
    VideoRescale {
        /// On-disk snapshot to decode in place of the video file.
        snapshot: PathBuf,
    },
    /// Sentinel handed to workers during shutdown.
    Exit,
}

impl std::fmt::Debug for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "Image"),
            Self::Preload { .. } => write!(f, "Preload"),
            Self::VideoRescale { snapshot } => f
                .debug_struct("VideoRescale")
                .field("snapshot", snapshot)
                .finish(),
            Self::Exit => write!(f, "Exit"),
        }
    }
}

/// Value identity of a request.
///
/// Equality covers file, size, angle, client and priority. The derived order
/// is lexicographic in that field order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    identity: FileIdentity,
    size: TargetSize,
    angle: i32,
    client: Option<ClientId>,
    priority: Priority,
    exit: bool,
}

impl RequestKey {
    /// Returns true if the request carries a client.
    #[must_use]
    pub const fn has_client(&self) -> bool {
        self.client.is_some()
    }
}

/// One decode job.
#[derive(Debug)]
pub struct ImageRequest {
    id: RequestId,
    identity: FileIdentity,
    kind: RequestKind,
    size: TargetSize,
    angle: i32,
    priority: Priority,
    client: Option<ClientHandle>,
    loaded_ok: bool,
    thumbnail_request: bool,
    upscale: bool,
    pre_rotated: bool,
    full_size: Option<(u32, u32)>,
}

impl ImageRequest {
    /// Creates a plain image request.
    #[must_use]
    pub fn new(
        identity: FileIdentity,
        size: TargetSize,
        angle: i32,
        client: Option<ClientHandle>,
    ) -> Self {
        Self::with_kind(RequestKind::Image, identity, size, angle, client)
    }

    /// Creates a preload request that is skipped once `cache` holds `identity`.
    #[must_use]
    pub fn preload(
        identity: FileIdentity,
        size: TargetSize,
        angle: i32,
        client: Option<ClientHandle>,
        cache: Arc<dyn ThumbnailPresence>,
    ) -> Self {
        Self::with_kind(RequestKind::Preload { cache }, identity, size, angle, client)
    }

    /// Creates a request that decodes `snapshot` on behalf of the video `identity`.
    #[must_use]
    pub fn video_rescale(
        identity: FileIdentity,
        snapshot: PathBuf,
        size: TargetSize,
        angle: i32,
        client: Option<ClientHandle>,
    ) -> Self {
        Self::with_kind(
            RequestKind::VideoRescale { snapshot },
            identity,
            size,
            angle,
            client,
        )
    }

    /// Creates the shutdown sentinel.
    #[must_use]
    pub fn exit() -> Self {
        Self::with_kind(
            RequestKind::Exit,
            FileIdentity::new(""),
            TargetSize::Full,
            0,
            None,
        )
    }

    fn with_kind(
        kind: RequestKind,
        identity: FileIdentity,
        size: TargetSize,
        angle: i32,
        client: Option<ClientHandle>,
    ) -> Self {
        Self {
            id: RequestId::next(),
            identity,
            kind,
            size,
            angle,
            priority: Priority::default(),
            client,
            loaded_ok: false,
            thumbnail_request: false,
            upscale: false,
            pre_rotated: false,
            full_size: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the request as a thumbnail request.
    #[must_use]
    pub fn with_thumbnail_request(mut self, thumbnail: bool) -> Self {
        self.thumbnail_request = thumbnail;
        self
    }

    /// Allows scaling images that are smaller than the target box.
    #[must_use]
    pub fn with_upscale(mut self, upscale: bool) -> Self {
        self.upscale = upscale;
        self
    }

    /// Declares that decoded pixels already carry the rotation.
    #[must_use]
    pub fn with_pre_rotated(mut self, pre_rotated: bool) -> Self {
        self.pre_rotated = pre_rotated;
        self
    }

    /// Returns the object identity of this request.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Returns the catalog identity.
    #[must_use]
    pub const fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    /// Returns the file that is actually decoded.
    #[must_use]
    pub fn file_system_path(&self) -> &Path {
        match &self.kind {
            RequestKind::VideoRescale { snapshot } => snapshot.as_path(),
            _ => self.identity.as_path(),
        }
    }

    /// Returns the request kind.
    #[must_use]
    pub const fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// Returns the requested size.
    #[must_use]
    pub const fn size(&self) -> TargetSize {
        self.size
    }

    /// Returns the rotation angle in degrees.
    #[must_use]
    pub const fn angle(&self) -> i32 {
        self.angle
    }

    /// Returns the priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Changes the priority.
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Returns the requesting client, if any.
    #[must_use]
    pub const fn client(&self) -> Option<&ClientHandle> {
        self.client.as_ref()
    }

    /// Returns true if the request was decoded successfully.
    #[must_use]
    pub const fn loaded_ok(&self) -> bool {
        self.loaded_ok
    }

    /// Records whether the decode succeeded.
    pub fn set_loaded_ok(&mut self, ok: bool) {
        self.loaded_ok = ok;
    }

    /// Returns true for thumbnail requests.
    #[must_use]
    pub const fn is_thumbnail_request(&self) -> bool {
        self.thumbnail_request
    }

    /// Returns true if upscaling is allowed.
    #[must_use]
    pub const fn upscale_allowed(&self) -> bool {
        self.upscale
    }

    /// Returns true if decoded pixels are already rotated.
    #[must_use]
    pub const fn is_pre_rotated(&self) -> bool {
        self.pre_rotated
    }

    /// Returns the full decoded size, once known.
    #[must_use]
    pub const fn full_size(&self) -> Option<(u32, u32)> {
        self.full_size
    }

    /// Records the full decoded size.
    pub fn set_full_size(&mut self, size: (u32, u32)) {
        self.full_size = Some(size);
    }

    /// Returns true for the shutdown sentinel.
    #[must_use]
    pub const fn is_exit(&self) -> bool {
        matches!(self.kind, RequestKind::Exit)
    }

    /// Returns false once the work has become pointless.
    #[must_use]
    pub fn still_needed(&self) -> bool {
        match &self.kind {
            RequestKind::Preload { cache } => !cache.contains(&self.identity),
            RequestKind::Image | RequestKind::VideoRescale { .. } | RequestKind::Exit => true,
        }
    }

    /// Returns the value identity used for deduplication.
    #[must_use]
    pub fn key(&self) -> RequestKey {
        RequestKey {
            identity: self.identity.clone(),
            size: self.size,
            angle: self.angle,
            client: self.client.as_ref().map(ClientHandle::id),
            priority: self.priority,
            exit: self.is_exit(),
        }
    }

    /// Returns true if the request belongs to `client`.
    #[must_use]
    pub fn belongs_to(&self, client: ClientId) -> bool {
        self.client.as_ref().is_some_and(|c| c.id() == client)
    }
}

impl PartialEq for ImageRequest {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ImageRequest {}
