//! Port for the external video thumbnail job runner.

use crate::domain::entities::{ImageRequest, StopAction, VideoJobPriority};
use crate::domain::ports::ClientId;

/// Produces still frames for video files.
///
/// The runner owns the request from `submit` on. Once it has a snapshot it
/// feeds a [`crate::domain::entities::RequestKind::VideoRescale`] request
/// back through the loader, or reports cancellation to the client itself.
pub trait VideoThumbnailer: Send + Sync {
    /// Queues a video request. Returns false if the runner cannot take it.
    fn submit(&self, request: ImageRequest, priority: VideoJobPriority) -> bool;

    /// Cancels queued jobs of `client` that fall under `action`.
    fn cancel(&self, client: ClientId, action: StopAction);
}
