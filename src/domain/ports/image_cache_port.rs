//! Port definition for thumbnail cache presence checks.

use crate::domain::entities::FileIdentity;

/// Answers whether a thumbnail for a file is already cached.
/// Implementations must be thread-safe and must not block on I/O.
pub trait ThumbnailPresence: Send + Sync {
    /// Returns true if a thumbnail for `identity` is cached.
    fn contains(&self, identity: &FileIdentity) -> bool;
}
