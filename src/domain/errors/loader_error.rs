//! Loader startup error types.

use thiserror::Error;

use super::CacheError;

/// Loader failure variants.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The thumbnail cache could not be opened.
    #[error("thumbnail cache unavailable: {0}")]
    Cache(#[from] CacheError),
}
