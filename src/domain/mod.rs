//! Domain layer with request entities, port definitions and error types.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{FileIdentity, ImageRequest, Priority, StopAction, TargetSize};
pub use errors::{CacheError, DecodeError, LoaderError};
pub use ports::{ClientHandle, ImageClient, ImageDecoder};
