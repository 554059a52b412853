//! Domain entity definitions.

mod file_identity;
mod image_request;
mod priority;

pub use file_identity::{FileIdentity, extension_of, uri_for_path};
pub use image_request::{ImageRequest, RequestId, RequestKey, RequestKind, TargetSize};
pub use priority::{Priority, StopAction, VideoJobPriority};
