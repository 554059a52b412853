//! Application layer driving the image pipeline.

/// Batch thumbnail generation.
pub mod thumbnail_builder;

pub use thumbnail_builder::{BuildItem, BuildProgress, ThumbnailBuilder, collect_build_items};
