//! Image decoding infrastructure.
//!
//! This module provides:
//! - The request queue and the coordinating loader with its worker pool
//! - Decoder backends and their registry
//! - Rotation and scaling helpers
//! - The blob thumbnail cache and the standardized thumbnail store

pub mod async_loader;
pub mod decoder_registry;
pub mod decoders;
pub mod events;
pub mod memory_cache;
pub mod request_queue;
pub mod thumbnail_cache;
pub mod thumbnail_store;
pub mod transform;
pub mod worker;

pub use async_loader::{AsyncLoader, ImageLoaderConfig, default_worker_count};
pub use decoder_registry::DecoderRegistry;
pub use decoders::{GenericDecoder, JpegDecoder, RawPreviewDecoder, is_video};
pub use events::LoaderEvent;
pub use memory_cache::{CacheStats, MemoryImageCache};
pub use request_queue::RequestQueue;
pub use thumbnail_cache::{
    CacheOptions, CachedThumbnail, InvalidationReason, ThumbnailCache, ThumbnailCacheStats,
};
pub use thumbnail_store::{FileThumbnailStore, StoredThumbnail, ThumbnailBucket, ThumbnailMetadata};
pub use worker::DecodePipeline;
