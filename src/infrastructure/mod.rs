//! Infrastructure layer with the loader, decoders, caches and configuration.

/// Application configuration.
pub mod config;
/// Image loading, decoding and caching.
pub mod image;

pub use config::{AppConfig, CliArgs, Command, LogLevel, StorageManager};
pub use self::image::{
    AsyncLoader, CacheOptions, DecoderRegistry, FileThumbnailStore, ImageLoaderConfig,
    ThumbnailCache,
};
