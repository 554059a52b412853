//! Thumbworks - asynchronous thumbnail and image decoding.
//!
//! This crate provides a prioritized, deduplicating decode queue served by a
//! pool of worker threads, pluggable decoders, and a compact persistent
//! thumbnail cache.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer driving the pipeline.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing the loader, decoders, and caches.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "thumbworks";
