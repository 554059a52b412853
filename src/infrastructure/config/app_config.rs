//! Application configuration.

use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::infrastructure::image::{CacheOptions, ImageLoaderConfig, default_worker_count};

const APP_NAME: &str = "thumbworks";
const APP_QUALIFIER: &str = "org";
const APP_ORGANIZATION: &str = "thumbworks";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Converts to tracing level.
    #[must_use]
    pub const fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Worker pool configuration.
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Blob thumbnail cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Standardized thumbnail store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Decoder configuration.
    #[serde(default)]
    pub decoders: DecodersConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Number of decoding threads. Derived from the core count when unset.
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

/// Blob thumbnail cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory. Defaults to the platform cache directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Longest edge of cached thumbnails in pixels.
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,

    /// Size at which a new blob file is started, in bytes.
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: u64,

    /// Unsaved entries that trigger an immediate index save.
    #[serde(default = "default_save_threshold")]
    pub save_threshold: usize,

    /// Delay before unsaved entries are written, in milliseconds.
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,

    /// JPEG quality of cached thumbnails.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            thumbnail_size: default_thumbnail_size(),
            max_blob_size: default_max_blob_size(),
            save_threshold: default_save_threshold(),
            save_debounce_ms: default_save_debounce_ms(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Standardized thumbnail store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Consult and fill the store while decoding.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Store root. Defaults to `thumbnails` under the user cache directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
        }
    }
}

/// Decoder configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodersConfig {
    /// Leave RAW files with a JPEG, TIFF or PNG sibling to the other decoders.
    #[serde(default)]
    pub skip_raw_with_sibling: bool,
}

fn default_thumbnail_size() -> u32 {
    256
}

fn default_max_blob_size() -> u64 {
    32 * 1024 * 1024
}

fn default_save_threshold() -> usize {
    100
}

fn default_save_debounce_ms() -> u64 {
    1000
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_true() -> bool {
    true
}

use super::args::CliArgs;

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(workers) = args.workers {
            self.loader.worker_threads = Some(workers);
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.cache.directory = Some(cache_dir.clone());
        }
        if let Some(thumbnail_size) = args.thumbnail_size {
            self.cache.thumbnail_size = thumbnail_size;
        }
        if args.no_store {
            self.store.enabled = false;
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default config file path.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Returns default log file path.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_dir().join("thumbworks.log"))
    }

    /// Returns default blob cache directory.
    #[must_use]
    pub fn default_cache_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.cache_dir().join("thumbnails"))
    }

    /// Returns default standardized thumbnail store root.
    #[must_use]
    pub fn default_store_dir() -> Option<PathBuf> {
        BaseDirs::new().map(|dirs| dirs.cache_dir().join("thumbnails"))
    }

    /// Returns effective config path.
    #[must_use]
    pub fn effective_config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(Self::default_config_path)
    }

    /// Returns effective log path.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(Self::default_log_path)
    }

    /// Returns effective blob cache directory.
    #[must_use]
    pub fn effective_cache_dir(&self) -> Option<PathBuf> {
        self.cache.directory.clone().or_else(Self::default_cache_dir)
    }

    /// Returns the store root, or `None` when the store is disabled.
    #[must_use]
    pub fn effective_store_dir(&self) -> Option<PathBuf> {
        if !self.store.enabled {
            return None;
        }
        self.store.directory.clone().or_else(Self::default_store_dir)
    }

    /// Returns the loader settings.
    #[must_use]
    pub fn loader_config(&self) -> ImageLoaderConfig {
        ImageLoaderConfig {
            worker_threads: self
                .loader
                .worker_threads
                .unwrap_or_else(default_worker_count)
                .max(1),
        }
    }

    /// Returns the blob cache settings, or `None` without a cache directory.
    #[must_use]
    pub fn cache_options(&self) -> Option<CacheOptions> {
        let directory = self.effective_cache_dir()?;
        Some(CacheOptions {
            thumbnail_size: self.cache.thumbnail_size,
            max_blob_size: self.cache.max_blob_size,
            save_threshold: self.cache.save_threshold,
            save_debounce: Duration::from_millis(self.cache.save_debounce_ms),
            jpeg_quality: self.cache.jpeg_quality.clamp(1, 100),
            ..CacheOptions::new(directory)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_config_sections() {
        let toml_content = r#"
            log_level = "debug"

            [loader]
            worker_threads = 3

            [cache]
            directory = "/tmp/thumbs"
            thumbnail_size = 160

            [store]
            enabled = false

            [decoders]
            skip_raw_with_sibling = true
        "#;

        let config: AppConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.loader_config().worker_threads, 3);
        assert_eq!(config.cache.thumbnail_size, 160);
        assert_eq!(config.cache.save_threshold, 100);
        assert!(config.decoders.skip_raw_with_sibling);
        assert!(config.effective_store_dir().is_none());

        let options = config.cache_options().unwrap();
        assert_eq!(options.directory, PathBuf::from("/tmp/thumbs"));
        assert_eq!(options.thumbnail_size, 160);
        assert_eq!(options.save_debounce, Duration::from_secs(1));
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.store.enabled);
        assert!(!config.decoders.skip_raw_with_sibling);
        assert_eq!(config.cache.jpeg_quality, 85);
        assert!(config.loader_config().worker_threads >= 1);
    }

    #[test]
    fn test_args_override_config() {
        let mut config = AppConfig::default();
        let args = CliArgs::parse_from([
            "thumbworks",
            "--workers",
            "2",
            "--cache-dir",
            "/var/cache/thumbs",
            "--no-store",
            "stats",
        ]);

        config.merge_with_args(&args);

        assert_eq!(config.loader_config().worker_threads, 2);
        assert_eq!(
            config.effective_cache_dir(),
            Some(PathBuf::from("/var/cache/thumbs"))
        );
        assert!(config.effective_store_dir().is_none());
    }
}
