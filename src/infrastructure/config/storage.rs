//! Reading and writing `config.toml`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::app_config::AppConfig;

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to determine config directory")]
    ConfigDirNotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("toml deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// Owns the configuration directory.
pub struct StorageManager {
    config_dir: PathBuf,
}

impl StorageManager {
    /// Uses the platform configuration directory.
    ///
    /// # Errors
    /// Returns [`ConfigError::ConfigDirNotFound`] when the platform has no
    /// home directory.
    pub fn new() -> Result<Self, ConfigError> {
        AppConfig::default_config_dir()
            .map(Self::with_dir)
            .ok_or(ConfigError::ConfigDirNotFound)
    }

    /// Uses `config_dir` instead of the platform directory.
    #[must_use]
    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Creates the configuration directory if needed.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn ensure_config_dir(&self) -> Result<(), ConfigError> {
        if !self.config_dir.is_dir() {
            info!(path = %self.config_dir.display(), "Creating configuration directory");
            fs::create_dir_all(&self.config_dir)?;
        }
        Ok(())
    }

    fn config_path(&self, path_override: Option<&Path>) -> PathBuf {
        path_override.map_or_else(|| self.config_dir.join(CONFIG_FILE_NAME), Path::to_path_buf)
    }

    /// Reads the configuration from `path_override` or the default file.
    ///
    /// A missing file is created with defaults. A file that does not parse
    /// is left alone and the defaults are used.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the default cannot be
    /// written.
    pub fn load_config(&self, path_override: Option<&Path>) -> Result<AppConfig, ConfigError> {
        self.ensure_config_dir()?;
        let path = self.config_path(path_override);

        if !path.exists() {
            info!(path = %path.display(), "Writing default configuration");
            let config = AppConfig::default();
            write_atomically(&path, &config)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        let config = toml::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Ignoring malformed configuration");
            AppConfig::default()
        });
        debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Writes `config` to `path_override` or the default file.
    ///
    /// # Errors
    /// Returns an error if the configuration cannot be serialized or written.
    pub fn save_config(
        &self,
        config: &AppConfig,
        path_override: Option<&Path>,
    ) -> Result<(), ConfigError> {
        self.ensure_config_dir()?;
        write_atomically(&self.config_path(path_override), config)
    }
}

fn write_atomically(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("config path has no parent"))?;
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content.as_bytes())?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> StorageManager {
        StorageManager::with_dir(dir.path().join("thumbworks"))
    }

    #[test]
    fn test_first_load_writes_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let manager = manager(&dir);

        let config = manager.load_config(None)?;

        assert!(config.store.enabled);
        let written = fs::read_to_string(manager.config_dir().join(CONFIG_FILE_NAME))?;
        assert!(written.contains("[cache]"));
        assert!(written.contains("thumbnail_size = 256"));
        Ok(())
    }

    #[test]
    fn test_partial_file_fills_in_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let manager = manager(&dir);
        manager.ensure_config_dir()?;
        fs::write(
            manager.config_dir().join(CONFIG_FILE_NAME),
            "[cache]\njpeg_quality = 70\n",
        )?;

        let config = manager.load_config(None)?;

        assert_eq!(config.cache.jpeg_quality, 70);
        assert_eq!(config.cache.max_blob_size, 32 * 1024 * 1024);
        assert!(config.loader.worker_threads.is_none());
        Ok(())
    }

    #[test]
    fn test_malformed_file_is_kept_and_defaults_used() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let manager = manager(&dir);
        manager.ensure_config_dir()?;
        let path = manager.config_dir().join(CONFIG_FILE_NAME);
        fs::write(&path, "[cache\nthumbnail_size = ")?;

        let config = manager.load_config(None)?;

        assert_eq!(config.cache.thumbnail_size, 256);
        assert_eq!(fs::read_to_string(&path)?, "[cache\nthumbnail_size = ");
        Ok(())
    }

    #[test]
    fn test_saved_settings_survive_reload() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let manager = manager(&dir);
        let mut config = AppConfig::default();
        config.loader.worker_threads = Some(5);
        config.decoders.skip_raw_with_sibling = true;

        manager.save_config(&config, None)?;
        let loaded = manager.load_config(None)?;

        assert_eq!(loaded.loader.worker_threads, Some(5));
        assert!(loaded.decoders.skip_raw_with_sibling);
        let leftovers = fs::read_dir(manager.config_dir())?.count();
        assert_eq!(leftovers, 1);
        Ok(())
    }

    #[test]
    fn test_override_path_leaves_default_untouched() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let manager = manager(&dir);
        let custom = dir.path().join("elsewhere").join("thumbworks.toml");

        manager.load_config(Some(&custom))?;

        assert!(custom.exists());
        assert!(!manager.config_dir().join(CONFIG_FILE_NAME).exists());
        Ok(())
    }
}
