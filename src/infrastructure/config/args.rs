use super::app_config::LogLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "thumbworks",
    version,
    about = "Builds and maintains a thumbnail cache for photo collections",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Number of decoding threads.
    #[arg(long, value_name = "N", global = true)]
    pub workers: Option<usize>,

    /// Thumbnail cache directory.
    #[arg(long, value_name = "PATH", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Longest edge of cached thumbnails.
    #[arg(long, value_name = "PIXELS", global = true)]
    pub thumbnail_size: Option<u32>,

    /// Do not read or write the standardized thumbnail store.
    #[arg(long, global = true)]
    pub no_store: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate thumbnails for the given files.
    Build {
        /// Only generate thumbnails that are not cached yet.
        #[arg(long)]
        missing: bool,

        /// Files or directories to process.
        #[arg(required = true, value_name = "FILES")]
        files: Vec<PathBuf>,
    },
    /// Discard every cached thumbnail.
    Flush,
    /// Print cache statistics.
    Stats,
}
