use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, eyre};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use thumbworks::application::{ThumbnailBuilder, collect_build_items};
use thumbworks::domain::FileIdentity;
use thumbworks::domain::ports::ImageDecoder;
use thumbworks::infrastructure::image::{
    AsyncLoader, DecoderRegistry, FileThumbnailStore, GenericDecoder, ThumbnailCache,
};
use thumbworks::infrastructure::{AppConfig, CliArgs, Command, StorageManager};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let storage = StorageManager::new()?;
    let mut config = storage.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    Ok(config)
}

fn is_supported(decoders: &DecoderRegistry, path: &Path) -> bool {
    decoders.might_decode(&FileIdentity::new(path)) || GenericDecoder.can_handle(path)
}

fn thumbnail_store(config: &AppConfig) -> Option<Arc<FileThumbnailStore>> {
    config
        .effective_store_dir()
        .map(|dir| Arc::new(FileThumbnailStore::new(dir)))
}

async fn build(
    config: &AppConfig,
    cache: &Arc<ThumbnailCache>,
    files: &[PathBuf],
    missing: bool,
) -> Result<()> {
    let decoders = Arc::new(DecoderRegistry::with_defaults(
        config.decoders.skip_raw_with_sibling,
    ));
    let store = thumbnail_store(config);
    let mut loader = AsyncLoader::new(
        &config.loader_config(),
        decoders.clone(),
        Some(cache.clone()),
        store.clone(),
    )?;

    let items = collect_build_items(files, |path| is_supported(&decoders, path));
    let found = items.len();
    let builder = ThumbnailBuilder::new(cache.clone()).with_store(store);
    let scheduled = if missing {
        builder.build_missing(&loader, items)
    } else {
        builder.rebuild(&loader, items)
    };
    info!(found, scheduled, "Thumbnail build scheduled");

    while !builder.progress().is_finished() {
        if !loader.dispatch_next().await {
            break;
        }
    }
    loader.request_exit();
    loader.dispatch_pending();
    cache.save()?;

    let progress = builder.progress();
    println!(
        "{found} files, {} thumbnails built, {} failed",
        progress.done.saturating_sub(progress.failed),
        progress.failed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = thumbworks::VERSION, "Starting {}", thumbworks::NAME);

    let options = config
        .cache_options()
        .ok_or_else(|| eyre!("no thumbnail cache directory available"))?;
    let cache = ThumbnailCache::open(options)?;
    if let Some(reason) = cache.invalidation() {
        warn!(%reason, "Thumbnail cache was discarded");
    }

    match &args.command {
        Command::Build { missing, files } => build(&config, &cache, files, *missing).await?,
        Command::Flush => {
            cache.flush()?;
            let removed = match thumbnail_store(&config) {
                Some(store) => store.clear()?,
                None => 0,
            };
            println!("Thumbnail cache flushed, {removed} stored thumbnails removed");
        }
        Command::Stats => println!("{}", cache.stats()),
    }

    Ok(())
}
