use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pixcache::{
    CacheType, DelayRetryStrategy, EngineConfig, ImageFormat, ImageManager, RetrieveImageResult,
    RetrieveOptions, RetryInterval, Source,
};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

mod cli;
mod error;
mod utils;

use cli::{CliArgs, Command};
use error::AppError;
use utils::{format_bytes, output_file_name, parse_size, parse_sources};

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    let mut config = EngineConfig::builder()
        .with_cache_name(args.cache_name.clone())
        .with_timeout(Duration::from_secs(args.timeout))
        .with_disk_size_limit(parse_size(&args.disk_limit)?)
        // Maintenance runs on demand through `clean`.
        .with_maintenance_interval(Duration::ZERO);
    if let Some(dir) = &args.cache_dir {
        config = config.with_cache_directory(dir.clone());
    }
    if let Some(user_agent) = &args.user_agent {
        config = config.with_user_agent(user_agent.clone());
    }
    for header in &args.headers {
        match header.split_once(':') {
            Some((name, value)) => config = config.with_header(name.trim(), value.trim()),
            None => warn!("Invalid header format: '{header}'. Expected 'Name: Value'"),
        }
    }
    let config = config.build();
    info!(directory = %config.cache.disk_directory().display(), "Using disk cache");

    let manager = ImageManager::builder().with_config(config).build()?;

    match args.command {
        Command::Fetch {
            urls,
            alternatives,
            retries,
            retry_interval,
            force,
            output_dir,
        } => {
            let mut options = RetrieveOptions::default()
                .with_wait_for_cache(true)
                .with_force_refresh(force)
                .with_alternative_sources(parse_sources(&alternatives)?);
            if retries > 0 {
                options = options.with_retry_strategy(Arc::new(DelayRetryStrategy::new(
                    retries,
                    RetryInterval::Seconds(retry_interval),
                )));
            }
            fetch(&manager, parse_sources(&urls)?, options, output_dir.as_deref()).await
        }
        Command::Prefetch { urls, concurrency } => {
            let sources = parse_sources(&urls)?;
            let total = sources.len();
            let summary = manager
                .prefetcher(sources, RetrieveOptions::default().with_wait_for_cache(true))
                .with_max_concurrent_downloads(concurrency)
                .run()
                .await;
            info!(
                "Prefetch done: {} completed, {} already cached, {} failed",
                summary.completed.len(),
                summary.skipped.len(),
                summary.failed.len()
            );
            for source in &summary.failed {
                warn!("Failed: {}", source.cache_key());
            }
            if summary.failed.is_empty() {
                Ok(())
            } else {
                Err(AppError::Incomplete {
                    failed: summary.failed.len(),
                    total,
                })
            }
        }
        Command::Status { urls } => {
            for source in parse_sources(&urls)? {
                let tier = match manager.cached_status(&source, "") {
                    CacheType::Memory => "memory",
                    CacheType::Disk => "disk",
                    CacheType::None => "not cached",
                };
                println!("{}\t{tier}", source.cache_key());
            }
            let size = manager.cache().total_disk_size().await?;
            println!("Disk cache size: {}", format_bytes(size));
            Ok(())
        }
        Command::Clean => {
            let before = manager.cache().total_disk_size().await?;
            let summary = manager.cache().maintain().await?;
            let after = manager.cache().total_disk_size().await?;
            info!(
                "Removed {} expired and {} evicted entries, {} stale temp files ({} -> {})",
                summary.expired,
                summary.evicted,
                summary.stale_temp_files,
                format_bytes(before),
                format_bytes(after)
            );
            Ok(())
        }
        Command::Clear => {
            manager.cache().clear().await?;
            info!("Cache cleared");
            Ok(())
        }
    }
}

async fn fetch(
    manager: &ImageManager,
    sources: Vec<Source>,
    options: RetrieveOptions,
    output_dir: Option<&Path>,
) -> Result<(), AppError> {
    if let Some(dir) = output_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    let total = sources.len();
    let mut failed = 0;
    for (index, source) in sources.into_iter().enumerate() {
        match manager.retrieve_image(source.clone(), options.clone()).await {
            Ok(result) => {
                info!(
                    "{} {}x{} from {}",
                    source.cache_key(),
                    result.image.width(),
                    result.image.height(),
                    describe_origin(&result)
                );
                if let Some(dir) = output_dir {
                    write_image(dir, index, &result).await?;
                }
            }
            Err(e) => {
                failed += 1;
                error!("Failed to retrieve {}: {e}", source.cache_key());
                for attempt in e.propagation_errors().unwrap_or_default() {
                    warn!("  {} -> {}", attempt.source.cache_key(), attempt.error);
                }
            }
        }
    }

    if failed == 0 {
        Ok(())
    } else {
        Err(AppError::Incomplete { failed, total })
    }
}

fn describe_origin(result: &RetrieveImageResult) -> String {
    match result.cache_type {
        CacheType::Memory => "memory cache".to_string(),
        CacheType::Disk => "disk cache".to_string(),
        CacheType::None if result.source != result.original_source => {
            format!("{} (alternative)", result.source.cache_key())
        }
        CacheType::None => "network".to_string(),
    }
}

async fn write_image(dir: &Path, index: usize, result: &RetrieveImageResult) -> Result<(), AppError> {
    let format = match result.image.format() {
        ImageFormat::Unknown => ImageFormat::Png,
        format => format,
    };
    let bytes = match &result.data {
        Some(data) => data.clone(),
        None => result.image.encode(format).ok_or_else(|| {
            AppError::InvalidInput(format!("cannot encode {}", result.source.cache_key()))
        })?,
    };
    let path = dir.join(output_file_name(&result.source, index, &format.to_string()));
    tokio::fs::write(&path, &bytes).await?;
    info!("Saved {}", path.display());
    Ok(())
}
