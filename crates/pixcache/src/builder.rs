//! # Builders
//!
//! Fluent construction of [`EngineConfig`] and [`ImageManager`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use pixcache::{EngineConfig, ImageManager, StorageExpiration};
//!
//! # async fn run() -> Result<(), pixcache::EngineError> {
//! let config = EngineConfig::builder()
//!     .with_timeout(Duration::from_secs(20))
//!     .with_user_agent("MyApp/1.0")
//!     .with_cache_name("avatars")
//!     .with_disk_expiration(StorageExpiration::Days(3))
//!     .build();
//!
//! let manager = ImageManager::builder().with_config(config).build()?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use tracing::warn;

use crate::cache::{CacheConfig, ImageCache, StorageExpiration};
use crate::config::{DownloaderConfig, EngineConfig};
use crate::downloader::{
    DefaultDownloaderDelegate, DownloaderDelegate, HttpTransport, ImageDownloader, TaskRegistry,
    Transport,
};
use crate::error::EngineError;
use crate::manager::ImageManager;
use crate::options::RetrieveOptions;
use crate::pool::ProcessingPool;

/// Builder for [`EngineConfig`]
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_downloader_config(mut self, downloader: DownloaderConfig) -> Self {
        self.config.downloader = downloader;
        self
    }

    pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    /// Set the overall timeout for the entire HTTP request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.downloader.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.downloader.connect_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.downloader.follow_redirects = follow;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.downloader.user_agent = user_agent.into();
        self
    }

    /// Add a default request header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        match (
            HeaderName::from_bytes(name.as_ref().as_bytes()),
            HeaderValue::from_str(value.as_ref()),
        ) {
            (Ok(name), Ok(value)) => {
                self.config.downloader.headers.insert(name, value);
            }
            _ => warn!(name = name.as_ref(), "Ignoring invalid header"),
        }
        self
    }

    pub fn with_max_body_size(mut self, bytes: u64) -> Self {
        self.config.downloader.max_body_size = bytes;
        self
    }

    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.downloader.danger_accept_invalid_certs = accept;
        self
    }

    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.config.cache.name = name.into();
        self
    }

    pub fn with_cache_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.cache.disk_directory = Some(directory.into());
        self
    }

    pub fn with_memory_cost_limit(mut self, bytes: u64) -> Self {
        self.config.cache.memory_total_cost_limit = bytes;
        self
    }

    pub fn with_memory_count_limit(mut self, count: u64) -> Self {
        self.config.cache.memory_count_limit = count;
        self
    }

    pub fn with_memory_expiration(mut self, expiration: StorageExpiration) -> Self {
        self.config.cache.memory_expiration = expiration;
        self
    }

    pub fn with_disk_size_limit(mut self, bytes: u64) -> Self {
        self.config.cache.disk_size_limit = bytes;
        self
    }

    pub fn with_disk_expiration(mut self, expiration: StorageExpiration) -> Self {
        self.config.cache.disk_expiration = expiration;
        self
    }

    /// Period of the background sweep; zero disables it
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.config.cache.maintenance_interval = interval;
        self
    }

    pub fn with_processing_pool_size(mut self, size: usize) -> Self {
        self.config.processing_pool_size = Some(size);
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

/// Builder for [`ImageManager`]
///
/// Every part not set explicitly is derived from the [`EngineConfig`].
#[derive(Default)]
pub struct ImageManagerBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn Transport>>,
    delegate: Option<Arc<dyn DownloaderDelegate>>,
    cache: Option<ImageCache>,
    default_options: Option<RetrieveOptions>,
}

impl ImageManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom transport instead of the reqwest client
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn DownloaderDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Use a prebuilt cache instead of one derived from the config
    pub fn with_cache(mut self, cache: ImageCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Options used by the convenience methods that take none
    pub fn with_default_options(mut self, options: RetrieveOptions) -> Self {
        self.default_options = Some(options);
        self
    }

    /// Build the manager. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<ImageManager, EngineError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Runtime(e.to_string()))?;

        let pool = match self.config.processing_pool_size {
            Some(size) => ProcessingPool::new(size),
            None => ProcessingPool::default(),
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config.downloader)?),
        };
        let delegate = self
            .delegate
            .unwrap_or_else(|| Arc::new(DefaultDownloaderDelegate));

        let cache = self
            .cache
            .unwrap_or_else(|| ImageCache::new(&self.config.cache))
            .with_processing_pool(pool.clone());

        let registry = TaskRegistry::new(pool.clone(), runtime.clone());
        let downloader = ImageDownloader::new(transport, registry).with_delegate(delegate);

        Ok(ImageManager::from_parts(
            cache,
            downloader,
            pool,
            runtime,
            self.default_options.unwrap_or_default(),
            self.config.cache.maintenance_interval,
        ))
    }
}
