use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::cache::CacheConfig;

const DEFAULT_USER_AGENT: &str = concat!("pixcache/", env!("CARGO_PKG_VERSION"));

/// Default cap on a single response body.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 50 * 1024 * 1024;

/// Configurable options for the HTTP downloader
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for the entire HTTP request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Largest accepted response body in bytes; 0 means unbounded
    pub max_body_size: u64,

    pub danger_accept_invalid_certs: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            danger_accept_invalid_certs: false,
        }
    }
}

impl DownloaderConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("image/png,image/jpeg,image/gif,image/*;q=0.8,*/*;q=0.5"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub downloader: DownloaderConfig,
    pub cache: CacheConfig,
    /// Size of the processing pool; `None` uses the available parallelism
    pub processing_pool_size: Option<usize>,
}

impl EngineConfig {
    pub fn builder() -> crate::builder::EngineConfigBuilder {
        crate::builder::EngineConfigBuilder::new()
    }
}
