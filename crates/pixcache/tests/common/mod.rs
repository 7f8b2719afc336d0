#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pixcache::{
    CacheConfig, FetchRequest, FetchResponse, Image, ImageCache, ImageFormat, ImageManager,
    ResponseError, Source,
};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio::sync::Semaphore;

/// Route engine logs to the test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn png(width: u32, height: u32) -> Bytes {
    Image::new(image::DynamicImage::new_rgba8(width, height), ImageFormat::Png, 1.0)
        .encode(ImageFormat::Png)
        .unwrap()
}

pub fn url(path: &str) -> String {
    format!("https://img.example.com/{path}")
}

pub fn source(path: &str) -> Source {
    Source::from_url_str(&url(path)).unwrap()
}

#[derive(Debug, Clone)]
pub enum Route {
    Image(Bytes),
    Status(u16),
    Constrained,
}

/// Scripted transport. Unknown URLs answer 404.
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, usize>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            gate: None,
        })
    }

    /// Responses wait until [`open`](Self::open) is called.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            gate: Some(Arc::new(Semaphore::new(0))),
        })
    }

    pub fn route(&self, path: &str, route: Route) {
        self.routes.lock().insert(url(path), route);
    }

    pub fn open(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self, path: &str) -> usize {
        self.calls.lock().get(&url(path)).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl pixcache::Transport for MockTransport {
    async fn get(&self, request: FetchRequest) -> Result<FetchResponse, ResponseError> {
        let key = request.url.to_string();
        *self.calls.lock().entry(key.clone()).or_default() += 1;
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }

        let route = self.routes.lock().get(&key).cloned();
        let (status, body) = match route {
            Some(Route::Image(body)) => (StatusCode::OK, body),
            Some(Route::Status(code)) => (StatusCode::from_u16(code).unwrap(), Bytes::new()),
            Some(Route::Constrained) => {
                return Err(ResponseError::NetworkConstrained { url: key });
            }
            None => (StatusCode::NOT_FOUND, Bytes::new()),
        };
        Ok(FetchResponse {
            url: request.url,
            status: Some(status),
            headers: HeaderMap::new(),
            body,
        })
    }
}

pub fn manager(transport: Arc<MockTransport>, dir: &std::path::Path) -> ImageManager {
    init_tracing();
    let config = CacheConfig {
        disk_directory: Some(dir.to_path_buf()),
        maintenance_interval: Duration::ZERO,
        ..CacheConfig::default()
    };
    ImageManager::builder()
        .with_transport(transport)
        .with_cache(ImageCache::new(&config))
        .build()
        .unwrap()
}
