//! # Sources
//!
//! A [`Source`] names what to fetch and under which cache key it is stored.
//! Network sources carry a [`Resource`]; everything else goes through an
//! [`ImageDataProvider`] that hands back raw bytes without a network transfer.

use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use url::Url;

use crate::error::{ImageError, RequestError};

/// Namespace prefix for keys derived from local file URLs.
pub const LOCAL_FILE_CACHE_KEY_PREFIX: &str = "pixcache.local.cacheKey";

/// Path component suffixes that mark an application container boundary.
pub const DEFAULT_CONTAINER_MARKERS: &[&str] = &[".app", ".appex"];

/// Error type returned by data providers.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// A downloadable resource.
#[derive(Debug, Clone)]
pub struct Resource {
    cache_key: String,
    download_url: Url,
}

impl Resource {
    /// Create a resource with an explicit cache key
    pub fn new(download_url: Url, cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            download_url,
        }
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn download_url(&self) -> &Url {
        &self.download_url
    }
}

impl From<Url> for Resource {
    fn from(url: Url) -> Self {
        let cache_key = if url.scheme() == "file" {
            local_file_cache_key(&url, DEFAULT_CONTAINER_MARKERS)
        } else {
            url.as_str().to_string()
        };
        Self {
            cache_key,
            download_url: url,
        }
    }
}

/// Derive a cache key for a local file URL that survives container relocation.
///
/// Path components are collected from the end until one ends with a container
/// marker. The collected suffix is joined under [`LOCAL_FILE_CACHE_KEY_PREFIX`]
/// and the query string, if any, is appended.
pub fn local_file_cache_key(url: &Url, markers: &[&str]) -> String {
    let components: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let mut suffix = Vec::with_capacity(components.len());
    for part in components.iter().rev() {
        suffix.push(*part);
        if markers.iter().any(|marker| part.ends_with(marker)) {
            break;
        }
    }
    suffix.reverse();

    let fixed_path = format!("{LOCAL_FILE_CACHE_KEY_PREFIX}/{}", suffix.join("/"));
    match url.query() {
        Some(query) => format!("{fixed_path}?{query}"),
        None => fixed_path,
    }
}

/// Supplies raw image bytes without a network transfer.
#[async_trait]
pub trait ImageDataProvider: Debug + Send + Sync {
    /// Key used to store the decoded image.
    fn cache_key(&self) -> &str;

    /// Load the raw bytes.
    async fn data(&self) -> Result<Bytes, ProviderError>;

    /// URL describing where the content lives, if any.
    fn content_url(&self) -> Option<&Url> {
        None
    }
}

/// Reads image bytes from a local file.
#[derive(Debug, Clone)]
pub struct LocalFileImageDataProvider {
    file_url: Url,
    path: PathBuf,
    cache_key: String,
}

impl LocalFileImageDataProvider {
    /// Create a provider for a `file://` URL. The cache key is path-stable.
    pub fn new(file_url: Url) -> Result<Self, ImageError> {
        let path = file_url
            .to_file_path()
            .map_err(|_| RequestError::InvalidUrl(file_url.to_string()))?;
        let cache_key = local_file_cache_key(&file_url, DEFAULT_CONTAINER_MARKERS);
        Ok(Self {
            file_url,
            path,
            cache_key,
        })
    }

    /// Create a provider for a filesystem path.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ImageError> {
        let path = path.into();
        let file_url = Url::from_file_path(&path)
            .map_err(|_| RequestError::InvalidUrl(path.display().to_string()))?;
        Self::new(file_url)
    }

    /// Override the derived cache key.
    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = cache_key.into();
        self
    }
}

#[async_trait]
impl ImageDataProvider for LocalFileImageDataProvider {
    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    async fn data(&self) -> Result<Bytes, ProviderError> {
        let data = tokio::fs::read(&self.path).await?;
        Ok(Bytes::from(data))
    }

    fn content_url(&self) -> Option<&Url> {
        Some(&self.file_url)
    }
}

/// Decodes image bytes from a base64 string.
#[derive(Debug, Clone)]
pub struct Base64ImageDataProvider {
    base64: String,
    cache_key: String,
}

impl Base64ImageDataProvider {
    pub fn new(base64: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self {
            base64: base64.into(),
            cache_key: cache_key.into(),
        }
    }
}

#[async_trait]
impl ImageDataProvider for Base64ImageDataProvider {
    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    async fn data(&self) -> Result<Bytes, ProviderError> {
        // Tolerate `data:image/png;base64,` prefixes.
        let payload = match self.base64.split_once(";base64,") {
            Some((_, rest)) => rest,
            None => self.base64.as_str(),
        };
        let decoded = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
        Ok(Bytes::from(decoded))
    }
}

/// Hands out bytes that are already in memory.
#[derive(Debug, Clone)]
pub struct RawImageDataProvider {
    data: Bytes,
    cache_key: String,
}

impl RawImageDataProvider {
    pub fn new(data: impl Into<Bytes>, cache_key: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            cache_key: cache_key.into(),
        }
    }
}

#[async_trait]
impl ImageDataProvider for RawImageDataProvider {
    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    async fn data(&self) -> Result<Bytes, ProviderError> {
        Ok(self.data.clone())
    }
}

/// Where an image comes from.
#[derive(Debug, Clone)]
pub enum Source {
    /// Fetched over the network
    Network(Resource),
    /// Read from a data provider
    Provider(Arc<dyn ImageDataProvider>),
}

impl Source {
    /// Build a source from a URL string. See the `From<Url>` impl.
    pub fn from_url_str(url: &str) -> Result<Self, ImageError> {
        let url = Url::parse(url).map_err(|e| RequestError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::from(url))
    }

    /// Build a provider source.
    pub fn provider(provider: impl ImageDataProvider + 'static) -> Self {
        Source::Provider(Arc::new(provider))
    }

    pub fn cache_key(&self) -> &str {
        match self {
            Source::Network(resource) => resource.cache_key(),
            Source::Provider(provider) => provider.cache_key(),
        }
    }

    /// The download URL or the provider's content URL.
    pub fn url(&self) -> Option<&Url> {
        match self {
            Source::Network(resource) => Some(resource.download_url()),
            Source::Provider(provider) => provider.content_url(),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Source::Network(_))
    }
}

/// `file://` URLs become a [`LocalFileImageDataProvider`] so they are read
/// from disk instead of going through the transport.
impl From<Url> for Source {
    fn from(url: Url) -> Self {
        if url.scheme() == "file" {
            if let Ok(provider) = LocalFileImageDataProvider::new(url.clone()) {
                return Source::provider(provider);
            }
        }
        Source::Network(Resource::from(url))
    }
}

impl From<Resource> for Source {
    fn from(resource: Resource) -> Self {
        Source::Network(resource)
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.is_network() == other.is_network()
            && self.cache_key() == other.cache_key()
            && self.url() == other.url()
    }
}

impl Eq for Source {}

impl Hash for Source {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.is_network().hash(state);
        self.cache_key().hash(state);
        self.url().map(Url::as_str).hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_url_uses_string_form_as_key() {
        let source = Source::from_url_str("https://cdn.example.com/img/a.png?v=2").unwrap();
        assert_eq!(source.cache_key(), "https://cdn.example.com/img/a.png?v=2");
        assert!(source.is_network());
    }

    #[test]
    fn test_local_file_key_stops_at_container_marker() {
        let url = Url::parse(
            "file:///var/containers/Bundle/Application/ABC-123/Paywall.app/images/hero.png",
        )
        .unwrap();
        let resource = Resource::from(url);
        assert_eq!(
            resource.cache_key(),
            "pixcache.local.cacheKey/Paywall.app/images/hero.png"
        );
    }

    #[test]
    fn test_local_file_key_survives_relocation() {
        let a = Url::parse("file:///old/place/Demo.appex/a.png?size=2").unwrap();
        let b = Url::parse("file:///new/location/deeper/Demo.appex/a.png?size=2").unwrap();
        let key_a = local_file_cache_key(&a, DEFAULT_CONTAINER_MARKERS);
        let key_b = local_file_cache_key(&b, DEFAULT_CONTAINER_MARKERS);
        assert_eq!(key_a, key_b);
        assert!(key_a.ends_with("Demo.appex/a.png?size=2"));
    }

    #[test]
    fn test_local_file_key_without_marker_keeps_full_path() {
        let url = Url::parse("file:///tmp/images/a.png").unwrap();
        assert_eq!(
            local_file_cache_key(&url, DEFAULT_CONTAINER_MARKERS),
            "pixcache.local.cacheKey/tmp/images/a.png"
        );
    }

    #[test]
    fn test_file_url_becomes_local_provider() {
        let url = Url::parse("file:///opt/Demo.appex/icons/a.png").unwrap();
        let source = Source::from(url.clone());
        assert!(!source.is_network());
        assert_eq!(source.cache_key(), "pixcache.local.cacheKey/Demo.appex/icons/a.png");
        assert_eq!(source.url(), Some(&url));

        let parsed = Source::from_url_str("file:///opt/Demo.appex/icons/a.png").unwrap();
        assert_eq!(parsed, source);
    }

    #[test]
    fn test_equality_uses_key_and_url() {
        let url = Url::parse("https://example.com/a.png").unwrap();
        let a = Source::Network(Resource::new(url.clone(), "shared"));
        let b = Source::Network(Resource::new(url, "shared"));
        let c = Source::Network(Resource::new(
            Url::parse("https://mirror.example.com/a.png").unwrap(),
            "shared",
        ));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.cache_key(), c.cache_key());
    }

    #[tokio::test]
    async fn test_base64_provider_accepts_data_uri() {
        let provider = Base64ImageDataProvider::new("data:image/png;base64,aGVsbG8=", "b64");
        assert_eq!(provider.data().await.unwrap(), Bytes::from_static(b"hello"));

        let broken = Base64ImageDataProvider::new("!!!", "broken");
        assert!(broken.data().await.is_err());
    }

    #[tokio::test]
    async fn test_local_file_provider_reads_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"payload").unwrap();

        let provider = LocalFileImageDataProvider::from_path(&path).unwrap();
        assert_eq!(provider.data().await.unwrap(), Bytes::from_static(b"payload"));
        assert!(provider.content_url().is_some());
    }
}
