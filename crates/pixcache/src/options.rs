//! # Retrieve Options
//!
//! Per-request knobs for [`crate::ImageManager::retrieve`]. Every pluggable
//! capability has a default so `RetrieveOptions::default()` is a complete,
//! working configuration.

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::bitmap::{BitmapDecoder, DefaultBitmapDecoder};
use crate::cache::serializer::{CacheSerializer, DefaultCacheSerializer};
use crate::cache::types::{ExpirationExtending, StorageExpiration};
use crate::downloader::RequestModifier;
use crate::pool::ProcessingPool;
use crate::processor::{DefaultImageProcessor, ImageProcessor};
use crate::retry::RetryStrategy;
use crate::source::Source;

/// Where completion callbacks run.
#[derive(Debug, Clone, Default)]
pub enum CallbackQueue {
    /// On whichever task produced the result
    #[default]
    Inline,
    /// Spawned onto the given runtime
    Runtime(Handle),
}

impl CallbackQueue {
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            CallbackQueue::Inline => f(),
            CallbackQueue::Runtime(handle) => {
                handle.spawn(async move { f() });
            }
        }
    }
}

/// Options of a single retrieval.
#[derive(Clone)]
pub struct RetrieveOptions {
    pub processor: Arc<dyn ImageProcessor>,
    pub cache_serializer: Arc<dyn CacheSerializer>,
    pub decoder: Arc<dyn BitmapDecoder>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub request_modifier: Option<Arc<dyn RequestModifier>>,
    /// Tried in order after the primary source fails
    pub alternative_sources: Vec<Source>,
    /// Tried once when the network rejects the request as constrained
    pub low_data_mode_source: Option<Source>,
    pub callback_queue: CallbackQueue,
    /// Overrides the engine's pool when set
    pub processing_pool: Option<ProcessingPool>,
    pub scale_factor: f32,
    /// Convert to an RGBA8 buffer on the processing pool before delivery
    pub background_decode: bool,
    /// Skip the cache lookup and always fetch
    pub force_refresh: bool,
    /// Fail with `ImageNotExisting` instead of fetching on a miss
    pub only_from_cache: bool,
    /// Accept only memory hits; anything else is refetched
    pub from_memory_cache_or_refresh: bool,
    pub cache_memory_only: bool,
    /// Fire the completion only after the disk write finished
    pub wait_for_cache: bool,
    /// Also persist the unprocessed bytes under the base key
    pub cache_original_image: bool,
    pub also_prefetch_to_memory: bool,
    pub memory_cache_expiration: Option<StorageExpiration>,
    pub disk_cache_expiration: Option<StorageExpiration>,
    pub memory_cache_access_extending_expiration: ExpirationExtending,
    pub disk_cache_access_extending_expiration: ExpirationExtending,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            processor: Arc::new(DefaultImageProcessor),
            cache_serializer: Arc::new(DefaultCacheSerializer::default()),
            decoder: Arc::new(DefaultBitmapDecoder),
            retry_strategy: None,
            request_modifier: None,
            alternative_sources: Vec::new(),
            low_data_mode_source: None,
            callback_queue: CallbackQueue::Inline,
            processing_pool: None,
            scale_factor: 1.0,
            background_decode: false,
            force_refresh: false,
            only_from_cache: false,
            from_memory_cache_or_refresh: false,
            cache_memory_only: false,
            wait_for_cache: false,
            cache_original_image: false,
            also_prefetch_to_memory: false,
            memory_cache_expiration: None,
            disk_cache_expiration: None,
            memory_cache_access_extending_expiration: ExpirationExtending::CacheTime,
            disk_cache_access_extending_expiration: ExpirationExtending::CacheTime,
        }
    }
}

impl RetrieveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_processor(mut self, processor: Arc<dyn ImageProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_cache_serializer(mut self, serializer: Arc<dyn CacheSerializer>) -> Self {
        self.cache_serializer = serializer;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn BitmapDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn with_request_modifier(mut self, modifier: Arc<dyn RequestModifier>) -> Self {
        self.request_modifier = Some(modifier);
        self
    }

    pub fn with_alternative_sources(mut self, sources: Vec<Source>) -> Self {
        self.alternative_sources = sources;
        self
    }

    pub fn with_low_data_mode_source(mut self, source: Source) -> Self {
        self.low_data_mode_source = Some(source);
        self
    }

    pub fn with_callback_queue(mut self, queue: CallbackQueue) -> Self {
        self.callback_queue = queue;
        self
    }

    pub fn with_processing_pool(mut self, pool: ProcessingPool) -> Self {
        self.processing_pool = Some(pool);
        self
    }

    pub fn with_scale_factor(mut self, scale: f32) -> Self {
        self.scale_factor = scale;
        self
    }

    pub fn with_background_decode(mut self, enabled: bool) -> Self {
        self.background_decode = enabled;
        self
    }

    pub fn with_force_refresh(mut self, enabled: bool) -> Self {
        self.force_refresh = enabled;
        self
    }

    pub fn with_only_from_cache(mut self, enabled: bool) -> Self {
        self.only_from_cache = enabled;
        self
    }

    pub fn with_from_memory_cache_or_refresh(mut self, enabled: bool) -> Self {
        self.from_memory_cache_or_refresh = enabled;
        self
    }

    pub fn with_cache_memory_only(mut self, enabled: bool) -> Self {
        self.cache_memory_only = enabled;
        self
    }

    pub fn with_wait_for_cache(mut self, enabled: bool) -> Self {
        self.wait_for_cache = enabled;
        self
    }

    pub fn with_cache_original_image(mut self, enabled: bool) -> Self {
        self.cache_original_image = enabled;
        self
    }

    pub fn with_also_prefetch_to_memory(mut self, enabled: bool) -> Self {
        self.also_prefetch_to_memory = enabled;
        self
    }

    pub fn with_memory_cache_expiration(mut self, expiration: StorageExpiration) -> Self {
        self.memory_cache_expiration = Some(expiration);
        self
    }

    pub fn with_disk_cache_expiration(mut self, expiration: StorageExpiration) -> Self {
        self.disk_cache_expiration = Some(expiration);
        self
    }

    pub fn with_memory_access_extending(mut self, extending: ExpirationExtending) -> Self {
        self.memory_cache_access_extending_expiration = extending;
        self
    }

    pub fn with_disk_access_extending(mut self, extending: ExpirationExtending) -> Self {
        self.disk_cache_access_extending_expiration = extending;
        self
    }

    pub(crate) fn processor_identifier(&self) -> &str {
        self.processor.identifier()
    }
}

impl fmt::Debug for RetrieveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveOptions")
            .field("processor", &self.processor.identifier())
            .field("has_retry_strategy", &self.retry_strategy.is_some())
            .field("has_request_modifier", &self.request_modifier.is_some())
            .field("alternative_sources", &self.alternative_sources.len())
            .field("callback_queue", &self.callback_queue)
            .field("scale_factor", &self.scale_factor)
            .field("force_refresh", &self.force_refresh)
            .field("only_from_cache", &self.only_from_cache)
            .field("from_memory_cache_or_refresh", &self.from_memory_cache_or_refresh)
            .field("cache_memory_only", &self.cache_memory_only)
            .field("wait_for_cache", &self.wait_for_cache)
            .field("cache_original_image", &self.cache_original_image)
            .finish_non_exhaustive()
    }
}
