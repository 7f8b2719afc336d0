//! # Pixcache
//!
//! An image retrieval and caching engine. Images are fetched from the network
//! or from data providers, decoded and processed on a bounded pool, and kept
//! in a two-tier cache.
//!
//! ## Features
//!
//! - Memory and disk caching with per-entry expiration
//! - Download coalescing: concurrent requests for one key share a transfer
//! - Per-caller cancellation that aborts the transfer once nobody waits
//! - Pluggable processors, serializers, decoders and retry strategies
//! - Alternative sources tried in order when a source fails
//! - Batch prefetching with bounded concurrency

pub mod bitmap;
pub mod builder;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod downloader;
pub mod error;
pub mod manager;
pub mod options;
pub mod pool;
pub mod prefetcher;
pub mod processor;
pub mod retry;
pub mod source;

pub use builder::{EngineConfigBuilder, ImageManagerBuilder};
pub use config::{DownloaderConfig, EngineConfig};
pub use error::{
    CacheError, EngineError, ImageError, ImageSettingError, ProcessorError, PropagationError,
    RequestError, ResponseError,
};
pub use manager::{ImageManager, RetrieveImageResult, RetrievingContext};

// Sources and providers
pub use source::{
    Base64ImageDataProvider, ImageDataProvider, LocalFileImageDataProvider, RawImageDataProvider,
    Resource, Source,
};

pub use bitmap::{BitmapDecoder, DefaultBitmapDecoder, Image, ImageFormat};

// Cache
pub use cache::{
    CacheConfig, CacheSerializer, CacheType, DefaultCacheSerializer, DiskStore,
    ExpirationExtending, FileStore, ImageCache, MemoryStorage, StorageExpiration,
};

pub use coordinator::{CacheAction, CacheCallbackCoordinator, CoordinatorState};
pub use options::{CallbackQueue, RetrieveOptions};
pub use pool::ProcessingPool;
pub use processor::{
    ComposedProcessor, DefaultImageProcessor, FnImageProcessor, ImageItem, ImageProcessor,
};
pub use retry::{DelayRetryStrategy, RetryContext, RetryDecision, RetryInterval, RetryStrategy};

// Downloader
pub use downloader::{
    AnyModifier, DefaultDownloaderDelegate, DownloadTask, DownloaderDelegate, FetchRequest,
    FetchResponse, HttpTransport, ImageDownloader, RequestModifier, Transport, create_client,
};
pub use prefetcher::{ImagePrefetcher, PrefetchSummary};
