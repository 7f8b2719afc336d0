//! # Image Manager
//!
//! Composes the cache, the downloader, the retry policy and the callback
//! coordinator into the retrieval pipeline:
//!
//! 1. a valid cache hit is served without a download task;
//! 2. a processed variant can be rebuilt from a cached original;
//! 3. otherwise the source is fetched (coalesced by cache key), processed,
//!    stored, and the completion fires as the coordinator decides;
//! 4. failures are retried per source, then alternative sources are tried,
//!    recording every failed attempt.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bitmap::Image;
use crate::builder::ImageManagerBuilder;
use crate::cache::{CacheType, ImageCache};
use crate::coordinator::{CacheAction, CacheCallbackCoordinator};
use crate::downloader::{
    CancelToken, DownloadTask, FetchedData, ImageDownloader, ImageLoadingResult, SessionCallback,
};
use crate::error::{
    CacheError, ImageError, ImageSettingError, ProcessorError, PropagationError,
};
use crate::options::RetrieveOptions;
use crate::pool::ProcessingPool;
use crate::prefetcher::ImagePrefetcher;
use crate::processor::{ImageItem, is_default};
use crate::retry::{RetryContext, RetryDecision};
use crate::source::Source;

/// A successful retrieval
#[derive(Debug, Clone)]
pub struct RetrieveImageResult {
    pub image: Image,
    /// Tier the image came from; `None` when it was fetched or rebuilt
    pub cache_type: CacheType,
    /// Source that produced the image
    pub source: Source,
    /// Source the retrieval started with
    pub original_source: Source,
    /// Raw bytes of a fresh fetch
    pub data: Option<Bytes>,
}

/// State of one top-level retrieval
#[derive(Debug, Clone)]
pub struct RetrievingContext {
    pub original_source: Source,
    pub options: RetrieveOptions,
    pub propagation_errors: Vec<PropagationError>,
}

impl RetrievingContext {
    pub fn new(source: Source, options: RetrieveOptions) -> Self {
        Self {
            original_source: source,
            options,
            propagation_errors: Vec::new(),
        }
    }

    fn pop_alternative_source(&mut self) -> Option<Source> {
        if self.options.alternative_sources.is_empty() {
            None
        } else {
            Some(self.options.alternative_sources.remove(0))
        }
    }

    fn append_error(&mut self, error: ImageError, source: Source) {
        self.propagation_errors.push(PropagationError { source, error });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CachePlan {
    /// The requested variant is cached
    Processed,
    /// Only the original is cached; process it
    Original,
    Miss,
}

struct Coordination {
    coordinator: CacheCallbackCoordinator,
    trigger: Option<oneshot::Sender<()>>,
}

impl Coordination {
    fn apply(&mut self, action: CacheAction) {
        let trigger = &mut self.trigger;
        self.coordinator.apply(action, || {
            if let Some(tx) = trigger.take() {
                let _ = tx.send(());
            }
        });
    }
}

struct ManagerInner {
    cache: ImageCache,
    downloader: ImageDownloader,
    pool: ProcessingPool,
    runtime: Handle,
    default_options: RetrieveOptions,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
    }
}

/// Entry point of the engine. Cloning is cheap.
#[derive(Clone)]
pub struct ImageManager {
    inner: Arc<ManagerInner>,
}

impl ImageManager {
    pub fn builder() -> ImageManagerBuilder {
        ImageManagerBuilder::new()
    }

    pub(crate) fn from_parts(
        cache: ImageCache,
        downloader: ImageDownloader,
        pool: ProcessingPool,
        runtime: Handle,
        default_options: RetrieveOptions,
        maintenance_interval: Duration,
    ) -> Self {
        let maintenance = if maintenance_interval.is_zero() {
            None
        } else {
            let _guard = runtime.enter();
            Some(cache.start_maintenance_task(maintenance_interval))
        };
        Self {
            inner: Arc::new(ManagerInner {
                cache,
                downloader,
                pool,
                runtime,
                default_options,
                maintenance: Mutex::new(maintenance),
            }),
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.inner.cache
    }

    pub fn downloader(&self) -> &ImageDownloader {
        &self.inner.downloader
    }

    pub fn default_options(&self) -> &RetrieveOptions {
        &self.inner.default_options
    }

    /// Tier holding `source` processed by `identifier`.
    pub fn cached_status(&self, source: &Source, identifier: &str) -> CacheType {
        self.inner
            .cache
            .image_cached_type(source.cache_key(), identifier)
    }

    /// Retrieve `source` and deliver the outcome to `completion` exactly once.
    ///
    /// Returns `None` when the result comes from the cache or the retrieval
    /// fails before any transfer starts.
    pub fn retrieve<F>(
        &self,
        source: Source,
        options: RetrieveOptions,
        completion: F,
    ) -> Option<DownloadTask>
    where
        F: FnOnce(Result<RetrieveImageResult, ImageError>) + Send + 'static,
    {
        let queue = options.callback_queue.clone();
        let deliver = move |result| queue.execute(move || completion(result));
        let key = source.cache_key().to_string();

        if !options.force_refresh {
            let plan = self.cache_plan(&source, &options);
            if plan != CachePlan::Miss {
                let manager = self.clone();
                let context = RetrievingContext::new(source.clone(), options);
                self.inner.runtime.spawn(async move {
                    let result = manager.retrieve_from_cache(&source, &context, plan).await;
                    deliver(result);
                });
                return None;
            }
            if options.only_from_cache {
                deliver(Err(CacheError::ImageNotExisting { key }.into()));
                return None;
            }
        }

        let task = DownloadTask::new(key, self.inner.downloader.registry().clone());
        let manager = self.clone();
        let handle = task.clone();
        self.inner.runtime.spawn(async move {
            let mut context = RetrievingContext::new(source, options);
            let result = manager.load_with_fallback(&mut context, &handle).await;
            deliver(result);
        });
        Some(task)
    }

    /// Async form of [`retrieve`](Self::retrieve).
    pub async fn retrieve_image(
        &self,
        source: Source,
        options: RetrieveOptions,
    ) -> Result<RetrieveImageResult, ImageError> {
        let key = source.cache_key().to_string();
        let (tx, rx) = oneshot::channel();
        let options = options.with_callback_queue(crate::options::CallbackQueue::Inline);
        let task = self.retrieve(source, options, move |result| {
            let _ = tx.send(result);
        });
        // Dropping the future cancels the retrieval.
        let _cancel_on_drop = task.map(CancelOnDrop);
        rx.await.unwrap_or_else(|_| Err(ImageError::cancelled(key)))
    }

    /// Retrieve with the manager's default options.
    pub async fn retrieve_default(&self, source: Source) -> Result<RetrieveImageResult, ImageError> {
        self.retrieve_image(source, self.inner.default_options.clone())
            .await
    }

    /// Prefetcher over `sources` sharing this manager.
    pub fn prefetcher(&self, sources: Vec<Source>, options: RetrieveOptions) -> ImagePrefetcher {
        ImagePrefetcher::new(self.clone(), sources, options)
    }

    fn cache_plan(&self, source: &Source, options: &RetrieveOptions) -> CachePlan {
        let key = source.cache_key();
        let cached = self
            .inner
            .cache
            .image_cached_type(key, options.processor_identifier());
        let valid = cached.cached()
            && (!options.from_memory_cache_or_refresh || cached == CacheType::Memory);
        if valid {
            return CachePlan::Processed;
        }
        if options.from_memory_cache_or_refresh || is_default(options.processor.as_ref()) {
            return CachePlan::Miss;
        }
        if self.inner.cache.is_cached(key, "") {
            CachePlan::Original
        } else {
            CachePlan::Miss
        }
    }

    async fn retrieve_from_cache(
        &self,
        source: &Source,
        context: &RetrievingContext,
        plan: CachePlan,
    ) -> Result<RetrieveImageResult, ImageError> {
        let key = source.cache_key();
        let options = &context.options;
        let not_existing = || ImageError::from(CacheError::ImageNotExisting {
            key: key.to_string(),
        });

        if plan == CachePlan::Processed {
            let (image, cache_type) = self
                .inner
                .cache
                .retrieve_image(key, options)
                .await?
                .ok_or_else(not_existing)?;
            debug!(key, ?cache_type, "Served from cache");
            return Ok(RetrieveImageResult {
                image,
                cache_type,
                source: source.clone(),
                original_source: context.original_source.clone(),
                data: None,
            });
        }

        let original = self
            .inner
            .cache
            .retrieve_original(key, options)
            .await?
            .ok_or_else(not_existing)?;

        let identifier = options.processor_identifier().to_string();
        let task_options = options.clone();
        let processed = self
            .pool_for(options)
            .run(move || {
                task_options
                    .processor
                    .process(&ImageItem::Image(original), &task_options)
            })
            .await
            .flatten()
            .ok_or_else(|| ProcessorError::ProcessingFailed {
                identifier,
                item: "cached original image".to_string(),
            })?;
        debug!(key, "Processed cached original image");

        let (tx, rx) = oneshot::channel();
        let coordination = Arc::new(Mutex::new(Coordination {
            coordinator: CacheCallbackCoordinator::new(options.wait_for_cache, false),
            trigger: Some(tx),
        }));
        self.cache_processed(&processed, None, key, options, &coordination);
        let _ = rx.await;

        Ok(RetrieveImageResult {
            image: processed,
            cache_type: CacheType::None,
            source: source.clone(),
            original_source: context.original_source.clone(),
            data: None,
        })
    }

    /// Walk the primary source, then the alternatives, until one succeeds.
    async fn load_with_fallback(
        &self,
        context: &mut RetrievingContext,
        task: &DownloadTask,
    ) -> Result<RetrieveImageResult, ImageError> {
        let mut source = context.original_source.clone();
        loop {
            let error = match self.load_with_retry(&source, context, task).await {
                Ok(result) => return Ok(result),
                Err(error) => error,
            };

            if error.is_task_cancelled() {
                return Err(error);
            }

            if error.is_network_constrained() {
                if let Some(low_data) = context.options.low_data_mode_source.take() {
                    info!(key = source.cache_key(), "Network constrained, trying low data mode source");
                    source = low_data;
                    continue;
                }
                return Err(error);
            }

            if let Some(next) = context.pop_alternative_source() {
                warn!(
                    failed = source.cache_key(),
                    next = next.cache_key(),
                    error = %error,
                    "Source failed, trying alternative source"
                );
                context.append_error(error, source);
                source = next;
                continue;
            }

            if context.propagation_errors.is_empty() {
                return Err(error);
            }
            context.append_error(error, source);
            return Err(ImageSettingError::AlternativeSourcesExhausted(
                context.propagation_errors.clone(),
            )
            .into());
        }
    }

    /// Load one source, consulting the retry strategy after each failure.
    async fn load_with_retry(
        &self,
        source: &Source,
        context: &RetrievingContext,
        task: &DownloadTask,
    ) -> Result<RetrieveImageResult, ImageError> {
        let mut retry_context: Option<RetryContext> = None;
        loop {
            let error = match self.load_and_cache(source, context, task).await {
                Ok(result) => return Ok(result),
                Err(error) => error,
            };
            let Some(strategy) = context.options.retry_strategy.clone() else {
                return Err(error);
            };

            let next = match retry_context.take() {
                Some(mut retry) => {
                    retry.increase_retry_count(error.clone());
                    retry
                }
                None => RetryContext::new(source.clone(), error.clone()),
            };
            let retry = retry_context.insert(next);

            match strategy.decide(retry) {
                RetryDecision::Stop => {
                    debug!(key = source.cache_key(), retried = retry.retried_count, "Retry stopped");
                    return Err(error);
                }
                RetryDecision::Retry { after, user_info } => {
                    retry.user_info = user_info;
                    info!(
                        key = source.cache_key(),
                        attempt = retry.retried_count + 1,
                        delay = ?after,
                        error = %error,
                        "Retrying image retrieval"
                    );
                    if !after.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(after) => {}
                            _ = task.cancelled() => {}
                        }
                    }
                }
            }
        }
    }

    /// One attempt: fetch (coalesced), then cache the processed result.
    async fn load_and_cache(
        &self,
        source: &Source,
        context: &RetrievingContext,
        task: &DownloadTask,
    ) -> Result<RetrieveImageResult, ImageError> {
        let options = &context.options;
        let (tx, rx) = oneshot::channel();
        let callback = SessionCallback::new(options.clone(), move |result| {
            let _ = tx.send(result);
        });
        task.attach(|| self.start_transfer(source, options, callback))?;

        let loaded = rx
            .await
            .unwrap_or_else(|_| Err(ImageError::cancelled(source.cache_key())))?;
        Ok(self.cache_image(source, context, loaded).await)
    }

    fn start_transfer(
        &self,
        source: &Source,
        options: &RetrieveOptions,
        callback: SessionCallback,
    ) -> Result<CancelToken, ImageError> {
        match source {
            Source::Network(resource) => self.inner.downloader.download(
                resource.download_url(),
                resource.cache_key(),
                options,
                callback,
            ),
            Source::Provider(provider) => {
                let provider = Arc::clone(provider);
                let key = provider.cache_key().to_string();
                let registry = self.inner.downloader.registry();
                Ok(registry.start(
                    &key,
                    move || {
                        async move {
                            let data = provider.data().await.map_err(|e| {
                                ImageSettingError::DataProviderError {
                                    key: provider.cache_key().to_string(),
                                    message: e.to_string(),
                                }
                            })?;
                            Ok::<_, ImageError>(FetchedData {
                                data,
                                url: provider.content_url().cloned(),
                            })
                        }
                        .boxed()
                    },
                    callback,
                ))
            }
        }
    }

    /// Store a fresh result and wait until the coordinator releases it.
    async fn cache_image(
        &self,
        source: &Source,
        context: &RetrievingContext,
        loaded: ImageLoadingResult,
    ) -> RetrieveImageResult {
        let options = &context.options;
        let key = source.cache_key();
        let need_original = options.cache_original_image && !is_default(options.processor.as_ref());

        let (tx, rx) = oneshot::channel();
        let coordination = Arc::new(Mutex::new(Coordination {
            coordinator: CacheCallbackCoordinator::new(options.wait_for_cache, need_original),
            trigger: Some(tx),
        }));

        self.cache_processed(
            &loaded.image,
            Some(loaded.original_data.clone()),
            key,
            options,
            &coordination,
        );

        if need_original {
            let cache = self.inner.cache.clone();
            let data = loaded.original_data.clone();
            let owned_key = key.to_string();
            let expiration = options.disk_cache_expiration;
            let coordination = Arc::clone(&coordination);
            self.inner.runtime.spawn(async move {
                if let Err(e) = cache.store_to_disk(data, &owned_key, "", expiration).await {
                    warn!(key = %owned_key, error = %e, "Failed to store original image on disk");
                }
                coordination.lock().apply(CacheAction::CachingOriginalImage);
            });
        }

        let _ = rx.await;
        RetrieveImageResult {
            image: loaded.image,
            cache_type: CacheType::None,
            source: source.clone(),
            original_source: context.original_source.clone(),
            data: Some(loaded.original_data),
        }
    }

    /// Memory store now, disk store in the background.
    fn cache_processed(
        &self,
        image: &Image,
        original: Option<Bytes>,
        key: &str,
        options: &RetrieveOptions,
        coordination: &Arc<Mutex<Coordination>>,
    ) {
        self.inner.cache.store_to_memory(image.clone(), key, options);
        coordination.lock().apply(CacheAction::CacheInitiated);

        if options.cache_memory_only {
            coordination.lock().apply(CacheAction::CachingImage);
            return;
        }

        let cache = self.inner.cache.clone();
        let image = image.clone();
        let owned_key = key.to_string();
        let options = options.clone();
        let coordination = Arc::clone(coordination);
        self.inner.runtime.spawn(async move {
            if let Err(e) = cache
                .store_serialized_to_disk(image, original, &owned_key, &options)
                .await
            {
                warn!(key = %owned_key, error = %e, "Failed to store image on disk");
            }
            coordination.lock().apply(CacheAction::CachingImage);
        });
    }

    fn pool_for(&self, options: &RetrieveOptions) -> ProcessingPool {
        options
            .processing_pool
            .clone()
            .unwrap_or_else(|| self.inner.pool.clone())
    }
}

struct CancelOnDrop(DownloadTask);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::tests::png_bytes;
    use crate::cache::CacheConfig;
    use crate::downloader::{FetchRequest, FetchResponse, Transport};
    use crate::error::ResponseError;
    use crate::processor::FnImageProcessor;
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn get(&self, request: FetchRequest) -> Result<FetchResponse, ResponseError> {
            Err(ResponseError::NoResponse {
                url: request.url.to_string(),
            })
        }
    }

    fn manager(dir: &std::path::Path) -> ImageManager {
        let config = CacheConfig {
            disk_directory: Some(dir.to_path_buf()),
            maintenance_interval: Duration::ZERO,
            ..CacheConfig::default()
        };
        ImageManager::builder()
            .with_transport(Arc::new(Offline))
            .with_cache(ImageCache::new(&config))
            .build()
            .unwrap()
    }

    fn url_source(path: &str) -> Source {
        Source::from_url_str(&format!("https://example.com/{path}")).unwrap()
    }

    #[test]
    fn test_alternative_sources_pop_in_order() {
        let options = RetrieveOptions::default()
            .with_alternative_sources(vec![url_source("b.png"), url_source("c.png")]);
        let mut context = RetrievingContext::new(url_source("a.png"), options);
        assert_eq!(context.pop_alternative_source(), Some(url_source("b.png")));
        assert_eq!(context.pop_alternative_source(), Some(url_source("c.png")));
        assert_eq!(context.pop_alternative_source(), None);
    }

    #[tokio::test]
    async fn test_cache_plan_prefers_processed_then_original() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let source = url_source("a.png");
        let key = source.cache_key().to_string();
        let blur = RetrieveOptions::default()
            .with_processor(Arc::new(FnImageProcessor::new("blur", |i, _| Some(i.clone()))));

        assert_eq!(manager.cache_plan(&source, &blur), CachePlan::Miss);

        manager
            .cache()
            .store_to_disk(png_bytes(2, 2), &key, "", None)
            .await
            .unwrap();
        assert_eq!(manager.cache_plan(&source, &blur), CachePlan::Original);
        assert_eq!(
            manager.cache_plan(&source, &blur.clone().with_from_memory_cache_or_refresh(true)),
            CachePlan::Miss
        );
        // The identity processor reads the bare key as its own variant.
        assert_eq!(
            manager.cache_plan(&source, &RetrieveOptions::default()),
            CachePlan::Processed
        );
    }

    #[tokio::test]
    async fn test_memory_only_hit_is_required_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let source = url_source("a.png");
        let key = source.cache_key().to_string();
        manager
            .cache()
            .store_to_disk(png_bytes(1, 1), &key, "", None)
            .await
            .unwrap();

        let options = RetrieveOptions::default().with_from_memory_cache_or_refresh(true);
        assert_eq!(manager.cache_plan(&source, &options), CachePlan::Miss);
        assert_eq!(manager.cached_status(&source, ""), CacheType::Disk);
    }

    #[tokio::test]
    async fn test_original_is_processed_and_stored() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let source = url_source("a.png");
        let key = source.cache_key().to_string();
        manager
            .cache()
            .store_to_disk(png_bytes(4, 4), &key, "", None)
            .await
            .unwrap();

        let half = RetrieveOptions::default().with_processor(Arc::new(FnImageProcessor::new(
            "half",
            |image, _| {
                Some(Image::new(
                    image.pixels().thumbnail_exact(2, 2),
                    image.format(),
                    image.scale(),
                ))
            },
        )));
        let result = manager
            .retrieve_image(source.clone(), half.clone().with_wait_for_cache(true))
            .await
            .unwrap();
        assert_eq!(result.cache_type, CacheType::None);
        assert_eq!(result.image.width(), 2);
        assert_eq!(manager.cached_status(&source, "half"), CacheType::Memory);
        assert!(manager.cache().disk().is_cached(&crate::cache::computed_key(&key, "half")));
    }
}
