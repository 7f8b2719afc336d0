//! # Image Cache
//!
//! Coordinates the memory and disk tiers. Processed variants are stored under
//! `key@identifier`; the default processor stores under the bare key, which is
//! also where original payloads live.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bitmap::Image;
use crate::cache::providers::file::{FileStore, FileStoreConfig};
use crate::cache::providers::memory::{MemoryStorage, MemoryStorageConfig};
use crate::cache::providers::provider::{DiskStore, SweepSummary};
use crate::cache::types::{CacheConfig, CacheType, StorageExpiration, computed_key};
use crate::error::CacheError;
use crate::options::RetrieveOptions;
use crate::pool::ProcessingPool;
use crate::processor::{DefaultImageProcessor, ImageItem};

/// Two-tier image cache
#[derive(Clone)]
pub struct ImageCache {
    memory: MemoryStorage,
    disk: Arc<dyn DiskStore>,
    pool: ProcessingPool,
}

impl ImageCache {
    /// Create a cache from `config`. A disk directory that cannot be created
    /// leaves the disk tier not ready instead of failing.
    pub fn new(config: &CacheConfig) -> Self {
        let disk = FileStore::new(Self::file_store_config(config));
        Self::with_stores(Self::memory_storage(config), Arc::new(disk))
    }

    /// Create a cache from `config`, failing if the disk directory cannot be created.
    pub fn try_new(config: &CacheConfig) -> Result<Self, CacheError> {
        let disk = FileStore::try_new(Self::file_store_config(config))?;
        Ok(Self::with_stores(Self::memory_storage(config), Arc::new(disk)))
    }

    /// Create a cache from explicit tiers
    pub fn with_stores(memory: MemoryStorage, disk: Arc<dyn DiskStore>) -> Self {
        Self {
            memory,
            disk,
            pool: ProcessingPool::default(),
        }
    }

    pub fn with_processing_pool(mut self, pool: ProcessingPool) -> Self {
        self.pool = pool;
        self
    }

    fn memory_storage(config: &CacheConfig) -> MemoryStorage {
        MemoryStorage::new(MemoryStorageConfig {
            total_cost_limit: config.memory_total_cost_limit,
            count_limit: config.memory_count_limit,
            expiration: config.memory_expiration,
        })
    }

    fn file_store_config(config: &CacheConfig) -> FileStoreConfig {
        FileStoreConfig {
            size_limit: config.disk_size_limit,
            expiration: config.disk_expiration,
            ..FileStoreConfig::new(config.disk_directory())
        }
    }

    pub fn memory(&self) -> &MemoryStorage {
        &self.memory
    }

    pub fn disk(&self) -> &Arc<dyn DiskStore> {
        &self.disk
    }

    fn pool_for(&self, options: &RetrieveOptions) -> ProcessingPool {
        options
            .processing_pool
            .clone()
            .unwrap_or_else(|| self.pool.clone())
    }

    /// Tier holding `key` processed by `identifier`. Never extends expiration.
    pub fn image_cached_type(&self, key: &str, identifier: &str) -> CacheType {
        let computed = computed_key(key, identifier);
        if self.memory.is_cached(&computed) {
            CacheType::Memory
        } else if self.disk.is_cached(&computed) {
            CacheType::Disk
        } else {
            CacheType::None
        }
    }

    pub fn is_cached(&self, key: &str, identifier: &str) -> bool {
        self.image_cached_type(key, identifier).cached()
    }

    /// Read from the memory tier only
    pub fn retrieve_image_in_memory_cache(
        &self,
        key: &str,
        options: &RetrieveOptions,
    ) -> Option<Image> {
        let computed = computed_key(key, options.processor_identifier());
        self.memory
            .value(&computed, options.memory_cache_access_extending_expiration)
    }

    /// Read from the disk tier only, decoding on the processing pool.
    ///
    /// When the serializer persisted the original payload, the processor of
    /// `options` runs again on the decoded image.
    pub async fn retrieve_image_in_disk_cache(
        &self,
        key: &str,
        options: &RetrieveOptions,
    ) -> Result<Option<Image>, CacheError> {
        let computed = computed_key(key, options.processor_identifier());
        let Some(data) = self
            .disk
            .value(&computed, options.disk_cache_access_extending_expiration)
            .await?
        else {
            return Ok(None);
        };

        let task_options = options.clone();
        let image = self
            .pool_for(options)
            .run(move || {
                let serializer = &task_options.cache_serializer;
                let image = serializer.image(&data, &task_options)?;
                if serializer.original_data_used() {
                    task_options
                        .processor
                        .process(&ImageItem::Image(image), &task_options)
                } else {
                    Some(image)
                }
            })
            .await
            .flatten();

        if image.is_none() {
            debug!(key = %computed, "Disk entry could not be decoded");
        }
        Ok(image)
    }

    /// Memory first, then disk. Disk hits are promoted to memory.
    pub async fn retrieve_image(
        &self,
        key: &str,
        options: &RetrieveOptions,
    ) -> Result<Option<(Image, CacheType)>, CacheError> {
        if let Some(image) = self.retrieve_image_in_memory_cache(key, options) {
            return Ok(Some((image, CacheType::Memory)));
        }
        if options.from_memory_cache_or_refresh {
            return Ok(None);
        }
        match self.retrieve_image_in_disk_cache(key, options).await? {
            Some(image) => {
                let computed = computed_key(key, options.processor_identifier());
                self.memory
                    .store(image.clone(), &computed, options.memory_cache_expiration);
                Ok(Some((image, CacheType::Disk)))
            }
            None => Ok(None),
        }
    }

    /// Store into memory only
    pub fn store_to_memory(&self, image: Image, key: &str, options: &RetrieveOptions) {
        let computed = computed_key(key, options.processor_identifier());
        self.memory
            .store(image, &computed, options.memory_cache_expiration);
    }

    /// Store `image` in memory and, with `to_disk`, its serialized form on disk.
    pub async fn store(
        &self,
        image: Image,
        original: Option<Bytes>,
        key: &str,
        options: &RetrieveOptions,
        to_disk: bool,
    ) -> Result<(), CacheError> {
        self.store_to_memory(image.clone(), key, options);
        if !to_disk {
            return Ok(());
        }
        self.store_serialized_to_disk(image, original, key, options)
            .await
    }

    /// Serialize `image` and write it to the disk tier only
    pub async fn store_serialized_to_disk(
        &self,
        image: Image,
        original: Option<Bytes>,
        key: &str,
        options: &RetrieveOptions,
    ) -> Result<(), CacheError> {
        let computed = computed_key(key, options.processor_identifier());
        let serializer = Arc::clone(&options.cache_serializer);
        let data = self
            .pool_for(options)
            .run(move || serializer.data(&image, original.as_ref()))
            .await
            .flatten()
            .ok_or_else(|| CacheError::CannotSerializeImage {
                key: computed.clone(),
            })?;

        self.disk
            .store(&computed, data, options.disk_cache_expiration)
            .await
    }

    /// Store raw bytes on disk under `key` and `identifier`
    pub async fn store_to_disk(
        &self,
        data: Bytes,
        key: &str,
        identifier: &str,
        expiration: Option<StorageExpiration>,
    ) -> Result<(), CacheError> {
        self.disk
            .store(&computed_key(key, identifier), data, expiration)
            .await
    }

    /// Read the unprocessed original stored under the bare key
    pub async fn retrieve_original(
        &self,
        key: &str,
        options: &RetrieveOptions,
    ) -> Result<Option<Image>, CacheError> {
        let original = options
            .clone()
            .with_processor(Arc::new(DefaultImageProcessor));
        Ok(self.retrieve_image(key, &original).await?.map(|(image, _)| image))
    }

    pub async fn remove_image(
        &self,
        key: &str,
        identifier: &str,
        from_memory: bool,
        from_disk: bool,
    ) -> Result<(), CacheError> {
        let computed = computed_key(key, identifier);
        if from_memory {
            self.memory.remove(&computed);
        }
        if from_disk {
            self.disk.remove(&computed).await?;
        }
        Ok(())
    }

    pub fn clear_memory_cache(&self) {
        self.memory.remove_all();
    }

    pub async fn clear_disk_cache(&self) -> Result<(), CacheError> {
        self.disk.remove_all().await
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.clear_memory_cache();
        self.clear_disk_cache().await
    }

    pub fn clean_expired_memory_cache(&self) -> usize {
        self.memory.remove_expired()
    }

    pub async fn clean_expired_disk_cache(&self) -> Result<SweepSummary, CacheError> {
        self.disk.sweep().await
    }

    pub async fn total_disk_size(&self) -> Result<u64, CacheError> {
        self.disk.total_size().await
    }

    /// Sweep both tiers
    pub async fn maintain(&self) -> Result<SweepSummary, CacheError> {
        let memory = self.clean_expired_memory_cache();
        let disk = self.clean_expired_disk_cache().await?;
        if memory > 0 {
            debug!(removed = memory, "Removed expired memory entries");
        }
        Ok(disk)
    }

    /// Start a background maintenance task
    pub fn start_maintenance_task(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        info!(interval = ?interval, "Starting cache maintenance task");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                if let Err(e) = cache.maintain().await {
                    warn!(error = %e, "Cache maintenance error");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::tests::png_bytes;
    use crate::bitmap::{BitmapDecoder, DefaultBitmapDecoder};
    use crate::cache::serializer::DefaultCacheSerializer;
    use crate::processor::FnImageProcessor;

    fn cache(dir: &std::path::Path) -> ImageCache {
        ImageCache::try_new(&CacheConfig {
            disk_directory: Some(dir.to_path_buf()),
            memory_expiration: StorageExpiration::Never,
            disk_expiration: StorageExpiration::Never,
            ..Default::default()
        })
        .unwrap()
    }

    fn image() -> (Image, Bytes) {
        let data = png_bytes(2, 2);
        (DefaultBitmapDecoder.decode(&data, 1.0).unwrap(), data)
    }

    #[tokio::test]
    async fn test_store_then_retrieve_from_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let options = RetrieveOptions::default();
        let (image, data) = image();

        cache
            .store(image.clone(), Some(data), "k", &options, true)
            .await
            .unwrap();
        assert_eq!(cache.image_cached_type("k", ""), CacheType::Memory);

        cache.clear_memory_cache();
        assert_eq!(cache.image_cached_type("k", ""), CacheType::Disk);

        let (read, tier) = cache.retrieve_image("k", &options).await.unwrap().unwrap();
        assert_eq!(tier, CacheType::Disk);
        assert_eq!(read, image);
        assert_eq!(cache.image_cached_type("k", ""), CacheType::Memory);
    }

    #[tokio::test]
    async fn test_processed_variants_use_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let (image, _) = image();
        let processed = RetrieveOptions::default()
            .with_processor(Arc::new(FnImageProcessor::new("noop", |i, _| Some(i.clone()))));

        cache
            .store(image, None, "k", &processed, false)
            .await
            .unwrap();
        assert_eq!(cache.image_cached_type("k", "noop"), CacheType::Memory);
        assert_eq!(cache.image_cached_type("k", ""), CacheType::None);
    }

    #[tokio::test]
    async fn test_original_data_serializer_reprocesses_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let (image, data) = image();
        let options = RetrieveOptions::default()
            .with_cache_serializer(Arc::new(DefaultCacheSerializer::original_data()))
            .with_processor(Arc::new(FnImageProcessor::new("scale3", |i, _| {
                Some(i.with_scale(3.0))
            })));

        cache
            .store(image.with_scale(3.0), Some(data), "k", &options, true)
            .await
            .unwrap();
        cache.clear_memory_cache();

        let read = cache
            .retrieve_image_in_disk_cache("k", &options)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.scale(), 3.0);
    }

    #[tokio::test]
    async fn test_memory_only_option_skips_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let (image, _) = image();
        let options = RetrieveOptions::default();

        cache.store(image, None, "k", &options, true).await.unwrap();
        cache.clear_memory_cache();

        let memory_only = options.with_from_memory_cache_or_refresh(true);
        assert!(cache.retrieve_image("k", &memory_only).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_and_total_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let (image, data) = image();
        let options = RetrieveOptions::default();

        cache.store(image, Some(data), "k", &options, true).await.unwrap();
        assert!(cache.total_disk_size().await.unwrap() > 0);

        cache.remove_image("k", "", true, true).await.unwrap();
        assert_eq!(cache.image_cached_type("k", ""), CacheType::None);
    }
}
