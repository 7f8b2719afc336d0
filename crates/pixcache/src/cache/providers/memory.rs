//! # Memory Storage
//!
//! Decoded images kept in a size-aware Moka cache. Expiration is tracked per
//! entry and checked lazily on every read.

use std::sync::Arc;
use std::time::SystemTime;

use moka::sync::Cache as MokaCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::bitmap::Image;
use crate::cache::types::{ExpirationExtending, StorageExpiration, extended_expiration, is_past};

/// Limits of the memory tier
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    /// Total decoded byte cost; 0 disables the cost bound
    pub total_cost_limit: u64,
    /// Entry count; only used when the cost bound is disabled
    pub count_limit: u64,
    /// Expiration applied when a store does not specify one
    pub expiration: StorageExpiration,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            total_cost_limit: 256 * 1024 * 1024,
            count_limit: 0,
            expiration: StorageExpiration::Seconds(300.0),
        }
    }
}

struct ExpiryState {
    expiration: StorageExpiration,
    estimated: Option<SystemTime>,
}

struct MemoryObject {
    image: Image,
    expiry: Mutex<ExpiryState>,
}

impl MemoryObject {
    fn is_expired(&self, now: SystemTime) -> bool {
        is_past(self.expiry.lock().estimated, now)
    }

    fn extend(&self, extending: ExpirationExtending, now: SystemTime) {
        let mut state = self.expiry.lock();
        if let Some(estimated) = extended_expiration(state.expiration, extending, now) {
            if let ExpirationExtending::ExpirationTime(expiration) = extending {
                state.expiration = expiration;
            }
            state.estimated = estimated;
        }
    }
}

/// Memory tier of the image cache
#[derive(Clone)]
pub struct MemoryStorage {
    cache: MokaCache<String, Arc<MemoryObject>>,
    config: Arc<MemoryStorageConfig>,
}

impl MemoryStorage {
    pub fn new(config: MemoryStorageConfig) -> Self {
        let cache = if config.total_cost_limit > 0 {
            MokaCache::builder()
                .weigher(|_k, v: &Arc<MemoryObject>| {
                    v.image.cost().try_into().unwrap_or(u32::MAX)
                })
                .max_capacity(config.total_cost_limit)
                .build()
        } else if config.count_limit > 0 {
            MokaCache::new(config.count_limit)
        } else {
            MokaCache::builder().build()
        };

        debug!(
            total_cost_limit = config.total_cost_limit,
            count_limit = config.count_limit,
            "Memory storage created"
        );

        Self {
            cache,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &MemoryStorageConfig {
        &self.config
    }

    /// Store `image` under `key`. An already expired policy skips the store.
    pub fn store(&self, image: Image, key: &str, expiration: Option<StorageExpiration>) {
        let expiration = expiration.unwrap_or(self.config.expiration);
        if expiration.is_expired() {
            return;
        }
        let object = MemoryObject {
            image,
            expiry: Mutex::new(ExpiryState {
                expiration,
                estimated: expiration.estimated_expiration_since(SystemTime::now()),
            }),
        };
        self.cache.insert(key.to_string(), Arc::new(object));
    }

    /// Read `key`, extending its expiration on a hit. Expired entries read as a miss.
    pub fn value(&self, key: &str, extending: ExpirationExtending) -> Option<Image> {
        let object = self.cache.get(key)?;
        let now = SystemTime::now();
        if object.is_expired(now) {
            debug!(key, "Memory entry expired");
            self.cache.invalidate(key);
            return None;
        }
        object.extend(extending, now);
        Some(object.image.clone())
    }

    /// Whether a live entry exists. Does not touch its expiration.
    pub fn is_cached(&self, key: &str) -> bool {
        self.cache
            .get(key)
            .is_some_and(|object| !object.is_expired(SystemTime::now()))
    }

    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn remove_all(&self) {
        self.cache.invalidate_all();
        debug!("Memory storage cleared");
    }

    /// Drop every expired entry and return how many were removed.
    pub fn remove_expired(&self) -> usize {
        let now = SystemTime::now();
        let expired: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(_, object)| object.is_expired(now))
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.cache.invalidate(key.as_str());
        }
        self.cache.run_pending_tasks();
        expired.len()
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bitmap::{BitmapDecoder, DefaultBitmapDecoder};
    use crate::bitmap::tests::png_bytes;

    fn image() -> Image {
        DefaultBitmapDecoder.decode(&png_bytes(2, 2), 1.0).unwrap()
    }

    fn storage() -> MemoryStorage {
        MemoryStorage::new(MemoryStorageConfig {
            expiration: StorageExpiration::Never,
            ..Default::default()
        })
    }

    #[test]
    fn test_store_and_read() {
        let storage = storage();
        storage.store(image(), "k", None);
        assert!(storage.is_cached("k"));
        assert_eq!(storage.value("k", ExpirationExtending::None), Some(image()));
        assert!(storage.value("missing", ExpirationExtending::None).is_none());
    }

    #[test]
    fn test_expired_policies_read_as_miss() {
        let storage = storage();
        storage.store(image(), "zero", Some(StorageExpiration::Seconds(0.0)));
        storage.store(image(), "expired", Some(StorageExpiration::Expired));

        assert!(!storage.is_cached("zero"));
        assert!(storage.value("zero", ExpirationExtending::CacheTime).is_none());
        assert!(!storage.is_cached("expired"));
    }

    #[test]
    fn test_extending_keeps_entry_alive() {
        let storage = storage();
        storage.store(image(), "k", Some(StorageExpiration::Seconds(60.0)));
        let extended = ExpirationExtending::ExpirationTime(StorageExpiration::Never);
        assert!(storage.value("k", extended).is_some());
        assert_eq!(storage.remove_expired(), 0);
        assert!(storage.is_cached("k"));
    }

    #[test]
    fn test_reads_slide_the_expiry_forward() {
        let storage = storage();
        let short = Some(StorageExpiration::Seconds(1.0));
        storage.store(image(), "sliding", short);
        storage.store(image(), "fixed", short);

        std::thread::sleep(Duration::from_millis(600));
        assert!(storage.value("sliding", ExpirationExtending::CacheTime).is_some());
        assert!(storage.value("fixed", ExpirationExtending::None).is_some());

        // Past the original deadline, inside the extended one.
        std::thread::sleep(Duration::from_millis(600));
        assert!(storage.is_cached("sliding"));
        assert!(storage.value("sliding", ExpirationExtending::None).is_some());
        assert!(!storage.is_cached("fixed"));
        assert!(storage.value("fixed", ExpirationExtending::CacheTime).is_none());

        std::thread::sleep(Duration::from_millis(1000));
        assert!(!storage.is_cached("sliding"));
        assert!(storage.value("sliding", ExpirationExtending::CacheTime).is_none());
    }

    #[test]
    fn test_new_expiration_replaces_stored_policy() {
        let storage = storage();
        storage.store(image(), "k", Some(StorageExpiration::Seconds(0.3)));
        let renewed = ExpirationExtending::ExpirationTime(StorageExpiration::Seconds(5.0));
        assert!(storage.value("k", renewed).is_some());

        std::thread::sleep(Duration::from_millis(500));
        // CacheTime now re-applies the five second policy.
        assert!(storage.value("k", ExpirationExtending::CacheTime).is_some());
        assert!(storage.is_cached("k"));
    }

    #[test]
    fn test_unrepresentable_expiration_never_expires() {
        let storage = storage();
        storage.store(image(), "k", Some(StorageExpiration::Seconds(1e300)));
        assert!(storage.value("k", ExpirationExtending::CacheTime).is_some());
        assert_eq!(storage.remove_expired(), 0);
        assert!(storage.is_cached("k"));
    }

    #[test]
    fn test_remove_expired_and_clear() {
        let storage = storage();
        storage.store(image(), "live", None);
        storage.store(image(), "dead", Some(StorageExpiration::Date(SystemTime::UNIX_EPOCH)));
        assert_eq!(storage.remove_expired(), 1);
        assert!(storage.is_cached("live"));

        storage.remove_all();
        assert!(!storage.is_cached("live"));
    }
}
