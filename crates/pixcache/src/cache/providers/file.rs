//! # File Store
//!
//! Persistent disk tier. Each entry is a data file named after the SHA-256 of
//! its key plus a JSON metadata sidecar holding expiry and access time.
//! An in-memory index of expiries answers `is_cached` without touching disk.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use super::provider::{DiskStore, SweepSummary};
use crate::cache::types::{
    ExpirationExtending, StorageExpiration, extended_expiration, from_millis, is_past,
    millis_since_epoch,
};
use crate::error::CacheError;

const METADATA_EXTENSION: &str = "meta";
const TEMP_EXTENSION: &str = "tmp";

/// Temporary files older than this are left over from interrupted writes
pub const DEFAULT_STALE_TEMP_AGE: Duration = Duration::from_secs(10 * 60);

/// Configuration of the file store
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    pub directory: PathBuf,
    /// Maximum total size in bytes; 0 means unbounded
    pub size_limit: u64,
    /// Expiration applied when a store does not specify one
    pub expiration: StorageExpiration,
    /// Age after which `sweep` deletes leftover temporary files
    pub stale_temp_age: Duration,
}

impl FileStoreConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            size_limit: 0,
            expiration: StorageExpiration::Days(7),
            stale_temp_age: DEFAULT_STALE_TEMP_AGE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMetadata {
    key: String,
    expiration: StorageExpiration,
    /// Milliseconds since the epoch, `None` for never
    expires_at: Option<u64>,
    accessed_at: u64,
    size: u64,
}

impl EntryMetadata {
    fn is_expired(&self, now: SystemTime) -> bool {
        is_past(self.expires_at.and_then(from_millis), now)
    }
}

/// Expiry in epoch millis per data file name, `None` for never
type ExpiryIndex = HashMap<String, Option<u64>>;

/// File-backed [`DiskStore`]
#[derive(Debug, Clone)]
pub struct FileStore {
    config: Arc<FileStoreConfig>,
    ready: bool,
    temp_counter: Arc<AtomicU64>,
    index: Arc<Mutex<ExpiryIndex>>,
}

impl FileStore {
    /// Create the store, marking it not ready when the directory cannot be created.
    pub fn new(config: FileStoreConfig) -> Self {
        match std::fs::create_dir_all(&config.directory) {
            Ok(()) => Self::with_readiness(config, true),
            Err(e) => {
                warn!(dir = ?config.directory, error = %e, "Failed to create disk cache directory");
                Self::with_readiness(config, false)
            }
        }
    }

    /// Create the store, failing when the directory cannot be created.
    pub fn try_new(config: FileStoreConfig) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&config.directory).map_err(|e| {
            CacheError::CannotCreateDirectory {
                path: config.directory.clone(),
                source: Arc::new(e),
            }
        })?;
        Ok(Self::with_readiness(config, true))
    }

    fn with_readiness(config: FileStoreConfig, ready: bool) -> Self {
        let index = if ready {
            Self::load_index(&config.directory)
        } else {
            ExpiryIndex::new()
        };
        Self {
            config: Arc::new(config),
            ready,
            temp_counter: Arc::new(AtomicU64::new(0)),
            index: Arc::new(Mutex::new(index)),
        }
    }

    /// Read every sidecar once so later lookups stay in memory.
    fn load_index(directory: &Path) -> ExpiryIndex {
        let mut index = ExpiryIndex::new();
        let Ok(entries) = std::fs::read_dir(directory) else {
            return index;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXTENSION) {
                continue;
            }
            let Ok(raw) = std::fs::read(&path) else {
                continue;
            };
            if let Ok(metadata) = serde_json::from_slice::<EntryMetadata>(&raw) {
                index.insert(Self::file_name(&metadata.key), metadata.expires_at);
            }
        }
        debug!(dir = ?directory, entries = index.len(), "Loaded disk cache index");
        index
    }

    fn index_insert(&self, key: &str, expires_at: Option<u64>) {
        self.index.lock().insert(Self::file_name(key), expires_at);
    }

    fn index_remove(&self, key: &str) {
        self.index.lock().remove(&Self::file_name(key));
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn config(&self) -> &FileStoreConfig {
        &self.config
    }

    fn ensure_ready(&self) -> Result<(), CacheError> {
        if self.ready {
            Ok(())
        } else {
            Err(CacheError::DiskStorageNotReady {
                path: self.config.directory.clone(),
            })
        }
    }

    fn file_name(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.config.directory.join(Self::file_name(key))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        let mut path = self.data_path(key);
        path.set_extension(METADATA_EXTENSION);
        path
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{n}.{TEMP_EXTENSION}"));
        path.with_file_name(name)
    }

    async fn read_metadata(path: &Path) -> Result<Option<EntryMetadata>, CacheError> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::CannotLoadDataFromDisk {
                    path: path.to_path_buf(),
                    source: Arc::new(e),
                });
            }
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| CacheError::InvalidMetadata {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), CacheError> {
        let temp = self.temp_path(path);
        let result = async {
            fs::write(&temp, contents).await?;
            fs::rename(&temp, path).await
        }
        .await;
        if let Err(e) = result {
            warn!(path = ?path, error = %e, "Failed to write cache file");
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::CannotCreateCacheFile {
                path: path.to_path_buf(),
                source: Arc::new(e),
            });
        }
        Ok(())
    }

    async fn remove_paths(data: &Path, meta: &Path) -> Result<(), CacheError> {
        for path in [data, meta] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to remove cache file");
                    return Err(CacheError::CannotRemoveFile {
                        path: path.to_path_buf(),
                        source: Arc::new(e),
                    });
                }
            }
        }
        Ok(())
    }

    /// Delete a temporary file whose last write is older than the configured age.
    async fn remove_stale_temp(&self, path: &Path, entry: &fs::DirEntry, now: SystemTime) -> bool {
        let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
            return false;
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age < self.config.stale_temp_age {
            return false;
        }
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = ?path, age = ?age, "Removed stale temporary file");
                true
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to remove stale temporary file");
                false
            }
        }
    }

    fn io_error(&self, e: io::Error) -> CacheError {
        CacheError::CannotLoadDataFromDisk {
            path: self.config.directory.clone(),
            source: Arc::new(e),
        }
    }
}

#[async_trait]
impl DiskStore for FileStore {
    fn directory(&self) -> &Path {
        &self.config.directory
    }

    fn is_cached(&self, key: &str) -> bool {
        if !self.ready {
            return false;
        }
        let name = Self::file_name(key);
        if let Some(expires_at) = self.index.lock().get(&name).copied() {
            return !is_past(expires_at.and_then(from_millis), SystemTime::now());
        }
        // Written by another store sharing the directory; expiry is checked on read.
        self.config.directory.join(name).exists()
    }

    async fn value(
        &self,
        key: &str,
        extending: ExpirationExtending,
    ) -> Result<Option<Bytes>, CacheError> {
        self.ensure_ready()?;

        let data_path = self.data_path(key);
        let meta_path = self.metadata_path(key);

        let mut metadata = match Self::read_metadata(&meta_path).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                self.index_remove(key);
                return Ok(None);
            }
            Err(CacheError::InvalidMetadata { path, message }) => {
                warn!(path = ?path, error = %message, "Failed to parse cache metadata, removing entry");
                self.index_remove(key);
                Self::remove_paths(&data_path, &meta_path).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        if metadata.is_expired(now) {
            debug!(key, "Disk entry expired");
            self.index_remove(key);
            Self::remove_paths(&data_path, &meta_path).await?;
            return Ok(None);
        }

        let data = match fs::read(&data_path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.index_remove(key);
                return Ok(None);
            }
            Err(e) => {
                return Err(CacheError::CannotLoadDataFromDisk {
                    path: data_path,
                    source: Arc::new(e),
                });
            }
        };

        metadata.accessed_at = millis_since_epoch(now);
        if let Some(estimated) = extended_expiration(metadata.expiration, extending, now) {
            if let ExpirationExtending::ExpirationTime(expiration) = extending {
                metadata.expiration = expiration;
            }
            metadata.expires_at = estimated.map(millis_since_epoch);
        }
        self.index_insert(key, metadata.expires_at);
        match serde_json::to_vec(&metadata) {
            Ok(json) => {
                if let Err(e) = self.write_atomic(&meta_path, &json).await {
                    warn!(key, error = %e, "Failed to update cache metadata after read");
                }
            }
            Err(e) => warn!(key, error = %e, "Failed to serialize cache metadata"),
        }

        Ok(Some(data))
    }

    async fn store(
        &self,
        key: &str,
        data: Bytes,
        expiration: Option<StorageExpiration>,
    ) -> Result<(), CacheError> {
        self.ensure_ready()?;

        let expiration = expiration.unwrap_or(self.config.expiration);
        if expiration.is_expired() {
            debug!(key, "Skipping disk store for an already expired entry");
            return Ok(());
        }

        let now = SystemTime::now();
        let data_path = self.data_path(key);
        let meta_path = self.metadata_path(key);
        let metadata = EntryMetadata {
            key: key.to_string(),
            expiration,
            expires_at: expiration
                .estimated_expiration_since(now)
                .map(millis_since_epoch),
            accessed_at: millis_since_epoch(now),
            size: data.len() as u64,
        };
        let json = serde_json::to_vec(&metadata).map_err(|_| CacheError::CannotSerializeImage {
            key: key.to_string(),
        })?;

        self.write_atomic(&data_path, &data).await?;
        if let Err(e) = self.write_atomic(&meta_path, &json).await {
            let _ = fs::remove_file(&data_path).await;
            self.index_remove(key);
            return Err(e);
        }
        self.index_insert(key, metadata.expires_at);

        debug!(key, size = data.len(), "Stored entry on disk");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.ensure_ready()?;
        self.index_remove(key);
        Self::remove_paths(&self.data_path(key), &self.metadata_path(key)).await
    }

    async fn remove_all(&self) -> Result<(), CacheError> {
        self.ensure_ready()?;
        let dir = &self.config.directory;
        self.index.lock().clear();
        match fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::CannotRemoveFile {
                    path: dir.clone(),
                    source: Arc::new(e),
                });
            }
        }
        fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::CannotCreateDirectory {
                path: dir.clone(),
                source: Arc::new(e),
            })?;
        info!(dir = ?dir, "Disk cache cleared");
        Ok(())
    }

    async fn sweep(&self) -> Result<SweepSummary, CacheError> {
        self.ensure_ready()?;

        let now = SystemTime::now();
        let mut summary = SweepSummary::default();
        let mut live = Vec::new();
        let mut entries = fs::read_dir(&self.config.directory)
            .await
            .map_err(|e| self.io_error(e))?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_error(e))? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(METADATA_EXTENSION) => {}
                Some(TEMP_EXTENSION) => {
                    if self.remove_stale_temp(&path, &entry, now).await {
                        summary.stale_temp_files += 1;
                    }
                    continue;
                }
                _ => continue,
            }
            let meta_path = path;
            let data_path = meta_path.with_extension("");
            match Self::read_metadata(&meta_path).await {
                Ok(Some(metadata)) if metadata.is_expired(now) => {
                    self.index_remove(&metadata.key);
                    Self::remove_paths(&data_path, &meta_path).await?;
                    summary.expired += 1;
                }
                Ok(Some(metadata)) => {
                    self.index_insert(&metadata.key, metadata.expires_at);
                    live.push((metadata.accessed_at, metadata.size, metadata.key, data_path, meta_path));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = ?meta_path, error = %e, "Removing unreadable cache entry");
                    if let Some(name) = data_path.file_name().and_then(|n| n.to_str()) {
                        self.index.lock().remove(name);
                    }
                    Self::remove_paths(&data_path, &meta_path).await?;
                }
            }
        }

        let limit = self.config.size_limit;
        let mut total: u64 = live.iter().map(|(_, size, _, _, _)| size).sum();
        if limit > 0 && total > limit {
            let target = limit / 2;
            live.sort_by_key(|(accessed_at, _, _, _, _)| *accessed_at);
            for (_, size, key, data_path, meta_path) in live {
                if total <= target {
                    break;
                }
                self.index_remove(&key);
                Self::remove_paths(&data_path, &meta_path).await?;
                total = total.saturating_sub(size);
                summary.evicted += 1;
            }
        }

        if summary.expired > 0 || summary.evicted > 0 || summary.stale_temp_files > 0 {
            info!(
                expired = summary.expired,
                evicted = summary.evicted,
                stale_temp_files = summary.stale_temp_files,
                remaining_bytes = total,
                "Disk cache sweep finished"
            );
        }
        Ok(summary)
    }

    async fn total_size(&self) -> Result<u64, CacheError> {
        self.ensure_ready()?;
        let mut total = 0;
        let mut entries = fs::read_dir(&self.config.directory)
            .await
            .map_err(|e| self.io_error(e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_error(e))? {
            let path = entry.path();
            if path.extension().is_some() {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> FileStore {
        FileStore::try_new(FileStoreConfig {
            expiration: StorageExpiration::Never,
            ..FileStoreConfig::new(dir)
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let payload = Bytes::from_static(b"\x89PNG not really");
        let payload_len = payload.len() as u64;

        store.store("k", payload.clone(), None).await.unwrap();
        assert!(store.is_cached("k"));
        let read = store.value("k", ExpirationExtending::None).await.unwrap();
        assert_eq!(read, Some(payload));
        assert_eq!(store.total_size().await.unwrap(), payload_len);
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store
            .store("zero", Bytes::from_static(b"a"), Some(StorageExpiration::Seconds(0.0)))
            .await
            .unwrap();
        store
            .store("expired", Bytes::from_static(b"b"), Some(StorageExpiration::Expired))
            .await
            .unwrap();

        assert!(!store.is_cached("zero"));
        assert_eq!(store.value("zero", ExpirationExtending::CacheTime).await.unwrap(), None);
        assert!(!store.is_cached("expired"));
        assert!(!store.data_path("expired").exists());
    }

    #[tokio::test]
    async fn test_sweep_trims_least_recently_accessed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::try_new(FileStoreConfig {
            size_limit: 30,
            expiration: StorageExpiration::Never,
            ..FileStoreConfig::new(dir.path())
        })
        .unwrap();

        for key in ["a", "b", "c"] {
            store.store(key, Bytes::from(vec![0u8; 10]), None).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store.store("d", Bytes::from(vec![0u8; 10]), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Touch "a" so it becomes the most recently accessed.
        store.value("a", ExpirationExtending::None).await.unwrap();

        let summary = store.sweep().await.unwrap();
        assert_eq!(summary.evicted, 3);
        assert!(store.is_cached("a"));
        assert!(!store.is_cached("b"));
        assert!(!store.is_cached("d"));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .store("old", Bytes::from_static(b"x"), Some(StorageExpiration::Date(SystemTime::UNIX_EPOCH)))
            .await
            .unwrap();
        store.store("new", Bytes::from_static(b"y"), None).await.unwrap();

        let summary = store.sweep().await.unwrap();
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.evicted, 0);
        assert!(store.is_cached("new"));
        assert!(!store.is_cached("old"));
    }

    #[tokio::test]
    async fn test_reads_slide_the_expiry_forward() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let short = Some(StorageExpiration::Seconds(1.0));
        store.store("sliding", Bytes::from_static(b"a"), short).await.unwrap();
        store.store("fixed", Bytes::from_static(b"b"), short).await.unwrap();
        store.store("renewed", Bytes::from_static(b"c"), short).await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        let longer = ExpirationExtending::ExpirationTime(StorageExpiration::Seconds(5.0));
        assert!(store.value("sliding", ExpirationExtending::CacheTime).await.unwrap().is_some());
        assert!(store.value("fixed", ExpirationExtending::None).await.unwrap().is_some());
        assert!(store.value("renewed", longer).await.unwrap().is_some());

        // Past the original deadline, inside the extended one.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.is_cached("sliding"));
        assert!(store.value("sliding", ExpirationExtending::None).await.unwrap().is_some());
        assert!(store.is_cached("renewed"));
        assert!(!store.is_cached("fixed"));
        assert_eq!(store.value("fixed", ExpirationExtending::CacheTime).await.unwrap(), None);

        // The extended expiration replaces the stored policy for later reads.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!store.is_cached("sliding"));
        assert!(store.value("renewed", ExpirationExtending::CacheTime).await.unwrap().is_some());
        assert!(store.is_cached("renewed"));
    }

    #[tokio::test]
    async fn test_reopened_store_knows_existing_expiries() {
        let dir = tempfile::tempdir().unwrap();
        let first = store(dir.path());
        first.store("live", Bytes::from_static(b"a"), None).await.unwrap();
        first
            .store("short", Bytes::from_static(b"b"), Some(StorageExpiration::Seconds(0.1)))
            .await
            .unwrap();
        drop(first);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let reopened = store(dir.path());
        assert!(reopened.is_cached("live"));
        assert!(!reopened.is_cached("short"));
        assert!(!reopened.is_cached("missing"));

        // Entries written by another store after startup are found by name.
        let writer = store(dir.path());
        writer.store("late", Bytes::from_static(b"c"), None).await.unwrap();
        assert!(reopened.is_cached("late"));
        writer.remove("late").await.unwrap();
        assert!(!writer.is_cached("late"));
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.store("k", Bytes::from_static(b"x"), None).await.unwrap();

        let stale = dir.path().join(format!("{}.7.tmp", FileStore::file_name("gone")));
        let fresh = dir.path().join(format!("{}.8.tmp", FileStore::file_name("writing")));
        std::fs::write(&stale, b"partial").unwrap();
        std::fs::write(&fresh, b"partial").unwrap();
        let old = SystemTime::now() - DEFAULT_STALE_TEMP_AGE - Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let summary = store.sweep().await.unwrap();
        assert_eq!(summary.stale_temp_files, 1);
        assert_eq!(summary.expired, 0);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(store.is_cached("k"));
    }

    #[tokio::test]
    async fn test_not_ready_store_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let store = FileStore::new(FileStoreConfig::new(blocker.join("cache")));
        assert!(!store.is_ready());
        let err = store.store("k", Bytes::from_static(b"a"), None).await.unwrap_err();
        assert!(matches!(err, CacheError::DiskStorageNotReady { .. }));

        let err = FileStore::try_new(FileStoreConfig::new(blocker.join("cache"))).unwrap_err();
        assert!(matches!(err, CacheError::CannotCreateDirectory { .. }));
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.store("a", Bytes::from_static(b"1"), None).await.unwrap();
        store.store("b", Bytes::from_static(b"2"), None).await.unwrap();

        store.remove("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert!(!store.is_cached("a"));

        store.remove_all().await.unwrap();
        assert!(!store.is_cached("b"));
        assert_eq!(store.total_size().await.unwrap(), 0);
    }
}
