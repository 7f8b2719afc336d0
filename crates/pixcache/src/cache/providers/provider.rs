//! # Disk Store
//!
//! This module defines the trait the disk tier is built on.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::types::{ExpirationExtending, StorageExpiration};
use crate::error::CacheError;

/// Result of a disk maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Entries removed because they expired
    pub expired: usize,
    /// Entries removed to get back under the size limit
    pub evicted: usize,
    /// Leftover temporary files from interrupted writes
    pub stale_temp_files: usize,
}

/// A durable key-value byte store backing the disk tier
#[async_trait]
pub trait DiskStore: Send + Sync {
    /// Directory the store lives in
    fn directory(&self) -> &Path;

    /// Whether a live entry exists for `key`. Never extends expiration.
    fn is_cached(&self, key: &str) -> bool;

    /// Read the bytes stored under `key`, extending the expiration on a hit
    async fn value(
        &self,
        key: &str,
        extending: ExpirationExtending,
    ) -> Result<Option<Bytes>, CacheError>;

    /// Write `data` under `key`. `None` uses the store's default expiration.
    async fn store(
        &self,
        key: &str,
        data: Bytes,
        expiration: Option<StorageExpiration>,
    ) -> Result<(), CacheError>;

    /// Remove the entry for `key`
    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every entry
    async fn remove_all(&self) -> Result<(), CacheError>;

    /// Remove expired entries and trim the store down to its size limit
    async fn sweep(&self) -> Result<SweepSummary, CacheError>;

    /// Total bytes used by the store
    async fn total_size(&self) -> Result<u64, CacheError>;
}
