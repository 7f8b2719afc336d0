//! # Caching
//!
//! Two-tier image cache: decoded images in memory, serialized bytes on disk.
//!
//! - `types`: cache tiers, expiration policies and configuration
//! - `providers`: the memory storage and the disk store
//! - `serializer`: conversion between images and persisted bytes
//! - `manager`: [`ImageCache`], which coordinates both tiers

pub mod manager;
pub mod providers;
pub mod serializer;
pub mod types;

pub use manager::ImageCache;
pub use providers::{DiskStore, FileStore, FileStoreConfig, MemoryStorage, MemoryStorageConfig, SweepSummary};
pub use serializer::{CacheSerializer, DefaultCacheSerializer};
pub use types::{CacheConfig, CacheType, ExpirationExtending, StorageExpiration, computed_key};
