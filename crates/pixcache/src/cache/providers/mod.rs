//! # Cache Providers
//!
//! Storage tiers behind the image cache.

pub use self::file::{FileStore, FileStoreConfig};
pub use self::memory::{MemoryStorage, MemoryStorageConfig};
pub use self::provider::{DiskStore, SweepSummary};

pub mod provider;

pub mod file;
pub mod memory;
