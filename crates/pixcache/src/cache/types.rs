//! # Cache Types
//!
//! Common types shared by the memory and disk tiers.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const SECONDS_IN_DAY: u64 = 86_400;

/// Configuration for the two-tier image cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name of the cache, used for the default disk directory
    pub name: String,
    /// Maximum decoded byte cost kept in memory; 0 disables the bound
    pub memory_total_cost_limit: u64,
    /// Maximum entry count in memory, used when the cost bound is 0
    pub memory_count_limit: u64,
    /// Default expiration of memory entries
    pub memory_expiration: StorageExpiration,
    /// Disk directory; defaults to `<temp>/pixcache/<name>`
    pub disk_directory: Option<PathBuf>,
    /// Maximum disk size in bytes; 0 means unbounded
    pub disk_size_limit: u64,
    /// Default expiration of disk entries
    pub disk_expiration: StorageExpiration,
    /// Period of the background sweep; zero disables it
    pub maintenance_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            memory_total_cost_limit: 256 * 1024 * 1024,
            memory_count_limit: 0,
            memory_expiration: StorageExpiration::Seconds(300.0),
            disk_directory: None,
            disk_size_limit: 0,
            disk_expiration: StorageExpiration::Days(7),
            maintenance_interval: Duration::from_secs(120),
        }
    }
}

impl CacheConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Resolved disk directory
    pub fn disk_directory(&self) -> PathBuf {
        self.disk_directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("pixcache").join(&self.name))
    }
}

/// Where a retrieved image was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    /// Not cached, fetched from network or provider
    None,
    /// Served from the memory tier
    Memory,
    /// Served from the disk tier
    Disk,
}

impl CacheType {
    pub fn cached(self) -> bool {
        !matches!(self, CacheType::None)
    }
}

/// Expiration policy of a stored entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StorageExpiration {
    /// Never expires
    Never,
    /// Expires after the given number of seconds
    Seconds(f64),
    /// Expires after the given number of days
    Days(u32),
    /// Expires at a fixed point in time
    Date(SystemTime),
    /// Already expired; storing with this policy is skipped
    Expired,
}

impl StorageExpiration {
    /// Absolute expiry computed from `now`. `None` means never.
    ///
    /// Durations past what `SystemTime` can represent are treated as never.
    /// Negative and NaN seconds expire immediately.
    pub fn estimated_expiration_since(&self, now: SystemTime) -> Option<SystemTime> {
        match *self {
            StorageExpiration::Never => None,
            StorageExpiration::Seconds(seconds) => {
                if seconds.is_nan() || seconds <= 0.0 {
                    return Some(now);
                }
                Duration::try_from_secs_f64(seconds)
                    .ok()
                    .and_then(|duration| now.checked_add(duration))
            }
            StorageExpiration::Days(days) => {
                now.checked_add(Duration::from_secs(u64::from(days) * SECONDS_IN_DAY))
            }
            StorageExpiration::Date(date) => Some(date),
            StorageExpiration::Expired => Some(UNIX_EPOCH),
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, StorageExpiration::Expired)
    }
}

/// How a successful read pushes an entry's expiry forward
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ExpirationExtending {
    /// Leave the expiry untouched
    None,
    /// Re-apply the expiration the entry was stored with
    #[default]
    CacheTime,
    /// Apply a new expiration starting now
    ExpirationTime(StorageExpiration),
}

/// Whether an absolute expiry lies in the past.
pub fn is_past(expiry: Option<SystemTime>, now: SystemTime) -> bool {
    match expiry {
        Some(expiry) => expiry <= now,
        None => false,
    }
}

/// New expiry after a read under `extending`, or `None` when unchanged.
pub fn extended_expiration(
    stored: StorageExpiration,
    extending: ExpirationExtending,
    now: SystemTime,
) -> Option<Option<SystemTime>> {
    match extending {
        ExpirationExtending::None => None,
        ExpirationExtending::CacheTime => Some(stored.estimated_expiration_since(now)),
        ExpirationExtending::ExpirationTime(expiration) => {
            Some(expiration.estimated_expiration_since(now))
        }
    }
}

/// Key combining the base cache key and a processor identifier.
pub fn computed_key(key: &str, processor_identifier: &str) -> String {
    if processor_identifier.is_empty() {
        key.to_string()
    } else {
        format!("{key}@{processor_identifier}")
    }
}

pub(crate) fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// `None` when the instant is not representable, which reads as never.
pub(crate) fn from_millis(millis: u64) -> Option<SystemTime> {
    UNIX_EPOCH.checked_add(Duration::from_millis(millis))
}
