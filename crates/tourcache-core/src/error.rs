//! Error taxonomy for the cache and sync layers.
//!
//! `CacheError` is what callers of `CacheManager`, `SyncEngine` and
//! `OfflineService` see. Storage and network failures are retryable;
//! validation and integrity failures are surfaced immediately.

use thiserror::Error;

use crate::remote::RemoteError;
use crate::store::StoreError;

pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid record: {0}")]
    Validation(String),

    #[error("Checksum mismatch for {key} (expected {expected}, got {actual})")]
    Integrity {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Cache entry {key} expired {age_secs}s after write (ttl {ttl_secs}s)")]
    Expired {
        key: String,
        age_secs: i64,
        ttl_secs: i64,
    },

    #[error("No cached data for {key}")]
    NotCached { key: String },

    #[error("Network error: {0}")]
    Network(#[from] RemoteError),

    #[error("Operation {id} failed after {attempts} attempts")]
    RetryExhausted { id: String, attempts: u32 },

    #[error("A sync is already in progress")]
    ConcurrentSync,

    #[error("Offline - sync skipped")]
    Offline,

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Whether retrying the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Storage(e) => e.is_retryable(),
            CacheError::Network(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the error means "repopulate from the remote source"
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            CacheError::NotCached { .. } | CacheError::Expired { .. } | CacheError::Integrity { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_family() {
        assert!(CacheError::NotCached { key: "k".into() }.is_miss());
        assert!(CacheError::Expired { key: "k".into(), age_secs: 10, ttl_secs: 5 }.is_miss());
        assert!(CacheError::Integrity {
            key: "k".into(),
            expected: "a".into(),
            actual: "b".into(),
        }
        .is_miss());
        assert!(!CacheError::ConcurrentSync.is_miss());
    }

    #[test]
    fn test_validation_is_not_retryable() {
        assert!(!CacheError::Validation("bad".into()).is_retryable());
        assert!(CacheError::Network(RemoteError::Timeout(30_000)).is_retryable());
        assert!(!CacheError::Network(RemoteError::Unauthorized).is_retryable());
    }
}
