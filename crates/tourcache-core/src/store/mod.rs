//! Namespaced key -> blob persistence.
//!
//! `PersistentStore` is the thinnest layer of the cache: whole blobs in,
//! whole blobs out, atomic per key. Two backends ship with the crate:
//! - `FileStore`: one JSON file per key under the cache directory
//! - `MemoryStore`: process-local map, with an optional byte capacity

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage full - cannot write {needed} bytes for {key}")]
    Full { key: String, needed: u64 },

    #[error("I/O error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    /// Transient I/O can be retried; a full disk or a bad key cannot.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io { .. })
    }
}

/// Key -> blob storage. Every operation is atomic for a single key; there is
/// no atomicity across keys.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read a blob. `Ok(None)` when the key has never been written.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Replace the blob stored under `key`.
    async fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> bool;

    /// All keys in this store's namespace.
    async fn keys(&self) -> StoreResult<Vec<String>>;

    fn namespace(&self) -> &str;
}

/// Keys are short identifiers like `tourist_places` or `user_data:42`.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("tourist_places").is_ok());
        assert!(validate_key("user_data:42").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("with space").is_err());
    }

    #[test]
    fn test_retryable() {
        let io = StoreError::Io {
            key: "k".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        };
        assert!(io.is_retryable());
        assert!(!StoreError::Full { key: "k".into(), needed: 1 }.is_retryable());
    }
}
