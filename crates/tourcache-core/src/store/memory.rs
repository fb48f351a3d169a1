use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{validate_key, PersistentStore, StoreError, StoreResult};

/// In-process store. Used for tests and for ephemeral sessions where nothing
/// should touch the disk.
pub struct MemoryStore {
    namespace: String,
    entries: RwLock<HashMap<String, Vec<u8>>>,
    capacity_bytes: Option<u64>,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: RwLock::new(HashMap::new()),
            capacity_bytes: None,
        }
    }

    /// Reject writes that would take the total stored bytes past `bytes`.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity_bytes = Some(bytes);
        self
    }

    pub async fn total_bytes(&self) -> u64 {
        self.entries
            .read()
            .await
            .values()
            .map(|v| v.len() as u64)
            .sum()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        let mut entries = self.entries.write().await;

        if let Some(capacity) = self.capacity_bytes {
            let others: u64 = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len() as u64)
                .sum();
            if others + value.len() as u64 > capacity {
                return Err(StoreError::Full {
                    key: key.to_string(),
                    needed: value.len() as u64,
                });
            }
        }

        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new("app");
        assert!(store.get("places").await.unwrap().is_none());

        store.set("places", b"[1,2,3]").await.unwrap();
        assert!(store.exists("places").await);
        assert_eq!(store.get("places").await.unwrap().unwrap(), b"[1,2,3]");

        store.remove("places").await.unwrap();
        assert!(!store.exists("places").await);
        // Removing twice is fine
        store.remove("places").await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_rejects_oversized_write() {
        let store = MemoryStore::new("app").with_capacity(10);
        store.set("a", b"12345").await.unwrap();
        let err = store.set("b", b"1234567").await.unwrap_err();
        assert!(matches!(err, StoreError::Full { needed: 7, .. }));

        // Overwriting an existing key only counts the new value
        store.set("a", b"1234567890").await.unwrap();
        assert_eq!(store.total_bytes().await, 10);
    }
}
