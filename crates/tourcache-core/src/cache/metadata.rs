//! Per-entry cache metadata and the index that holds it.
//!
//! The index is the single authority for expiry and integrity decisions.
//! It is persisted as one record (`cache_metadata`) so startup does not have
//! to deserialize every dataset.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::ChecksumAlgorithm;
use crate::error::CacheResult;
use crate::store::PersistentStore;

use super::keys;

const POLY_PREFIX: &str = "poly:";
const SHA256_PREFIX: &str = "sha256:";

/// Polynomial base for the rolling hash
const POLY_BASE: u32 = 31;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// Payload size in bytes
    pub size: u64,
    pub last_accessed: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(rename = "ttl")]
    pub ttl_seconds: i64,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl CacheMetadata {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_modified
    }

    /// `now - lastModified > ttl`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now).num_milliseconds() > self.ttl_seconds.saturating_mul(1000)
    }
}

/// Checksum a payload. The result names its algorithm so it can be verified
/// later regardless of the current configuration.
pub fn compute_checksum(payload: &[u8], algorithm: ChecksumAlgorithm) -> String {
    match algorithm {
        ChecksumAlgorithm::Polynomial => {
            let hash = payload.iter().fold(0u32, |hash, &b| {
                hash.wrapping_mul(POLY_BASE).wrapping_add(u32::from(b))
            });
            format!("{}{:08x}", POLY_PREFIX, hash)
        }
        ChecksumAlgorithm::Sha256 => {
            format!("{}{}", SHA256_PREFIX, hex::encode(Sha256::digest(payload)))
        }
    }
}

/// Recompute `expected`'s algorithm over `payload`.
/// On mismatch, returns the checksum that was actually computed.
pub fn verify_checksum(payload: &[u8], expected: &str) -> Result<(), String> {
    let algorithm = if expected.starts_with(SHA256_PREFIX) {
        ChecksumAlgorithm::Sha256
    } else if expected.starts_with(POLY_PREFIX) {
        ChecksumAlgorithm::Polynomial
    } else {
        return Err(format!("unknown checksum format: {}", expected));
    };

    let actual = compute_checksum(payload, algorithm);
    if actual == expected {
        Ok(())
    } else {
        Err(actual)
    }
}

#[derive(Debug, Default)]
pub struct CacheMetadataIndex {
    entries: HashMap<String, CacheMetadata>,
    dirty: bool,
}

impl CacheMetadataIndex {
    /// Load the persisted index. A missing record yields an empty index; an
    /// unreadable one is logged and discarded, since every entry it described
    /// will simply be treated as a miss.
    pub async fn load(store: &dyn PersistentStore) -> CacheResult<Self> {
        let Some(bytes) = store.get(keys::CACHE_METADATA).await? else {
            debug!("No persisted cache metadata");
            return Ok(Self::default());
        };

        match serde_json::from_slice::<HashMap<String, CacheMetadata>>(&bytes) {
            Ok(entries) => {
                debug!(count = entries.len(), "Cache metadata loaded");
                Ok(Self {
                    entries,
                    dirty: false,
                })
            }
            Err(e) => {
                warn!(error = %e, "Cache metadata unreadable, starting with an empty index");
                Ok(Self {
                    entries: HashMap::new(),
                    dirty: true,
                })
            }
        }
    }

    pub async fn save(&mut self, store: &dyn PersistentStore) -> CacheResult<()> {
        let bytes = serde_json::to_vec(&self.entries)?;
        store.set(keys::CACHE_METADATA, &bytes).await?;
        self.dirty = false;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&CacheMetadata> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Unknown keys count as expired.
    pub fn is_expired(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(key)
            .map(|m| m.is_expired(now))
            .unwrap_or(true)
    }

    /// Returns false if the key is not indexed.
    pub fn record_access(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(key) {
            Some(meta) => {
                meta.last_accessed = now;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn record_write(&mut self, key: &str, metadata: CacheMetadata) {
        self.entries.insert(key.to_string(), metadata);
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheMetadata> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|m| m.size).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CacheMetadata)> {
        self.entries.iter()
    }
}
