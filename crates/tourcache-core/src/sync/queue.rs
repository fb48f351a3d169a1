//! Durable, priority-ordered queue of outbound operations.
//!
//! The queue is snapshotted to the `sync_queue` record after every mutation
//! so pending work survives a restart.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::keys;
use crate::error::CacheResult;
use crate::remote::ResourceType;
use crate::store::PersistentStore;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
    ConflictResolution,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    #[serde(rename = "type")]
    pub operation: SyncOperation,
    pub resource: ResourceType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub priority: Priority,
}

impl SyncQueueItem {
    pub fn new(
        operation: SyncOperation,
        resource: ResourceType,
        payload: Value,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("op-{}-{}-{:04x}", now.timestamp_millis(), seq, rand::random::<u16>()),
            operation,
            resource,
            payload,
            timestamp: now,
            retry_count: 0,
            priority,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncQueue {
    items: Vec<SyncQueueItem>,
}

impl SyncQueue {
    /// Restore the persisted snapshot. An unreadable snapshot is logged and
    /// replaced by an empty queue.
    pub async fn load(store: &dyn PersistentStore) -> CacheResult<Self> {
        let Some(bytes) = store.get(keys::SYNC_QUEUE).await? else {
            return Ok(Self::default());
        };

        match serde_json::from_slice::<Vec<SyncQueueItem>>(&bytes) {
            Ok(items) => {
                debug!(count = items.len(), "Sync queue restored");
                let mut queue = Self { items };
                queue.sort();
                Ok(queue)
            }
            Err(e) => {
                warn!(error = %e, "Sync queue snapshot unreadable, starting empty");
                Ok(Self::default())
            }
        }
    }

    pub async fn save(&self, store: &dyn PersistentStore) -> CacheResult<()> {
        let bytes = serde_json::to_vec(&self.items)?;
        store.set(keys::SYNC_QUEUE, &bytes).await?;
        Ok(())
    }

    /// Highest priority first; FIFO within a priority.
    fn sort(&mut self) {
        self.items.sort_by_key(|item| (Reverse(item.priority), item.timestamp));
    }

    pub fn push(&mut self, item: SyncQueueItem) {
        self.items.push(item);
        self.sort();
    }

    /// Drop a settled item (pushed, resolved, or given up on).
    pub fn remove(&mut self, id: &str) -> Option<SyncQueueItem> {
        let pos = self.items.iter().position(|item| item.id == id)?;
        Some(self.items.remove(pos))
    }

    /// Replace an item in place, e.g. after bumping its retry count.
    pub fn replace(&mut self, updated: SyncQueueItem) -> bool {
        match self.items.iter_mut().find(|item| item.id == updated.id) {
            Some(slot) => {
                *slot = updated;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SyncQueueItem> {
        self.items.clone()
    }
}
