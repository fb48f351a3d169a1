//! Status snapshots and the channel they are published on.
//!
//! `CacheManager` and `SyncEngine` each own a `StatusBroadcaster` and push
//! an immutable snapshot whenever their state changes. Subscribers either
//! hold a receiver or register a callback; slow subscribers lag rather than
//! block the publisher.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Snapshots buffered per subscriber before it starts lagging
pub const STATUS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CacheStatus {
    pub is_online: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub cache_size_mb: f64,
    pub item_count: usize,
    pub sync_in_progress: bool,
    pub pending_operations: usize,
    pub needs_update: bool,
    /// 0-100, observability only
    pub health_score: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncStatus {
    pub is_online: bool,
    pub sync_in_progress: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub queue_size: usize,
    pub conflicts: usize,
}

/// Fan-out publisher of status snapshots.
pub struct StatusBroadcaster<T: Clone> {
    name: &'static str,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> StatusBroadcaster<T> {
    pub fn new(name: &'static str) -> Self {
        Self::with_capacity(name, STATUS_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { name, tx }
    }

    /// Publish a snapshot to every current subscriber. Having no subscribers
    /// is not an error.
    pub fn notify(&self, status: T) {
        match self.tx.send(status) {
            Ok(receivers) => debug!(channel = self.name, receivers, "Status published"),
            Err(_) => debug!(channel = self.name, "No status subscribers"),
        }
    }

    /// A receiver for all snapshots published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Run `callback` for each snapshot on a background task until the
    /// returned `Subscription` is unsubscribed or dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_with<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let name = self.name;
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(status) => callback(status),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(channel = name, skipped, "Status subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Handle for a callback subscription.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_receiver_gets_snapshot() {
        let broadcaster = StatusBroadcaster::<SyncStatus>::new("sync");
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        let status = SyncStatus {
            queue_size: 3,
            ..Default::default()
        };
        broadcaster.notify(status.clone());

        assert_eq!(a.recv().await.unwrap(), status);
        assert_eq!(b.recv().await.unwrap(), status);
    }

    #[tokio::test]
    async fn test_notify_without_subscribers_is_fine() {
        let broadcaster = StatusBroadcaster::<SyncStatus>::new("sync");
        broadcaster.notify(SyncStatus::default());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_stops_after_unsubscribe() {
        let broadcaster = StatusBroadcaster::<SyncStatus>::new("sync");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let subscription = broadcaster.subscribe_with(move |s: SyncStatus| {
            sink.lock().unwrap().push(s.queue_size);
        });

        broadcaster.notify(SyncStatus { queue_size: 1, ..Default::default() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        subscription.unsubscribe();
        tokio::task::yield_now().await;
        broadcaster.notify(SyncStatus { queue_size: 2, ..Default::default() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }
}
