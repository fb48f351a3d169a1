//! The surface the application layer talks to.
//!
//! `OfflineService` wires a `CacheManager` and a `SyncEngine` together and
//! adds read-through: a miss triggers a single-resource sync when online, and
//! when that fails the last known good data is served, flagged
//! `needs_update`.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
    BundledDataset, CacheManager, CacheMetadata, CacheStatistics, CleanupReport, GetOptions,
    InitReport, PreloadReport, PreloadSource,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, PreloadStrategy};
use crate::error::CacheResult;
use crate::models::UserContext;
use crate::remote::{RemoteDataSource, ResourceType};
use crate::status::{CacheStatus, Subscription, SyncStatus};
use crate::store::PersistentStore;
use crate::sync::{NetworkState, Priority, SyncEngine, SyncOperation, SyncResult};

/// Records returned to the application.
#[derive(Debug, Clone)]
pub struct Records<T> {
    pub data: T,
    /// Served without a fresh fetch
    pub from_cache: bool,
    /// Past its TTL
    pub stale: bool,
    /// The data is usable but a refresh failed or is pending
    pub needs_update: bool,
    pub metadata: CacheMetadata,
}

pub struct OfflineService {
    cache: Arc<CacheManager>,
    engine: Arc<SyncEngine>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineService {
    /// Initialize the cache (bootstrapping the bundled dataset on first run)
    /// and restore any queued operations.
    pub async fn start(
        store: Arc<dyn PersistentStore>,
        remote: Arc<dyn RemoteDataSource>,
        config: CacheConfig,
        user_context: Option<UserContext>,
    ) -> CacheResult<(Self, InitReport)> {
        Self::start_with_clock(store, remote, config, user_context, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(
        store: Arc<dyn PersistentStore>,
        remote: Arc<dyn RemoteDataSource>,
        config: CacheConfig,
        user_context: Option<UserContext>,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<(Self, InitReport)> {
        let cache = Arc::new(CacheManager::with_clock(store, config, clock));
        let report = cache.initialize(user_context.as_ref()).await?;

        let engine = Arc::new(SyncEngine::new(Arc::clone(&cache), remote));
        engine.restore_queue().await?;

        let service = Self {
            cache,
            engine,
            background: Mutex::new(None),
        };
        Ok((service, report))
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Cache-first read with sync on miss and stale fallback.
    pub async fn get_records<T: DeserializeOwned>(
        &self,
        resource: &ResourceType,
        force_refresh: bool,
    ) -> CacheResult<Records<T>> {
        let key = resource.cache_key();

        if !force_refresh {
            match self.cache.get::<T>(&key, GetOptions::default()).await {
                Ok(read) => {
                    return Ok(Records {
                        data: read.data,
                        from_cache: true,
                        stale: false,
                        needs_update: false,
                        metadata: read.metadata,
                    });
                }
                Err(e) if e.is_miss() => debug!(key = %key, error = %e, "Read-through miss"),
                Err(e) => return Err(e),
            }
        }

        if self.engine.is_online() {
            let result = self.engine.sync_resource(resource).await;
            if result.success {
                let read = self.cache.peek::<T>(&key).await?;
                return Ok(Records {
                    data: read.data,
                    from_cache: false,
                    stale: read.stale,
                    needs_update: false,
                    metadata: read.metadata,
                });
            }
            warn!(key = %key, errors = ?result.errors, "Refresh failed, falling back to cached data");
        } else {
            debug!(key = %key, "Offline, serving cached data");
        }

        // Last known good. Integrity failures surface here rather than
        // serving corrupted data.
        let read = self.cache.peek::<T>(&key).await?;
        Ok(Records {
            data: read.data,
            from_cache: true,
            stale: read.stale,
            needs_update: true,
            metadata: read.metadata,
        })
    }

    /// Full sync for the current user.
    pub async fn refresh(&self) -> SyncResult {
        let ctx = self.cache.user_context().await;
        self.engine.sync_all(ctx.as_ref()).await
    }

    pub fn subscribe_to_cache_status<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(CacheStatus) + Send + 'static,
    {
        self.cache.on_status(callback)
    }

    pub fn subscribe_to_sync_status<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(SyncStatus) + Send + 'static,
    {
        self.engine.on_status(callback)
    }

    pub async fn cleanup(&self, aggressive: bool) -> CacheResult<CleanupReport> {
        self.cache.cleanup_cache(aggressive).await
    }

    pub async fn get_statistics(&self) -> CacheStatistics {
        self.cache.statistics().await
    }

    pub async fn cache_status(&self) -> CacheStatus {
        self.cache.cache_status().await
    }

    /// Preload from the remote dataset, or from the bundled one when the
    /// remote cannot be reached.
    pub async fn preload(&self, strategy: PreloadStrategy) -> CacheResult<PreloadReport> {
        let source = match self.engine.fetch_preload_source().await {
            Ok(source) => source,
            Err(e) => {
                warn!(error = %e, "Remote dataset unavailable, preloading from bundled data");
                PreloadSource::from(BundledDataset::load()?)
            }
        };
        let ctx = self.cache.user_context().await;
        self.cache.intelligent_preload(&source, ctx.as_ref(), strategy).await
    }

    /// Record a local change for the next sync.
    pub async fn queue_change(
        &self,
        operation: SyncOperation,
        resource: ResourceType,
        payload: Value,
        priority: Priority,
    ) -> CacheResult<String> {
        self.engine
            .queue_sync_operation(operation, resource, payload, priority)
            .await
    }

    pub fn set_network_state(&self, state: NetworkState) {
        self.engine.set_network_state(state);
    }

    pub async fn set_user_context(&self, ctx: Option<UserContext>) {
        self.cache.set_user_context(ctx).await;
    }

    /// Start the background worker for the configured sync strategy. Returns
    /// false when the strategy is manual or a worker is already running.
    pub fn start_background_sync(&self) -> bool {
        let mut slot = self.background.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        match self.engine.spawn_background() {
            Some(handle) => {
                *slot = Some(handle);
                true
            }
            None => false,
        }
    }

    /// Stop background work and persist the metadata index.
    pub async fn shutdown(&self) -> CacheResult<()> {
        let handle = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.cache.flush().await?;
        info!("Offline service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::models::TouristPlace;
    use crate::remote::{BundledRemote, FetchResponse, PushResponse, RemoteError, SyncDelta};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct DownRemote;

    #[async_trait]
    impl RemoteDataSource for DownRemote {
        async fn fetch(&self, _: &ResourceType) -> Result<FetchResponse, RemoteError> {
            Err(RemoteError::Unauthorized)
        }

        async fn push(&self, _: &ResourceType, _: &SyncDelta) -> Result<PushResponse, RemoteError> {
            Err(RemoteError::Unauthorized)
        }
    }

    async fn service(remote: Arc<dyn RemoteDataSource>) -> OfflineService {
        let store = Arc::new(MemoryStore::new("app"));
        let (service, _) = OfflineService::start(store, remote, CacheConfig::default(), None)
            .await
            .unwrap();
        service
    }

    #[tokio::test]
    async fn test_bootstrapped_places_served_from_cache() {
        let service = service(Arc::new(DownRemote)).await;
        let records: Records<Vec<TouristPlace>> = service
            .get_records(&ResourceType::TouristPlaces, false)
            .await
            .unwrap();
        assert!(records.from_cache);
        assert!(!records.needs_update);
        assert_eq!(records.data.len(), 20);
    }

    #[tokio::test]
    async fn test_miss_is_filled_by_sync() {
        let service = service(Arc::new(BundledRemote::new().unwrap())).await;
        let records: Records<Vec<Value>> = service
            .get_records(&ResourceType::EnhancedPlaces, false)
            .await
            .unwrap();
        assert!(!records.from_cache);
        assert_eq!(records.data.len(), 20);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_last_known_good() {
        let service = service(Arc::new(DownRemote)).await;
        let records: Records<Vec<TouristPlace>> = service
            .get_records(&ResourceType::TouristPlaces, true)
            .await
            .unwrap();
        assert!(records.from_cache);
        assert!(records.needs_update);
        assert_eq!(records.data.len(), 20);
    }

    #[tokio::test]
    async fn test_miss_offline_without_data_is_an_error() {
        let service = service(Arc::new(DownRemote)).await;
        service.set_network_state(NetworkState {
            online: false,
            metered: false,
        });
        let err = service
            .get_records::<Vec<Value>>(&ResourceType::EnhancedPlaces, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotCached { .. }));
    }

    #[tokio::test]
    async fn test_preload_falls_back_to_bundled_data() {
        let service = service(Arc::new(DownRemote)).await;
        let report = service.preload(PreloadStrategy::All).await.unwrap();
        assert_eq!(report.places, 20);
    }

    #[tokio::test]
    async fn test_background_worker_starts_once() {
        let service = service(Arc::new(DownRemote)).await;
        assert!(service.start_background_sync());
        assert!(!service.start_background_sync());
        service.shutdown().await.unwrap();
    }
}
