use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, PreloadSource, SetOptions};
use crate::config::{CacheConfig, ConflictStrategy, SyncStrategy};
use crate::error::{CacheError, CacheResult};
use crate::models::{Cacheable, Category, City, EnhancedPlace, TouristPlace, UserContext, UserData};
use crate::remote::{FetchResponse, RemoteDataSource, RemoteError, ResourceType, SyncDelta};
use crate::status::{StatusBroadcaster, Subscription, SyncStatus};
use crate::store::PersistentStore;

use super::conflict::{resolve_conflict, ConflictResolution, Resolution};
use super::queue::{Priority, SyncOperation, SyncQueue, SyncQueueItem};
use super::retry::execute_with_retry;

/// Shortest background tick, whatever the configured interval
const MIN_BACKGROUND_INTERVAL: Duration = Duration::from_secs(1);

/// Connectivity as reported by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkState {
    pub online: bool,
    /// Cellular or otherwise paid-per-byte
    pub metered: bool,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            online: true,
            metered: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncResult {
    pub success: bool,
    /// Datasets refreshed plus queue items settled
    pub synced: usize,
    pub failed: usize,
    /// Queue items that failed this run and stay queued for another attempt
    pub requeued: usize,
    pub conflicts: usize,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

impl SyncResult {
    fn rejected(error: CacheError) -> Self {
        Self {
            success: false,
            errors: vec![error.to_string()],
            ..Default::default()
        }
    }

    fn fail(&mut self, what: impl std::fmt::Display, error: &CacheError) {
        self.failed += 1;
        self.errors.push(format!("{}: {}", what, error));
    }
}

/// A conflict the configured strategy could not settle. The local copy is
/// kept until the application decides.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualConflict {
    pub resource: ResourceType,
    pub record_id: String,
    pub local: Value,
    pub remote: Value,
    pub detected_at: DateTime<Utc>,
}

/// Releases the single-sync flag on every exit path.
struct SyncGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Reconciles the cache with the remote and drains the operation queue.
///
/// At most one sync (full, single-resource or queue drain) runs at a time;
/// a second caller is turned away with `ConcurrentSync` rather than queued.
pub struct SyncEngine {
    cache: Arc<CacheManager>,
    store: Arc<dyn PersistentStore>,
    remote: Arc<dyn RemoteDataSource>,
    config: CacheConfig,
    queue: Mutex<SyncQueue>,
    in_progress: AtomicBool,
    online: AtomicBool,
    metered: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    manual_conflicts: Mutex<Vec<ManualConflict>>,
    status: StatusBroadcaster<SyncStatus>,
    wake: Notify,
}

impl SyncEngine {
    pub fn new(cache: Arc<CacheManager>, remote: Arc<dyn RemoteDataSource>) -> Self {
        let store = Arc::clone(cache.store());
        let config = cache.config().clone();
        Self {
            cache,
            store,
            remote,
            config,
            queue: Mutex::new(SyncQueue::default()),
            in_progress: AtomicBool::new(false),
            online: AtomicBool::new(true),
            metered: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            manual_conflicts: Mutex::new(Vec::new()),
            status: StatusBroadcaster::new("sync"),
            wake: Notify::new(),
        }
    }

    /// Reload operations persisted by a previous run. Returns how many are pending.
    pub async fn restore_queue(&self) -> CacheResult<usize> {
        let restored = SyncQueue::load(self.store.as_ref()).await?;
        let count = restored.len();
        *self.queue.lock().await = restored;
        if count > 0 {
            info!(count, "Pending sync operations restored");
        }
        Ok(count)
    }

    // ===== Network state =====

    pub fn set_network_state(&self, state: NetworkState) {
        let was_online = self.online.swap(state.online, Ordering::AcqRel);
        self.metered.store(state.metered, Ordering::Release);
        if state.online && !was_online {
            info!(metered = state.metered, "Back online");
            self.wake.notify_one();
        } else if !state.online && was_online {
            info!("Went offline");
        }
    }

    pub fn network_state(&self) -> NetworkState {
        NetworkState {
            online: self.online.load(Ordering::Acquire),
            metered: self.metered.load(Ordering::Acquire),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> Option<SyncGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard {
                flag: &self.in_progress,
            })
    }

    // ===== Queue =====

    /// Append an outbound operation. It is persisted before this returns and
    /// stays queued until pushed or reported as failed.
    pub async fn queue_sync_operation(
        &self,
        operation: SyncOperation,
        resource: ResourceType,
        payload: Value,
        priority: Priority,
    ) -> CacheResult<String> {
        let item = SyncQueueItem::new(operation, resource, payload, priority, self.cache.clock().now());
        let id = item.id.clone();
        {
            let mut queue = self.queue.lock().await;
            queue.push(item);
            queue.save(self.store.as_ref()).await?;
            debug!(id = %id, operation = ?operation, pending = queue.len(), "Sync operation queued");
        }

        self.publish_status().await;
        if self.config.sync_strategy == SyncStrategy::Immediate {
            self.wake.notify_one();
        }
        Ok(id)
    }

    pub async fn pending_operations(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn queue_snapshot(&self) -> Vec<SyncQueueItem> {
        self.queue.lock().await.snapshot()
    }

    pub async fn manual_conflicts(&self) -> Vec<ManualConflict> {
        self.manual_conflicts.lock().await.clone()
    }

    /// Resolve with `strategy`, or the configured policy when `None`.
    pub fn resolve_conflict<T: Cacheable>(
        &self,
        local: &T,
        remote: &T,
        strategy: Option<ConflictStrategy>,
    ) -> ConflictResolution<T> {
        resolve_conflict(local, remote, strategy.unwrap_or(self.config.conflict_resolution))
    }

    // ===== Sync entry points =====

    /// Refresh every dataset, then drain the queue.
    ///
    /// Datasets sync in a fixed order: places, enhanced places, categories,
    /// cities, then the user's data when a context is given. One failing
    /// dataset does not stop the others.
    pub async fn sync_all(&self, user_context: Option<&UserContext>) -> SyncResult {
        let mut resources = vec![
            ResourceType::TouristPlaces,
            ResourceType::EnhancedPlaces,
            ResourceType::Categories,
            ResourceType::Cities,
        ];
        if let Some(ctx) = user_context {
            resources.push(ResourceType::UserData(ctx.user_id.clone()));
        }
        self.run("full", &resources, true).await
    }

    /// Refresh only the tourist place dataset.
    pub async fn force_sync_tourist_places(&self) -> SyncResult {
        self.sync_resource(&ResourceType::TouristPlaces).await
    }

    /// Refresh a single dataset without touching the queue.
    pub async fn sync_resource(&self, resource: &ResourceType) -> SyncResult {
        self.run("single", std::slice::from_ref(resource), false).await
    }

    /// Push queued operations only.
    pub async fn process_queue(&self) -> SyncResult {
        self.run("queue", &[], true).await
    }

    async fn run(&self, kind: &str, resources: &[ResourceType], drain: bool) -> SyncResult {
        if !self.is_online() {
            debug!(kind, "Offline, sync skipped");
            return SyncResult::rejected(CacheError::Offline);
        }
        let Some(_guard) = self.try_begin() else {
            warn!(kind, "Sync already in progress, rejecting");
            return SyncResult::rejected(CacheError::ConcurrentSync);
        };

        let started = Instant::now();
        info!(kind, resources = resources.len(), "Sync started");
        self.publish_status().await;

        let mut result = SyncResult::default();
        for resource in resources {
            match self.sync_one(resource).await {
                Ok(conflicts) => {
                    result.synced += 1;
                    result.conflicts += conflicts;
                }
                Err(e) => {
                    warn!(resource = %resource, error = %e, "Resource sync failed");
                    result.fail(resource, &e);
                }
            }
        }

        if drain {
            self.drain_queue(&mut result).await;
        }

        result.success = result.failed == 0 && result.requeued == 0;
        result.duration_ms = started.elapsed().as_millis() as u64;
        *self.last_sync.lock().await = Some(self.cache.clock().now());

        info!(
            kind,
            success = result.success,
            synced = result.synced,
            failed = result.failed,
            requeued = result.requeued,
            conflicts = result.conflicts,
            duration_ms = result.duration_ms,
            "Sync finished"
        );

        drop(_guard);
        self.publish_status().await;
        result
    }

    // ===== Datasets =====

    async fn sync_one(&self, resource: &ResourceType) -> CacheResult<usize> {
        match resource {
            ResourceType::TouristPlaces => self.sync_dataset::<TouristPlace>(resource).await,
            ResourceType::EnhancedPlaces => self.sync_dataset::<EnhancedPlace>(resource).await,
            ResourceType::Categories => self.sync_dataset::<Category>(resource).await,
            ResourceType::Cities => self.sync_dataset::<City>(resource).await,
            ResourceType::UserData(_) => self.sync_record::<UserData>(resource).await,
        }
    }

    /// Bound a remote call by the configured network timeout.
    async fn call_remote<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> CacheResult<T> {
        match tokio::time::timeout(self.config.network_timeout(), call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RemoteError::Timeout(self.config.network_timeout_ms).into()),
        }
    }

    async fn fetch(&self, resource: &ResourceType) -> CacheResult<FetchResponse> {
        let label = format!("fetch {}", resource);
        execute_with_retry(&label, self.config.retry_limit, || {
            self.call_remote(self.remote.fetch(resource))
        })
        .await
    }

    /// Fetch and validate the remote copy of a resource.
    async fn fetch_records<R: serde::de::DeserializeOwned>(
        &self,
        resource: &ResourceType,
    ) -> CacheResult<(R, Option<String>)> {
        let response = self.fetch(resource).await?;
        let version = response.version.clone();
        let data = response.into_data()?;
        let records = serde_json::from_value(data).map_err(|e| {
            CacheError::Validation(format!("malformed {} from remote: {}", resource, e))
        })?;
        Ok((records, version))
    }

    async fn store_records<T: Serialize + ?Sized>(
        &self,
        resource: &ResourceType,
        records: &T,
        version: Option<String>,
    ) -> CacheResult<()> {
        let key = resource.cache_key();
        let label = format!("store {}", key);
        execute_with_retry(&label, self.config.retry_limit, || {
            self.cache.set(
                &key,
                records,
                SetOptions {
                    version: version.clone(),
                    ..Default::default()
                },
            )
        })
        .await?;
        Ok(())
    }

    async fn sync_dataset<T: Cacheable>(&self, resource: &ResourceType) -> CacheResult<usize> {
        let (remote, version): (Vec<T>, _) = self.fetch_records(resource).await?;
        for record in &remote {
            record.validate().map_err(CacheError::Validation)?;
        }

        let local: Vec<T> = match self.cache.peek(&resource.cache_key()).await {
            Ok(read) => read.data,
            Err(e) => {
                debug!(resource = %resource, error = %e, "No usable local copy to reconcile");
                Vec::new()
            }
        };

        let mut conflicts = 0;
        let mut records = Vec::with_capacity(remote.len());
        for remote_record in remote {
            let local_record = local
                .iter()
                .find(|l| l.record_id() == remote_record.record_id());
            let (record, conflicted) = match local_record {
                Some(l) => self.reconcile(resource, l, remote_record).await?,
                None => (remote_record, false),
            };
            conflicts += usize::from(conflicted);
            records.push(record);
        }

        self.store_records(resource, &records, version).await?;
        debug!(resource = %resource, records = records.len(), conflicts, "Dataset synced");
        Ok(conflicts)
    }

    async fn sync_record<T: Cacheable>(&self, resource: &ResourceType) -> CacheResult<usize> {
        let (remote, version): (T, _) = self.fetch_records(resource).await?;
        remote.validate().map_err(CacheError::Validation)?;

        let (record, conflicted) = match self.cache.peek::<T>(&resource.cache_key()).await {
            Ok(local) => self.reconcile(resource, &local.data, remote).await?,
            Err(_) => (remote, false),
        };

        self.store_records(resource, &record, version).await?;
        Ok(usize::from(conflicted))
    }

    /// Everything a preload can choose from, fetched from the remote.
    pub async fn fetch_preload_source(&self) -> CacheResult<PreloadSource> {
        if !self.is_online() {
            return Err(CacheError::Offline);
        }
        let (places, version): (Vec<TouristPlace>, _) =
            self.fetch_records(&ResourceType::TouristPlaces).await?;
        let (categories, _) = self.fetch_records(&ResourceType::Categories).await?;
        let (cities, _) = self.fetch_records(&ResourceType::Cities).await?;

        Ok(PreloadSource {
            places,
            categories,
            cities,
            version: version.unwrap_or_default(),
        })
    }

    /// Settle one local/remote pair. Returns the record to keep and whether
    /// it counts as a conflict.
    ///
    /// Identical timestamps, or a remote copy that simply wins, are plain
    /// refreshes. Only a local winner, a merge or an unresolved pair is a
    /// conflict; local and merged winners are queued for push.
    async fn reconcile<T: Cacheable>(
        &self,
        resource: &ResourceType,
        local: &T,
        remote: T,
    ) -> CacheResult<(T, bool)> {
        if local.modified_at() == remote.modified_at() {
            return Ok((remote, false));
        }

        let resolution = self.resolve_conflict(local, &remote, None);
        let record = match (resolution.resolution, resolution.data) {
            (Resolution::ServerWins, Some(data)) => return Ok((data, false)),
            (Resolution::ClientWins | Resolution::Merged, Some(data)) => {
                self.queue_sync_operation(
                    SyncOperation::Update,
                    resource.clone(),
                    serde_json::to_value(&data)?,
                    Priority::Normal,
                )
                .await?;
                data
            }
            _ => {
                self.record_manual_conflict(resource, local, &remote).await;
                local.clone()
            }
        };
        Ok((record, true))
    }

    async fn record_manual_conflict<T: Cacheable>(&self, resource: &ResourceType, local: &T, remote: &T) {
        warn!(resource = %resource, id = local.record_id(), "Conflict needs manual resolution, keeping local copy");
        let conflict = ManualConflict {
            resource: resource.clone(),
            record_id: local.record_id().to_string(),
            local: serde_json::to_value(local).unwrap_or(Value::Null),
            remote: serde_json::to_value(remote).unwrap_or(Value::Null),
            detected_at: self.cache.clock().now(),
        };
        self.manual_conflicts.lock().await.push(conflict);
    }

    // ===== Queue drain =====

    /// Attempt every pending item once, in priority order and `batchSize`
    /// batches. Items stay in the persisted queue until they settle: pushed,
    /// rejected outright, or out of attempts after `retryLimit + 1` tries.
    /// A retryable failure that stays queued is reported in `errors` and
    /// `requeued`, and the run is not a success.
    async fn drain_queue(&self, result: &mut SyncResult) {
        let pending = self.queue.lock().await.snapshot();
        if pending.is_empty() {
            return;
        }
        debug!(pending = pending.len(), batch_size = self.config.batch_size, "Draining sync queue");

        let mut settled = Vec::new();
        let mut retry = Vec::new();

        for batch in pending.chunks(self.config.batch_size.max(1)) {
            if !self.is_online() {
                debug!("Went offline mid-drain, leaving the rest queued");
                break;
            }

            for (item, outcome) in self.run_batch(batch).await {
                match outcome {
                    Ok(conflicts) => {
                        result.synced += 1;
                        result.conflicts += conflicts;
                        settled.push(item.id.clone());
                    }
                    Err(e) if e.is_retryable() => {
                        let mut item = item.clone();
                        item.retry_count += 1;
                        if item.retry_count > self.config.retry_limit {
                            let exhausted = CacheError::RetryExhausted {
                                id: item.id.clone(),
                                attempts: item.retry_count,
                            };
                            warn!(id = %item.id, attempts = item.retry_count, error = %e, "Dropping sync operation");
                            result.fail(&item.id, &exhausted);
                            settled.push(item.id);
                        } else {
                            warn!(id = %item.id, retry_count = item.retry_count, error = %e, "Sync operation will be retried");
                            result.requeued += 1;
                            result.errors.push(format!(
                                "{}: {} (retry {}/{})",
                                item.id, e, item.retry_count, self.config.retry_limit
                            ));
                            retry.push(item);
                        }
                    }
                    Err(e) => {
                        warn!(id = %item.id, error = %e, "Sync operation rejected, dropping");
                        result.fail(&item.id, &e);
                        settled.push(item.id.clone());
                    }
                }
            }
        }

        let mut queue = self.queue.lock().await;
        for id in &settled {
            queue.remove(id);
        }
        for item in retry {
            queue.replace(item);
        }
        if let Err(e) = queue.save(self.store.as_ref()).await {
            warn!(error = %e, "Failed to persist sync queue");
            result.errors.push(format!("{}: {}", crate::cache::keys::SYNC_QUEUE, e));
        }
    }

    /// Run one batch. Items for different resources run concurrently; items
    /// for the same resource run in queue order, one at a time, since each
    /// may rewrite that resource's whole dataset.
    async fn run_batch<'a>(
        &self,
        batch: &'a [SyncQueueItem],
    ) -> Vec<(&'a SyncQueueItem, CacheResult<usize>)> {
        let mut groups: Vec<Vec<&'a SyncQueueItem>> = Vec::new();
        for item in batch {
            match groups.iter_mut().find(|g| g[0].resource == item.resource) {
                Some(group) => group.push(item),
                None => groups.push(vec![item]),
            }
        }

        let runs = groups.into_iter().map(|group| async move {
            let mut outcomes = Vec::with_capacity(group.len());
            for item in group {
                outcomes.push((item, self.process_item(item).await));
            }
            outcomes
        });
        join_all(runs).await.into_iter().flatten().collect()
    }

    /// One attempt at one queue item. Returns the number of conflicts it settled.
    async fn process_item(&self, item: &SyncQueueItem) -> CacheResult<usize> {
        match item.operation {
            SyncOperation::Create | SyncOperation::Update | SyncOperation::Delete => {
                self.push(&item.resource, item.operation, item.payload.clone(), item.timestamp)
                    .await?;
                Ok(0)
            }
            SyncOperation::ConflictResolution => {
                self.resolve_queued_conflict(item).await?;
                Ok(1)
            }
        }
    }

    async fn push(
        &self,
        resource: &ResourceType,
        operation: SyncOperation,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> CacheResult<()> {
        let delta = SyncDelta {
            operation,
            payload,
            timestamp,
        };
        let response = self.call_remote(self.remote.push(resource, &delta)).await?;
        response.into_result()?;
        Ok(())
    }

    /// Payload is `{"local": .., "remote": ..}`. The winner is written to the
    /// cache; a client or merged winner is also pushed.
    async fn resolve_queued_conflict(&self, item: &SyncQueueItem) -> CacheResult<()> {
        let (Some(local), Some(remote)) = (item.payload.get("local"), item.payload.get("remote")) else {
            return Err(CacheError::Validation(format!(
                "conflict {} needs both local and remote copies",
                item.id
            )));
        };
        for side in [local, remote] {
            side.validate()
                .map_err(|e| CacheError::Validation(format!("conflict {}: {}", item.id, e)))?;
        }

        let resolution = self.resolve_conflict(local, remote, None);
        match (resolution.resolution, resolution.data) {
            (Resolution::ServerWins, Some(data)) => {
                self.apply_record(&item.resource, data).await?;
            }
            (Resolution::ClientWins | Resolution::Merged, Some(data)) => {
                self.push(&item.resource, SyncOperation::Update, data.clone(), self.cache.clock().now())
                    .await?;
                self.apply_record(&item.resource, data).await?;
            }
            _ => self.record_manual_conflict(&item.resource, local, remote).await,
        }
        Ok(())
    }

    /// Write one resolved record into its cached dataset, replacing any
    /// record with the same id.
    async fn apply_record(&self, resource: &ResourceType, record: Value) -> CacheResult<()> {
        let key = resource.cache_key();
        let (current, version) = match self.cache.peek::<Value>(&key).await {
            Ok(read) => (Some(read.data), Some(read.metadata.version)),
            Err(_) => (None, None),
        };

        let updated = match current {
            Some(Value::Array(mut records)) => {
                let id = record.record_id().to_string();
                match records.iter().position(|r| r.record_id() == id) {
                    Some(i) => records[i] = record,
                    None => records.push(record),
                }
                Value::Array(records)
            }
            _ if matches!(resource, ResourceType::UserData(_)) => record,
            _ => Value::Array(vec![record]),
        };

        self.store_records(resource, &updated, version).await
    }

    // ===== Status =====

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.is_online(),
            sync_in_progress: self.is_syncing(),
            last_sync: *self.last_sync.lock().await,
            queue_size: self.queue.lock().await.len(),
            conflicts: self.manual_conflicts.lock().await.len(),
        }
    }

    async fn publish_status(&self) {
        let status = self.status().await;
        self.cache.observe_sync(&status).await;
        self.status.notify(status);
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn on_status<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(SyncStatus) + Send + 'static,
    {
        self.status.subscribe_with(callback)
    }

    // ===== Background =====

    async fn should_drain(&self) -> bool {
        if !self.is_online() || self.is_syncing() {
            return false;
        }
        if self.config.sync_strategy == SyncStrategy::WifiOnly && self.metered.load(Ordering::Acquire) {
            debug!("Metered network, skipping background sync");
            return false;
        }
        !self.queue.lock().await.is_empty()
    }

    /// Drain the queue every `syncIntervalMinutes`, and also on enqueue when
    /// the strategy is `immediate`. Returns `None` for the `manual` strategy.
    ///
    /// A tick that finds a sync in progress is skipped, not made up later.
    pub fn spawn_background(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.config.sync_strategy == SyncStrategy::Manual {
            info!("Manual sync strategy, no background worker");
            return None;
        }

        let engine = Arc::clone(self);
        let period = self.config.sync_interval().max(MIN_BACKGROUND_INTERVAL);
        info!(
            strategy = ?self.config.sync_strategy,
            interval_secs = period.as_secs(),
            "Background sync started"
        );

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = engine.wake.notified() => {}
                }

                if engine.should_drain().await {
                    let result = engine.process_queue().await;
                    debug!(synced = result.synced, failed = result.failed, "Background sync pass");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::GetOptions;
    use crate::cache::CacheRead;
    use crate::clock::ManualClock;
    use crate::models::place::tests::place;
    use crate::remote::PushResponse;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Remote serving fixed places; pushes fail while `fail_pushes` is set.
    #[derive(Default)]
    struct StubRemote {
        places: std::sync::Mutex<Vec<TouristPlace>>,
        fail_pushes: AtomicBool,
        pushes: AtomicUsize,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl RemoteDataSource for StubRemote {
        async fn fetch(&self, resource: &ResourceType) -> Result<FetchResponse, RemoteError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let data = match resource {
                ResourceType::TouristPlaces => json!(*self.places.lock().unwrap()),
                ResourceType::UserData(id) => json!({ "userId": id }),
                _ => json!([]),
            };
            Ok(FetchResponse::ok(data))
        }

        async fn push(&self, _: &ResourceType, _: &SyncDelta) -> Result<PushResponse, RemoteError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if self.fail_pushes.load(Ordering::SeqCst) {
                Err(RemoteError::ServerError("503".into()))
            } else {
                Ok(PushResponse {
                    success: true,
                    error: None,
                })
            }
        }
    }

    fn engine_with(remote: Arc<StubRemote>, config: CacheConfig) -> (Arc<CacheManager>, SyncEngine) {
        let store = Arc::new(MemoryStore::new("app"));
        let cache = Arc::new(CacheManager::with_clock(store, config, Arc::new(ManualClock::default())));
        let engine = SyncEngine::new(Arc::clone(&cache), remote);
        (cache, engine)
    }

    #[tokio::test]
    async fn test_sync_all_refreshes_datasets() {
        let remote = Arc::new(StubRemote::default());
        *remote.places.lock().unwrap() = vec![place("p1", "museum", 10), place("p2", "nature", 20)];
        let (cache, engine) = engine_with(remote.clone(), CacheConfig::default());

        let ctx = UserContext::new("u1");
        let result = engine.sync_all(Some(&ctx)).await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.synced, 5);
        assert_eq!(result.failed, 0);

        let read: CacheRead<Vec<TouristPlace>> = cache
            .get("tourist_places", GetOptions::default())
            .await
            .unwrap();
        assert_eq!(read.data.len(), 2);

        let user: CacheRead<UserData> = cache.get("user_data:u1", GetOptions::default()).await.unwrap();
        assert_eq!(user.data.user_id, "u1");
        assert!(engine.status().await.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_offline_sync_is_rejected_without_touching_queue() {
        let remote = Arc::new(StubRemote::default());
        let (_cache, engine) = engine_with(remote.clone(), CacheConfig::default());
        engine
            .queue_sync_operation(SyncOperation::Create, ResourceType::TouristPlaces, json!({}), Priority::Normal)
            .await
            .unwrap();

        engine.set_network_state(NetworkState {
            online: false,
            metered: false,
        });
        let result = engine.sync_all(None).await;
        assert!(!result.success);
        assert_eq!(result.synced + result.failed, 0);
        assert_eq!(engine.pending_operations().await, 1);
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_guard_released_after_run() {
        let remote = Arc::new(StubRemote::default());
        let (_cache, engine) = engine_with(remote, CacheConfig::default());
        assert!(engine.force_sync_tourist_places().await.success);
        assert!(!engine.is_syncing());
        assert!(engine.force_sync_tourist_places().await.success);
    }

    #[tokio::test]
    async fn test_failing_push_is_dropped_after_retry_limit() {
        let remote = Arc::new(StubRemote::default());
        remote.fail_pushes.store(true, Ordering::SeqCst);
        let mut config = CacheConfig::default();
        config.retry_limit = 2;
        let (_cache, engine) = engine_with(remote.clone(), config);

        engine
            .queue_sync_operation(SyncOperation::Update, ResourceType::TouristPlaces, json!({"id": "p1"}), Priority::High)
            .await
            .unwrap();

        for attempt in 1..=2 {
            let result = engine.process_queue().await;
            assert!(!result.success);
            assert_eq!(result.failed, 0);
            assert_eq!(result.requeued, 1);
            assert!(result.errors[0].contains(&format!("(retry {}/2)", attempt)), "{:?}", result.errors);
            assert_eq!(engine.pending_operations().await, 1);
        }
        let result = engine.process_queue().await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.requeued, 0);
        assert!(!result.success);
        assert_eq!(engine.pending_operations().await, 0);
        assert_eq!(remote.pushes.load(Ordering::SeqCst), 3);

        engine.process_queue().await;
        assert_eq!(remote.pushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_queue_is_restored_by_a_new_engine() {
        let remote = Arc::new(StubRemote::default());
        let (cache, engine) = engine_with(remote.clone(), CacheConfig::default());
        engine
            .queue_sync_operation(SyncOperation::Delete, ResourceType::Cities, json!({"id": "rome"}), Priority::Low)
            .await
            .unwrap();

        let restarted = SyncEngine::new(cache, remote);
        assert_eq!(restarted.restore_queue().await.unwrap(), 1);
        assert_eq!(restarted.queue_snapshot().await[0].operation, SyncOperation::Delete);
    }

    #[tokio::test]
    async fn test_newer_remote_record_is_a_plain_refresh() {
        let t0 = Utc::now();
        let remote = Arc::new(StubRemote::default());
        let mut server = place("p1", "museum", 10);
        server.name = "Server".into();
        server.updated_at = Some(t0 + chrono::Duration::hours(1));
        *remote.places.lock().unwrap() = vec![server];
        let (cache, engine) = engine_with(remote, CacheConfig::default());

        let mut local = place("p1", "museum", 10);
        local.updated_at = Some(t0);
        cache.set("tourist_places", &vec![local], SetOptions::default()).await.unwrap();

        let result = engine.force_sync_tourist_places().await;
        assert_eq!(result.conflicts, 0);
        let read: CacheRead<Vec<TouristPlace>> = cache.get("tourist_places", GetOptions::default()).await.unwrap();
        assert_eq!(read.data[0].name, "Server");
        assert_eq!(engine.pending_operations().await, 0);
    }

    #[tokio::test]
    async fn test_newer_local_record_is_kept_and_queued_for_push() {
        let t0 = Utc::now();
        let remote = Arc::new(StubRemote::default());
        let mut server = place("p1", "museum", 10);
        server.updated_at = Some(t0);
        *remote.places.lock().unwrap() = vec![server];
        let (cache, engine) = engine_with(remote, CacheConfig::default());

        let mut local = place("p1", "museum", 10);
        local.name = "Local edit".into();
        local.updated_at = Some(t0 + chrono::Duration::minutes(5));
        cache.set("tourist_places", &vec![local], SetOptions::default()).await.unwrap();

        let result = engine.force_sync_tourist_places().await;
        assert_eq!(result.conflicts, 1);
        let read: CacheRead<Vec<TouristPlace>> = cache.get("tourist_places", GetOptions::default()).await.unwrap();
        assert_eq!(read.data[0].name, "Local edit");
        assert_eq!(engine.pending_operations().await, 1);
    }

    #[tokio::test]
    async fn test_manual_strategy_records_conflict() {
        let t0 = Utc::now();
        let remote = Arc::new(StubRemote::default());
        let mut server = place("p1", "museum", 10);
        server.updated_at = Some(t0 + chrono::Duration::hours(1));
        *remote.places.lock().unwrap() = vec![server];
        let mut config = CacheConfig::default();
        config.conflict_resolution = ConflictStrategy::Manual;
        let (cache, engine) = engine_with(remote, config);

        let mut local = place("p1", "museum", 10);
        local.updated_at = Some(t0);
        cache.set("tourist_places", &vec![local.clone()], SetOptions::default()).await.unwrap();

        engine.force_sync_tourist_places().await;
        let conflicts = engine.manual_conflicts().await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].record_id, "p1");
        assert_eq!(engine.status().await.conflicts, 1);

        let read: CacheRead<Vec<TouristPlace>> = cache.get("tourist_places", GetOptions::default()).await.unwrap();
        assert_eq!(read.data[0], local);
    }

    #[tokio::test]
    async fn test_queued_conflict_client_wins_is_pushed_and_applied() {
        let remote = Arc::new(StubRemote::default());
        let (cache, engine) = engine_with(remote.clone(), CacheConfig::default());

        let payload = json!({
            "local": { "id": "p9", "name": "Mine", "updatedAt": "2024-05-02T00:00:00Z" },
            "remote": { "id": "p9", "name": "Theirs", "updatedAt": "2024-05-01T00:00:00Z" },
        });
        engine
            .queue_sync_operation(SyncOperation::ConflictResolution, ResourceType::EnhancedPlaces, payload, Priority::High)
            .await
            .unwrap();

        let result = engine.process_queue().await;
        assert!(result.success);
        assert_eq!(result.conflicts, 1);
        assert_eq!(remote.pushes.load(Ordering::SeqCst), 1);

        let read: CacheRead<Vec<Value>> = cache.get("enhanced_places", GetOptions::default()).await.unwrap();
        assert_eq!(read.data[0]["name"], "Mine");
    }

    #[tokio::test]
    async fn test_malformed_conflict_item_is_dropped() {
        let remote = Arc::new(StubRemote::default());
        let (_cache, engine) = engine_with(remote, CacheConfig::default());
        engine
            .queue_sync_operation(SyncOperation::ConflictResolution, ResourceType::Cities, json!({"local": {}}), Priority::Normal)
            .await
            .unwrap();

        let result = engine.process_queue().await;
        assert_eq!(result.failed, 1);
        assert_eq!(engine.pending_operations().await, 0);
    }

    #[tokio::test]
    async fn test_conflict_item_with_non_object_side_is_rejected() {
        let remote = Arc::new(StubRemote::default());
        let (cache, engine) = engine_with(remote.clone(), CacheConfig::default());
        let payload = json!({
            "local": "x",
            "remote": { "id": "p9", "name": "Theirs", "updatedAt": "2024-05-01T00:00:00Z" },
        });
        engine
            .queue_sync_operation(SyncOperation::ConflictResolution, ResourceType::EnhancedPlaces, payload, Priority::Normal)
            .await
            .unwrap();

        let result = engine.process_queue().await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.requeued, 0);
        assert!(result.errors[0].contains("Invalid record"), "{:?}", result.errors);
        assert_eq!(engine.pending_operations().await, 0);
        assert_eq!(remote.pushes.load(Ordering::SeqCst), 0);

        let err = cache
            .get::<Vec<Value>>("enhanced_places", GetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotCached { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_strategy_wakes_background_worker() {
        let remote = Arc::new(StubRemote::default());
        let mut config = CacheConfig::default();
        config.sync_strategy = SyncStrategy::Immediate;
        let (_cache, engine) = engine_with(remote.clone(), config);
        let engine = Arc::new(engine);

        let handle = engine.spawn_background().unwrap();
        tokio::task::yield_now().await;
        engine
            .queue_sync_operation(SyncOperation::Create, ResourceType::TouristPlaces, json!({"id": "n1"}), Priority::Normal)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remote.pushes.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_operations().await, 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_manual_strategy_has_no_worker() {
        let remote = Arc::new(StubRemote::default());
        let mut config = CacheConfig::default();
        config.sync_strategy = SyncStrategy::Manual;
        let (_cache, engine) = engine_with(remote, config);
        assert!(Arc::new(engine).spawn_background().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wifi_only_skips_metered_ticks() {
        let remote = Arc::new(StubRemote::default());
        let mut config = CacheConfig::default();
        config.sync_strategy = SyncStrategy::WifiOnly;
        config.sync_interval_minutes = 1;
        let (_cache, engine) = engine_with(remote.clone(), config);
        let engine = Arc::new(engine);
        engine.set_network_state(NetworkState {
            online: true,
            metered: true,
        });
        engine
            .queue_sync_operation(SyncOperation::Create, ResourceType::TouristPlaces, json!({"id": "n1"}), Priority::Normal)
            .await
            .unwrap();

        let handle = engine.spawn_background().unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(remote.pushes.load(Ordering::SeqCst), 0);

        engine.set_network_state(NetworkState {
            online: true,
            metered: false,
        });
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(remote.pushes.load(Ordering::SeqCst), 1);
        handle.abort();
    }
}
