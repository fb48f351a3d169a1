use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::value::RawValue;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, PreloadStrategy};
use crate::error::{CacheError, CacheResult};
use crate::models::UserContext;
use crate::status::{CacheStatus, StatusBroadcaster, Subscription, SyncStatus};
use crate::store::{PersistentStore, StoreError};

use super::bundled::{BundledDataset, BUNDLED_VERSION_PREFIX};
use super::envelope::{age_display, CachedData};
use super::keys;
use super::metadata::{compute_checksum, verify_checksum, CacheMetadata, CacheMetadataIndex};
use super::preload::{self, PreloadReport, PreloadSource};

/// Utilization (percent) above which a non-aggressive cleanup starts evicting
const CLEANUP_TRIGGER_PCT: u64 = 90;

/// Utilization (percent) a cleanup evicts down to
const CLEANUP_TARGET_PCT: u64 = 80;

/// Aggressive cleanup also drops anything not read for this long
const AGGRESSIVE_MAX_IDLE_HOURS: i64 = 24;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Skip the cache entirely; the read is reported as a miss
    pub force_refresh: bool,
    /// Serve an expired entry instead of reporting `Expired`
    pub allow_expired: bool,
}

impl GetOptions {
    pub fn allow_expired() -> Self {
        Self {
            allow_expired: true,
            ..Default::default()
        }
    }

    pub fn force_refresh() -> Self {
        Self {
            force_refresh: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Overrides the per-key-class TTL
    pub ttl_secs: Option<i64>,
    pub version: Option<String>,
}

/// A successful cache read.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    pub data: T,
    pub from_cache: bool,
    /// Served past its TTL (only possible with `allow_expired`)
    pub stale: bool,
    pub metadata: CacheMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub cleaned: usize,
    pub size_freed_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub entries_loaded: usize,
    pub expired_removed: usize,
    pub bootstrapped: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    #[serde(rename = "totalSizeMB")]
    pub total_size_mb: f64,
    pub item_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Read-through cache over a `PersistentStore`.
///
/// Owns the `CacheMetadataIndex`; every expiry, integrity and eviction
/// decision goes through it. Holds no network concerns: a miss is reported
/// to the caller, who decides whether to sync.
pub struct CacheManager {
    store: Arc<dyn PersistentStore>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    index: Mutex<CacheMetadataIndex>,
    hits: AtomicU64,
    misses: AtomicU64,
    sync_view: RwLock<SyncStatus>,
    user_context: RwLock<Option<UserContext>>,
    status: StatusBroadcaster<CacheStatus>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn PersistentStore>, config: CacheConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn PersistentStore>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            index: Mutex::new(CacheMetadataIndex::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sync_view: RwLock::new(SyncStatus::default()),
            user_context: RwLock::new(None),
            status: StatusBroadcaster::new("cache"),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    pub async fn user_context(&self) -> Option<UserContext> {
        self.user_context.read().await.clone()
    }

    pub async fn set_user_context(&self, ctx: Option<UserContext>) {
        *self.user_context.write().await = ctx;
    }

    // ===== Lifecycle =====

    /// Load the persisted index, drop expired entries, and make sure the
    /// essential datasets exist (from the bundled dataset if necessary).
    pub async fn initialize(&self, user_context: Option<&UserContext>) -> CacheResult<InitReport> {
        let loaded = CacheMetadataIndex::load(self.store.as_ref()).await?;
        let entries_loaded = loaded.len();
        *self.index.lock().await = loaded;

        if let Some(ctx) = user_context {
            self.set_user_context(Some(ctx.clone())).await;
        }

        let expired_removed = self.cleanup_expired_cache().await?;

        let bootstrapped = if self.has_essential_data().await {
            false
        } else {
            self.bootstrap_bundled().await?;
            true
        };

        info!(
            entries = entries_loaded,
            expired_removed, bootstrapped, "Cache initialized"
        );
        self.publish_status().await;

        Ok(InitReport {
            entries_loaded,
            expired_removed,
            bootstrapped,
        })
    }

    /// Persist the index if anything changed since the last save.
    pub async fn flush(&self) -> CacheResult<()> {
        let mut index = self.index.lock().await;
        if index.is_dirty() {
            index.save(self.store.as_ref()).await?;
            debug!("Cache metadata flushed");
        }
        Ok(())
    }

    /// True when every essential dataset is indexed and present in the store.
    pub async fn has_essential_data(&self) -> bool {
        let index = self.index.lock().await;
        for key in keys::ESSENTIAL {
            if !index.contains(key) || !self.store.exists(key).await {
                return false;
            }
        }
        true
    }

    async fn bootstrap_bundled(&self) -> CacheResult<()> {
        let bundle = BundledDataset::load()?;
        let version = bundle.cache_version();
        let places = bundle.featured_places(self.config.essential_place_count);

        info!(
            places = places.len(),
            categories = bundle.categories.len(),
            cities = bundle.cities.len(),
            "No essential data cached, loading bundled dataset"
        );

        let options = SetOptions {
            version: Some(version),
            ..Default::default()
        };
        self.set(keys::TOURIST_PLACES, &places, options.clone()).await?;
        self.set(keys::CATEGORIES, &bundle.categories, options.clone()).await?;
        self.set(keys::CITIES, &bundle.cities, options).await?;
        Ok(())
    }

    // ===== Reads and writes =====

    /// Cache-first read. Misses, expiry and checksum failures come back as
    /// errors (`CacheError::is_miss`); nothing corrupted is ever served.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        options: GetOptions,
    ) -> CacheResult<CacheRead<T>> {
        self.read(key, options, true).await
    }

    /// Read a dataset, expired or not, without touching hit statistics or
    /// access times. Used when reconciling local copies during sync.
    pub(crate) async fn peek<T: DeserializeOwned>(&self, key: &str) -> CacheResult<CacheRead<T>> {
        self.read(key, GetOptions::allow_expired(), false).await
    }

    async fn read<T: DeserializeOwned>(
        &self,
        key: &str,
        options: GetOptions,
        track: bool,
    ) -> CacheResult<CacheRead<T>> {
        if options.force_refresh {
            debug!(key = key, "Forced refresh, bypassing cache");
            return Err(self.miss(track, CacheError::NotCached {
                key: key.to_string(),
            }));
        }

        let now = self.clock.now();
        let mut index = self.index.lock().await;

        let Some(metadata) = index.get(key).cloned() else {
            debug!(key = key, "Cache miss");
            return Err(self.miss(track, CacheError::NotCached {
                key: key.to_string(),
            }));
        };

        let stale = metadata.is_expired(now);
        if stale && !options.allow_expired {
            debug!(key = key, "Cache entry expired");
            return Err(self.miss(track, CacheError::Expired {
                key: key.to_string(),
                age_secs: metadata.age(now).num_seconds(),
                ttl_secs: metadata.ttl_seconds,
            }));
        }

        let Some(blob) = self.store.get(key).await? else {
            warn!(key = key, "Indexed entry missing from store, dropping it");
            index.remove(key);
            return Err(self.miss(track, CacheError::NotCached {
                key: key.to_string(),
            }));
        };

        let envelope: CachedData<Box<RawValue>> = match serde_json::from_slice(&blob) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key = key, error = %e, "Unreadable cache envelope");
                return Err(self.miss(track, CacheError::Integrity {
                    key: key.to_string(),
                    expected: metadata.checksum.clone().unwrap_or_default(),
                    actual: "unreadable".to_string(),
                }));
            }
        };

        if let Some(expected) = &metadata.checksum {
            if let Err(actual) = verify_checksum(envelope.data.get().as_bytes(), expected) {
                warn!(key = key, expected = %expected, actual = %actual, "Checksum mismatch, refusing to serve");
                return Err(self.miss(track, CacheError::Integrity {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual,
                }));
            }
        }

        let data: T = serde_json::from_str(envelope.data.get()).map_err(|e| {
            CacheError::Validation(format!("cached {} does not match the requested type: {}", key, e))
        })?;

        if !track {
            return Ok(CacheRead {
                data,
                from_cache: true,
                stale,
                metadata,
            });
        }

        index.record_access(key, now);
        let metadata = index.get(key).cloned().unwrap_or(metadata);
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = key, stale, "Cache hit");

        Ok(CacheRead {
            data,
            from_cache: true,
            stale,
            metadata,
        })
    }

    fn miss(&self, track: bool, error: CacheError) -> CacheError {
        if track {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        error
    }

    /// Serialize and store a dataset, updating the index.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
        options: SetOptions,
    ) -> CacheResult<CacheMetadata> {
        if keys::is_reserved(key) {
            return Err(CacheError::Validation(format!("{} is a reserved key", key)));
        }

        let payload = serde_json::to_string(data)?;
        let now = self.clock.now();
        let metadata = CacheMetadata {
            size: payload.len() as u64,
            last_accessed: now,
            last_modified: now,
            ttl_seconds: options.ttl_secs.unwrap_or_else(|| self.config.ttl.ttl_for(key)),
            version: options.version.unwrap_or_else(|| now.timestamp_millis().to_string()),
            checksum: Some(compute_checksum(payload.as_bytes(), self.config.checksum_algorithm)),
        };

        self.ensure_capacity(key, metadata.size).await?;

        let raw = RawValue::from_string(payload)?;
        let blob = serde_json::to_vec(&CachedData::new(&*raw, metadata.clone()))?;

        {
            let mut index = self.index.lock().await;
            self.store.set(key, &blob).await?;
            index.record_write(key, metadata.clone());
            index.save(self.store.as_ref()).await?;
        }

        debug!(key = key, bytes = metadata.size, version = %metadata.version, "Cached dataset written");
        self.publish_status().await;
        Ok(metadata)
    }

    pub async fn remove(&self, key: &str) -> CacheResult<bool> {
        let mut index = self.index.lock().await;
        self.store.remove(key).await?;
        let removed = index.remove(key).is_some();
        if removed {
            index.save(self.store.as_ref()).await?;
        }
        Ok(removed)
    }

    pub async fn is_expired(&self, key: &str) -> bool {
        self.index.lock().await.is_expired(key, self.clock.now())
    }

    pub async fn metadata(&self, key: &str) -> Option<CacheMetadata> {
        self.index.lock().await.get(key).cloned()
    }

    /// "5m ago" style age of a cached dataset.
    pub async fn cached_age(&self, key: &str) -> Option<String> {
        let metadata = self.metadata(key).await?;
        Some(age_display(metadata.age(self.clock.now()).num_minutes()))
    }

    // ===== Preload =====

    /// Cache the part of `source` selected by `strategy`, replacing the
    /// place, category and city datasets.
    pub async fn intelligent_preload(
        &self,
        source: &PreloadSource,
        user_context: Option<&UserContext>,
        strategy: PreloadStrategy,
    ) -> CacheResult<PreloadReport> {
        let stored_ctx;
        let ctx = match user_context {
            Some(ctx) => Some(ctx),
            None => {
                stored_ctx = self.user_context().await;
                stored_ctx.as_ref()
            }
        };

        let selection = preload::select(source, ctx, strategy, &self.config);
        let options = SetOptions {
            version: Some(source.version.clone()).filter(|v| !v.is_empty()),
            ..Default::default()
        };

        self.set(keys::TOURIST_PLACES, &selection.places, options.clone()).await?;
        self.set(keys::CATEGORIES, &selection.categories, options.clone()).await?;
        self.set(keys::CITIES, &selection.cities, options).await?;

        let report = PreloadReport {
            requested: strategy,
            applied: selection.strategy,
            places: selection.places.len(),
            categories: selection.categories.len(),
            cities: selection.cities.len(),
        };
        info!(
            requested = %report.requested,
            applied = %report.applied,
            places = report.places,
            "Preload complete"
        );
        Ok(report)
    }

    // ===== Cleanup =====

    /// Remove expired entries outside the essential set. Expired essential
    /// entries stay so they can still be served stale.
    pub async fn cleanup_expired_cache(&self) -> CacheResult<usize> {
        let now = self.clock.now();
        let mut index = self.index.lock().await;

        let expired: Vec<String> = index
            .iter()
            .filter(|(key, meta)| !keys::is_essential(key) && meta.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.store.remove(key).await?;
            index.remove(key);
            debug!(key = %key, "Expired entry removed");
        }

        if index.is_dirty() {
            index.save(self.store.as_ref()).await?;
        }
        Ok(expired.len())
    }

    /// Evict least-recently-accessed entries (never essential ones) until
    /// utilization is under the target line. A non-aggressive cleanup does
    /// nothing unless utilization is above the trigger line; an aggressive
    /// one additionally drops every entry idle for more than a day.
    pub async fn cleanup_cache(&self, aggressive: bool) -> CacheResult<CleanupReport> {
        let now = self.clock.now();
        let max = self.config.max_storage_bytes();
        let trigger = max * CLEANUP_TRIGGER_PCT / 100;
        let target = max * CLEANUP_TARGET_PCT / 100;
        let idle_cutoff = now - Duration::hours(AGGRESSIVE_MAX_IDLE_HOURS);

        let mut index = self.index.lock().await;
        let mut total = index.total_size();

        if !aggressive && total <= trigger {
            debug!(total, trigger, "Cache below cleanup trigger");
            return Ok(CleanupReport::default());
        }

        let mut candidates: Vec<(String, CacheMetadata)> = index
            .iter()
            .filter(|(key, _)| !keys::is_essential(key))
            .map(|(key, meta)| (key.clone(), meta.clone()))
            .collect();
        candidates.sort_by_key(|(_, meta)| meta.last_accessed);

        let mut report = CleanupReport::default();
        for (key, meta) in candidates {
            let over_target = total >= target;
            let idle = aggressive && meta.last_accessed < idle_cutoff;
            if !over_target && !idle {
                if aggressive {
                    continue;
                }
                break;
            }

            self.store.remove(&key).await?;
            index.remove(&key);
            total = total.saturating_sub(meta.size);
            report.cleaned += 1;
            report.size_freed_bytes += meta.size;
            debug!(key = %key, bytes = meta.size, "Evicted cache entry");
        }

        if report.cleaned > 0 {
            index.save(self.store.as_ref()).await?;
            info!(
                cleaned = report.cleaned,
                freed = report.size_freed_bytes,
                aggressive,
                "Cache cleanup complete"
            );
        }
        drop(index);

        self.publish_status().await;
        Ok(report)
    }

    /// Make room for `incoming` bytes under `key`, running an aggressive
    /// cleanup past the emergency threshold.
    async fn ensure_capacity(&self, key: &str, incoming: u64) -> CacheResult<()> {
        let max = self.config.max_storage_bytes();
        let emergency = max * u64::from(self.config.emergency_cleanup_threshold_pct) / 100;

        let projected = self.projected_size(key, incoming).await;
        if projected <= emergency {
            return Ok(());
        }

        warn!(key = key, projected, emergency, "Storage pressure, running emergency cleanup");
        self.cleanup_cache(true).await?;

        let projected = self.projected_size(key, incoming).await;
        if projected > max {
            return Err(StoreError::Full {
                key: key.to_string(),
                needed: incoming,
            }
            .into());
        }
        Ok(())
    }

    async fn projected_size(&self, key: &str, incoming: u64) -> u64 {
        let index = self.index.lock().await;
        let existing = index.get(key).map(|m| m.size).unwrap_or(0);
        index.total_size() - existing + incoming
    }

    // ===== Status =====

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            1.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    /// 0-100 score from hit rate, penalized under storage pressure.
    pub async fn health_score(&self) -> u8 {
        let total = self.index.lock().await.total_size();
        self.score(total)
    }

    fn score(&self, total_bytes: u64) -> u8 {
        let utilization = total_bytes as f64 / self.config.max_storage_bytes() as f64;
        let mut score = self.hit_rate() * 100.0;
        if utilization > 0.90 {
            score -= 20.0;
        }
        if utilization > 0.95 {
            score -= 30.0;
        }
        score.clamp(0.0, 100.0).round() as u8
    }

    pub async fn statistics(&self) -> CacheStatistics {
        let index = self.index.lock().await;
        CacheStatistics {
            total_size_mb: index.total_size() as f64 / BYTES_PER_MB,
            item_count: index.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }

    /// Essential data missing, expired, or still the bundled defaults.
    pub async fn needs_update(&self) -> bool {
        let now = self.clock.now();
        let index = self.index.lock().await;
        keys::ESSENTIAL.iter().any(|key| match index.get(key) {
            None => true,
            Some(meta) => meta.is_expired(now) || meta.version.starts_with(BUNDLED_VERSION_PREFIX),
        })
    }

    pub async fn cache_status(&self) -> CacheStatus {
        let sync = self.sync_view.read().await.clone();
        let needs_update = self.needs_update().await;
        let index = self.index.lock().await;
        let total = index.total_size();

        CacheStatus {
            is_online: sync.is_online,
            last_sync: sync.last_sync,
            cache_size_mb: total as f64 / BYTES_PER_MB,
            item_count: index.len(),
            sync_in_progress: sync.sync_in_progress,
            pending_operations: sync.queue_size,
            needs_update,
            health_score: self.score(total),
        }
    }

    /// Record the sync engine's latest state and republish cache status.
    pub async fn observe_sync(&self, status: &SyncStatus) {
        *self.sync_view.write().await = status.clone();
        self.publish_status().await;
    }

    async fn publish_status(&self) {
        let status = self.cache_status().await;
        self.status.notify(status);
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<CacheStatus> {
        self.status.subscribe()
    }

    pub fn on_status<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(CacheStatus) + Send + 'static,
    {
        self.status.subscribe_with(callback)
    }
}

// ============================================================================
// Tests
// ============================================================================
