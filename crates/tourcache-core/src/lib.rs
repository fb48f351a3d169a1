//! Offline-first cache and sync engine for tourist place data.
//!
//! Records are persisted locally through a `PersistentStore`, served by the
//! `CacheManager` with freshness, integrity and eviction rules, and
//! reconciled against a `RemoteDataSource` by the `SyncEngine`.
//! `OfflineService` ties them together for the application layer.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod remote;
pub mod service;
pub mod status;
pub mod store;
pub mod sync;

pub use cache::{CacheManager, CacheRead, CacheStatistics, CleanupReport, GetOptions, SetOptions};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ChecksumAlgorithm, ConflictStrategy, PreloadStrategy, SyncStrategy};
pub use error::{CacheError, CacheResult};
pub use remote::{BundledRemote, HttpRemote, RemoteDataSource, RemoteError, ResourceType};
pub use service::{OfflineService, Records};
pub use status::{CacheStatus, StatusBroadcaster, Subscription, SyncStatus};
pub use store::{FileStore, MemoryStore, PersistentStore, StoreError};
pub use sync::{NetworkState, Priority, SyncEngine, SyncOperation, SyncResult};
