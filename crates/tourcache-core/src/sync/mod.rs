//! Reconciliation with the remote source of truth.
//!
//! - `engine`: `SyncEngine`, dataset refresh, queue drain, background worker
//! - `queue`: durable priority queue of outbound operations
//! - `conflict`: last-writer-wins and the other resolution strategies
//! - `retry`: exponential backoff around storage and network calls

pub mod conflict;
pub mod engine;
pub mod queue;
pub mod retry;

pub use conflict::{resolve_conflict, ConflictResolution, Resolution};
pub use engine::{ManualConflict, NetworkState, SyncEngine, SyncResult};
pub use queue::{Priority, SyncOperation, SyncQueue, SyncQueueItem};
pub use retry::{backoff_delay, execute_with_retry};
