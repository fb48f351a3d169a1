//! Local caching for offline data access.
//!
//! This module provides the `CacheManager` for storing and serving records
//! with freshness, integrity and eviction rules. Each dataset is stored as
//! one envelope (`{"data": .., "metadata": ..}`) under its own key, and the
//! `CacheMetadataIndex` is persisted next to them.
//!
//! Cached datasets:
//! - Tourist places and enhanced places
//! - Categories and cities
//! - User-scoped data (`user_data:<id>`)

pub mod bundled;
pub mod envelope;
pub mod manager;
pub mod metadata;
pub mod preload;

pub use bundled::BundledDataset;
pub use envelope::CachedData;
pub use manager::{
    CacheManager, CacheRead, CacheStatistics, CleanupReport, GetOptions, InitReport, SetOptions,
};
pub use metadata::{compute_checksum, verify_checksum, CacheMetadata, CacheMetadataIndex};
pub use preload::{PreloadReport, PreloadSelection, PreloadSource};

/// Storage keys for the datasets and bookkeeping records.
pub mod keys {
    pub const TOURIST_PLACES: &str = "tourist_places";
    pub const ENHANCED_PLACES: &str = "enhanced_places";
    pub const CATEGORIES: &str = "categories";
    pub const CITIES: &str = "cities";
    pub const USER_DATA_PREFIX: &str = "user_data";

    /// Consolidated metadata index
    pub const CACHE_METADATA: &str = "cache_metadata";
    /// Durable snapshot of the sync queue
    pub const SYNC_QUEUE: &str = "sync_queue";

    /// The base record set that keeps the app usable offline. Never evicted.
    pub const ESSENTIAL: [&str; 3] = [TOURIST_PLACES, CATEGORIES, CITIES];

    pub fn user_data(user_id: &str) -> String {
        format!("{}:{}", USER_DATA_PREFIX, user_id)
    }

    pub fn is_essential(key: &str) -> bool {
        ESSENTIAL.contains(&key)
    }

    /// Keys the cache manager must never hand out as dataset keys.
    pub fn is_reserved(key: &str) -> bool {
        key == CACHE_METADATA || key == SYNC_QUEUE
    }
}
