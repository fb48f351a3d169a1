//! Cache and sync configuration.
//!
//! Configuration is stored at `~/.config/tourcache/config.json` in camelCase
//! JSON. Missing fields take their defaults, and `TOURCACHE_*` environment
//! variables override the file.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::keys;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tourcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Which subset of the remote dataset to fetch before it is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreloadStrategy {
    Essential,
    UserBased,
    LocationBased,
    All,
}

impl FromStr for PreloadStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "essential" => Ok(Self::Essential),
            "user-based" => Ok(Self::UserBased),
            "location-based" => Ok(Self::LocationBased),
            "all" => Ok(Self::All),
            other => bail!("Unknown preload strategy: {}", other),
        }
    }
}

impl fmt::Display for PreloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Essential => "essential",
            Self::UserBased => "user-based",
            Self::LocationBased => "location-based",
            Self::All => "all",
        };
        f.write_str(s)
    }
}

/// When queued operations are pushed to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStrategy {
    /// Wake the background worker as soon as something is queued
    Immediate,
    /// Drain the queue every `syncIntervalMinutes`
    Background,
    /// Only when the application asks
    Manual,
    /// Like `Background`, but skip ticks on metered networks
    WifiOnly,
}

/// How divergent local and remote copies of a record are reconciled.
///
/// Unrecognized names deserialize to `Manual`, so an unknown policy never
/// silently picks a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConflictStrategy {
    Client,
    Server,
    Manual,
    Smart,
    Merge,
}

impl From<String> for ConflictStrategy {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<ConflictStrategy> for String {
    fn from(s: ConflictStrategy) -> Self {
        s.as_str().to_string()
    }
}

impl ConflictStrategy {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "client" => Self::Client,
            "server" => Self::Server,
            "manual" => Self::Manual,
            "smart" => Self::Smart,
            "merge" => Self::Merge,
            other => {
                warn!(strategy = other, "Unrecognized conflict strategy, requiring manual resolution");
                Self::Manual
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Manual => "manual",
            Self::Smart => "smart",
            Self::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// Cheap rolling hash - detects corruption, not tampering
    Polynomial,
    Sha256,
}

/// Per-dataset time-to-live, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TtlConfig {
    pub places_secs: i64,
    pub user_data_secs: i64,
    pub categories_secs: i64,
    pub cities_secs: i64,
    pub default_secs: i64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            places_secs: 6 * 3600,
            user_data_secs: 3600,
            categories_secs: 24 * 3600,
            cities_secs: 7 * 24 * 3600,
            default_secs: 6 * 3600,
        }
    }
}

impl TtlConfig {
    /// TTL for a cache key, chosen by key class.
    pub fn ttl_for(&self, key: &str) -> i64 {
        match key {
            keys::TOURIST_PLACES | keys::ENHANCED_PLACES => self.places_secs,
            keys::CATEGORIES => self.categories_secs,
            keys::CITIES => self.cities_secs,
            k if k.starts_with(keys::USER_DATA_PREFIX) => self.user_data_secs,
            _ => self.default_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub preload_strategy: PreloadStrategy,
    /// Share (0-100) of the favorite-category matches kept by `user-based` preload
    pub preload_percentage: u8,
    pub sync_strategy: SyncStrategy,
    pub sync_interval_minutes: u64,
    #[serde(rename = "maxStorageSizeMB")]
    pub max_storage_size_mb: u64,
    /// Utilization (percent) past which a write triggers aggressive cleanup
    pub emergency_cleanup_threshold_pct: u8,
    pub conflict_resolution: ConflictStrategy,
    pub retry_limit: u32,
    pub network_timeout_ms: u64,
    /// Ask the remote for gzip-compressed responses
    pub enable_compression: bool,
    pub batch_size: usize,
    pub location_radius_km: f64,
    pub essential_place_count: usize,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub namespace: String,
    pub remote_base_url: Option<String>,
    pub ttl: TtlConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            preload_strategy: PreloadStrategy::Essential,
            preload_percentage: 50,
            sync_strategy: SyncStrategy::Background,
            sync_interval_minutes: 30,
            max_storage_size_mb: 100,
            emergency_cleanup_threshold_pct: 95,
            conflict_resolution: ConflictStrategy::Smart,
            retry_limit: 3,
            network_timeout_ms: 30_000,
            enable_compression: true,
            batch_size: 10,
            location_radius_km: 100.0,
            essential_place_count: 20,
            checksum_algorithm: ChecksumAlgorithm::Polynomial,
            namespace: "app".to_string(),
            remote_base_url: None,
            ttl: TtlConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(&self.namespace))
    }

    /// Overlay `TOURCACHE_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("TOURCACHE_REMOTE_URL") {
            self.remote_base_url = Some(url);
        }
        if let Ok(mb) = std::env::var("TOURCACHE_MAX_STORAGE_MB") {
            self.max_storage_size_mb = mb
                .parse()
                .with_context(|| format!("Invalid TOURCACHE_MAX_STORAGE_MB: {}", mb))?;
        }
        if let Ok(strategy) = std::env::var("TOURCACHE_PRELOAD_STRATEGY") {
            self.preload_strategy = strategy.parse()?;
        }
        if let Ok(strategy) = std::env::var("TOURCACHE_CONFLICT_RESOLUTION") {
            self.conflict_resolution = ConflictStrategy::parse(&strategy);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.preload_percentage > 100 {
            bail!("preloadPercentage must be 0-100, got {}", self.preload_percentage);
        }
        if !(1..=100).contains(&self.emergency_cleanup_threshold_pct) {
            bail!(
                "emergencyCleanupThresholdPct must be 1-100, got {}",
                self.emergency_cleanup_threshold_pct
            );
        }
        if self.max_storage_size_mb == 0 {
            bail!("maxStorageSizeMB must be positive");
        }
        if self.batch_size == 0 {
            bail!("batchSize must be positive");
        }
        if self.sync_interval_minutes == 0 {
            bail!("syncIntervalMinutes must be positive");
        }
        Ok(())
    }

    pub fn max_storage_bytes(&self) -> u64 {
        self.max_storage_size_mb * BYTES_PER_MB
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_storage_bytes(), 100 * 1024 * 1024);
        assert_eq!(config.network_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_limit, 3);
    }

    #[test]
    fn test_parse_camel_case_with_defaults() {
        let json = r#"{
            "preloadStrategy": "user-based",
            "preloadPercentage": 25,
            "syncStrategy": "wifi-only",
            "maxStorageSizeMB": 50,
            "conflictResolution": "server"
        }"#;
        let config: CacheConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.preload_strategy, PreloadStrategy::UserBased);
        assert_eq!(config.preload_percentage, 25);
        assert_eq!(config.sync_strategy, SyncStrategy::WifiOnly);
        assert_eq!(config.max_storage_size_mb, 50);
        assert_eq!(config.conflict_resolution, ConflictStrategy::Server);
        // Untouched fields keep defaults
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.namespace, "app");
    }

    #[test]
    fn test_unknown_conflict_strategy_is_manual() {
        let json = r#"{ "conflictResolution": "coin-flip" }"#;
        let config: CacheConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.conflict_resolution, ConflictStrategy::Manual);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = CacheConfig::default();
        config.preload_percentage = 120;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.emergency_cleanup_threshold_pct = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_by_key_class() {
        let ttl = TtlConfig::default();
        assert!(ttl.ttl_for(keys::TOURIST_PLACES) < ttl.ttl_for(keys::CATEGORIES));
        assert!(ttl.ttl_for(keys::CATEGORIES) < ttl.ttl_for(keys::CITIES));
        assert_eq!(ttl.ttl_for("user_data:7"), ttl.user_data_secs);
        assert_eq!(ttl.ttl_for("something_else"), ttl.default_secs);
    }

    #[test]
    fn test_preload_strategy_from_str() {
        assert_eq!("location-based".parse::<PreloadStrategy>().unwrap(), PreloadStrategy::LocationBased);
        assert!("nearby".parse::<PreloadStrategy>().is_err());
        assert_eq!(PreloadStrategy::UserBased.to_string(), "user-based");
    }
}
