//! Default dataset compiled into the binary.
//!
//! Written on first run when no essential data is cached, so the app is
//! never empty, even without a network.

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};
use crate::models::{Category, City, TouristPlace};

const BUNDLED_JSON: &str = include_str!("../../data/bundled.json");

/// Version tag prefix for data that came from the bundle rather than the remote.
pub const BUNDLED_VERSION_PREFIX: &str = "bundled-";

#[derive(Debug, Clone, Deserialize)]
pub struct BundledDataset {
    pub version: String,
    pub places: Vec<TouristPlace>,
    pub categories: Vec<Category>,
    pub cities: Vec<City>,
}

impl BundledDataset {
    pub fn load() -> CacheResult<Self> {
        let dataset: Self = serde_json::from_str(BUNDLED_JSON)?;
        Ok(dataset)
    }

    /// The version string stamped on cache entries written from the bundle.
    pub fn cache_version(&self) -> String {
        format!("{}{}", BUNDLED_VERSION_PREFIX, self.version)
    }

    /// Featured places, most popular first, capped at `limit`.
    pub fn featured_places(&self, limit: usize) -> Vec<TouristPlace> {
        let mut featured: Vec<TouristPlace> =
            self.places.iter().filter(|p| p.featured).cloned().collect();
        featured.sort_by(|a, b| b.popularity.cmp(&a.popularity));
        featured.truncate(limit);
        featured
    }

    pub fn validate(&self) -> CacheResult<()> {
        use crate::models::Cacheable;

        for place in &self.places {
            place.validate().map_err(CacheError::Validation)?;
        }
        for category in &self.categories {
            category.validate().map_err(CacheError::Validation)?;
        }
        for city in &self.cities {
            city.validate().map_err(CacheError::Validation)?;
        }
        Ok(())
    }
}
