//! Preload strategies: which part of the full dataset to cache ahead of use.
//!
//! Selection is a pure function of the source dataset, the user context and
//! the strategy; `CacheManager::intelligent_preload` writes the result.

use serde::Serialize;
use tracing::debug;

use crate::config::{CacheConfig, PreloadStrategy};
use crate::models::{Category, City, TouristPlace, UserContext};

use super::bundled::BundledDataset;

/// Places at or above this popularity count as essential even when not featured.
const ESSENTIAL_POPULARITY: u32 = 80;

/// The universe a preload picks from.
#[derive(Debug, Clone, Default)]
pub struct PreloadSource {
    pub places: Vec<TouristPlace>,
    pub categories: Vec<Category>,
    pub cities: Vec<City>,
    pub version: String,
}

impl From<BundledDataset> for PreloadSource {
    fn from(bundle: BundledDataset) -> Self {
        Self {
            version: bundle.cache_version(),
            places: bundle.places,
            categories: bundle.categories,
            cities: bundle.cities,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreloadSelection {
    /// Strategy actually applied (after falling back for a missing context)
    pub strategy: PreloadStrategy,
    pub places: Vec<TouristPlace>,
    pub categories: Vec<Category>,
    pub cities: Vec<City>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadReport {
    pub requested: PreloadStrategy,
    pub applied: PreloadStrategy,
    pub places: usize,
    pub categories: usize,
    pub cities: usize,
}

fn by_popularity(places: &mut [TouristPlace]) {
    places.sort_by(|a, b| b.popularity.cmp(&a.popularity).then_with(|| a.id.cmp(&b.id)));
}

fn popular_cities(source: &PreloadSource) -> Vec<City> {
    source.cities.iter().filter(|c| c.popular).cloned().collect()
}

fn essential(source: &PreloadSource, config: &CacheConfig) -> PreloadSelection {
    let mut places: Vec<TouristPlace> = source
        .places
        .iter()
        .filter(|p| p.featured || p.popularity >= ESSENTIAL_POPULARITY)
        .cloned()
        .collect();
    by_popularity(&mut places);
    places.truncate(config.essential_place_count);

    PreloadSelection {
        strategy: PreloadStrategy::Essential,
        places,
        categories: source.categories.clone(),
        cities: popular_cities(source),
    }
}

/// Number of records kept from `matching` at `percentage` percent, rounded up.
pub fn percentage_cap(matching: usize, percentage: u8) -> usize {
    (matching * usize::from(percentage.min(100))).div_ceil(100)
}

pub fn select(
    source: &PreloadSource,
    ctx: Option<&UserContext>,
    strategy: PreloadStrategy,
    config: &CacheConfig,
) -> PreloadSelection {
    match strategy {
        PreloadStrategy::Essential => essential(source, config),

        PreloadStrategy::UserBased => {
            let Some(ctx) = ctx.filter(|c| !c.favorite_categories.is_empty()) else {
                debug!("No favorite categories, falling back to essential preload");
                return essential(source, config);
            };

            let mut places: Vec<TouristPlace> = source
                .places
                .iter()
                .filter(|p| ctx.likes_category(&p.category))
                .cloned()
                .collect();
            by_popularity(&mut places);
            let cap = percentage_cap(places.len(), config.preload_percentage);
            places.truncate(cap);

            PreloadSelection {
                strategy: PreloadStrategy::UserBased,
                places,
                categories: source.categories.clone(),
                cities: popular_cities(source),
            }
        }

        PreloadStrategy::LocationBased => {
            let Some(origin) = ctx.and_then(|c| c.last_location) else {
                debug!("No known location, falling back to essential preload");
                return essential(source, config);
            };
            let radius = config.location_radius_km;

            let mut nearby: Vec<(f64, TouristPlace)> = source
                .places
                .iter()
                .map(|p| (origin.distance_km(&p.location()), p))
                .filter(|(d, _)| *d <= radius)
                .map(|(d, p)| (d, p.clone()))
                .collect();
            nearby.sort_by(|a, b| a.0.total_cmp(&b.0));

            let cities = source
                .cities
                .iter()
                .filter(|c| origin.distance_km(&c.location()) <= radius)
                .cloned()
                .collect();

            PreloadSelection {
                strategy: PreloadStrategy::LocationBased,
                places: nearby.into_iter().map(|(_, p)| p).collect(),
                categories: source.categories.clone(),
                cities,
            }
        }

        PreloadStrategy::All => PreloadSelection {
            strategy: PreloadStrategy::All,
            places: source.places.clone(),
            categories: source.categories.clone(),
            cities: source.cities.clone(),
        },
    }
}
