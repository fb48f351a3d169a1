use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::cache::BundledDataset;
use crate::error::CacheResult;
use crate::models::{EnhancedPlace, UserData};

use super::{FetchResponse, PushResponse, RemoteDataSource, RemoteError, ResourceType, SyncDelta};

/// Serves the compiled-in dataset as if it were the remote API, after a
/// simulated network delay. Pushes are accepted and discarded.
pub struct BundledRemote {
    dataset: BundledDataset,
    latency: Duration,
}

impl BundledRemote {
    pub fn new() -> CacheResult<Self> {
        Ok(Self {
            dataset: BundledDataset::load()?,
            latency: Duration::ZERO,
        })
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn enhanced_places(&self) -> Vec<EnhancedPlace> {
        self.dataset
            .places
            .iter()
            .map(|place| EnhancedPlace {
                highlights: vec![format!("{} highlights tour", place.name)],
                average_visit_minutes: Some(90),
                opening_hours: Some("09:00-18:00".to_string()),
                entry_fee: None,
                place: place.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl RemoteDataSource for BundledRemote {
    async fn fetch(&self, resource: &ResourceType) -> Result<FetchResponse, RemoteError> {
        self.simulate_latency().await;

        let data = match resource {
            ResourceType::TouristPlaces => json!(self.dataset.places),
            ResourceType::EnhancedPlaces => json!(self.enhanced_places()),
            ResourceType::Categories => json!(self.dataset.categories),
            ResourceType::Cities => json!(self.dataset.cities),
            ResourceType::UserData(user_id) => json!(UserData {
                user_id: user_id.clone(),
                favorite_place_ids: Vec::new(),
                visited_place_ids: Vec::new(),
                updated_at: None,
            }),
        };
        debug!(resource = %resource, "Served bundled resource");

        Ok(FetchResponse {
            version: Some(self.dataset.version.clone()),
            ..FetchResponse::ok(data)
        })
    }

    async fn push(
        &self,
        resource: &ResourceType,
        delta: &SyncDelta,
    ) -> Result<PushResponse, RemoteError> {
        self.simulate_latency().await;
        debug!(resource = %resource, operation = ?delta.operation, "Bundled remote accepted push");
        Ok(PushResponse {
            success: true,
            error: None,
        })
    }
}
