//! Remote source of truth for the cached datasets.
//!
//! `SyncEngine` talks to a `RemoteDataSource`; the concrete source is
//! chosen by the host: `HttpRemote` for a real backend, `BundledRemote` to
//! serve the compiled-in dataset (demo mode), or a fake in tests.

mod bundled;
mod error;
mod http;

pub use bundled::BundledRemote;
pub use error::RemoteError;
pub use http::HttpRemote;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::keys;
use crate::sync::SyncOperation;

/// The record sets the remote serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceType {
    TouristPlaces,
    EnhancedPlaces,
    Categories,
    Cities,
    UserData(String),
}

impl ResourceType {
    /// URL path segment under the remote base
    pub fn path(&self) -> String {
        match self {
            ResourceType::TouristPlaces => "places".to_string(),
            ResourceType::EnhancedPlaces => "places/enhanced".to_string(),
            ResourceType::Categories => "categories".to_string(),
            ResourceType::Cities => "cities".to_string(),
            ResourceType::UserData(user_id) => format!("users/{}/data", user_id),
        }
    }

    /// Store key the dataset is cached under
    pub fn cache_key(&self) -> String {
        match self {
            ResourceType::TouristPlaces => keys::TOURIST_PLACES.to_string(),
            ResourceType::EnhancedPlaces => keys::ENHANCED_PLACES.to_string(),
            ResourceType::Categories => keys::CATEGORIES.to_string(),
            ResourceType::Cities => keys::CITIES.to_string(),
            ResourceType::UserData(user_id) => keys::user_data(user_id),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            keys::TOURIST_PLACES | "places" => Ok(ResourceType::TouristPlaces),
            keys::ENHANCED_PLACES | "enhanced" => Ok(ResourceType::EnhancedPlaces),
            keys::CATEGORIES => Ok(ResourceType::Categories),
            keys::CITIES => Ok(ResourceType::Cities),
            other => match other.split_once(':') {
                Some((keys::USER_DATA_PREFIX, user_id)) if !user_id.is_empty() => {
                    Ok(ResourceType::UserData(user_id.to_string()))
                }
                _ => Err(format!("unknown resource type: {}", other)),
            },
        }
    }
}

impl TryFrom<String> for ResourceType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceType> for String {
    fn from(resource: ResourceType) -> Self {
        resource.cache_key()
    }
}

/// Response to a `fetch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<String>,
}

impl FetchResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// The payload of a successful response.
    pub fn into_data(self) -> Result<Value, RemoteError> {
        if !self.success {
            return Err(RemoteError::Rejected(
                self.error.unwrap_or_else(|| "fetch failed".to_string()),
            ));
        }
        self.data
            .ok_or_else(|| RemoteError::InvalidResponse("success without data".to_string()))
    }
}

/// Outbound change pushed to the remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDelta {
    pub operation: SyncOperation,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Response to a `push`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl PushResponse {
    pub fn into_result(self) -> Result<(), RemoteError> {
        if self.success {
            Ok(())
        } else {
            Err(RemoteError::Rejected(
                self.error.unwrap_or_else(|| "push failed".to_string()),
            ))
        }
    }
}

#[async_trait]
pub trait RemoteDataSource: Send + Sync {
    async fn fetch(&self, resource: &ResourceType) -> Result<FetchResponse, RemoteError>;

    async fn push(
        &self,
        resource: &ResourceType,
        delta: &SyncDelta,
    ) -> Result<PushResponse, RemoteError>;
}
