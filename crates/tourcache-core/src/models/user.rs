use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{require_non_empty, Cacheable, GeoPoint};

/// What the cache knows about the current user when choosing what to
/// preload and which user-scoped data to sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub favorite_categories: Vec<String>,
    #[serde(default)]
    pub last_location: Option<GeoPoint>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_favorites<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.favorite_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.last_location = Some(location);
        self
    }

    pub fn likes_category(&self, category: &str) -> bool {
        self.favorite_categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }
}

/// User-scoped data kept in sync with the remote (saved and visited places).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    pub user_id: String,
    #[serde(default)]
    pub favorite_place_ids: Vec<String>,
    #[serde(default)]
    pub visited_place_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Cacheable for UserData {
    fn record_id(&self) -> &str {
        &self.user_id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn validate(&self) -> Result<(), String> {
        require_non_empty("userId", &self.user_id)
    }
}
