use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{require_non_empty, Cacheable};

/// Mean Earth radius used for great-circle distances.
const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Haversine great-circle distance in kilometres.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TouristPlace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub rating: f64,
    /// 0-100
    #[serde(default)]
    pub popularity: u32,
    #[serde(default)]
    pub featured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TouristPlace {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

impl Cacheable for TouristPlace {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn validate(&self) -> Result<(), String> {
        require_non_empty("id", &self.id)?;
        require_non_empty("name", &self.name)?;
        require_non_empty("category", &self.category)?;
        if !self.location().is_valid() {
            return Err(format!(
                "place {} has invalid coordinates ({}, {})",
                self.id, self.latitude, self.longitude
            ));
        }
        if !(0.0..=5.0).contains(&self.rating) {
            return Err(format!("place {} has rating {} outside 0-5", self.id, self.rating));
        }
        Ok(())
    }
}

/// A place with the detail fields served by the enhanced endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedPlace {
    #[serde(flatten)]
    pub place: TouristPlace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening_hours: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_fee: Option<f64>,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_visit_minutes: Option<u32>,
}

impl Cacheable for EnhancedPlace {
    fn record_id(&self) -> &str {
        &self.place.id
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.place.updated_at
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.place.created_at
    }

    fn validate(&self) -> Result<(), String> {
        self.place.validate()?;
        if matches!(self.entry_fee, Some(fee) if fee < 0.0) {
            return Err(format!("place {} has a negative entry fee", self.place.id));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn place(id: &str, category: &str, popularity: u32) -> TouristPlace {
        TouristPlace {
            id: id.to_string(),
            name: format!("Place {}", id),
            description: String::new(),
            category: category.to_string(),
            city: "rome".to_string(),
            latitude: 41.9,
            longitude: 12.5,
            rating: 4.0,
            popularity,
            featured: false,
            image_url: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_distance_rome_to_paris() {
        let rome = GeoPoint::new(41.9028, 12.4964);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let d = rome.distance_km(&paris);
        assert!((1100.0..1120.0).contains(&d), "got {}", d);
        assert!(rome.distance_km(&rome) < 1e-9);
    }

    #[test]
    fn test_validate_place() {
        let mut p = place("p1", "historical", 50);
        assert!(p.validate().is_ok());

        p.latitude = 120.0;
        assert!(p.validate().is_err());

        let mut p = place("p1", "historical", 50);
        p.name = "  ".to_string();
        assert!(p.validate().unwrap_err().contains("name"));
    }

    #[test]
    fn test_enhanced_place_flattens() {
        let json = r#"{
            "id": "p9", "name": "Louvre", "category": "museum", "city": "paris",
            "latitude": 48.86, "longitude": 2.33, "openingHours": "09:00-18:00",
            "highlights": ["Mona Lisa"]
        }"#;
        let p: EnhancedPlace = serde_json::from_str(json).unwrap();
        assert_eq!(p.record_id(), "p9");
        assert_eq!(p.opening_hours.as_deref(), Some("09:00-18:00"));
        assert_eq!(p.highlights, vec!["Mona Lisa".to_string()]);
        assert!(p.validate().is_ok());
    }
}
