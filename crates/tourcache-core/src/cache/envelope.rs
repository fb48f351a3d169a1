use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metadata::CacheMetadata;

/// On-disk envelope: the dataset plus the metadata it was written with.
///
/// The manager writes `CachedData<&RawValue>` and reads
/// `CachedData<Box<RawValue>>`, so the payload text is kept byte-for-byte and
/// its checksum recomputes exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub metadata: CacheMetadata,
}

impl<T> CachedData<T> {
    pub fn new(data: T, metadata: CacheMetadata) -> Self {
        Self { data, metadata }
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        self.metadata.age(now).num_minutes()
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        age_display(self.age_minutes(now))
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.metadata.is_expired(now)
    }
}

/// Human-readable age: "just now", "5m ago", "2h ago", "3d ago".
pub fn age_display(minutes: i64) -> String {
    if minutes < 1 {
        // Negative covers clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        let remaining_mins = minutes % 60;
        if remaining_mins >= 30 {
            // Round up: 1h 30m+ becomes 2h
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        let remaining_hours = (minutes % 1440) / 60;
        if remaining_hours >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::value::RawValue;

    fn metadata(now: DateTime<Utc>) -> CacheMetadata {
        CacheMetadata {
            size: 7,
            last_accessed: now,
            last_modified: now,
            ttl_seconds: 3600,
            version: "1".to_string(),
            checksum: None,
        }
    }

    #[test]
    fn test_age_display() {
        assert_eq!(age_display(-3), "just now");
        assert_eq!(age_display(0), "just now");
        assert_eq!(age_display(5), "5m ago");
        assert_eq!(age_display(89), "1h ago");
        assert_eq!(age_display(90), "2h ago");
        assert_eq!(age_display(1440 * 3), "3d ago");
        assert_eq!(age_display(1440 + 12 * 60), "2d ago");
    }

    #[test]
    fn test_envelope_staleness() {
        let now = Utc::now();
        let cached = CachedData::new(vec![1], metadata(now));
        assert!(!cached.is_stale(now));
        assert!(cached.is_stale(now + Duration::minutes(61)));
        assert_eq!(cached.age_display(now + Duration::minutes(5)), "5m ago");
    }

    #[test]
    fn test_raw_payload_survives_round_trip() {
        let now = Utc::now();
        let payload = r#"[{"name":"Colosseum","id":"p1"}]"#;
        let raw = RawValue::from_string(payload.to_string()).unwrap();
        let blob = serde_json::to_vec_pretty(&CachedData::new(&*raw, metadata(now))).unwrap();

        let read: CachedData<Box<RawValue>> = serde_json::from_slice(&blob).unwrap();
        assert_eq!(read.data.get(), payload);
        assert_eq!(read.metadata, metadata(now));
    }
}
