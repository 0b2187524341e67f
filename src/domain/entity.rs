//! Synchronized entities and their version markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One synchronized entity as seen by a single side (local or remote).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub entity_id: String,

    /// Entity body
    pub payload: serde_json::Value,

    /// Content hash of `payload`
    pub version: String,

    /// Last modification time on the side that produced this record
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub updated_at: DateTime<Utc>,

    /// Local edits not yet accepted by the server
    #[serde(default)]
    pub dirty: bool,

    /// Server version this local copy is based on
    #[serde(default)]
    pub base_version: Option<String>,
}

impl EntityRecord {
    /// Build a record, deriving the version from the payload
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let version = content_version(&payload);
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            version,
            updated_at,
            dirty: false,
            base_version: None,
        }
    }

    /// Store key for this entity
    pub fn key(&self) -> String {
        entity_key(&self.entity_type, &self.entity_id)
    }
}

/// Store key for an entity: `{type}:{id}`
pub fn entity_key(entity_type: &str, entity_id: &str) -> String {
    format!("{}:{}", entity_type, entity_id)
}

/// Content hash of a payload (first 16 hex chars of SHA256)
pub fn content_version(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_tracks_content() {
        let a = content_version(&json!({"text": "hello"}));
        let b = content_version(&json!({"text": "hello"}));
        let c = content_version(&json!({"text": "hello!"}));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_entity_key() {
        let record = EntityRecord::new("capture", "cap-1", json!({}), Utc::now());
        assert_eq!(record.key(), "capture:cap-1");
        assert!(!record.dirty);
    }
}
