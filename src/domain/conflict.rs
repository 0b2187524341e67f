//! Sync conflicts: append-only audit of local/remote divergence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::EntityRecord;
use super::error::SyncError;

/// How a conflict was (or will be) settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LocalWins,
    RemoteWins,
    Merged,
}

impl ResolutionStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "local_wins" | "local" => Some(Self::LocalWins),
            "remote_wins" | "remote" => Some(Self::RemoteWins),
            "merged" | "merge" => Some(Self::Merged),
            _ => None,
        }
    }
}

/// A detected divergence. Both versions are kept even after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub local_version: EntityRecord,
    pub remote_version: EntityRecord,

    #[serde(with = "chrono::serde::ts_microseconds")]
    pub detected_at: DateTime<Utc>,

    /// Set once, never cleared
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub resolved_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub resolution_strategy: Option<ResolutionStrategy>,
}

impl SyncConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Stamp the resolution; fails if one was already recorded
    pub fn stamp_resolution(
        &mut self,
        strategy: ResolutionStrategy,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        if self.is_resolved() {
            return Err(SyncError::Validation(format!(
                "conflict {} was already resolved",
                self.id
            )));
        }
        self.resolved_at = Some(at);
        self.resolution_strategy = Some(strategy);
        Ok(())
    }
}
