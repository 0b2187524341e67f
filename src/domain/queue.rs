//! Queue items: units of local capture processing work.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be picked up
    Pending,

    /// Handed to the capture processor
    Processing,

    /// Processed successfully (terminal)
    Completed,

    /// Failed permanently (terminal)
    Failed,
}

impl QueueStatus {
    /// Completed and Failed items are never mutated again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable lowercase name (matches the persisted form)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the persisted form
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Why an item ended up Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTag {
    /// The processor reported a permanent error
    PermanentError,

    /// Transient failures hit the retry limit
    RetriesExhausted,

    /// Found in Processing at startup with its source file gone
    SourceMissingAfterCrash,
}

/// A capture waiting for (or done with) local processing.
///
/// Timestamps are persisted as microseconds since the epoch so ordered
/// store queries compare them numerically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Opaque unique id
    pub id: String,

    /// The capture this work belongs to
    pub capture_id: String,

    /// Audio/text file to process
    pub source_path: PathBuf,

    /// Length of the recording in seconds, when known
    #[serde(default)]
    pub source_duration: Option<f64>,

    /// Current status
    pub status: QueueStatus,

    /// Failed attempts so far (only ever increases)
    #[serde(default)]
    pub retry_count: u32,

    /// Message of the most recent failure
    #[serde(default)]
    pub last_error: Option<String>,

    /// Reason for a terminal failure
    #[serde(default)]
    pub failure_tag: Option<FailureTag>,

    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_microseconds")]
    pub updated_at: DateTime<Utc>,

    /// Backoff gate: not handed out before this instant
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Create a new Pending item
    pub fn new(
        id: String,
        capture_id: String,
        source_path: PathBuf,
        source_duration: Option<f64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            capture_id,
            source_path,
            source_duration,
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            failure_tag: None,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
        }
    }

    /// Whether a Pending item may be handed out at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending
            && self.next_attempt_at.map(|at| at <= now).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_terminal_statuses() {
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serializes_as_lowercase() {
        let json = serde_json::to_string(&QueueStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        assert_eq!(QueueStatus::parse("Completed"), Some(QueueStatus::Completed));
        assert_eq!(QueueStatus::parse("done"), None);
    }

    #[test]
    fn test_backoff_gate() {
        let now = Utc::now();
        let mut item = QueueItem::new(
            "q1".into(),
            "cap-1".into(),
            PathBuf::from("/tmp/a.m4a"),
            None,
            now,
        );
        assert!(item.is_ready(now));

        item.next_attempt_at = Some(now + Duration::seconds(10));
        assert!(!item.is_ready(now));
        assert!(item.is_ready(now + Duration::seconds(10)));
    }

    #[test]
    fn test_timestamps_persist_as_micros() {
        let item = QueueItem::new(
            "q1".into(),
            "cap-1".into(),
            PathBuf::from("/tmp/a.m4a"),
            Some(12.5),
            Utc::now(),
        );
        let value = serde_json::to_value(&item).unwrap();
        assert!(value["created_at"].is_i64());
        assert!(value["next_attempt_at"].is_null());
    }
}
