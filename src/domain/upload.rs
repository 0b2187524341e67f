//! Resumable transfer progress records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SyncError;

/// Status of a chunked upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    InProgress,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Persisted progress of one file transfer.
///
/// `last_chunk_uploaded` is -1 until the first chunk is acknowledged and
/// never moves backwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub upload_id: String,
    pub capture_id: String,
    pub file_path: PathBuf,
    pub file_size_bytes: u64,
    pub chunk_size_bytes: u64,
    pub total_chunks: u32,
    pub last_chunk_uploaded: i64,
    pub status: UploadStatus,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_microseconds")]
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    /// Start tracking a new transfer
    pub fn new(
        upload_id: String,
        capture_id: String,
        file_path: PathBuf,
        file_size_bytes: u64,
        chunk_size_bytes: u64,
        total_chunks: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            upload_id,
            capture_id,
            file_path,
            file_size_bytes,
            chunk_size_bytes,
            total_chunks,
            last_chunk_uploaded: -1,
            status: UploadStatus::InProgress,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Index of the first chunk not yet acknowledged
    pub fn next_chunk(&self) -> u32 {
        (self.last_chunk_uploaded + 1).max(0) as u32
    }

    /// Whether every chunk has been acknowledged
    pub fn all_chunks_acknowledged(&self) -> bool {
        self.last_chunk_uploaded + 1 >= i64::from(self.total_chunks)
    }

    /// Record a server acknowledgement for `chunk_index`
    pub fn acknowledge(&mut self, chunk_index: u32, now: DateTime<Utc>) -> Result<(), SyncError> {
        let index = i64::from(chunk_index);
        if chunk_index >= self.total_chunks {
            return Err(SyncError::Validation(format!(
                "chunk {} out of range for {} chunks",
                chunk_index, self.total_chunks
            )));
        }
        if index < self.last_chunk_uploaded {
            return Err(SyncError::Validation(format!(
                "chunk {} acknowledged after chunk {}",
                chunk_index, self.last_chunk_uploaded
            )));
        }

        self.last_chunk_uploaded = index;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total: u32) -> UploadRecord {
        UploadRecord::new(
            "up-1".into(),
            "cap-1".into(),
            PathBuf::from("/tmp/a.m4a"),
            100,
            40,
            total,
            Utc::now(),
        )
    }

    #[test]
    fn test_fresh_record_starts_at_chunk_zero() {
        let record = record(3);
        assert_eq!(record.last_chunk_uploaded, -1);
        assert_eq!(record.next_chunk(), 0);
        assert!(!record.all_chunks_acknowledged());
    }

    #[test]
    fn test_acknowledge_is_monotonic_and_bounded() {
        let mut record = record(3);
        record.acknowledge(0, Utc::now()).unwrap();
        record.acknowledge(1, Utc::now()).unwrap();
        assert_eq!(record.next_chunk(), 2);

        assert!(record.acknowledge(0, Utc::now()).is_err());
        assert!(record.acknowledge(3, Utc::now()).is_err());

        record.acknowledge(2, Utc::now()).unwrap();
        assert!(record.all_chunks_acknowledged());
    }
}
