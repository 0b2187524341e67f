//! Resumable chunked transfer.
//!
//! Progress lives in the store, never only in memory: each acknowledged
//! chunk is persisted before the next one is read, so a crash between
//! chunks costs at most one chunk of re-send.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::chunk::{calculate_chunks, ChunkPlan, DEFAULT_CHUNK_SIZE};
use crate::adapters::Transport;
use crate::core::Clock;
use crate::domain::{ErrorClass, SyncError, UploadRecord, UploadStatus};
use crate::store::{get_record, put_record, query_records, Collection, Filter, LocalStore, OrderBy};

/// Uploads files chunk by chunk and resumes from persisted progress
pub struct ChunkedUploader {
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    chunk_size: u64,

    /// One transfer at a time keeps acknowledgements totally ordered
    active: Mutex<()>,
}

impl ChunkedUploader {
    pub fn new(store: Arc<dyn LocalStore>, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self::with_chunk_size(store, transport, clock, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        chunk_size: u64,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            chunk_size,
            active: Mutex::new(()),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Upload `file_path`, resuming from any persisted progress for `upload_id`
    #[instrument(skip(self, file_path))]
    pub async fn upload_file(
        &self,
        upload_id: &str,
        capture_id: &str,
        file_path: &Path,
        file_size_bytes: u64,
    ) -> Result<UploadRecord, SyncError> {
        let _active = self.active.lock().await;

        let mut record = match self.get(upload_id).await? {
            Some(existing) => {
                check_matches(&existing, capture_id, file_path, file_size_bytes)?;
                existing
            }
            None => {
                self.create_record(upload_id, capture_id, file_path, file_size_bytes)
                    .await?
            }
        };

        match record.status {
            UploadStatus::Completed => {
                debug!(upload_id, "Upload already completed");
                return Ok(record);
            }
            UploadStatus::Failed => {
                return Err(SyncError::PermanentResource(format!(
                    "upload {} failed: {}",
                    upload_id,
                    record.last_error.as_deref().unwrap_or("unknown error")
                )));
            }
            UploadStatus::InProgress => {}
        }

        match self.send_remaining(&mut record).await {
            Ok(()) => {
                record.status = UploadStatus::Completed;
                record.last_error = None;
                record.updated_at = self.clock.now();
                self.save(&record).await?;
                info!(upload_id, total_chunks = record.total_chunks, "Upload completed");
                Ok(record)
            }
            Err(err) => {
                self.record_failure(&mut record, &err).await?;
                Err(err)
            }
        }
    }

    /// Continue a previously started upload
    pub async fn resume_upload(&self, upload_id: &str) -> Result<UploadRecord, SyncError> {
        let record = self
            .get(upload_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("upload {}", upload_id)))?;

        self.upload_file(
            &record.upload_id,
            &record.capture_id,
            &record.file_path,
            record.file_size_bytes,
        )
        .await
    }

    /// Create an InProgress record without sending anything.
    ///
    /// Idempotent for the same `upload_id`.
    pub async fn register(
        &self,
        upload_id: &str,
        capture_id: &str,
        file_path: &Path,
        file_size_bytes: u64,
    ) -> Result<UploadRecord, SyncError> {
        let _active = self.active.lock().await;

        if let Some(existing) = self.get(upload_id).await? {
            check_matches(&existing, capture_id, file_path, file_size_bytes)?;
            return Ok(existing);
        }
        self.create_record(upload_id, capture_id, file_path, file_size_bytes)
            .await
    }

    pub async fn get(&self, upload_id: &str) -> Result<Option<UploadRecord>, SyncError> {
        Ok(get_record(self.store.as_ref(), Collection::UploadRecords, upload_id).await?)
    }

    /// InProgress uploads, oldest first
    pub async fn pending(&self) -> Result<Vec<UploadRecord>, SyncError> {
        Ok(query_records(
            self.store.as_ref(),
            Collection::UploadRecords,
            &Filter::all().eq("status", UploadStatus::InProgress.as_str()),
            &OrderBy::asc("created_at"),
        )
        .await?)
    }

    /// Every upload record, oldest first
    pub async fn list(&self) -> Result<Vec<UploadRecord>, SyncError> {
        Ok(query_records(
            self.store.as_ref(),
            Collection::UploadRecords,
            &Filter::all(),
            &OrderBy::asc("created_at"),
        )
        .await?)
    }

    async fn create_record(
        &self,
        upload_id: &str,
        capture_id: &str,
        file_path: &Path,
        file_size_bytes: u64,
    ) -> Result<UploadRecord, SyncError> {
        if upload_id.trim().is_empty() {
            return Err(SyncError::Validation("upload id must not be empty".to_string()));
        }
        let plan = calculate_chunks(file_size_bytes, self.chunk_size)?;

        let active: Vec<UploadRecord> = query_records(
            self.store.as_ref(),
            Collection::UploadRecords,
            &Filter::all()
                .eq("capture_id", capture_id)
                .eq("status", UploadStatus::InProgress.as_str()),
            &OrderBy::asc("created_at"),
        )
        .await?;
        if let Some(other) = active.first() {
            return Err(SyncError::Validation(format!(
                "capture {} already has upload {} in progress",
                capture_id, other.upload_id
            )));
        }

        let record = UploadRecord::new(
            upload_id.to_string(),
            capture_id.to_string(),
            PathBuf::from(file_path),
            file_size_bytes,
            plan.chunk_size,
            plan.total_chunks,
            self.clock.now(),
        );
        self.save(&record).await?;

        info!(
            upload_id,
            capture_id,
            total_chunks = plan.total_chunks,
            "Upload registered"
        );
        Ok(record)
    }

    /// Send every chunk after the last acknowledged one
    async fn send_remaining(&self, record: &mut UploadRecord) -> Result<(), SyncError> {
        // The record's own chunking wins over the current setting
        let plan = calculate_chunks(record.file_size_bytes, record.chunk_size_bytes)?;

        let mut file = File::open(&record.file_path)
            .await
            .map_err(|e| SyncError::from_io(&e, "open upload source"))?;
        let actual_size = file
            .metadata()
            .await
            .map_err(|e| SyncError::from_io(&e, "stat upload source"))?
            .len();
        if actual_size != record.file_size_bytes {
            return Err(SyncError::PermanentResource(format!(
                "{} is {} bytes, expected {}",
                record.file_path.display(),
                actual_size,
                record.file_size_bytes
            )));
        }

        for index in record.next_chunk()..plan.total_chunks {
            let data = read_chunk(&mut file, &plan, index).await?;
            let expected_next = u64::from(index) * plan.chunk_size + data.len() as u64;

            let ack = self
                .transport
                .post_chunk(&record.upload_id, index, plan.total_chunks, data)
                .await?;

            if !ack.chunk_uploaded {
                return Err(SyncError::TransientIo(format!(
                    "server did not acknowledge chunk {}",
                    index
                )));
            }
            if let Some(next_offset) = ack.next_offset {
                if next_offset != expected_next {
                    return Err(SyncError::TransientIo(format!(
                        "server expects offset {} after chunk {}, local plan says {}",
                        next_offset, index, expected_next
                    )));
                }
            }

            record.acknowledge(index, self.clock.now())?;
            self.save(record).await?;
            debug!(
                upload_id = %record.upload_id,
                chunk_index = index,
                total_chunks = plan.total_chunks,
                "Chunk acknowledged"
            );
        }

        Ok(())
    }

    /// Persist the failure; permanent ones end the upload
    async fn record_failure(&self, record: &mut UploadRecord, err: &SyncError) -> Result<(), SyncError> {
        record.last_error = Some(err.to_string());
        record.updated_at = self.clock.now();

        match err.class() {
            ErrorClass::Permanent | ErrorClass::Validation => {
                record.status = UploadStatus::Failed;
                warn!(upload_id = %record.upload_id, error = %err, "Upload failed permanently");
            }
            _ => {
                warn!(
                    upload_id = %record.upload_id,
                    last_chunk = record.last_chunk_uploaded,
                    error = %err,
                    "Upload interrupted; progress kept for resume"
                );
            }
        }

        self.save(record).await
    }

    async fn save(&self, record: &UploadRecord) -> Result<(), SyncError> {
        put_record(
            self.store.as_ref(),
            Collection::UploadRecords,
            &record.upload_id,
            record,
        )
        .await?;
        Ok(())
    }
}

fn check_matches(
    record: &UploadRecord,
    capture_id: &str,
    file_path: &Path,
    file_size_bytes: u64,
) -> Result<(), SyncError> {
    if record.capture_id != capture_id
        || record.file_path != file_path
        || record.file_size_bytes != file_size_bytes
    {
        return Err(SyncError::Validation(format!(
            "upload {} belongs to capture {} ({}, {} bytes)",
            record.upload_id,
            record.capture_id,
            record.file_path.display(),
            record.file_size_bytes
        )));
    }
    Ok(())
}

async fn read_chunk(file: &mut File, plan: &ChunkPlan, index: u32) -> Result<Vec<u8>, SyncError> {
    let (offset, len) = plan
        .chunk_range(index)
        .ok_or_else(|| SyncError::Validation(format!("chunk {} out of range", index)))?;

    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| SyncError::from_io(&e, "seek upload source"))?;

    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)
        .await
        .map_err(|e| SyncError::from_io(&e, "read upload source"))?;
    Ok(buf)
}
