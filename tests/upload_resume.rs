//! Chunked Upload Integration Tests
//!
//! Tests for resuming interrupted uploads, including across a restart of
//! the process that started them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use capsync::adapters::{ChunkAck, Transport};
use capsync::core::SystemClock;
use capsync::domain::{ErrorClass, SyncError, UploadStatus};
use capsync::store::{JsonlStore, LocalStore, MemoryStore};
use capsync::upload::{calculate_chunks, ChunkedUploader, DEFAULT_CHUNK_SIZE};

const MIB: u64 = 1024 * 1024;

/// One-shot misbehaviour for a chunk index
#[derive(Debug, Clone, Copy)]
enum Fault {
    ConnectionReset,
    Rejected,
    WrongOffset(u64),
}

/// Records every chunk it accepts; each scripted fault fires once
#[derive(Default)]
struct ScriptedTransport {
    sent: Mutex<Vec<(String, u32, u32, usize)>>,
    faults: Mutex<HashMap<u32, Fault>>,
}

impl ScriptedTransport {
    fn fail(&self, index: u32, fault: Fault) {
        self.faults.lock().unwrap().insert(index, fault);
    }

    fn sent_sizes(&self) -> Vec<(u32, usize)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, index, _, len)| (*index, *len))
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: Vec<u8>,
    ) -> Result<ChunkAck, SyncError> {
        let fault = self.faults.lock().unwrap().remove(&chunk_index);
        match fault {
            Some(Fault::ConnectionReset) => {
                return Err(SyncError::TransientIo("connection reset by peer".into()))
            }
            Some(Fault::Rejected) => return Ok(ChunkAck::rejected()),
            Some(Fault::WrongOffset(offset)) => {
                self.sent
                    .lock()
                    .unwrap()
                    .push((upload_id.to_string(), chunk_index, total_chunks, data.len()));
                return Ok(ChunkAck::accepted(Some(offset)));
            }
            None => {}
        }

        self.sent
            .lock()
            .unwrap()
            .push((upload_id.to_string(), chunk_index, total_chunks, data.len()));
        Ok(ChunkAck::accepted(None))
    }
}

fn write_file(dir: &Path, name: &str, len: u64) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

fn uploader(store: Arc<dyn LocalStore>, transport: Arc<ScriptedTransport>) -> ChunkedUploader {
    ChunkedUploader::new(store, transport, Arc::new(SystemClock::new()))
}

#[test]
fn test_twelve_mib_plan() {
    let plan = calculate_chunks(12 * MIB, DEFAULT_CHUNK_SIZE).unwrap();
    assert_eq!(plan.total_chunks, 3);
    assert_eq!(plan.chunk_range(0), Some((0, 5 * MIB)));
    assert_eq!(plan.chunk_range(1), Some((5 * MIB, 5 * MIB)));
    assert_eq!(plan.chunk_range(2), Some((10 * MIB, 2 * MIB)));
}

#[tokio::test]
async fn test_resume_after_restart_sends_only_missing_chunk() {
    let temp = TempDir::new().unwrap();
    let store_path = temp.path().join("capsync.jsonl");
    let file = write_file(temp.path(), "memo.m4a", 12 * MIB);

    let transport = Arc::new(ScriptedTransport::default());
    transport.fail(2, Fault::ConnectionReset);

    {
        let store = Arc::new(JsonlStore::open(&store_path).await.unwrap());
        let uploader = uploader(store, transport.clone());

        let err = uploader
            .upload_file("up-1", "cap-1", &file, 12 * MIB)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);

        let record = uploader.get("up-1").await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::InProgress);
        assert_eq!(record.total_chunks, 3);
        assert_eq!(record.last_chunk_uploaded, 1);
    }

    assert_eq!(
        transport.sent_sizes(),
        vec![(0, (5 * MIB) as usize), (1, (5 * MIB) as usize)]
    );

    // New process, same store
    let store = Arc::new(JsonlStore::open(&store_path).await.unwrap());
    let uploader = uploader(store, transport.clone());
    assert_eq!(uploader.pending().await.unwrap().len(), 1);

    let record = uploader.resume_upload("up-1").await.unwrap();
    assert_eq!(record.status, UploadStatus::Completed);
    assert_eq!(record.last_chunk_uploaded, 2);
    assert!(record.last_error.is_none());

    let sent = transport.sent_sizes();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2], (2, (2 * MIB) as usize));
    assert!(transport
        .sent
        .lock()
        .unwrap()
        .iter()
        .all(|(id, _, total, _)| id == "up-1" && *total == 3));
    assert!(uploader.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unacknowledged_chunk_is_retried_later() {
    let temp = TempDir::new().unwrap();
    let file = write_file(temp.path(), "memo.m4a", 10);
    let transport = Arc::new(ScriptedTransport::default());
    transport.fail(0, Fault::Rejected);

    let uploader = ChunkedUploader::with_chunk_size(
        Arc::new(MemoryStore::new()),
        transport.clone(),
        Arc::new(SystemClock::new()),
        4,
    );

    let err = uploader.upload_file("up-1", "cap-1", &file, 10).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(uploader.get("up-1").await.unwrap().unwrap().last_chunk_uploaded, -1);

    let record = uploader.resume_upload("up-1").await.unwrap();
    assert_eq!(record.status, UploadStatus::Completed);
    assert_eq!(transport.sent_sizes(), vec![(0, 4), (1, 4), (2, 2)]);
}

#[tokio::test]
async fn test_offset_disagreement_keeps_earlier_progress() {
    let temp = TempDir::new().unwrap();
    let file = write_file(temp.path(), "memo.m4a", 10);
    let transport = Arc::new(ScriptedTransport::default());
    transport.fail(1, Fault::WrongOffset(3));

    let uploader = ChunkedUploader::with_chunk_size(
        Arc::new(MemoryStore::new()),
        transport.clone(),
        Arc::new(SystemClock::new()),
        4,
    );

    let err = uploader.upload_file("up-1", "cap-1", &file, 10).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);

    let record = uploader.get("up-1").await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::InProgress);
    assert_eq!(record.last_chunk_uploaded, 0);
}

#[tokio::test]
async fn test_changed_file_fails_permanently() {
    let temp = TempDir::new().unwrap();
    let file = write_file(temp.path(), "memo.m4a", 10);
    let transport = Arc::new(ScriptedTransport::default());
    transport.fail(1, Fault::ConnectionReset);

    let uploader = ChunkedUploader::with_chunk_size(
        Arc::new(MemoryStore::new()),
        transport.clone(),
        Arc::new(SystemClock::new()),
        4,
    );
    uploader.upload_file("up-1", "cap-1", &file, 10).await.unwrap_err();

    // The source was rewritten between attempts
    write_file(temp.path(), "memo.m4a", 7);

    let err = uploader.resume_upload("up-1").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Permanent);

    let record = uploader.get("up-1").await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Failed);
    assert_eq!(record.last_chunk_uploaded, 0);

    // A failed upload frees the capture for a new one
    let file = write_file(temp.path(), "memo-2.m4a", 7);
    let retry = uploader.upload_file("up-2", "cap-1", &file, 7).await.unwrap();
    assert_eq!(retry.status, UploadStatus::Completed);
}

#[tokio::test]
async fn test_resume_unknown_upload() {
    let uploader = uploader(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedTransport::default()),
    );
    let err = uploader.resume_upload("missing").await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}
