//! JSONL-backed store.
//!
//! Follows the append-only pattern: every put/delete is appended as a JSON
//! line and current state is derived by replaying the log on open. The log
//! file is held under an exclusive advisory lock for the lifetime of the
//! store so two processes never interleave writes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{run_query, Collection, Filter, LocalStore, OrderBy};
use crate::domain::StoreError;

type Tables = HashMap<Collection, BTreeMap<String, Value>>;

/// Kind of log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOp {
    Put,
    Delete,
}

/// One line of the store log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// When this entry was written
    pub timestamp: DateTime<Utc>,

    pub op: LogOp,

    pub collection: Collection,

    pub key: String,

    /// New record (puts only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
}

struct Inner {
    tables: Tables,
    file: File,
}

/// Append-only JSONL store
pub struct JsonlStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JsonlStore {
    /// Open (or create) the log at `path` and replay it
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = open_locked(&path)?;
        let (tables, torn_tail) = replay(&path).await?;

        let store = Self {
            path,
            inner: Mutex::new(Inner { tables, file }),
        };

        if torn_tail {
            warn!(path = %store.path.display(), "Discarded torn final log line; compacting");
            store.compact().await?;
        }

        Ok(store)
    }

    /// Path to the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the log so it holds exactly one put per live record
    pub async fn compact(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        let tmp_path = self.path.with_extension("jsonl.compact");
        let mut tmp = File::create(&tmp_path).await?;
        let now = Utc::now();
        let mut count = 0usize;

        for collection in Collection::ALL {
            if let Some(records) = inner.tables.get(&collection) {
                for (key, record) in records {
                    let entry = LogEntry {
                        timestamp: now,
                        op: LogOp::Put,
                        collection,
                        key: key.clone(),
                        record: Some(record.clone()),
                    };
                    let json = serde_json::to_string(&entry)?;
                    tmp.write_all(format!("{}\n", json).as_bytes()).await?;
                    count += 1;
                }
            }
        }
        tmp.flush().await?;
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).await?;
        inner.file = open_locked(&self.path)?;

        info!(path = %self.path.display(), records = count, "Compacted store log");
        Ok(())
    }

    async fn append(inner: &mut Inner, entry: &LogEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(entry)?;
        inner.file.write_all(format!("{}\n", json).as_bytes()).await?;
        inner.file.flush().await?;
        inner.file.sync_data().await?;
        Ok(())
    }
}

/// Open the log for appending and take the exclusive lock
fn open_locked(path: &Path) -> Result<File, StoreError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    file.try_lock_exclusive().map_err(|e| {
        StoreError::Lock(format!("{} is in use by another process: {}", path.display(), e))
    })?;

    Ok(File::from_std(file))
}

/// Replay the log into tables. Returns whether a torn final line was dropped.
async fn replay(path: &Path) -> Result<(Tables, bool), StoreError> {
    let mut tables = Tables::new();

    let file = File::open(path).await?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let mut pending_error: Option<serde_json::Error> = None;
    let mut applied = 0usize;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        // A bad line is only tolerated if it is the last one
        if let Some(err) = pending_error.take() {
            return Err(StoreError::Serialization(err));
        }

        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => {
                apply_entry(&mut tables, entry);
                applied += 1;
            }
            Err(err) => pending_error = Some(err),
        }
    }

    debug!(path = %path.display(), entries = applied, "Replayed store log");
    Ok((tables, pending_error.is_some()))
}

fn apply_entry(tables: &mut Tables, entry: LogEntry) {
    match entry.op {
        LogOp::Put => {
            if let Some(record) = entry.record {
                tables
                    .entry(entry.collection)
                    .or_default()
                    .insert(entry.key, record);
            }
        }
        LogOp::Delete => {
            if let Some(records) = tables.get_mut(&entry.collection) {
                records.remove(&entry.key);
            }
        }
    }
}

#[async_trait]
impl LocalStore for JsonlStore {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.tables.get(&collection).and_then(|t| t.get(key)).cloned())
    }

    async fn put(&self, collection: Collection, key: &str, record: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = LogEntry {
            timestamp: Utc::now(),
            op: LogOp::Put,
            collection,
            key: key.to_string(),
            record: Some(record.clone()),
        };
        Self::append(&mut inner, &entry).await?;

        inner
            .tables
            .entry(collection)
            .or_default()
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let exists = inner
            .tables
            .get(&collection)
            .map(|t| t.contains_key(key))
            .unwrap_or(false);
        if !exists {
            return Ok(false);
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            op: LogOp::Delete,
            collection,
            key: key.to_string(),
            record: None,
        };
        Self::append(&mut inner, &entry).await?;

        if let Some(records) = inner.tables.get_mut(&collection) {
            records.remove(key);
        }
        Ok(true)
    }

    async fn query_ordered(
        &self,
        collection: Collection,
        filter: &Filter,
        order_by: &OrderBy,
    ) -> Result<Vec<Value>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(run_query(inner.tables.get(&collection), filter, order_by))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.jsonl");

        {
            let store = JsonlStore::open(&path).await.unwrap();
            store
                .put(Collection::QueueItems, "a", json!({"status": "pending"}))
                .await
                .unwrap();
            store
                .put(Collection::QueueItems, "a", json!({"status": "processing"}))
                .await
                .unwrap();
            store
                .put(Collection::QueueItems, "b", json!({"status": "pending"}))
                .await
                .unwrap();
            store.delete(Collection::QueueItems, "b").await.unwrap();
        }

        let store = JsonlStore::open(&path).await.unwrap();
        assert_eq!(
            store.get(Collection::QueueItems, "a").await.unwrap(),
            Some(json!({"status": "processing"}))
        );
        assert!(store.get(Collection::QueueItems, "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_open_is_locked_out() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.jsonl");

        let _first = JsonlStore::open(&path).await.unwrap();
        let second = JsonlStore::open(&path).await;
        assert!(matches!(second, Err(StoreError::Lock(_))));
    }

    #[tokio::test]
    async fn test_torn_tail_is_discarded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.jsonl");

        {
            let store = JsonlStore::open(&path).await.unwrap();
            store
                .put(Collection::Entities, "capture:1", json!({"v": 1}))
                .await
                .unwrap();
        }

        // Simulate a crash halfway through writing the next line
        let mut content = tokio::fs::read_to_string(&path).await.unwrap();
        content.push_str("{\"timestamp\":\"2024-01-01T00:00");
        tokio::fs::write(&path, content).await.unwrap();

        let store = JsonlStore::open(&path).await.unwrap();
        assert_eq!(
            store.get(Collection::Entities, "capture:1").await.unwrap(),
            Some(json!({"v": 1}))
        );

        // Compaction leaves a clean log that new writes can follow
        store
            .put(Collection::Entities, "capture:2", json!({"v": 2}))
            .await
            .unwrap();
        drop(store);
        let store = JsonlStore::open(&path).await.unwrap();
        assert!(store.get(Collection::Entities, "capture:2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.jsonl");
        tokio::fs::write(&path, "not json\n{\"also\": \"bad\"}\n")
            .await
            .unwrap();

        let result = JsonlStore::open(&path).await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }
}
