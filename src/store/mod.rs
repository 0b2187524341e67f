//! Local store: durable key/value persistence with ordered queries.
//!
//! The store is the single source of truth for queue items, upload
//! progress, conflicts and synchronized entities. Records are JSON values
//! grouped into [`Collection`]s; components read the freshest record and
//! write it back with a single-record upsert.
//!
//! Backends:
//! - [`MemoryStore`]: in-process maps (tests, ephemeral sessions)
//! - [`JsonlStore`]: append-only JSONL log replayed on open
//! - [`SqliteStore`]: rusqlite table with expression indexes

pub mod jsonl;
pub mod memory;
pub mod sqlite;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::StoreError;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Logical tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    QueueItems,
    UploadRecords,
    SyncConflicts,
    Entities,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Self::QueueItems,
        Self::UploadRecords,
        Self::SyncConflicts,
        Self::Entities,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueItems => "queue_items",
            Self::UploadRecords => "upload_records",
            Self::SyncConflicts => "sync_conflicts",
            Self::Entities => "entities",
        }
    }
}

/// Conjunction of field equality conditions
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    /// Match every record
    pub fn all() -> Self {
        Self::default()
    }

    /// Add `field == value` (a missing field compares equal to null)
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.conditions.iter().all(|(field, expected)| {
            record.get(field.as_str()).unwrap_or(&Value::Null) == expected
        })
    }
}

/// Sort order for [`LocalStore::query_ordered`]
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }

    /// Compare two records on this field
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let null = Value::Null;
        let left = a.get(self.field.as_str()).unwrap_or(&null);
        let right = b.get(self.field.as_str()).unwrap_or(&null);
        let ord = compare_values(left, right);
        if self.ascending {
            ord
        } else {
            ord.reverse()
        }
    }
}

/// Total order over JSON scalars: null < bool < number < string < other
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&y.as_f64().unwrap_or(0.0))
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Filter and sort one collection's records (stable: ties keep key order)
pub(crate) fn run_query(
    records: Option<&BTreeMap<String, Value>>,
    filter: &Filter,
    order_by: &OrderBy,
) -> Vec<Value> {
    let mut matched: Vec<Value> = records
        .map(|r| r.values().filter(|v| filter.matches(v)).cloned().collect())
        .unwrap_or_default();
    matched.sort_by(|a, b| order_by.compare(a, b));
    matched
}

/// Durable key/value persistence with ordered queries
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetch one record
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or replace one record
    async fn put(&self, collection: Collection, key: &str, record: Value) -> Result<(), StoreError>;

    /// Remove one record; returns whether it existed
    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError>;

    /// All records matching `filter`, sorted by `order_by`
    async fn query_ordered(
        &self,
        collection: Collection,
        filter: &Filter,
        order_by: &OrderBy,
    ) -> Result<Vec<Value>, StoreError>;
}

/// Fetch and deserialize one record
pub async fn get_record<T: DeserializeOwned>(
    store: &dyn LocalStore,
    collection: Collection,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(collection, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and upsert one record
pub async fn put_record<T: Serialize>(
    store: &dyn LocalStore,
    collection: Collection,
    key: &str,
    record: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(record)?;
    store.put(collection, key, value).await
}

/// Query and deserialize records
pub async fn query_records<T: DeserializeOwned>(
    store: &dyn LocalStore,
    collection: Collection,
    filter: &Filter,
    order_by: &OrderBy,
) -> Result<Vec<T>, StoreError> {
    store
        .query_ordered(collection, filter, order_by)
        .await?
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(StoreError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_missing_as_null() {
        let record = json!({"status": "pending"});
        assert!(Filter::all().eq("status", "pending").matches(&record));
        assert!(Filter::all().eq("resolved_at", Value::Null).matches(&record));
        assert!(!Filter::all().eq("status", "failed").matches(&record));
    }

    #[test]
    fn test_order_by_numbers_not_text() {
        let order = OrderBy::asc("created_at");
        let early = json!({"created_at": 9});
        let late = json!({"created_at": 10});
        assert_eq!(order.compare(&early, &late), Ordering::Less);
        assert_eq!(OrderBy::desc("created_at").compare(&early, &late), Ordering::Greater);
    }

    #[test]
    fn test_run_query_filters_and_sorts() {
        let mut records = BTreeMap::new();
        records.insert("a".to_string(), json!({"n": 3, "kind": "x"}));
        records.insert("b".to_string(), json!({"n": 1, "kind": "x"}));
        records.insert("c".to_string(), json!({"n": 2, "kind": "y"}));

        let result = run_query(
            Some(&records),
            &Filter::all().eq("kind", "x"),
            &OrderBy::asc("n"),
        );
        let ns: Vec<i64> = result.iter().map(|v| v["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![1, 3]);
    }
}
