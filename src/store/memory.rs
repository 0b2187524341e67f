//! In-memory store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{run_query, Collection, Filter, LocalStore, OrderBy};
use crate::domain::StoreError;

type Tables = HashMap<Collection, BTreeMap<String, Value>>;

/// Store backed by process memory; contents vanish with the process
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Lock("memory store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>, StoreError> {
        let tables = self.tables()?;
        Ok(tables.get(&collection).and_then(|t| t.get(key)).cloned())
    }

    async fn put(&self, collection: Collection, key: &str, record: Value) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        tables
            .entry(collection)
            .or_default()
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        Ok(tables
            .get_mut(&collection)
            .map(|t| t.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn query_ordered(
        &self,
        collection: Collection,
        filter: &Filter,
        order_by: &OrderBy,
    ) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables()?;
        Ok(run_query(tables.get(&collection), filter, order_by))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_crud_round_trip() {
        let store = MemoryStore::new();

        store
            .put(Collection::QueueItems, "a", json!({"status": "pending"}))
            .await
            .unwrap();
        assert_eq!(
            store.get(Collection::QueueItems, "a").await.unwrap(),
            Some(json!({"status": "pending"}))
        );
        // Collections are isolated
        assert!(store.get(Collection::Entities, "a").await.unwrap().is_none());

        assert!(store.delete(Collection::QueueItems, "a").await.unwrap());
        assert!(!store.delete(Collection::QueueItems, "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_ordered() {
        let store = MemoryStore::new();
        for (key, ts, status) in [("x", 30, "pending"), ("y", 10, "pending"), ("z", 20, "failed")] {
            store
                .put(
                    Collection::QueueItems,
                    key,
                    json!({"id": key, "created_at": ts, "status": status}),
                )
                .await
                .unwrap();
        }

        let pending = store
            .query_ordered(
                Collection::QueueItems,
                &Filter::all().eq("status", "pending"),
                &OrderBy::asc("created_at"),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = pending.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["y", "x"]);
    }
}
