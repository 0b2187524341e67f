//! Local copies of synchronized entities.
//!
//! A local edit marks the entity dirty; a successful push marks it clean
//! again, but only if nothing changed in between.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::Clock;
use crate::domain::{entity_key, EntityRecord, SyncError};
use crate::store::{get_record, put_record, query_records, Collection, Filter, LocalStore, OrderBy};

/// Entity collection accessor
pub struct EntityStore {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
}

impl EntityStore {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a local edit. Unchanged content is not re-marked dirty.
    pub async fn record_local_change(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: Value,
    ) -> Result<EntityRecord, SyncError> {
        if entity_type.is_empty() || entity_id.is_empty() {
            return Err(SyncError::Validation(
                "entity type and id must not be empty".to_string(),
            ));
        }

        let existing = self.get(entity_type, entity_id).await?;
        let mut record = EntityRecord::new(entity_type, entity_id, payload, self.clock.now());

        if let Some(existing) = &existing {
            if existing.version == record.version {
                return Ok(existing.clone());
            }
            record.base_version = existing.base_version.clone();
        }
        record.dirty = true;

        self.save(&record).await?;
        debug!(entity = %record.key(), version = %record.version, "Recorded local change");
        Ok(record)
    }

    pub async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<EntityRecord>, SyncError> {
        let key = entity_key(entity_type, entity_id);
        Ok(get_record(self.store.as_ref(), Collection::Entities, &key).await?)
    }

    /// Entities with unpushed edits, oldest edit first
    pub async fn dirty(&self) -> Result<Vec<EntityRecord>, SyncError> {
        Ok(query_records(
            self.store.as_ref(),
            Collection::Entities,
            &Filter::all().eq("dirty", true),
            &OrderBy::asc("updated_at"),
        )
        .await?)
    }

    pub async fn dirty_count(&self) -> Result<usize, SyncError> {
        Ok(self.dirty().await?.len())
    }

    pub async fn list(&self) -> Result<Vec<EntityRecord>, SyncError> {
        Ok(query_records(
            self.store.as_ref(),
            Collection::Entities,
            &Filter::all(),
            &OrderBy::asc("updated_at"),
        )
        .await?)
    }

    /// Mark `pushed` as accepted by the server.
    ///
    /// Returns false (and leaves the entity dirty) if it was edited again
    /// after `pushed` was read.
    pub async fn mark_clean(&self, pushed: &EntityRecord) -> Result<bool, SyncError> {
        let Some(mut current) = self.get(&pushed.entity_type, &pushed.entity_id).await? else {
            return Ok(false);
        };
        if current.version != pushed.version {
            return Ok(false);
        }

        current.dirty = false;
        current.base_version = Some(current.version.clone());
        self.save(&current).await?;
        Ok(true)
    }

    /// Replace the local copy with the server's
    pub async fn apply_remote(&self, remote: &EntityRecord) -> Result<EntityRecord, SyncError> {
        let mut record = remote.clone();
        record.dirty = false;
        record.base_version = Some(remote.version.clone());
        self.save(&record).await?;
        debug!(entity = %record.key(), version = %record.version, "Applied remote version");
        Ok(record)
    }

    /// Keep `local` but base it on the server's `remote_version`
    pub async fn rebase(&self, local: &EntityRecord, remote_version: &str) -> Result<EntityRecord, SyncError> {
        let mut record = local.clone();
        record.dirty = true;
        record.base_version = Some(remote_version.to_string());
        self.save(&record).await?;
        Ok(record)
    }

    /// Store a hand-merged payload as a new local edit on top of `base_version`
    pub async fn record_merge(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: Value,
        base_version: &str,
    ) -> Result<EntityRecord, SyncError> {
        let mut record = EntityRecord::new(entity_type, entity_id, payload, self.clock.now());
        record.dirty = true;
        record.base_version = Some(base_version.to_string());
        self.save(&record).await?;
        Ok(record)
    }

    async fn save(&self, record: &EntityRecord) -> Result<(), SyncError> {
        put_record(self.store.as_ref(), Collection::Entities, &record.key(), record).await?;
        Ok(())
    }
}
