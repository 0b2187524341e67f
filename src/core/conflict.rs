//! Conflict detection and resolution.
//!
//! Default policy is last-write-wins by `updated_at`. Edits closer together
//! than the tolerance window are left unresolved for manual review. Both
//! versions are always kept on the conflict record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::Value;
use tracing::{info, warn};

use super::Clock;
use crate::domain::{EntityRecord, ResolutionStrategy, SyncConflict, SyncError};
use crate::store::{get_record, put_record, query_records, Collection, Filter, LocalStore, OrderBy};

/// Records and settles divergences between local and remote entities
pub struct ConflictResolver {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    tolerance: ChronoDuration,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, tolerance: Duration) -> Self {
        Self {
            store,
            clock,
            tolerance: ChronoDuration::from_std(tolerance).unwrap_or_else(|_| ChronoDuration::zero()),
        }
    }

    /// Record a conflict and apply the default policy
    pub async fn resolve(
        &self,
        entity_type: &str,
        entity_id: &str,
        local: &EntityRecord,
        remote: &EntityRecord,
    ) -> Result<SyncConflict, SyncError> {
        if local.entity_type != entity_type
            || local.entity_id != entity_id
            || remote.entity_type != entity_type
            || remote.entity_id != entity_id
        {
            return Err(SyncError::Validation(format!(
                "versions do not belong to {}:{}",
                entity_type, entity_id
            )));
        }
        if local.version == remote.version {
            return Err(SyncError::Validation(format!(
                "{}:{} has no divergence to resolve",
                entity_type, entity_id
            )));
        }

        let now = self.clock.now();
        let mut conflict = SyncConflict {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            local_version: local.clone(),
            remote_version: remote.clone(),
            detected_at: now,
            resolved_at: None,
            resolution_strategy: None,
        };

        let skew = local.updated_at - remote.updated_at;
        let distance = if skew < ChronoDuration::zero() { -skew } else { skew };
        if distance <= self.tolerance {
            warn!(
                conflict_id = %conflict.id,
                entity_type,
                entity_id,
                skew_ms = skew.num_milliseconds(),
                "Concurrent edits; conflict needs manual resolution"
            );
        } else {
            let strategy = if skew > ChronoDuration::zero() {
                ResolutionStrategy::LocalWins
            } else {
                ResolutionStrategy::RemoteWins
            };
            conflict.stamp_resolution(strategy, now)?;
            info!(
                conflict_id = %conflict.id,
                entity_type,
                entity_id,
                strategy = ?strategy,
                "Conflict resolved by last write"
            );
        }

        self.save(&conflict).await?;
        Ok(conflict)
    }

    /// Settle an open conflict by hand
    pub async fn resolve_manually(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<SyncConflict, SyncError> {
        let mut conflict = self
            .get(conflict_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;

        conflict.stamp_resolution(strategy, self.clock.now())?;
        self.save(&conflict).await?;

        info!(conflict_id, strategy = ?strategy, "Conflict resolved manually");
        Ok(conflict)
    }

    pub async fn get(&self, conflict_id: &str) -> Result<Option<SyncConflict>, SyncError> {
        Ok(get_record(self.store.as_ref(), Collection::SyncConflicts, conflict_id).await?)
    }

    /// Conflicts awaiting manual resolution, oldest first
    pub async fn unresolved(&self) -> Result<Vec<SyncConflict>, SyncError> {
        Ok(query_records(
            self.store.as_ref(),
            Collection::SyncConflicts,
            &Filter::all().eq("resolved_at", Value::Null),
            &OrderBy::asc("detected_at"),
        )
        .await?)
    }

    /// The open conflict for one entity, if any
    pub async fn open_conflict_for(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<SyncConflict>, SyncError> {
        let open: Vec<SyncConflict> = query_records(
            self.store.as_ref(),
            Collection::SyncConflicts,
            &Filter::all()
                .eq("entity_type", entity_type)
                .eq("entity_id", entity_id)
                .eq("resolved_at", Value::Null),
            &OrderBy::asc("detected_at"),
        )
        .await?;
        Ok(open.into_iter().next())
    }

    /// Full audit trail, oldest first
    pub async fn list(&self) -> Result<Vec<SyncConflict>, SyncError> {
        Ok(query_records(
            self.store.as_ref(),
            Collection::SyncConflicts,
            &Filter::all(),
            &OrderBy::asc("detected_at"),
        )
        .await?)
    }

    async fn save(&self, conflict: &SyncConflict) -> Result<(), SyncError> {
        put_record(self.store.as_ref(), Collection::SyncConflicts, &conflict.id, conflict).await?;
        Ok(())
    }
}
