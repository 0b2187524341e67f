//! Crash recovery for items orphaned in Processing.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::Clock;
use crate::domain::{FailureTag, QueueItem, QueueStatus, SyncError};
use crate::store::{put_record, query_records, Collection, Filter, LocalStore, OrderBy};

/// What recovery did with each orphan
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Reset to Pending (source intact)
    pub recovered: Vec<QueueItem>,

    /// Marked Failed with `SourceMissingAfterCrash`
    pub failed: Vec<QueueItem>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.failed.is_empty()
    }
}

/// Startup scan over the queue collection
pub struct CrashRecovery {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
}

impl CrashRecovery {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RecoveryReport, SyncError> {
        let orphans: Vec<QueueItem> = query_records(
            self.store.as_ref(),
            Collection::QueueItems,
            &Filter::all().eq("status", QueueStatus::Processing.as_str()),
            &OrderBy::asc("created_at"),
        )
        .await?;

        let mut report = RecoveryReport::default();

        for mut item in orphans {
            item.updated_at = self.clock.now();

            if source_intact(&item.source_path).await {
                item.status = QueueStatus::Pending;
                item.next_attempt_at = None;
                info!(item_id = %item.id, capture_id = %item.capture_id, "Recovered orphaned item");
                put_record(self.store.as_ref(), Collection::QueueItems, &item.id, &item).await?;
                report.recovered.push(item);
            } else {
                item.status = QueueStatus::Failed;
                item.failure_tag = Some(FailureTag::SourceMissingAfterCrash);
                item.last_error = Some(format!(
                    "source missing after crash: {}",
                    item.source_path.display()
                ));
                warn!(
                    item_id = %item.id,
                    path = %item.source_path.display(),
                    "Orphaned item lost its source"
                );
                put_record(self.store.as_ref(), Collection::QueueItems, &item.id, &item).await?;
                report.failed.push(item);
            }
        }

        info!(
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            "Crash recovery finished"
        );
        Ok(report)
    }
}

/// A source is usable if it is a non-empty regular file
async fn source_intact(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}
