//! Durable processing queue.
//!
//! Items live in the `queue_items` collection and every transition is a
//! read-latest, write-back upsert. Guarantees:
//! - at most one non-terminal item per capture
//! - at most one item `Processing` at a time
//! - FIFO hand-out by `created_at`
//! - nothing is handed out before crash recovery has run

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::recovery::{CrashRecovery, RecoveryReport};
use crate::core::{Clock, RetryPolicy};
use crate::domain::{FailureTag, QueueItem, QueueStatus, SyncError};
use crate::store::{get_record, put_record, query_records, Collection, Filter, LocalStore, OrderBy};

/// Queue behaviour knobs
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// `max_attempts` bounds `retry_count`; delays come from `backoff_for`
    pub retry: RetryPolicy,

    /// Keep Completed items instead of deleting them
    pub retain_completed: bool,
}

/// Item counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Capture processing queue
pub struct ProcessingQueue {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    paused: AtomicBool,
    recovered: AtomicBool,

    /// Serializes read-modify-write sequences
    write_lock: Mutex<()>,
}

impl ProcessingQueue {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
            paused: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue a capture for processing
    pub async fn enqueue(
        &self,
        capture_id: &str,
        source_path: impl Into<PathBuf>,
        source_duration: Option<f64>,
    ) -> Result<QueueItem, SyncError> {
        let source_path = source_path.into();
        if capture_id.trim().is_empty() {
            return Err(SyncError::Validation("capture id must not be empty".to_string()));
        }
        if source_path.as_os_str().is_empty() {
            return Err(SyncError::Validation("source path must not be empty".to_string()));
        }
        if let Some(duration) = source_duration {
            if !duration.is_finite() || duration < 0.0 {
                return Err(SyncError::Validation(format!(
                    "invalid source duration: {}",
                    duration
                )));
            }
        }

        let _guard = self.write_lock.lock().await;

        if let Some(active) = self.active_for_capture(capture_id).await? {
            return Err(SyncError::Validation(format!(
                "capture {} already queued as {} ({})",
                capture_id,
                active.id,
                active.status.as_str()
            )));
        }

        let item = QueueItem::new(
            uuid::Uuid::new_v4().to_string(),
            capture_id.to_string(),
            source_path,
            source_duration,
            self.clock.now(),
        );
        self.save(&item).await?;

        info!(item_id = %item.id, capture_id, "Enqueued capture");
        Ok(item)
    }

    /// Hand out the oldest ready Pending item, moving it to Processing.
    ///
    /// Returns `None` when paused, when another item is Processing, or
    /// when nothing is ready.
    pub async fn dequeue_next(&self) -> Result<Option<QueueItem>, SyncError> {
        if !self.recovered.load(Ordering::SeqCst) {
            return Err(SyncError::RecoveryPending);
        }
        if self.is_paused() {
            debug!("Queue paused; not dequeuing");
            return Ok(None);
        }

        let _guard = self.write_lock.lock().await;

        if !self.items_with_status(QueueStatus::Processing).await?.is_empty() {
            debug!("An item is already processing");
            return Ok(None);
        }

        let now = self.clock.now();
        let next = self
            .items_with_status(QueueStatus::Pending)
            .await?
            .into_iter()
            .find(|item| item.is_ready(now));

        let Some(mut item) = next else {
            return Ok(None);
        };

        item.status = QueueStatus::Processing;
        item.next_attempt_at = None;
        item.updated_at = self.clock.now();
        self.save(&item).await?;

        info!(item_id = %item.id, capture_id = %item.capture_id, retry_count = item.retry_count, "Dequeued capture");
        Ok(Some(item))
    }

    /// Finish a Processing item successfully
    pub async fn mark_completed(&self, id: &str) -> Result<QueueItem, SyncError> {
        let _guard = self.write_lock.lock().await;

        let mut item = self.require(id).await?;
        ensure_processing(&item, QueueStatus::Completed)?;

        item.status = QueueStatus::Completed;
        item.last_error = None;
        item.updated_at = self.clock.now();

        if self.config.retain_completed {
            self.save(&item).await?;
        } else {
            self.store.delete(Collection::QueueItems, &item.id).await?;
        }

        info!(item_id = %item.id, capture_id = %item.capture_id, "Capture processed");
        Ok(item)
    }

    /// Record a failed attempt.
    ///
    /// Retryable errors go back to Pending behind a backoff gate until
    /// `retry_count` reaches the limit; everything else is terminal.
    pub async fn mark_failed(&self, id: &str, error: &SyncError) -> Result<QueueItem, SyncError> {
        let _guard = self.write_lock.lock().await;

        let mut item = self.require(id).await?;
        ensure_processing(&item, QueueStatus::Failed)?;

        let now = self.clock.now();
        item.retry_count += 1;
        item.last_error = Some(error.to_string());
        item.updated_at = now;

        let policy = &self.config.retry;
        if !error.is_retryable() {
            item.status = QueueStatus::Failed;
            item.failure_tag = Some(FailureTag::PermanentError);
            warn!(item_id = %item.id, error = %error, "Capture failed permanently");
        } else if policy.should_retry(item.retry_count) {
            let delay = policy.backoff_for(item.retry_count);
            item.status = QueueStatus::Pending;
            item.next_attempt_at = Some(
                now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero()),
            );
            warn!(
                item_id = %item.id,
                retry_count = item.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Capture failed; will retry"
            );
        } else {
            item.status = QueueStatus::Failed;
            item.failure_tag = Some(FailureTag::RetriesExhausted);
            warn!(
                item_id = %item.id,
                retry_count = item.retry_count,
                error = %error,
                "Capture failed; retries exhausted"
            );
        }

        self.save(&item).await?;
        Ok(item)
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Queue paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Queue resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Reclassify items orphaned in Processing by a previous process.
    ///
    /// Runs once; `dequeue_next` refuses work until it has.
    pub async fn recover(&self) -> Result<RecoveryReport, SyncError> {
        let _guard = self.write_lock.lock().await;

        if self.recovered.load(Ordering::SeqCst) {
            return Err(SyncError::Validation(
                "crash recovery already ran for this queue".to_string(),
            ));
        }

        let report = CrashRecovery::new(self.store.clone(), self.clock.clone())
            .run()
            .await?;
        self.recovered.store(true, Ordering::SeqCst);
        Ok(report)
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered.load(Ordering::SeqCst)
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueueItem>, SyncError> {
        Ok(get_record(self.store.as_ref(), Collection::QueueItems, id).await?)
    }

    /// Items in FIFO order, optionally restricted to one status
    pub async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueItem>, SyncError> {
        let filter = match status {
            Some(status) => Filter::all().eq("status", status.as_str()),
            None => Filter::all(),
        };
        Ok(query_records(
            self.store.as_ref(),
            Collection::QueueItems,
            &filter,
            &OrderBy::asc("created_at"),
        )
        .await?)
    }

    pub async fn status(&self) -> Result<QueueCounts, SyncError> {
        let mut counts = QueueCounts::default();
        for item in self.list(None).await? {
            match item.status {
                QueueStatus::Pending => counts.pending += 1,
                QueueStatus::Processing => counts.processing += 1,
                QueueStatus::Completed => counts.completed += 1,
                QueueStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Delete a terminal item
    pub async fn purge(&self, id: &str) -> Result<QueueItem, SyncError> {
        let _guard = self.write_lock.lock().await;

        let item = self.require(id).await?;
        if !item.status.is_terminal() {
            return Err(SyncError::InvalidTransition {
                from: item.status.as_str(),
                to: "purged",
            });
        }
        self.store.delete(Collection::QueueItems, id).await?;

        info!(item_id = %id, capture_id = %item.capture_id, "Purged queue item");
        Ok(item)
    }

    /// Queue a fresh attempt for the capture of a Failed item.
    ///
    /// The failed item stays as it is.
    pub async fn retry_failed(&self, id: &str) -> Result<QueueItem, SyncError> {
        let _guard = self.write_lock.lock().await;

        let failed = self.require(id).await?;
        if failed.status != QueueStatus::Failed {
            return Err(SyncError::InvalidTransition {
                from: failed.status.as_str(),
                to: "pending",
            });
        }
        if let Some(active) = self.active_for_capture(&failed.capture_id).await? {
            return Err(SyncError::Validation(format!(
                "capture {} already queued as {}",
                failed.capture_id, active.id
            )));
        }

        let item = QueueItem::new(
            uuid::Uuid::new_v4().to_string(),
            failed.capture_id.clone(),
            failed.source_path.clone(),
            failed.source_duration,
            self.clock.now(),
        );
        self.save(&item).await?;

        info!(item_id = %item.id, previous = %failed.id, "Manual retry queued");
        Ok(item)
    }

    async fn require(&self, id: &str) -> Result<QueueItem, SyncError> {
        self.get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("queue item {}", id)))
    }

    async fn items_with_status(&self, status: QueueStatus) -> Result<Vec<QueueItem>, SyncError> {
        self.list(Some(status)).await
    }

    async fn active_for_capture(&self, capture_id: &str) -> Result<Option<QueueItem>, SyncError> {
        let items: Vec<QueueItem> = query_records(
            self.store.as_ref(),
            Collection::QueueItems,
            &Filter::all().eq("capture_id", capture_id),
            &OrderBy::asc("created_at"),
        )
        .await?;
        Ok(items.into_iter().find(|item| !item.status.is_terminal()))
    }

    async fn save(&self, item: &QueueItem) -> Result<(), SyncError> {
        put_record(self.store.as_ref(), Collection::QueueItems, &item.id, item).await?;
        Ok(())
    }
}

fn ensure_processing(item: &QueueItem, to: QueueStatus) -> Result<(), SyncError> {
    if item.status != QueueStatus::Processing {
        return Err(SyncError::InvalidTransition {
            from: item.status.as_str(),
            to: to.as_str(),
        });
    }
    Ok(())
}
