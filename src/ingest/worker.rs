//! Queue worker: dequeue, process, record the outcome.
//!
//! Before a capture is marked completed the worker hands the result to the
//! sync side: the transcript becomes a local entity change and the source
//! file is registered for upload. A failed hand-off counts as a failed
//! attempt. Once the item completes a sync is requested.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::processor::{CaptureProcessor, ProcessingOutput};
use super::queue::ProcessingQueue;
use crate::core::{EntityStore, SyncTrigger};
use crate::domain::{QueueItem, SyncError, SyncRequest};
use crate::upload::ChunkedUploader;

/// Entity type used for processed captures
pub const CAPTURE_ENTITY: &str = "capture";

/// Result of one worker step
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    /// Nothing ready (empty, paused, or backing off)
    Idle,

    Completed(QueueItem),

    /// Attempt failed; the item is Pending again or terminally Failed
    Failed { item: QueueItem, error: String },
}

/// Totals from draining the queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub failed: usize,
}

/// Drives the queue through a capture processor
pub struct QueueWorker {
    queue: Arc<ProcessingQueue>,
    processor: Arc<dyn CaptureProcessor>,
    entities: Option<Arc<EntityStore>>,
    uploader: Option<Arc<ChunkedUploader>>,
    sync_trigger: Option<Arc<dyn SyncTrigger>>,
}

impl QueueWorker {
    pub fn new(queue: Arc<ProcessingQueue>, processor: Arc<dyn CaptureProcessor>) -> Self {
        Self {
            queue,
            processor,
            entities: None,
            uploader: None,
            sync_trigger: None,
        }
    }

    /// Record transcripts as local entity changes
    pub fn with_entities(mut self, entities: Arc<EntityStore>) -> Self {
        self.entities = Some(entities);
        self
    }

    /// Register processed sources for chunked upload
    pub fn with_uploader(mut self, uploader: Arc<ChunkedUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Request a sync after each completed capture
    pub fn with_sync_trigger(mut self, trigger: Arc<dyn SyncTrigger>) -> Self {
        self.sync_trigger = Some(trigger);
        self
    }

    /// Process at most one item
    pub async fn process_next(&self) -> Result<WorkOutcome, SyncError> {
        let Some(item) = self.queue.dequeue_next().await? else {
            return Ok(WorkOutcome::Idle);
        };

        match self.processor.process(&item).await {
            Ok(output) => {
                // The queue item is the only record of the capture until the
                // hand-off is durable, so it completes last
                if let Err(error) = self.hand_off(&item, &output).await {
                    warn!(item_id = %item.id, error = %error, "Hand-off failed; capture stays queued");
                    return self.fail(&item, error).await;
                }
                let done = self.queue.mark_completed(&item.id).await?;
                self.request_sync();
                Ok(WorkOutcome::Completed(done))
            }
            Err(error) => self.fail(&item, error).await,
        }
    }

    async fn fail(&self, item: &QueueItem, error: SyncError) -> Result<WorkOutcome, SyncError> {
        let failed = self.queue.mark_failed(&item.id, &error).await?;
        Ok(WorkOutcome::Failed {
            item: failed,
            error: error.to_string(),
        })
    }

    /// Process until nothing is ready or `limit` items were handled
    pub async fn drain(&self, limit: Option<usize>) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();

        while limit.map_or(true, |limit| report.completed + report.failed < limit) {
            match self.process_next().await? {
                WorkOutcome::Idle => break,
                WorkOutcome::Completed(_) => report.completed += 1,
                WorkOutcome::Failed { .. } => report.failed += 1,
            }
        }

        Ok(report)
    }

    /// Keep draining, sleeping `poll` between empty rounds, until `stop` flips
    pub async fn run(&self, poll: Duration, mut stop: watch::Receiver<bool>) -> Result<DrainReport, SyncError> {
        let mut total = DrainReport::default();

        loop {
            let round = self.drain(None).await?;
            total.completed += round.completed;
            total.failed += round.failed;

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }

        info!(completed = total.completed, failed = total.failed, "Worker stopped");
        Ok(total)
    }

    /// Persist the transcript and register the source for upload
    async fn hand_off(&self, item: &QueueItem, output: &ProcessingOutput) -> Result<(), SyncError> {
        if let Some(entities) = &self.entities {
            let payload = json!({
                "capture_id": item.capture_id,
                "text": output.text,
                "language": output.language,
                "duration_seconds": output.duration_seconds,
            });
            entities
                .record_local_change(CAPTURE_ENTITY, &item.capture_id, payload)
                .await?;
        }

        if let Some(uploader) = &self.uploader {
            let meta = tokio::fs::metadata(&item.source_path)
                .await
                .map_err(|e| SyncError::from_io(&e, "stat processed source"))?;
            match uploader
                .register(&item.id, &item.capture_id, &item.source_path, meta.len())
                .await
            {
                Ok(_) => {}
                // An earlier item for this capture is still uploading
                Err(e @ SyncError::Validation(_)) => {
                    warn!(capture_id = %item.capture_id, error = %e, "Upload not registered");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn request_sync(&self) {
        if let Some(trigger) = &self.sync_trigger {
            let trigger = trigger.clone();
            tokio::spawn(async move {
                match trigger.request_sync(SyncRequest::manual()).await {
                    Ok(outcome) => debug!(?outcome, "Post-capture sync finished"),
                    Err(e) => warn!(error = %e, "Post-capture sync failed"),
                }
            });
        }
    }
}
