//! Sync orchestrator.
//!
//! Decides when a sync pass runs and carries it out:
//! 1. drain pending chunked uploads
//! 2. push dirty local entities
//! 3. pull remote changes, reconciling divergence through the resolver
//!
//! Passes never overlap. A request that arrives while a pass is running
//! waits for that pass and shares its report.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::periodic::{PeriodicTrigger, SyncTrigger};
use super::{lock_unpoisoned, AuthToken, Clock, ConflictResolver, EntityStore};
use crate::adapters::{NetworkObserver, PushOutcome, SyncRemote};
use crate::domain::{
    EntityRecord, ErrorClass, ResolutionStrategy, SyncConflict, SyncError, SyncOutcome,
    SyncReport, SyncRequest, SyncState, SyncStatus,
};
use crate::upload::ChunkedUploader;

/// Scheduling knobs
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Periodic trigger interval
    pub periodic_interval: Duration,

    /// How often connectivity is polled for reconnect detection
    pub reconnect_poll: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            periodic_interval: Duration::from_secs(15 * 60),
            reconnect_poll: Duration::from_secs(5),
        }
    }
}

/// `None` while running; then `Some(report)` on success, `Some(None)` on failure
type PassResult = Option<Option<SyncReport>>;

enum Role {
    Leader(watch::Sender<PassResult>),
    Follower(watch::Receiver<PassResult>),
}

struct Running {
    periodic: PeriodicTrigger,
    stop_tx: watch::Sender<bool>,
    _monitor: JoinHandle<()>,
}

/// Runs sync passes and the triggers that request them
pub struct SyncOrchestrator {
    network: Arc<dyn NetworkObserver>,
    uploader: Arc<ChunkedUploader>,
    remote: Arc<dyn SyncRemote>,
    entities: Arc<EntityStore>,
    resolver: Arc<ConflictResolver>,
    auth: Arc<AuthToken>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,

    in_flight: Mutex<Option<watch::Receiver<PassResult>>>,
    status: Mutex<SyncStatus>,
    running: Mutex<Option<Running>>,
    token_ready: Notify,

    /// Newest remote `updated_at` applied so far
    pull_cursor: Mutex<Option<DateTime<Utc>>>,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: Arc<dyn NetworkObserver>,
        uploader: Arc<ChunkedUploader>,
        remote: Arc<dyn SyncRemote>,
        entities: Arc<EntityStore>,
        resolver: Arc<ConflictResolver>,
        auth: Arc<AuthToken>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            network,
            uploader,
            remote,
            entities,
            resolver,
            auth,
            clock,
            config,
            in_flight: Mutex::new(None),
            status: Mutex::new(SyncStatus::default()),
            running: Mutex::new(None),
            token_ready: Notify::new(),
            pull_cursor: Mutex::new(None),
        }
    }

    /// Supply credentials; wakes the startup sync if it is waiting
    pub fn set_auth_token(&self, token: impl Into<String>) {
        self.auth.set(token);
        if self.auth.is_set() {
            info!("Auth token set");
            self.token_ready.notify_one();
        }
    }

    pub fn clear_auth_token(&self) {
        self.auth.clear();
    }

    /// Run one sync pass, or join the one already running
    #[instrument(skip(self), fields(priority = ?request.priority, source = ?request.source))]
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncOutcome, SyncError> {
        let Some(token) = self.auth.get() else {
            warn!("Sync requested without an auth token");
            return Err(SyncError::Unauthenticated);
        };

        if !self.network.is_connected().await {
            debug!("Offline; sync skipped");
            self.update_status(|status| status.state = SyncState::Offline);
            return Ok(SyncOutcome::NetworkUnavailable);
        }

        let tx = match self.claim_pass() {
            Role::Follower(rx) => {
                debug!("Sync already in flight; joining it");
                return Ok(SyncOutcome::Coalesced(wait_for_pass(rx).await));
            }
            Role::Leader(tx) => tx,
        };

        info!("Sync pass started");
        self.update_status(|status| status.state = SyncState::Syncing);

        let result = self.run_pass(&token).await;

        *lock_unpoisoned(&self.in_flight) = None;
        let _ = tx.send(Some(result.as_ref().ok().cloned()));

        let pending = self.pending_count().await.ok();
        match result {
            Ok(report) => {
                let now = self.clock.now();
                self.update_status(|status| {
                    status.state = SyncState::Idle;
                    status.last_sync_at = Some(now);
                    status.last_error = None;
                    if let Some(pending) = pending {
                        status.pending_count = pending;
                    }
                });
                info!(
                    uploaded = report.uploaded,
                    pushed = report.pushed,
                    downloaded = report.downloaded,
                    conflicts = report.conflicts,
                    deferred = report.deferred_uploads,
                    "Sync pass finished"
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(SyncError::NetworkUnavailable) => {
                info!("Connectivity lost during sync; will resume on reconnect");
                self.update_status(|status| status.state = SyncState::Offline);
                Ok(SyncOutcome::NetworkUnavailable)
            }
            Err(e) => {
                warn!(error = %e, "Sync pass failed");
                let message = e.to_string();
                self.update_status(|status| {
                    status.state = SyncState::Error;
                    status.last_error = Some(message);
                    if let Some(pending) = pending {
                        status.pending_count = pending;
                    }
                });
                Err(e)
            }
        }
    }

    /// Ask for a high-priority sync after a local change worth sharing
    pub async fn notify_local_change(&self) -> Result<SyncOutcome, SyncError> {
        self.sync(SyncRequest::manual()).await
    }

    /// Last known status (cheap; no store access)
    pub fn current_status(&self) -> SyncStatus {
        lock_unpoisoned(&self.status).clone()
    }

    /// Recount pending work and return the fresh status
    pub async fn refresh_status(&self) -> Result<SyncStatus, SyncError> {
        let pending = self.pending_count().await?;
        self.update_status(|status| status.pending_count = pending);
        Ok(self.current_status())
    }

    /// Settle an open conflict and apply the chosen version locally.
    ///
    /// `Merged` requires the merged payload.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        merged_payload: Option<Value>,
    ) -> Result<SyncConflict, SyncError> {
        if strategy == ResolutionStrategy::Merged && merged_payload.is_none() {
            return Err(SyncError::Validation(
                "a merged resolution needs the merged payload".to_string(),
            ));
        }

        let conflict = self.resolver.resolve_manually(conflict_id, strategy).await?;
        let remote = &conflict.remote_version;

        match strategy {
            ResolutionStrategy::RemoteWins => {
                // Newer server edits were held back by the pull cursor and
                // land on the next pass
                self.entities.apply_remote(remote).await?;
            }
            ResolutionStrategy::LocalWins => {
                // Later local edits supersede the snapshot on the conflict
                let local = self
                    .entities
                    .get(&conflict.entity_type, &conflict.entity_id)
                    .await?
                    .filter(|current| current.dirty)
                    .unwrap_or_else(|| conflict.local_version.clone());
                self.entities.rebase(&local, &remote.version).await?;
            }
            ResolutionStrategy::Merged => {
                let payload = merged_payload.unwrap_or(Value::Null);
                self.entities
                    .record_merge(&conflict.entity_type, &conflict.entity_id, payload, &remote.version)
                    .await?;
            }
        }

        Ok(conflict)
    }

    /// Start the periodic trigger and the startup/reconnect monitor.
    ///
    /// Calling it again while started does nothing.
    pub fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        let mut running = lock_unpoisoned(&self.running);
        if running.is_some() {
            debug!("Orchestrator already started");
            return Ok(());
        }

        let target: Arc<dyn SyncTrigger> = self.clone();
        let periodic = PeriodicTrigger::new(self.config.periodic_interval, self.network.clone(), target)?;
        periodic.start();

        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = tokio::spawn(self.clone().monitor(stop_rx));

        *running = Some(Running {
            periodic,
            stop_tx,
            _monitor: monitor,
        });
        info!("Orchestrator started");
        Ok(())
    }

    /// Cancel future triggers; a pass already running is left to finish
    pub fn stop(&self) {
        let Some(running) = lock_unpoisoned(&self.running).take() else {
            return;
        };
        running.periodic.stop();
        let _ = running.stop_tx.send(true);
        info!("Orchestrator stopped");
    }

    pub fn is_started(&self) -> bool {
        lock_unpoisoned(&self.running).is_some()
    }

    fn claim_pass(&self) -> Role {
        let mut in_flight = lock_unpoisoned(&self.in_flight);
        if let Some(rx) = in_flight.as_ref() {
            // A dropped leader leaves a closed channel behind
            if rx.has_changed().is_ok() {
                return Role::Follower(rx.clone());
            }
        }
        let (tx, rx) = watch::channel(None);
        *in_flight = Some(rx);
        Role::Leader(tx)
    }

    async fn run_pass(&self, token: &str) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        self.drain_uploads(&mut report).await?;
        self.push_changes(token, &mut report).await?;
        self.pull_changes(token, &mut report).await?;

        Ok(report)
    }

    async fn drain_uploads(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        for record in self.uploader.pending().await? {
            match self.uploader.resume_upload(&record.upload_id).await {
                Ok(_) => report.uploaded += 1,
                Err(e) => match e.class() {
                    ErrorClass::NetworkUnavailable | ErrorClass::Unauthenticated => return Err(e),
                    _ => {
                        warn!(upload_id = %record.upload_id, error = %e, "Upload deferred");
                        report.deferred_uploads += 1;
                    }
                },
            }
        }
        Ok(())
    }

    async fn push_changes(&self, token: &str, report: &mut SyncReport) -> Result<(), SyncError> {
        for entity in self.entities.dirty().await? {
            if self
                .resolver
                .open_conflict_for(&entity.entity_type, &entity.entity_id)
                .await?
                .is_some()
            {
                debug!(entity = %entity.key(), "Open conflict; not pushing");
                continue;
            }

            match self.remote.push_entity(token, &entity).await? {
                PushOutcome::Accepted => {
                    self.entities.mark_clean(&entity).await?;
                    report.pushed += 1;
                }
                PushOutcome::Conflict(remote) if remote.version == entity.version => {
                    self.entities.mark_clean(&entity).await?;
                    report.pushed += 1;
                }
                PushOutcome::Conflict(remote) => {
                    self.reconcile(token, &entity, &remote, report).await?;
                }
            }
        }
        Ok(())
    }

    async fn pull_changes(&self, token: &str, report: &mut SyncReport) -> Result<(), SyncError> {
        let since = *lock_unpoisoned(&self.pull_cursor);
        let changes = self.remote.pull_changes(token, since).await?;
        let mut newest = since;
        // Oldest change skipped behind an open conflict; the cursor stays below it
        let mut held: Option<DateTime<Utc>> = None;

        for remote in changes {
            newest = newest.max(Some(remote.updated_at));

            match self.entities.get(&remote.entity_type, &remote.entity_id).await? {
                None => {
                    self.entities.apply_remote(&remote).await?;
                    report.downloaded += 1;
                }
                Some(local) if local.version == remote.version => {
                    if local.dirty {
                        self.entities.mark_clean(&local).await?;
                    }
                }
                Some(local) if !local.dirty => {
                    self.entities.apply_remote(&remote).await?;
                    report.downloaded += 1;
                }
                Some(local) => {
                    if self
                        .resolver
                        .open_conflict_for(&local.entity_type, &local.entity_id)
                        .await?
                        .is_some()
                    {
                        debug!(entity = %local.key(), "Open conflict; remote change held for next pull");
                        held = Some(held.map_or(remote.updated_at, |h| h.min(remote.updated_at)));
                        continue;
                    }
                    self.reconcile(token, &local, &remote, report).await?;
                }
            }
        }

        if let Some(held) = held {
            let below = held - ChronoDuration::microseconds(1);
            newest = Some(newest.map_or(below, |n| n.min(below)));
        }
        *lock_unpoisoned(&self.pull_cursor) = newest;
        Ok(())
    }

    /// Record the divergence and act on the resolver's verdict
    async fn reconcile(
        &self,
        token: &str,
        local: &EntityRecord,
        remote: &EntityRecord,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let conflict = self
            .resolver
            .resolve(&local.entity_type, &local.entity_id, local, remote)
            .await?;
        report.conflicts += 1;

        match conflict.resolution_strategy {
            Some(ResolutionStrategy::RemoteWins) => {
                self.entities.apply_remote(remote).await?;
                report.downloaded += 1;
            }
            Some(ResolutionStrategy::LocalWins) => {
                let rebased = self.entities.rebase(local, &remote.version).await?;
                match self.remote.push_entity(token, &rebased).await? {
                    PushOutcome::Accepted => {
                        self.entities.mark_clean(&rebased).await?;
                        report.pushed += 1;
                    }
                    PushOutcome::Conflict(_) => {
                        warn!(entity = %local.key(), "Server still rejects local version; retrying next pass");
                    }
                }
            }
            Some(ResolutionStrategy::Merged) | None => {
                info!(conflict_id = %conflict.id, entity = %local.key(), "Conflict awaiting manual resolution");
            }
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, SyncError> {
        let uploads = self.uploader.pending().await?.len();
        let entities = self.entities.dirty_count().await?;
        Ok(uploads + entities)
    }

    fn update_status(&self, apply: impl FnOnce(&mut SyncStatus)) {
        apply(&mut lock_unpoisoned(&self.status));
    }

    /// Startup sync once a token exists, then reconnect detection
    async fn monitor(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        while !self.auth.is_set() {
            tokio::select! {
                _ = self.token_ready.notified() => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return;
                    }
                }
            }
        }
        self.request_logged(SyncRequest::startup()).await;

        let poll = self.config.reconnect_poll;
        let mut ticker = interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut was_connected = self.network.is_connected().await;

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let connected = self.network.is_connected().await;
                    if connected && !was_connected {
                        info!("Connectivity restored");
                        self.request_logged(SyncRequest::reconnect()).await;
                    } else if !connected && was_connected {
                        info!("Connectivity lost");
                        self.update_status(|status| {
                            if status.state != SyncState::Syncing {
                                status.state = SyncState::Offline;
                            }
                        });
                    }
                    was_connected = connected;
                }
            }
        }
        debug!("Sync monitor exited");
    }

    async fn request_logged(&self, request: SyncRequest) {
        if let Err(e) = self.sync(request).await {
            warn!(source = ?request.source, error = %e, "Triggered sync failed");
        }
    }
}

#[async_trait]
impl SyncTrigger for SyncOrchestrator {
    async fn request_sync(&self, request: SyncRequest) -> Result<SyncOutcome, SyncError> {
        self.sync(request).await
    }
}

async fn wait_for_pass(mut rx: watch::Receiver<PassResult>) -> Option<SyncReport> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone().flatten();
        }
    }
}
