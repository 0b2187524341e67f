//! Sync Orchestrator Integration Tests
//!
//! Drives full sync passes against an in-process fake server: coalescing,
//! credential and connectivity gating, last-write-wins and manual conflict
//! resolution, upload draining, and the startup/reconnect triggers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tempfile::TempDir;

use capsync::adapters::{ChunkAck, PushOutcome, SharedNetworkState, SyncRemote, Transport};
use capsync::core::{
    AuthToken, ConflictResolver, EntityStore, ManualClock, OrchestratorConfig, SyncOrchestrator,
};
use capsync::domain::{
    EntityRecord, ResolutionStrategy, SyncError, SyncOutcome, SyncReport, SyncRequest, SyncState,
};
use capsync::store::{LocalStore, MemoryStore};
use capsync::upload::ChunkedUploader;

const TOKEN: &str = "token-123";

/// Versioned entity server; rejects pushes not based on its current copy
#[derive(Default)]
struct FakeServer {
    entities: Mutex<HashMap<String, EntityRecord>>,
    pushes: AtomicUsize,
    pulls: AtomicUsize,
    pull_delay: Duration,
}

impl FakeServer {
    fn with_pull_delay(pull_delay: Duration) -> Self {
        Self {
            pull_delay,
            ..Self::default()
        }
    }

    fn seed(&self, record: EntityRecord) {
        self.entities.lock().unwrap().insert(record.key(), record);
    }

    fn copy_of(&self, key: &str) -> Option<EntityRecord> {
        self.entities.lock().unwrap().get(key).cloned()
    }

    fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncRemote for FakeServer {
    async fn push_entity(&self, token: &str, entity: &EntityRecord) -> Result<PushOutcome, SyncError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if token != TOKEN {
            return Err(SyncError::Unauthenticated);
        }

        let mut entities = self.entities.lock().unwrap();
        if let Some(current) = entities.get(&entity.key()) {
            let based_on_current = entity.base_version.as_deref() == Some(current.version.as_str());
            if current.version != entity.version && !based_on_current {
                return Ok(PushOutcome::Conflict(current.clone()));
            }
        }

        let mut stored = entity.clone();
        stored.dirty = false;
        stored.base_version = None;
        entities.insert(stored.key(), stored);
        Ok(PushOutcome::Accepted)
    }

    async fn pull_changes(
        &self,
        token: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EntityRecord>, SyncError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if token != TOKEN {
            return Err(SyncError::Unauthenticated);
        }
        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }

        let mut changes: Vec<EntityRecord> = self
            .entities
            .lock()
            .unwrap()
            .values()
            .filter(|record| since.map_or(true, |since| record.updated_at > since))
            .cloned()
            .collect();
        changes.sort_by_key(|record| record.updated_at);
        Ok(changes)
    }
}

#[derive(Default)]
struct CountingTransport {
    chunks: AtomicUsize,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn post_chunk(&self, _: &str, _: u32, _: u32, _: Vec<u8>) -> Result<ChunkAck, SyncError> {
        self.chunks.fetch_add(1, Ordering::SeqCst);
        Ok(ChunkAck::accepted(None))
    }
}

struct Harness {
    orchestrator: Arc<SyncOrchestrator>,
    entities: Arc<EntityStore>,
    resolver: Arc<ConflictResolver>,
    uploader: Arc<ChunkedUploader>,
    transport: Arc<CountingTransport>,
    network: Arc<SharedNetworkState>,
    server: Arc<FakeServer>,
    start: DateTime<Utc>,
}

fn harness_with(server: FakeServer, config: OrchestratorConfig) -> Harness {
    let start = Utc::now();
    let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start));
    let network = Arc::new(SharedNetworkState::online());
    let server = Arc::new(server);
    let transport = Arc::new(CountingTransport::default());

    let entities = Arc::new(EntityStore::new(store.clone(), clock.clone()));
    let resolver = Arc::new(ConflictResolver::new(
        store.clone(),
        clock.clone(),
        Duration::from_secs(1),
    ));
    let uploader = Arc::new(ChunkedUploader::with_chunk_size(
        store,
        transport.clone(),
        clock.clone(),
        4,
    ));

    let orchestrator = Arc::new(SyncOrchestrator::new(
        network.clone(),
        uploader.clone(),
        server.clone(),
        entities.clone(),
        resolver.clone(),
        Arc::new(AuthToken::new()),
        clock,
        config,
    ));

    Harness {
        orchestrator,
        entities,
        resolver,
        uploader,
        transport,
        network,
        server,
        start,
    }
}

fn harness() -> Harness {
    harness_with(FakeServer::default(), OrchestratorConfig::default())
}

fn completed(outcome: SyncOutcome) -> SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed pass, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_pass() {
    let h = harness_with(
        FakeServer::with_pull_delay(Duration::from_secs(10)),
        OrchestratorConfig::default(),
    );
    h.orchestrator.set_auth_token(TOKEN);
    h.entities
        .record_local_change("capture", "cap-1", json!({"text": "hello"}))
        .await
        .unwrap();

    let (a, b, c) = tokio::join!(
        h.orchestrator.sync(SyncRequest::manual()),
        h.orchestrator.sync(SyncRequest::periodic()),
        h.orchestrator.sync(SyncRequest::reconnect()),
    );
    let outcomes = vec![a.unwrap(), b.unwrap(), c.unwrap()];

    let leaders: Vec<&SyncOutcome> = outcomes
        .iter()
        .filter(|o| matches!(o, SyncOutcome::Completed(_)))
        .collect();
    assert_eq!(leaders.len(), 1);

    let report = match leaders[0] {
        SyncOutcome::Completed(report) => report.clone(),
        _ => unreachable!(),
    };
    assert_eq!(report.pushed, 1);
    for outcome in &outcomes {
        if let SyncOutcome::Coalesced(shared) = outcome {
            assert_eq!(shared.as_ref(), Some(&report));
        }
    }

    assert_eq!(h.server.pulls(), 1);
    assert_eq!(h.server.pushes(), 1);

    // The next request runs a pass of its own
    completed(h.orchestrator.sync(SyncRequest::manual()).await.unwrap());
    assert_eq!(h.server.pulls(), 2);
}

#[tokio::test]
async fn test_sync_requires_token() {
    let h = harness();
    h.entities
        .record_local_change("capture", "cap-1", json!({"text": "hello"}))
        .await
        .unwrap();

    let err = h.orchestrator.sync(SyncRequest::manual()).await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthenticated));
    assert_eq!(h.server.pushes(), 0);
    assert_eq!(h.server.pulls(), 0);

    // A token the server rejects surfaces the same way
    h.orchestrator.set_auth_token("expired");
    let err = h.orchestrator.sync(SyncRequest::manual()).await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthenticated));

    let status = h.orchestrator.current_status();
    assert_eq!(status.state, SyncState::Error);
    assert!(status.last_error.is_some());
    assert_eq!(status.pending_count, 1);
    assert_eq!(h.entities.dirty_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_offline_sync_defers_everything() {
    let h = harness();
    h.orchestrator.set_auth_token(TOKEN);
    h.network.set_connected(false);
    h.entities
        .record_local_change("capture", "cap-1", json!({"text": "offline edit"}))
        .await
        .unwrap();

    let outcome = h.orchestrator.sync(SyncRequest::manual()).await.unwrap();
    assert_eq!(outcome, SyncOutcome::NetworkUnavailable);
    assert_eq!(h.orchestrator.current_status().state, SyncState::Offline);
    assert_eq!(h.server.pushes(), 0);
    assert_eq!(h.entities.dirty_count().await.unwrap(), 1);

    h.network.set_connected(true);
    let report = completed(h.orchestrator.sync(SyncRequest::reconnect()).await.unwrap());
    assert_eq!(report.pushed, 1);
    assert_eq!(h.entities.dirty_count().await.unwrap(), 0);
    assert!(h.server.copy_of("capture:cap-1").is_some());
}

#[tokio::test]
async fn test_newer_remote_edit_wins() {
    let h = harness();
    h.orchestrator.set_auth_token(TOKEN);

    let remote = EntityRecord::new(
        "capture",
        "cap-1",
        json!({"text": "edited on the web"}),
        h.start + ChronoDuration::seconds(10),
    );
    h.server.seed(remote.clone());
    h.entities
        .record_local_change("capture", "cap-1", json!({"text": "edited on the phone"}))
        .await
        .unwrap();

    let report = completed(h.orchestrator.sync(SyncRequest::manual()).await.unwrap());
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.pushed, 0);

    let local = h.entities.get("capture", "cap-1").await.unwrap().unwrap();
    assert_eq!(local.version, remote.version);
    assert!(!local.dirty);

    let conflicts = h.resolver.list().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(
        conflicts[0].resolution_strategy,
        Some(ResolutionStrategy::RemoteWins)
    );
    assert!(conflicts[0].resolved_at.is_some());
    // Both sides are kept for audit
    assert_eq!(conflicts[0].local_version.payload["text"], "edited on the phone");
    assert_eq!(conflicts[0].remote_version.payload["text"], "edited on the web");
}

#[tokio::test]
async fn test_newer_local_edit_wins() {
    let h = harness();
    h.orchestrator.set_auth_token(TOKEN);

    h.server.seed(EntityRecord::new(
        "capture",
        "cap-1",
        json!({"text": "stale server copy"}),
        h.start - ChronoDuration::seconds(60),
    ));
    let local = h
        .entities
        .record_local_change("capture", "cap-1", json!({"text": "fresh local edit"}))
        .await
        .unwrap();

    let report = completed(h.orchestrator.sync(SyncRequest::manual()).await.unwrap());
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.pushed, 1);

    let server_copy = h.server.copy_of("capture:cap-1").unwrap();
    assert_eq!(server_copy.version, local.version);
    assert_eq!(h.entities.dirty_count().await.unwrap(), 0);
    assert_eq!(
        h.resolver.list().await.unwrap()[0].resolution_strategy,
        Some(ResolutionStrategy::LocalWins)
    );
}

#[tokio::test]
async fn test_concurrent_edits_wait_for_manual_merge() {
    let h = harness();
    h.orchestrator.set_auth_token(TOKEN);

    let remote = EntityRecord::new(
        "capture",
        "cap-1",
        json!({"text": "web"}),
        h.start + ChronoDuration::milliseconds(200),
    );
    h.server.seed(remote.clone());
    h.entities
        .record_local_change("capture", "cap-1", json!({"text": "phone"}))
        .await
        .unwrap();

    let report = completed(h.orchestrator.sync(SyncRequest::manual()).await.unwrap());
    assert_eq!(report.conflicts, 1);

    let open = h.resolver.unresolved().await.unwrap();
    assert_eq!(open.len(), 1);
    assert!(open[0].resolution_strategy.is_none());
    assert!(h.entities.get("capture", "cap-1").await.unwrap().unwrap().dirty);

    // Open conflicts are neither pushed nor recorded again
    let pushes = h.server.pushes();
    let report = completed(h.orchestrator.sync(SyncRequest::manual()).await.unwrap());
    assert_eq!(report.conflicts, 0);
    assert_eq!(h.server.pushes(), pushes);
    assert_eq!(h.resolver.list().await.unwrap().len(), 1);

    let resolved = h
        .orchestrator
        .resolve_conflict(&open[0].id, ResolutionStrategy::Merged, Some(json!({"text": "phone + web"})))
        .await
        .unwrap();
    assert_eq!(resolved.resolution_strategy, Some(ResolutionStrategy::Merged));
    assert!(h.resolver.unresolved().await.unwrap().is_empty());

    // A resolution is stamped once
    let again = h
        .orchestrator
        .resolve_conflict(&open[0].id, ResolutionStrategy::RemoteWins, None)
        .await;
    assert!(matches!(again, Err(SyncError::Validation(_))));

    let report = completed(h.orchestrator.sync(SyncRequest::manual()).await.unwrap());
    assert_eq!(report.pushed, 1);
    assert_eq!(
        h.server.copy_of("capture:cap-1").unwrap().payload["text"],
        "phone + web"
    );
    assert_eq!(h.entities.dirty_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_manual_remote_wins_discards_local_edit() {
    let h = harness();
    h.orchestrator.set_auth_token(TOKEN);

    let remote = EntityRecord::new("capture", "cap-1", json!({"text": "web"}), h.start);
    h.server.seed(remote.clone());
    h.entities
        .record_local_change("capture", "cap-1", json!({"text": "phone"}))
        .await
        .unwrap();
    completed(h.orchestrator.sync(SyncRequest::manual()).await.unwrap());

    let open = h.resolver.unresolved().await.unwrap();
    assert_eq!(open.len(), 1);

    h.orchestrator
        .resolve_conflict(&open[0].id, ResolutionStrategy::RemoteWins, None)
        .await
        .unwrap();

    let local = h.entities.get("capture", "cap-1").await.unwrap().unwrap();
    assert_eq!(local.version, remote.version);
    assert!(!local.dirty);
}

#[tokio::test]
async fn test_server_edit_during_open_conflict_is_not_lost() {
    let h = harness();
    h.orchestrator.set_auth_token(TOKEN);

    h.server.seed(EntityRecord::new(
        "capture",
        "cap-1",
        json!({"text": "web v1"}),
        h.start + ChronoDuration::milliseconds(200),
    ));
    h.entities
        .record_local_change("capture", "cap-1", json!({"text": "phone"}))
        .await
        .unwrap();
    completed(h.orchestrator.sync(SyncRequest::manual()).await.unwrap());

    let open = h.resolver.unresolved().await.unwrap();
    assert_eq!(open.len(), 1);

    // The server moves on while the conflict is still open
    let newer = EntityRecord::new(
        "capture",
        "cap-1",
        json!({"text": "web v2"}),
        h.start + ChronoDuration::seconds(60),
    );
    h.server.seed(newer.clone());
    let report = completed(h.orchestrator.sync(SyncRequest::periodic()).await.unwrap());
    assert_eq!(report.downloaded, 0);

    h.orchestrator
        .resolve_conflict(&open[0].id, ResolutionStrategy::RemoteWins, None)
        .await
        .unwrap();

    let report = completed(h.orchestrator.sync(SyncRequest::periodic()).await.unwrap());
    assert_eq!(report.downloaded, 1);
    completed(h.orchestrator.sync(SyncRequest::periodic()).await.unwrap());

    let local = h.entities.get("capture", "cap-1").await.unwrap().unwrap();
    assert_eq!(local.version, newer.version);
    assert_eq!(local.payload["text"], "web v2");
    assert!(!local.dirty);
    assert_eq!(h.server.copy_of("capture:cap-1").unwrap().version, newer.version);
}

#[tokio::test]
async fn test_pull_applies_only_new_changes() {
    let h = harness();
    h.orchestrator.set_auth_token(TOKEN);

    for id in ["cap-1", "cap-2"] {
        h.server.seed(EntityRecord::new(
            "capture",
            id,
            json!({"text": format!("server {}", id)}),
            h.start - ChronoDuration::seconds(30),
        ));
    }

    let report = completed(h.orchestrator.sync(SyncRequest::startup()).await.unwrap());
    assert_eq!(report.downloaded, 2);
    assert_eq!(h.entities.list().await.unwrap().len(), 2);

    let report = completed(h.orchestrator.sync(SyncRequest::periodic()).await.unwrap());
    assert_eq!(report.downloaded, 0);

    h.server.seed(EntityRecord::new(
        "capture",
        "cap-1",
        json!({"text": "server cap-1, edited"}),
        h.start,
    ));
    let report = completed(h.orchestrator.sync(SyncRequest::periodic()).await.unwrap());
    assert_eq!(report.downloaded, 1);
    assert_eq!(
        h.entities.get("capture", "cap-1").await.unwrap().unwrap().payload["text"],
        "server cap-1, edited"
    );
}

#[tokio::test]
async fn test_pass_drains_pending_uploads() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("memo.m4a");
    std::fs::write(&file, vec![1u8; 10]).unwrap();

    let h = harness();
    h.orchestrator.set_auth_token(TOKEN);
    h.uploader.register("up-1", "cap-1", &file, 10).await.unwrap();
    assert_eq!(h.orchestrator.refresh_status().await.unwrap().pending_count, 1);

    let report = completed(h.orchestrator.sync(SyncRequest::manual()).await.unwrap());
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.deferred_uploads, 0);
    assert_eq!(h.transport.chunks.load(Ordering::SeqCst), 3);
    assert!(h.uploader.pending().await.unwrap().is_empty());
    assert_eq!(h.orchestrator.current_status().pending_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_waits_for_token_then_watches_connectivity() {
    let h = harness_with(
        FakeServer::default(),
        OrchestratorConfig {
            periodic_interval: Duration::from_secs(3600),
            reconnect_poll: Duration::from_secs(5),
        },
    );

    h.orchestrator.start().unwrap();
    h.orchestrator.start().unwrap();
    assert!(h.orchestrator.is_started());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.server.pulls(), 0);

    // Startup sync runs as soon as credentials arrive
    h.orchestrator.set_auth_token(TOKEN);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.server.pulls(), 1);

    h.network.set_connected(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.server.pulls(), 1);

    h.network.set_connected(true);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.server.pulls(), 2);

    h.orchestrator.stop();
    h.orchestrator.stop();
    assert!(!h.orchestrator.is_started());

    h.network.set_connected(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    h.network.set_connected(true);
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.server.pulls(), 2);
}
