//! Sync requests, reports and connectivity snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of link reported by the network observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Wifi,
    Cellular,
    /// Connected, but the observer cannot tell how
    Unknown,
    None,
}

/// Read-only connectivity snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub connected: bool,
    pub transport: ConnectionKind,
}

impl NetworkState {
    pub fn online(transport: ConnectionKind) -> Self {
        Self {
            connected: true,
            transport,
        }
    }

    pub fn offline() -> Self {
        Self {
            connected: false,
            transport: ConnectionKind::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPriority {
    Low,
    High,
}

/// What asked for a sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    Periodic,
    Manual,
    Reconnect,
    Startup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub priority: SyncPriority,
    pub source: SyncSource,
}

impl SyncRequest {
    pub fn new(priority: SyncPriority, source: SyncSource) -> Self {
        Self { priority, source }
    }

    pub fn periodic() -> Self {
        Self::new(SyncPriority::Low, SyncSource::Periodic)
    }

    pub fn manual() -> Self {
        Self::new(SyncPriority::High, SyncSource::Manual)
    }

    pub fn reconnect() -> Self {
        Self::new(SyncPriority::High, SyncSource::Reconnect)
    }

    pub fn startup() -> Self {
        Self::new(SyncPriority::High, SyncSource::Startup)
    }
}

/// Counts from one completed sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Files fully uploaded
    pub uploaded: usize,

    /// Local entity changes accepted by the server
    pub pushed: usize,

    /// Remote entities applied locally
    pub downloaded: usize,

    /// Conflicts recorded
    pub conflicts: usize,

    /// Uploads that stopped early and will resume on a later pass
    pub deferred_uploads: usize,
}

/// Result of asking for a sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// This call ran the pass
    Completed(SyncReport),

    /// Another pass was in flight; carries its report if it succeeded
    Coalesced(Option<SyncReport>),

    /// Offline; nothing was attempted
    NetworkUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    Offline,
    Error,
}

/// Snapshot returned by the orchestrator's status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub pending_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            pending_count: 0,
            last_sync_at: None,
            last_error: None,
        }
    }
}
