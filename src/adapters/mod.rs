//! Adapter interfaces for external systems.
//!
//! The engine talks to the outside world only through these traits:
//! - Transport: chunk POSTs for resumable uploads
//! - NetworkObserver: connectivity snapshots
//! - SyncRemote: entity push/pull against the server
//!
//! HTTP implementations live in [`http`]; connectivity observers in
//! [`network`].

pub mod http;
pub mod network;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EntityRecord, NetworkState, SyncError};

pub use http::{HttpSyncRemote, HttpTransport};
pub use network::{HttpProbeObserver, SharedNetworkState};

/// Server acknowledgement for one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    /// Whether the server stored the chunk
    pub chunk_uploaded: bool,

    /// Byte offset the server expects next, if it reports one
    #[serde(default)]
    pub next_offset: Option<u64>,
}

impl ChunkAck {
    pub fn accepted(next_offset: Option<u64>) -> Self {
        Self {
            chunk_uploaded: true,
            next_offset,
        }
    }

    pub fn rejected() -> Self {
        Self {
            chunk_uploaded: false,
            next_offset: None,
        }
    }
}

/// Chunked request/response primitive.
///
/// Timeouts and retries are the transport's responsibility.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: Vec<u8>,
    ) -> Result<ChunkAck, SyncError>;
}

/// Current connectivity, polled on demand
#[async_trait]
pub trait NetworkObserver: Send + Sync {
    async fn current_state(&self) -> NetworkState;

    async fn is_connected(&self) -> bool {
        self.current_state().await.connected
    }
}

/// Result of pushing one local entity
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Server took the local version
    Accepted,

    /// Server holds a different version; carries it
    Conflict(EntityRecord),
}

/// Server side of entity synchronization
#[async_trait]
pub trait SyncRemote: Send + Sync {
    /// Send one local change
    async fn push_entity(&self, token: &str, entity: &EntityRecord) -> Result<PushOutcome, SyncError>;

    /// Entities changed on the server since `since` (everything when `None`)
    async fn pull_changes(
        &self,
        token: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EntityRecord>, SyncError>;
}
