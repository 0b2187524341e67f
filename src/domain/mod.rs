//! Domain types for the capture sync engine.
//!
//! This module contains the core data structures:
//! - QueueItem: local processing work
//! - UploadRecord: resumable transfer progress
//! - EntityRecord / SyncConflict: synchronized state and its divergences
//! - SyncError: the shared error taxonomy

pub mod conflict;
pub mod entity;
pub mod error;
pub mod queue;
pub mod sync;
pub mod upload;

// Re-export commonly used types
pub use conflict::{ResolutionStrategy, SyncConflict};
pub use entity::{content_version, entity_key, EntityRecord};
pub use error::{ErrorClass, StoreError, SyncError};
pub use queue::{FailureTag, QueueItem, QueueStatus};
pub use sync::{
    ConnectionKind, NetworkState, SyncOutcome, SyncPriority, SyncReport, SyncRequest,
    SyncSource, SyncState, SyncStatus,
};
pub use upload::{UploadRecord, UploadStatus};
