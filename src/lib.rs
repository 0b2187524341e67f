//! capsync - Offline-first capture sync engine
//!
//! Captures (voice memos, notes) are queued for local processing, their
//! files are uploaded in resumable chunks, and the resulting entities are
//! synchronized with a server whenever connectivity and credentials allow.
//!
//! # Architecture
//!
//! Every component reads and writes through a [`store::LocalStore`], so
//! the store is the single source of truth:
//! - Queue items survive crashes and are reclassified on startup
//! - Upload progress is persisted after every acknowledged chunk
//! - Conflicts are kept as an audit trail, never deleted
//!
//! # Modules
//!
//! - `adapters`: Transport, network and sync-server seams (HTTP)
//! - `core`: Orchestration logic (SyncOrchestrator, PeriodicTrigger, ConflictResolver)
//! - `domain`: Data structures (QueueItem, UploadRecord, SyncConflict, SyncError)
//! - `ingest`: Processing queue, crash recovery and the queue worker
//! - `store`: Local store backends (memory, JSONL, SQLite)
//! - `upload`: Chunk planning and the resumable uploader
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Queue and process a capture
//! capsync enqueue memo-1 ~/Recordings/memo-1.m4a
//! capsync process --once
//!
//! # Sync with the server
//! CAPSYNC_TOKEN=... capsync sync
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;
pub mod store;
pub mod upload;

// Re-export main types at crate root for convenience
pub use core::{ConflictResolver, PeriodicTrigger, SyncOrchestrator};
pub use domain::{
    QueueItem, QueueStatus, SyncConflict, SyncError, SyncOutcome, SyncRequest, UploadRecord,
    UploadStatus,
};
pub use ingest::{ProcessingQueue, QueueWorker};
pub use store::{JsonlStore, LocalStore, MemoryStore, SqliteStore};
pub use upload::ChunkedUploader;
