//! Capture ingestion: the durable processing queue.
//!
//! # Architecture
//!
//! ```text
//! enqueue → queue_items (Pending) → QueueWorker → CaptureProcessor
//!                                        ↓
//!                     Completed → EntityStore + ChunkedUploader + sync
//!                     Failed    → backoff (Pending) or terminal
//! ```
//!
//! Crash recovery runs once at startup before the queue hands out work.

pub mod processor;
pub mod queue;
pub mod recovery;
pub mod worker;

// Re-export key types
pub use processor::{CaptureProcessor, ProcessingOutput, WhisperProcessor};
pub use queue::{ProcessingQueue, QueueConfig, QueueCounts};
pub use recovery::{CrashRecovery, RecoveryReport};
pub use worker::{DrainReport, QueueWorker, WorkOutcome, CAPTURE_ENTITY};
