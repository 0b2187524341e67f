//! Resumable chunked uploads.
//!
//! - [`calculate_chunks`]: fixed-size chunk planning
//! - [`ChunkedUploader`]: sequential chunk POSTs with persisted progress

pub mod chunk;
pub mod transfer;

pub use chunk::{calculate_chunks, ChunkPlan, DEFAULT_CHUNK_SIZE};
pub use transfer::ChunkedUploader;
