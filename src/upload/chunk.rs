//! Chunk planning.

use serde::{Deserialize, Serialize};

use crate::domain::SyncError;

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// How a file splits into fixed-size chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,

    /// Size of the final chunk (equals `chunk_size` on an exact multiple)
    pub last_chunk_size: u64,
}

/// Split `file_size` bytes into `chunk_size` pieces
pub fn calculate_chunks(file_size: u64, chunk_size: u64) -> Result<ChunkPlan, SyncError> {
    if file_size == 0 {
        return Err(SyncError::Validation(
            "file size must be greater than zero".to_string(),
        ));
    }
    if chunk_size == 0 {
        return Err(SyncError::Validation(
            "chunk size must be greater than zero".to_string(),
        ));
    }

    let total = file_size.div_ceil(chunk_size);
    let total_chunks = u32::try_from(total).map_err(|_| {
        SyncError::Validation(format!(
            "{} bytes in {}-byte chunks exceeds the chunk index range",
            file_size, chunk_size
        ))
    })?;

    let remainder = file_size % chunk_size;
    let last_chunk_size = if remainder == 0 { chunk_size } else { remainder };

    Ok(ChunkPlan {
        file_size,
        chunk_size,
        total_chunks,
        last_chunk_size,
    })
}

impl ChunkPlan {
    /// Byte range `(offset, len)` of chunk `index`, or None past the end
    pub fn chunk_range(&self, index: u32) -> Option<(u64, u64)> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = u64::from(index) * self.chunk_size;
        let len = if index + 1 == self.total_chunks {
            self.last_chunk_size
        } else {
            self.chunk_size
        };
        Some((offset, len))
    }
}
