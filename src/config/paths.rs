//! Canonical file locations under the capsync home directory.
//!
//! | File | Purpose |
//! |------|---------|
//! | `capsync.jsonl` | JSONL store log (default backend) |
//! | `capsync.db` | SQLite store |

use std::path::PathBuf;

use super::{ResolvedConfig, StoreBackend};

/// JSONL store log file name
pub const JSONL_STORE_FILE: &str = "capsync.jsonl";

/// SQLite database file name
pub const SQLITE_STORE_FILE: &str = "capsync.db";

/// Path of the store file for `backend`
pub fn store_file(config: &ResolvedConfig, backend: StoreBackend) -> PathBuf {
    let name = match backend {
        StoreBackend::Jsonl => JSONL_STORE_FILE,
        StoreBackend::Sqlite => SQLITE_STORE_FILE,
    };
    config.home.join(name)
}

/// Path of the configured store file
pub fn configured_store_file(config: &ResolvedConfig) -> PathBuf {
    store_file(config, config.store)
}
