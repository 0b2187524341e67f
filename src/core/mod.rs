//! Core sync engine.
//!
//! This module contains:
//! - Clock: monotonic time sources
//! - RetryPolicy: capped exponential backoff
//! - AuthToken: externally supplied credentials
//! - EntityStore: local copies of synchronized entities
//! - ConflictResolver: divergence detection and audit
//! - PeriodicTrigger: connectivity-gated timer
//! - SyncOrchestrator: decides when to sync and runs the passes

pub mod auth;
pub mod clock;
pub mod conflict;
pub mod entities;
pub mod orchestrator;
pub mod periodic;
pub mod retry;

use std::sync::{Mutex, MutexGuard};

// Re-export commonly used types
pub use auth::AuthToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::ConflictResolver;
pub use entities::EntityStore;
pub use orchestrator::{OrchestratorConfig, SyncOrchestrator};
pub use periodic::{PeriodicTrigger, SyncTrigger, TriggerState};
pub use retry::RetryPolicy;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
