//! Periodic, connectivity-gated sync trigger.
//!
//! State machine: `Stopped → Running` on `start()`, `Running → Stopped` on
//! `stop()`. Offline ticks are skipped, not failed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::lock_unpoisoned;
use crate::adapters::NetworkObserver;
use crate::domain::{SyncError, SyncOutcome, SyncRequest};

/// Anything that can be asked to run a sync pass
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn request_sync(&self, request: SyncRequest) -> Result<SyncOutcome, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Stopped,
    Running,
}

struct RunningTimer {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Timer that asks its target for a low-priority sync every `interval`
pub struct PeriodicTrigger {
    interval: Duration,
    network: Arc<dyn NetworkObserver>,
    target: Arc<dyn SyncTrigger>,
    running: Mutex<Option<RunningTimer>>,
}

impl PeriodicTrigger {
    pub fn new(
        interval: Duration,
        network: Arc<dyn NetworkObserver>,
        target: Arc<dyn SyncTrigger>,
    ) -> Result<Self, SyncError> {
        if interval.is_zero() {
            return Err(SyncError::Validation(
                "periodic sync interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            interval,
            network,
            target,
            running: Mutex::new(None),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start ticking. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut running = lock_unpoisoned(&self.running);
        if let Some(timer) = running.as_ref() {
            if !timer.task.is_finished() {
                debug!("Periodic trigger already running");
                return false;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(tick_loop(
            self.interval,
            self.network.clone(),
            self.target.clone(),
            stop_rx,
        ));
        *running = Some(RunningTimer { stop_tx, task });

        info!(interval_secs = self.interval.as_secs(), "Periodic sync started");
        true
    }

    /// Cancel future ticks. A sync already in progress runs to completion.
    ///
    /// Returns false if it was not running.
    pub fn stop(&self) -> bool {
        let Some(timer) = lock_unpoisoned(&self.running).take() else {
            return false;
        };
        // The loop may already have exited; nothing to signal then
        let _ = timer.stop_tx.send(true);
        info!("Periodic sync stopped");
        true
    }

    pub fn state(&self) -> TriggerState {
        match lock_unpoisoned(&self.running).as_ref() {
            Some(timer) if !timer.task.is_finished() => TriggerState::Running,
            _ => TriggerState::Stopped,
        }
    }
}

impl Drop for PeriodicTrigger {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn tick_loop(
    interval: Duration,
    network: Arc<dyn NetworkObserver>,
    target: Arc<dyn SyncTrigger>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !network.is_connected().await {
                    debug!("Offline; skipping periodic sync");
                    continue;
                }
                match target.request_sync(SyncRequest::periodic()).await {
                    Ok(outcome) => debug!(?outcome, "Periodic sync finished"),
                    Err(e) => warn!(error = %e, "Periodic sync failed"),
                }
            }
        }
    }

    debug!("Periodic tick loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SharedNetworkState;
    use crate::domain::SyncReport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTarget {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SyncTrigger for CountingTarget {
        async fn request_sync(&self, _request: SyncRequest) -> Result<SyncOutcome, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SyncOutcome::Completed(SyncReport::default()))
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = PeriodicTrigger::new(
            Duration::ZERO,
            Arc::new(SharedNetworkState::online()),
            Arc::new(CountingTarget::default()),
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_while_online() {
        let target = Arc::new(CountingTarget::default());
        let trigger = PeriodicTrigger::new(
            Duration::from_secs(60),
            Arc::new(SharedNetworkState::online()),
            target.clone(),
        )
        .unwrap();

        assert!(trigger.start());
        assert_eq!(trigger.state(), TriggerState::Running);

        // No tick at time zero
        tokio::task::yield_now().await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 2);

        assert!(trigger.stop());
        assert!(!trigger.stop());
    }
}
