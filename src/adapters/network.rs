//! Network observers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::NetworkObserver;
use crate::domain::{ConnectionKind, NetworkState};

/// Connectivity flag set by the host (or by tests).
///
/// Observers elsewhere may `subscribe` for change notifications, but the
/// engine itself only polls.
#[derive(Debug)]
pub struct SharedNetworkState {
    tx: watch::Sender<NetworkState>,
}

impl SharedNetworkState {
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn online() -> Self {
        Self::new(NetworkState::online(ConnectionKind::Wifi))
    }

    pub fn offline() -> Self {
        Self::new(NetworkState::offline())
    }

    pub fn set(&self, state: NetworkState) {
        self.tx.send_replace(state);
    }

    pub fn set_connected(&self, connected: bool) {
        let state = if connected {
            NetworkState::online(ConnectionKind::Wifi)
        } else {
            NetworkState::offline()
        };
        self.set(state);
    }

    pub fn snapshot(&self) -> NetworkState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NetworkObserver for SharedNetworkState {
    async fn current_state(&self) -> NetworkState {
        self.snapshot()
    }
}

/// Treats the server as reachable if a HEAD request gets any response
pub struct HttpProbeObserver {
    url: String,
    client: reqwest::Client,
}

impl HttpProbeObserver {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, Duration::from_secs(3))
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl NetworkObserver for HttpProbeObserver {
    async fn current_state(&self) -> NetworkState {
        match self.client.head(&self.url).send().await {
            Ok(_) => NetworkState::online(ConnectionKind::Unknown),
            Err(e) => {
                debug!(url = %self.url, error = %e, "Connectivity probe failed");
                NetworkState::offline()
            }
        }
    }
}
