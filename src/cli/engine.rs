//! Wiring of the engine components from a resolved configuration.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::adapters::{HttpProbeObserver, HttpSyncRemote, HttpTransport};
use crate::config::{paths, ResolvedConfig, StoreBackend};
use crate::core::{AuthToken, Clock, ConflictResolver, EntityStore, SyncOrchestrator, SystemClock};
use crate::ingest::{ProcessingQueue, WhisperProcessor};
use crate::store::{JsonlStore, LocalStore, SqliteStore};
use crate::upload::ChunkedUploader;

/// Components sharing one store, clock and credential holder
pub struct Engine {
    pub config: ResolvedConfig,
    pub auth: Arc<AuthToken>,
    pub queue: Arc<ProcessingQueue>,
    pub uploader: Arc<ChunkedUploader>,
    pub entities: Arc<EntityStore>,
    pub resolver: Arc<ConflictResolver>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Open the configured store and build the local components
    pub async fn open(config: ResolvedConfig, token: Option<String>) -> Result<Self> {
        let store_path = paths::configured_store_file(&config);
        let store: Arc<dyn LocalStore> = match config.store {
            StoreBackend::Jsonl => Arc::new(
                JsonlStore::open(&store_path)
                    .await
                    .with_context(|| format!("Failed to open store: {}", store_path.display()))?,
            ),
            StoreBackend::Sqlite => Arc::new(
                SqliteStore::open(&store_path)
                    .with_context(|| format!("Failed to open store: {}", store_path.display()))?,
            ),
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let auth = Arc::new(match token {
            Some(token) => AuthToken::with_token(token),
            None => AuthToken::new(),
        });

        let transport = HttpTransport::new(
            config.server_url(),
            auth.clone(),
            config.request_timeout(),
            config.request_retry(),
        )
        .context("Failed to build upload transport")?;

        let queue = Arc::new(ProcessingQueue::new(
            store.clone(),
            clock.clone(),
            config.queue_config(),
        ));
        let uploader = Arc::new(ChunkedUploader::with_chunk_size(
            store.clone(),
            Arc::new(transport),
            clock.clone(),
            config.upload.chunk_size_bytes,
        ));
        let entities = Arc::new(EntityStore::new(store.clone(), clock.clone()));
        let resolver = Arc::new(ConflictResolver::new(
            store,
            clock.clone(),
            config.conflict_tolerance(),
        ));

        Ok(Self {
            config,
            auth,
            queue,
            uploader,
            entities,
            resolver,
            clock,
        })
    }

    pub fn processor(&self) -> WhisperProcessor {
        let settings = &self.config.processor;
        WhisperProcessor::new(&settings.whisper_path, &settings.model, &settings.language)
    }

    /// Build an orchestrator talking to the configured server
    pub fn orchestrator(&self) -> Result<Arc<SyncOrchestrator>> {
        let base_url = self.config.server_url().trim_end_matches('/');
        let network = HttpProbeObserver::with_timeout(
            format!("{}/health", base_url),
            self.config.request_timeout().min(std::time::Duration::from_secs(5)),
        );
        let remote = HttpSyncRemote::new(
            base_url,
            self.config.request_timeout(),
            self.config.request_retry(),
        )
        .context("Failed to build sync client")?;

        Ok(Arc::new(SyncOrchestrator::new(
            Arc::new(network),
            self.uploader.clone(),
            Arc::new(remote),
            self.entities.clone(),
            self.resolver.clone(),
            self.auth.clone(),
            self.clock.clone(),
            self.config.orchestrator_config(),
        )))
    }
}
