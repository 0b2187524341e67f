//! Configuration for capsync.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CAPSYNC_HOME, CAPSYNC_SERVER_URL)
//! 2. Config file (.capsync/config.yaml)
//! 3. Defaults (~/.capsync)
//!
//! Config file discovery:
//! - Searches current directory and parents for .capsync/config.yaml
//! - A relative `paths.home` is resolved against the .capsync/ directory
//!
//! The resolved value is passed explicitly to whatever needs it.

pub mod paths;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{OrchestratorConfig, RetryPolicy};
use crate::ingest::QueueConfig;
use crate::upload::DEFAULT_CHUNK_SIZE;

/// Name of the per-project config directory
pub const CONFIG_DIR: &str = ".capsync";

/// Server used when none is configured
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub processor: ProcessorSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .capsync/)
    pub home: Option<String>,
    /// Store backend
    pub store: Option<StoreBackend>,
}

/// Which [`crate::store::LocalStore`] backs the CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default)]
    pub retain_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_periodic_interval_secs")]
    pub periodic_interval_secs: u64,
    #[serde(default = "default_reconnect_poll_secs")]
    pub reconnect_poll_secs: u64,
    #[serde(default = "default_conflict_tolerance_ms")]
    pub conflict_tolerance_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSettings {
    #[serde(default = "default_whisper_path")]
    pub whisper_path: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    300_000
}
fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_periodic_interval_secs() -> u64 {
    900
}
fn default_reconnect_poll_secs() -> u64 {
    5
}
fn default_conflict_tolerance_ms() -> u64 {
    1000
}
fn default_whisper_path() -> String {
    "/opt/homebrew/bin/whisper".to_string()
}
fn default_model() -> String {
    "base".to_string()
}
fn default_language() -> String {
    "en".to_string()
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            retain_completed: false,
        }
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            periodic_interval_secs: default_periodic_interval_secs(),
            reconnect_poll_secs: default_reconnect_poll_secs(),
            conflict_tolerance_ms: default_conflict_tolerance_ms(),
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            whisper_path: default_whisper_path(),
            model: default_model(),
            language: default_language(),
        }
    }
}

/// Environment overrides, captured once so resolution stays pure
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<String>,
    pub server_url: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var("CAPSYNC_HOME").ok().filter(|v| !v.is_empty()),
            server_url: std::env::var("CAPSYNC_SERVER_URL").ok().filter(|v| !v.is_empty()),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub store: StoreBackend,
    pub queue: QueueSettings,
    pub upload: UploadSettings,
    pub sync: SyncSettings,
    pub server: ServerSettings,
    pub processor: ProcessorSettings,
}

impl ResolvedConfig {
    pub fn server_url(&self) -> &str {
        self.server.base_url.as_deref().unwrap_or(DEFAULT_SERVER_URL)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            retry: RetryPolicy {
                max_attempts: self.queue.max_retries,
                initial_delay_ms: self.queue.backoff_base_ms,
                max_delay_ms: self.queue.backoff_cap_ms,
                backoff_multiplier: 2.0,
            },
            retain_completed: self.queue.retain_completed,
        }
    }

    /// Retry policy for individual HTTP requests
    pub fn request_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.upload.max_retries.max(1),
            ..RetryPolicy::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.request_timeout_secs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            periodic_interval: Duration::from_secs(self.sync.periodic_interval_secs),
            reconnect_poll: Duration::from_secs(self.sync.reconnect_poll_secs.max(1)),
        }
    }

    pub fn conflict_tolerance(&self) -> Duration {
        Duration::from_millis(self.sync.conflict_tolerance_ms)
    }
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed config file (if any), env overrides and defaults
pub fn resolve_config(
    file: Option<(PathBuf, ConfigFile)>,
    env: &EnvOverrides,
    default_home: PathBuf,
) -> ResolvedConfig {
    let (config_file, parsed) = match file {
        Some((path, parsed)) => (Some(path), parsed),
        None => (None, ConfigFile::default()),
    };

    let home = if let Some(env_home) = &env.home {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (&parsed.paths.home, &config_file) {
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let mut server = parsed.server;
    if let Some(url) = &env.server_url {
        server.base_url = Some(url.clone());
    }

    ResolvedConfig {
        home,
        config_file,
        store: parsed.paths.store.unwrap_or_default(),
        queue: parsed.queue,
        upload: parsed.upload,
        sync: parsed.sync,
        server,
        processor: parsed.processor,
    }
}

/// Load configuration from all sources
pub fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let file = match find_config_file(&cwd) {
        Some(path) => {
            let parsed = load_config_file(&path)?;
            Some((path, parsed))
        }
        None => None,
    };

    Ok(resolve_config(file, &EnvOverrides::from_env(), default_home))
}
