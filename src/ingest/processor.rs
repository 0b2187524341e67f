//! Capture processors.
//!
//! A processor turns one queued capture into text. The bundled
//! implementation shells out to a local whisper binary.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::domain::{QueueItem, SyncError};

/// Result of processing a capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOutput {
    pub text: String,
    pub language: String,
    pub duration_seconds: f64,
}

/// Scarce, non-reentrant engine invoked once per queue item
#[async_trait]
pub trait CaptureProcessor: Send + Sync {
    async fn process(&self, item: &QueueItem) -> Result<ProcessingOutput, SyncError>;
}

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    end: f64,
}

/// Transcribes audio with a local whisper binary
#[derive(Debug, Clone)]
pub struct WhisperProcessor {
    whisper_path: PathBuf,
    model: String,
    language: String,
    timeout: Duration,
}

impl WhisperProcessor {
    pub fn new(whisper_path: impl Into<PathBuf>, model: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            whisper_path: whisper_path.into(),
            model: model.into(),
            language: language.into(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CaptureProcessor for WhisperProcessor {
    async fn process(&self, item: &QueueItem) -> Result<ProcessingOutput, SyncError> {
        let audio_path = &item.source_path;
        tokio::fs::metadata(audio_path)
            .await
            .map_err(|e| SyncError::from_io(&e, "capture source"))?;

        let temp_dir = tempfile::tempdir()
            .map_err(|e| SyncError::TransientIo(format!("Failed to create temp dir: {}", e)))?;

        let run = Command::new(&self.whisper_path)
            .arg(audio_path)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json")
            .arg("--language")
            .arg(&self.language)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SyncError::TransientIo(format!(
                    "Failed to run {}: {}",
                    self.whisper_path.display(),
                    e
                )))
            }
            Err(_) => {
                return Err(SyncError::TransientIo(format!(
                    "whisper timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::TransientIo(format!(
                "Whisper failed: {}",
                stderr.trim()
            )));
        }

        // Find and parse JSON output
        let stem = audio_path.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{}.json", stem));

        let json_content = tokio::fs::read_to_string(&json_path)
            .await
            .map_err(|e| SyncError::TransientIo(format!("Failed to read whisper output: {}", e)))?;

        let whisper: WhisperOutput = serde_json::from_str(&json_content)
            .map_err(|e| SyncError::TransientIo(format!("Failed to parse whisper JSON: {}", e)))?;

        let duration = whisper
            .segments
            .last()
            .map(|s| s.end)
            .or(item.source_duration)
            .unwrap_or(0.0);

        debug!(item_id = %item.id, duration, "Transcribed capture");

        Ok(ProcessingOutput {
            text: whisper.text.trim().to_string(),
            language: if whisper.language.is_empty() {
                self.language.clone()
            } else {
                whisper.language
            },
            duration_seconds: duration,
        })
    }
}
