//! HTTP implementations of [`Transport`] and [`SyncRemote`].
//!
//! Endpoints (relative to the configured base URL):
//! - `POST /uploads/{upload_id}/chunks`: multipart with `chunkIndex`,
//!   `totalChunks` and a `chunk` file part; replies with a [`ChunkAck`]
//! - `POST /sync/entities`: JSON entity; `409` carries the server version
//! - `GET /sync/changes?since=...`: JSON array of entities

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use super::{ChunkAck, PushOutcome, SyncRemote, Transport};
use crate::core::{AuthToken, RetryPolicy};
use crate::domain::{EntityRecord, ErrorClass, SyncError};

/// Map a reqwest failure onto the error taxonomy
pub fn classify_request_error(err: &reqwest::Error, what: &str) -> SyncError {
    if err.is_timeout() {
        SyncError::TransientIo(format!("{}: request timed out", what))
    } else if err.is_connect() {
        SyncError::NetworkUnavailable
    } else if err.is_builder() {
        SyncError::Validation(format!("{}: {}", what, err))
    } else if let Some(status) = err.status() {
        SyncError::from_status(status.as_u16(), what)
    } else {
        SyncError::TransientIo(format!("{}: {}", what, err))
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, SyncError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::Validation(format!("Failed to build HTTP client: {}", e)))
}

/// Send a request, retrying transient failures per `policy`.
///
/// Returns the response for any status that is not itself transient;
/// callers interpret the rest.
async fn send_with_retry<F>(
    policy: &RetryPolicy,
    what: &str,
    build: F,
) -> Result<Response, SyncError>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 1;
    loop {
        let err = match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let err = SyncError::from_status(status.as_u16(), what);
                if err.class() != ErrorClass::Transient {
                    return Ok(response);
                }
                err
            }
            Err(e) => classify_request_error(&e, what),
        };

        if err.class() != ErrorClass::Transient || !policy.should_retry(attempt) {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Request failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

fn bearer(auth: &AuthToken) -> Result<String, SyncError> {
    auth.get().ok_or(SyncError::Unauthenticated)
}

/// Chunk uploads over HTTP
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    auth: Arc<AuthToken>,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        auth: Arc<AuthToken>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
            auth,
            retry,
        })
    }

    fn chunk_url(&self, upload_id: &str) -> String {
        format!("{}/uploads/{}/chunks", self.base_url, upload_id)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: Vec<u8>,
    ) -> Result<ChunkAck, SyncError> {
        let token = bearer(&self.auth)?;
        let url = self.chunk_url(upload_id);
        let what = format!("chunk {} of {}", chunk_index, upload_id);

        let response = send_with_retry(&self.retry, &what, || {
            let part = Part::bytes(data.clone()).file_name(format!("chunk-{}", chunk_index));
            let form = Form::new()
                .text("chunkIndex", chunk_index.to_string())
                .text("totalChunks", total_chunks.to_string())
                .part("chunk", part);
            self.client.post(&url).bearer_auth(&token).multipart(form)
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::from_status(status.as_u16(), &what));
        }

        let ack: ChunkAck = response
            .json()
            .await
            .map_err(|e| SyncError::TransientIo(format!("{}: bad acknowledgement: {}", what, e)))?;

        debug!(upload_id, chunk_index, uploaded = ack.chunk_uploaded, "Chunk response");
        Ok(ack)
    }
}

/// Entity push/pull over HTTP
pub struct HttpSyncRemote {
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpSyncRemote {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
            retry,
        })
    }
}

#[async_trait]
impl SyncRemote for HttpSyncRemote {
    async fn push_entity(&self, token: &str, entity: &EntityRecord) -> Result<PushOutcome, SyncError> {
        let url = format!("{}/sync/entities", self.base_url);
        let what = format!("push {}", entity.key());

        let response = send_with_retry(&self.retry, &what, || {
            self.client.post(&url).bearer_auth(token).json(entity)
        })
        .await?;

        match response.status() {
            status if status.is_success() => Ok(PushOutcome::Accepted),
            StatusCode::CONFLICT => {
                let remote: EntityRecord = response.json().await.map_err(|e| {
                    SyncError::TransientIo(format!("{}: bad conflict body: {}", what, e))
                })?;
                Ok(PushOutcome::Conflict(remote))
            }
            status => Err(SyncError::from_status(status.as_u16(), &what)),
        }
    }

    async fn pull_changes(
        &self,
        token: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EntityRecord>, SyncError> {
        let url = format!("{}/sync/changes", self.base_url);
        let since = since.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true));

        let response = send_with_retry(&self.retry, "pull changes", || {
            let request = self.client.get(&url).bearer_auth(token);
            match &since {
                Some(since) => request.query(&[("since", since.as_str())]),
                None => request,
            }
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::from_status(status.as_u16(), "pull changes"));
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::TransientIo(format!("pull changes: bad body: {}", e)))
    }
}
