// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of batches and run lifecycle calls to the tracking server.
//!
//! Failures are classified so callers can decide what to do with them:
//!
//! - [`TransportError::Transient`]: network errors, 5xx, 408, 425 and 429.
//!   Retried in place according to the [`RetryStrategy`], then surfaced.
//! - [`TransportError::Permanent`]: any other 4xx. Never retried.
//! - [`TransportError::Payload`]: the batch could not be turned into a request.
//!
//! Creation endpoints (runs, alerts, artifacts) are create-if-absent: a 409
//! means the object already exists and counts as success, which makes replay
//! of those records idempotent.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error};
use uuid::Uuid;

use crate::batch::Batch;
use crate::config::Config;
use crate::http::get_client;
use crate::record::{RecordKind, RunIdentity, RunStatus, SequencedRecord, TelemetryRecord};

const MAX_ERROR_BODY_CHARS: usize = 512;

/// How many times a request is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Attempts, no delay.
    Immediate(u64),
    /// Attempts, fixed delay in milliseconds.
    LinearBackoff(u64, u64),
    /// Attempts, doubling delay starting at `base_ms` and capped at `max_ms`.
    ExponentialBackoff {
        attempts: u64,
        base_ms: u64,
        max_ms: u64,
    },
}

impl RetryStrategy {
    /// Total attempts, never less than one.
    #[must_use]
    pub fn max_attempts(&self) -> u64 {
        let attempts = match self {
            RetryStrategy::Immediate(attempts)
            | RetryStrategy::LinearBackoff(attempts, _)
            | RetryStrategy::ExponentialBackoff { attempts, .. } => *attempts,
        };
        attempts.max(1)
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u64) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, delay_ms) => Duration::from_millis(*delay_ms),
            RetryStrategy::ExponentialBackoff {
                base_ms, max_ms, ..
            } => {
                let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                let factor = 2_u64.checked_pow(exponent).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(*max_ms))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("request rejected by server (status {status:?}): {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },
    #[error("cannot build request payload: {0}")]
    Payload(String),
}

impl TransportError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Permanent { status, .. } => *status,
            _ => None,
        }
    }
}

/// Delivery channel to the tracking server.
///
/// Every call either fully succeeds or returns a classified error; a
/// successful [`Transport::submit`] means every record in the batch is
/// durably stored server-side.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Registers the run; succeeds if it already exists.
    async fn create_run(&self, identity: &RunIdentity) -> Result<(), TransportError>;

    async fn submit(&self, batch: &Batch) -> Result<(), TransportError>;

    async fn heartbeat(&self, run_id: Uuid, at: OffsetDateTime) -> Result<(), TransportError>;

    async fn update_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), TransportError>;
}

/// [`Transport`] speaking JSON over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    retry_strategy: RetryStrategy,
}

struct Request {
    method: Method,
    path: String,
    body: Value,
    conflict_ok: bool,
}

impl HttpTransport {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: Option<String>,
        retry_strategy: RetryStrategy,
    ) -> Self {
        let base_url: String = base_url.into();
        HttpTransport {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            retry_strategy,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let client = get_client(config.https_proxy.as_deref(), config.request_timeout);
        HttpTransport::new(
            client,
            config.server_url.clone(),
            config.token.clone(),
            config.retry_strategy.clone(),
        )
    }

    fn requests_for(batch: &Batch) -> Result<Vec<Request>, TransportError> {
        if let Some(stray) = batch.records.iter().find(|r| r.record.kind() != batch.kind) {
            return Err(TransportError::Payload(format!(
                "{} record {} in a {} batch",
                stray.record.kind(),
                stray.seq,
                batch.kind
            )));
        }
        let run_id = batch.run_id;

        match batch.kind {
            RecordKind::Metric => {
                let metrics: Vec<_> = batch
                    .records
                    .iter()
                    .filter_map(|r| match &r.record {
                        TelemetryRecord::Metric(point) => Some(point),
                        _ => None,
                    })
                    .collect();
                Ok(vec![Request {
                    method: Method::POST,
                    path: format!("/api/runs/{run_id}/metrics"),
                    body: json!({
                        "start_seq": batch.first_seq(),
                        "end_seq": batch.last_seq(),
                        "metrics": metrics,
                    }),
                    conflict_ok: false,
                }])
            }
            RecordKind::Event => {
                let events: Vec<_> = batch
                    .records
                    .iter()
                    .filter_map(|r| match &r.record {
                        TelemetryRecord::Event(event) => Some(event),
                        _ => None,
                    })
                    .collect();
                Ok(vec![Request {
                    method: Method::POST,
                    path: format!("/api/runs/{run_id}/events"),
                    body: json!({
                        "start_seq": batch.first_seq(),
                        "end_seq": batch.last_seq(),
                        "events": events,
                    }),
                    conflict_ok: false,
                }])
            }
            // Single-object endpoints: one request per record, in order
            _ => Ok(batch
                .records
                .iter()
                .filter_map(|r| Self::single_request(run_id, r))
                .collect()),
        }
    }

    fn single_request(run_id: Uuid, record: &SequencedRecord) -> Option<Request> {
        let seq = record.seq;
        match &record.record {
            TelemetryRecord::Metadata(delta) => Some(Request {
                method: Method::PUT,
                path: format!("/api/runs/{run_id}"),
                body: json!({ "metadata": delta.entries, "seq": seq }),
                conflict_ok: false,
            }),
            TelemetryRecord::Alert(alert) => Some(Request {
                method: Method::POST,
                path: "/api/alerts".to_string(),
                body: json!({
                    "run": run_id,
                    "name": alert.name,
                    "rule": alert.rule,
                    "seq": seq,
                }),
                conflict_ok: true,
            }),
            TelemetryRecord::Artifact(artifact) => Some(Request {
                method: Method::POST,
                path: format!("/api/runs/{run_id}/artifacts"),
                body: json!({
                    "name": artifact.server_name,
                    "category": artifact.category,
                    "path": artifact.local_path,
                    "seq": seq,
                }),
                conflict_ok: true,
            }),
            TelemetryRecord::Metric(_) | TelemetryRecord::Event(_) => None,
        }
    }

    async fn send(&self, request: &Request) -> Result<(), TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let max_attempts = self.retry_strategy.max_attempts();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .json(&request.body);
            if let Some(token) = &self.token {
                builder = builder.bearer_auth(token);
            }

            let result = match builder.send().await {
                Ok(resp) => Self::classify(resp, request.conflict_ok).await,
                Err(e) => Err(TransportError::Transient(e.to_string())),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    let delay = self.retry_strategy.backoff(attempts);
                    debug!(
                        "{} {} failed (attempt {}/{}): {}, retrying in {} ms",
                        request.method,
                        request.path,
                        attempts,
                        max_attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "{} {} failed after {} attempts: {}",
                        request.method, request.path, attempts, e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn classify(resp: reqwest::Response, conflict_ok: bool) -> Result<(), TransportError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::CONFLICT && conflict_ok {
            debug!("Object already exists on the server");
            return Ok(());
        }
        // 408, 425 (too early) and 429 are worth another attempt
        if status.is_server_error() || matches!(status.as_u16(), 408 | 425 | 429) {
            return Err(TransportError::Transient(format!("HTTP {status}")));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::Permanent {
            status: Some(status.as_u16()),
            message: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_run(&self, identity: &RunIdentity) -> Result<(), TransportError> {
        self.send(&Request {
            method: Method::POST,
            path: "/api/runs".to_string(),
            body: json!({
                "id": identity.run_id,
                "name": identity.name,
                "status": identity.status,
            }),
            conflict_ok: true,
        })
        .await
    }

    async fn submit(&self, batch: &Batch) -> Result<(), TransportError> {
        if batch.is_empty() {
            return Ok(());
        }
        for request in Self::requests_for(batch)? {
            self.send(&request).await?;
        }
        debug!(
            "Delivered {} {} records ({}..={}) for run {}",
            batch.len(),
            batch.kind,
            batch.first_seq(),
            batch.last_seq(),
            batch.run_id
        );
        Ok(())
    }

    async fn heartbeat(&self, run_id: Uuid, at: OffsetDateTime) -> Result<(), TransportError> {
        let timestamp = at
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|e| TransportError::Payload(e.to_string()))?;
        self.send(&Request {
            method: Method::PUT,
            path: format!("/api/runs/{run_id}/heartbeat"),
            body: json!({ "timestamp": timestamp }),
            conflict_ok: false,
        })
        .await
    }

    async fn update_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), TransportError> {
        self.send(&Request {
            method: Method::PUT,
            path: format!("/api/runs/{run_id}"),
            body: json!({ "status": status }),
            conflict_ok: false,
        })
        .await
    }
}
