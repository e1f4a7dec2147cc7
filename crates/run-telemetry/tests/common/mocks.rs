// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock transport for driving the dispatcher and sender without a server

use async_trait::async_trait;
use run_telemetry::batch::Batch;
use run_telemetry::record::{RunIdentity, RunStatus};
use run_telemetry::transport::{Transport, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Transport that records what it was asked to deliver
#[derive(Default)]
pub struct RecordingTransport {
    pub submitted: Mutex<Vec<u64>>,
    pub statuses: Mutex<Vec<(Uuid, RunStatus)>>,
    pub heartbeats: Mutex<Vec<Uuid>>,
    /// Every call fails with a transient error while set
    pub unavailable: AtomicBool,
    /// Delay applied to every call before it completes
    pub delay: Option<Duration>,
}

impl RecordingTransport {
    #[allow(dead_code)]
    pub fn with_delay(delay: Duration) -> Self {
        RecordingTransport {
            delay: Some(delay),
            ..Default::default()
        }
    }

    #[allow(dead_code)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<u64> {
        self.submitted.lock().unwrap().clone()
    }

    async fn outcome(&self) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Transient("HTTP 503".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn create_run(&self, _identity: &RunIdentity) -> Result<(), TransportError> {
        self.outcome().await
    }

    async fn submit(&self, batch: &Batch) -> Result<(), TransportError> {
        self.outcome().await?;
        self.submitted
            .lock()
            .unwrap()
            .extend(batch.records.iter().map(|r| r.seq));
        Ok(())
    }

    async fn heartbeat(&self, run_id: Uuid, _at: OffsetDateTime) -> Result<(), TransportError> {
        self.outcome().await?;
        self.heartbeats.lock().unwrap().push(run_id);
        Ok(())
    }

    async fn update_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), TransportError> {
        self.outcome().await?;
        self.statuses.lock().unwrap().push((run_id, status));
        Ok(())
    }
}
