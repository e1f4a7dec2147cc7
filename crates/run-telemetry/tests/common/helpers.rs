// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use run_telemetry::batch::Batch;
use run_telemetry::cache::CacheStore;
use run_telemetry::record::{RecordKind, RunIdentity, RunMode, RunStatus, SequencedRecord};
use run_telemetry::transport::{HttpTransport, RetryStrategy, Transport};
use run_telemetry::{Config, TelemetryRecord};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Configuration pointing at a test server and a private cache root
pub fn test_config(server_url: &str, cache_dir: &Path) -> Config {
    Config {
        server_url: server_url.to_string(),
        token: Some("test-token".to_string()),
        cache_dir: cache_dir.to_path_buf(),
        flush_interval: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        retry_strategy: RetryStrategy::Immediate(1),
        ..Config::default()
    }
}

pub fn open_cache(cache_dir: &Path) -> Arc<CacheStore> {
    Arc::new(CacheStore::open(cache_dir).expect("failed to open cache"))
}

/// HTTP transport without retries, so failure tests stay fast
pub fn http_transport(config: &Config) -> Arc<dyn Transport> {
    Arc::new(HttpTransport::new(
        reqwest::Client::new(),
        config.server_url.clone(),
        config.token.clone(),
        RetryStrategy::Immediate(1),
    ))
}

pub fn metric(step: i64) -> TelemetryRecord {
    TelemetryRecord::metric("loss", 1.0 / (step as f64 + 1.0), step)
}

/// Writes a run straight into the cache, as a crashed producer would leave it
pub fn seed_run(
    cache: &CacheStore,
    status: RunStatus,
    steps: std::ops::RangeInclusive<i64>,
) -> RunIdentity {
    let mut identity = RunIdentity::new("seeded", RunMode::Offline);
    identity.status = status;
    cache
        .write_identity(&identity)
        .expect("failed to write identity");
    let batch = Batch {
        run_id: identity.run_id,
        kind: RecordKind::Metric,
        records: steps
            .map(|step| SequencedRecord {
                seq: step as u64,
                record: metric(step),
            })
            .collect(),
    };
    cache.append_batch(&batch).expect("failed to append records");
    identity
}

pub fn pending_seqs(cache: &CacheStore, identity: &RunIdentity) -> Vec<u64> {
    cache
        .read_pending(identity.run_id)
        .expect("failed to read pending records")
        .map(|r| r.expect("unreadable record").seq)
        .collect()
}
