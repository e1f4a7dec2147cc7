// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drain cycle that replays the cache to the tracking server.
//!
//! One drain holds the sender lock for its whole duration and, for every
//! cached run:
//!
//! 1. registers the run (create-if-absent),
//! 2. replays pending records in ascending sequence order, confirming each
//!    delivered batch in the cache,
//! 3. forwards the heartbeat of active runs, or the final status of
//!    terminal ones,
//! 4. purges terminal runs with nothing left to send.
//!
//! Runs are independent and replayed concurrently up to `max_workers`. A
//! transient failure stops the run for this cycle; a permanent one also
//! leaves a `failed.json` marker so later cycles skip the run until retried
//! explicitly.
//!
//! With `replay_kinds` set, replay of a run stops at its first record of an
//! unselected kind. Later records wait for a cycle that selects that kind,
//! so the server still receives each run in sequence order. A terminal run
//! with records held back keeps its entry and its final status.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::Batcher;
use crate::cache::{CacheError, CacheStore, ReplayFailure};
use crate::config::Config;
use crate::lock::{Acquire, LockError, LockInfo, LockManager, LockOwnership};
use crate::record::{RunIdentity, SequencedRecord};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("delivery failed: {0}")]
    Transport(#[from] TransportError),
    #[error("sender task failed: {0}")]
    Task(String),
}

#[derive(Debug)]
pub enum DrainOutcome {
    /// Another sender holds the lock; nothing was touched.
    Busy { holder: LockInfo },
    Completed(DrainReport),
}

/// Per-run results of one drain cycle, ordered by run id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub runs: Vec<RunReport>,
}

impl DrainReport {
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.runs.iter().map(|r| r.delivered).sum()
    }

    #[must_use]
    pub fn purged(&self) -> usize {
        self.runs.iter().filter(|r| r.purged).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|r| r.error.is_some()).count()
    }

    #[must_use]
    pub fn run(&self, run_id: Uuid) -> Option<&RunReport> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Records confirmed by the server during this cycle.
    pub delivered: u64,
    pub purged: bool,
    /// Left alone because of a failed-replay marker or a missing identity.
    pub skipped: bool,
    /// Replay stopped at a record kind this cycle does not send.
    pub held_back: bool,
    pub error: Option<String>,
}

impl RunReport {
    fn new(run_id: Uuid) -> Self {
        RunReport {
            run_id,
            delivered: 0,
            purged: false,
            skipped: false,
            held_back: false,
            error: None,
        }
    }
}

pub struct Sender {
    config: Arc<Config>,
    cache: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    locks: LockManager,
}

impl Sender {
    #[must_use]
    pub fn new(config: Arc<Config>, cache: Arc<CacheStore>, transport: Arc<dyn Transport>) -> Self {
        let locks = LockManager::new(cache.root(), config.lock_stale_after);
        Sender {
            config,
            cache,
            transport,
            locks,
        }
    }

    /// Runs one drain cycle.
    ///
    /// Returns [`DrainOutcome::Busy`] without touching the cache when another
    /// sender is active. The lock is released on every exit path.
    pub async fn drain(&self) -> Result<DrainOutcome, SenderError> {
        let locks = self.locks.clone();
        let acquired = tokio::task::spawn_blocking(move || locks.try_acquire())
            .await
            .map_err(|e| SenderError::Task(e.to_string()))??;
        let lock = match acquired {
            Acquire::Acquired(lock) => lock,
            Acquire::Busy(holder) => {
                info!(
                    "Another sender (pid {}) is draining since {}, nothing to do",
                    holder.owner_pid, holder.acquired_at
                );
                return Ok(DrainOutcome::Busy { holder });
            }
        };

        let result = self.drain_locked(lock.ownership()).await;

        match tokio::task::spawn_blocking(move || lock.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to release sender lock: {e}"),
            Err(e) => warn!("Lock release task failed: {e}"),
        }
        result.map(DrainOutcome::Completed)
    }

    async fn drain_locked(&self, ownership: LockOwnership) -> Result<DrainReport, SenderError> {
        let runs = self.blocking(CacheStore::list_runs).await?;
        if runs.is_empty() {
            debug!("Cache is empty");
            return Ok(DrainReport::default());
        }
        info!("Draining {} cached runs", runs.len());

        let mut reports: Vec<RunReport> = stream::iter(runs)
            .map(|run_id| self.drain_run(run_id, ownership.clone()))
            .buffer_unordered(self.config.max_workers.max(1))
            .collect()
            .await;
        reports.sort_by_key(|r| r.run_id);

        let report = DrainReport { runs: reports };
        info!(
            "Drain finished: {} records delivered, {} runs purged, {} runs failed",
            report.delivered(),
            report.purged(),
            report.failed()
        );
        Ok(report)
    }

    async fn drain_run(&self, run_id: Uuid, ownership: LockOwnership) -> RunReport {
        let mut report = RunReport::new(run_id);
        let held = tokio::task::spawn_blocking(move || ownership.is_held())
            .await
            .map_err(|e| SenderError::Task(e.to_string()))
            .and_then(|held| held.map_err(SenderError::from));
        match held {
            Ok(true) => {}
            Ok(false) => {
                warn!("Sender lock was taken over, leaving run {run_id} for its holder");
                report.skipped = true;
                return report;
            }
            Err(e) => {
                error!("Run {run_id}: cannot check the sender lock: {e}");
                report.error = Some(e.to_string());
                return report;
            }
        }
        if let Err(e) = self.replay_run(run_id, &mut report).await {
            error!("Run {run_id}: {e}");
            report.error = Some(e.to_string());
        }
        report
    }

    async fn replay_run(&self, run_id: Uuid, report: &mut RunReport) -> Result<(), SenderError> {
        let identity = match self.blocking(move |cache| cache.read_identity(run_id)).await {
            Ok(identity) => identity,
            Err(SenderError::Cache(CacheError::MissingRun(_))) => {
                debug!("Run {run_id} has no identity yet, skipping");
                report.skipped = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(failure) = self.blocking(move |cache| cache.read_failure(run_id)).await? {
            if !self.config.retry_failed {
                warn!(
                    "Run {run_id} failed permanently at {} ({}), skipping until retried",
                    failure.at, failure.message
                );
                report.skipped = true;
                return Ok(());
            }
            info!("Retrying previously failed run {run_id}");
            self.blocking(move |cache| cache.clear_failure(run_id))
                .await?;
        }

        if let Err(e) = self.transport.create_run(&identity).await {
            return self.fail(run_id, None, e).await;
        }

        let held_back = self.replay_records(&identity, report).await?;
        report.held_back = held_back;
        self.reconcile(run_id, report).await
    }

    /// Sends pending records in sequence order, one cache chunk at a time.
    ///
    /// Returns whether records were held back by the kind filter.
    async fn replay_records(
        &self,
        identity: &RunIdentity,
        report: &mut RunReport,
    ) -> Result<bool, SenderError> {
        let run_id = identity.run_id;
        let limits = self.config.batch_limits();
        let chunk_size = limits.max_records.max(1);

        loop {
            let (mut records, mut broken) = self
                .blocking(move |cache| read_chunk(cache, run_id, chunk_size))
                .await?;
            if records.is_empty() && broken.is_none() {
                return Ok(false);
            }

            let filtered = records
                .iter()
                .position(|r| !self.config.replays(r.record.kind()));
            if let Some(stop) = filtered {
                records.truncate(stop);
                broken = None;
            }

            let mut batcher = Batcher::new(run_id, limits);
            for record in records {
                let size = record.encoded_len().unwrap_or(0);
                batcher.push(record, size);
            }
            while let Some(batch) = batcher.next_batch() {
                if let Err(e) = self.transport.submit(&batch).await {
                    return self
                        .fail(run_id, Some(batch.first_seq()), e)
                        .await
                        .map(|()| false);
                }
                let up_to = batch.last_seq();
                self.blocking(move |cache| cache.remove_confirmed(run_id, up_to))
                    .await?;
                report.delivered += batch.len() as u64;
            }

            if filtered.is_some() {
                debug!("Run {run_id}: remaining records are not selected for replay");
                return Ok(true);
            }

            if let Some(e) = broken {
                let failure = ReplayFailure {
                    seq: None,
                    status: None,
                    message: e.to_string(),
                    at: OffsetDateTime::now_utc(),
                };
                self.blocking(move |cache| cache.mark_failed(run_id, &failure))
                    .await?;
                return Err(e.into());
            }
        }
    }

    /// Forwards liveness or final status, then purges finished runs.
    async fn reconcile(&self, run_id: Uuid, report: &mut RunReport) -> Result<(), SenderError> {
        // The producer may have closed the run while we were replaying.
        let identity = self.blocking(move |cache| cache.read_identity(run_id)).await?;

        if !identity.status.is_terminal() {
            let at = self
                .blocking(move |cache| cache.read_heartbeat(run_id))
                .await?
                .unwrap_or_else(OffsetDateTime::now_utc);
            if let Err(e) = self.transport.heartbeat(run_id, at).await {
                return self.fail(run_id, None, e).await;
            }
            debug!("Run {run_id} is {}, heartbeat forwarded", identity.status);
            return Ok(());
        }

        if report.held_back {
            debug!(
                "Run {run_id} is {} but has records held back, status deferred",
                identity.status
            );
            return Ok(());
        }
        if let Err(e) = self.transport.update_status(run_id, identity.status).await {
            return self.fail(run_id, None, e).await;
        }
        match self.blocking(move |cache| cache.purge(run_id)).await {
            Ok(()) => {
                info!("Run {run_id} is {}, cache purged", identity.status);
                report.purged = true;
                Ok(())
            }
            Err(SenderError::Cache(CacheError::NotPurgeable { reason, .. })) => {
                debug!("Run {run_id} kept: {reason}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stops the run for this cycle, leaving a marker if the error will not
    /// go away on its own.
    async fn fail(
        &self,
        run_id: Uuid,
        seq: Option<u64>,
        error: TransportError,
    ) -> Result<(), SenderError> {
        if !error.is_transient() {
            let failure = ReplayFailure {
                seq,
                status: error.status(),
                message: error.to_string(),
                at: OffsetDateTime::now_utc(),
            };
            self.blocking(move |cache| cache.mark_failed(run_id, &failure))
                .await?;
        }
        Err(error.into())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SenderError>
    where
        F: FnOnce(&CacheStore) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        tokio::task::spawn_blocking(move || f(&cache))
            .await
            .map_err(|e| SenderError::Task(e.to_string()))?
            .map_err(SenderError::from)
    }
}

/// Reads up to `limit` pending records, stopping at the first unreadable one.
fn read_chunk(
    cache: &CacheStore,
    run_id: Uuid,
    limit: usize,
) -> Result<(Vec<SequencedRecord>, Option<CacheError>), CacheError> {
    let mut records = Vec::new();
    for item in cache.read_pending(run_id)?.take(limit) {
        match item {
            Ok(record) => records.push(record),
            Err(e @ CacheError::Corrupt { .. }) => return Ok((records, Some(e))),
            Err(e) => return Err(e),
        }
    }
    Ok((records, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LOCK_FILE_NAME;
    use crate::record::{RecordKind, RunMode, RunStatus, TelemetryRecord};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    use crate::batch::Batch;

    #[derive(Default)]
    struct ScriptedTransport {
        submitted: Mutex<HashMap<Uuid, Vec<u64>>>,
        heartbeats: Mutex<Vec<Uuid>>,
        statuses: Mutex<Vec<(Uuid, RunStatus)>>,
        rejected_run: Mutex<Option<Uuid>>,
        unavailable: AtomicBool,
        /// Lock file overwritten by a foreign sender on the next create_run
        steal_lock: Mutex<Option<std::path::PathBuf>>,
    }

    impl ScriptedTransport {
        fn check(&self, run_id: Uuid) -> Result<(), TransportError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(TransportError::Transient("HTTP 503".to_string()));
            }
            if *self.rejected_run.lock().unwrap() == Some(run_id) {
                return Err(TransportError::Permanent {
                    status: Some(422),
                    message: "malformed".to_string(),
                });
            }
            Ok(())
        }

        fn submitted(&self, run_id: Uuid) -> Vec<u64> {
            self.submitted
                .lock()
                .unwrap()
                .get(&run_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn create_run(&self, _identity: &RunIdentity) -> Result<(), TransportError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(TransportError::Transient("connection refused".to_string()));
            }
            if let Some(path) = self.steal_lock.lock().unwrap().take() {
                let foreign = LockInfo {
                    owner_pid: 1,
                    acquired_at: OffsetDateTime::now_utc(),
                };
                std::fs::write(path, serde_json::to_vec(&foreign).unwrap()).unwrap();
            }
            Ok(())
        }

        async fn submit(&self, batch: &Batch) -> Result<(), TransportError> {
            self.check(batch.run_id)?;
            self.submitted
                .lock()
                .unwrap()
                .entry(batch.run_id)
                .or_default()
                .extend(batch.records.iter().map(|r| r.seq));
            Ok(())
        }

        async fn heartbeat(&self, run_id: Uuid, _at: OffsetDateTime) -> Result<(), TransportError> {
            self.check(run_id)?;
            self.heartbeats.lock().unwrap().push(run_id);
            Ok(())
        }

        async fn update_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), TransportError> {
            self.check(run_id)?;
            self.statuses.lock().unwrap().push((run_id, status));
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        cache: Arc<CacheStore>,
        transport: Arc<ScriptedTransport>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().expect("failed to create temp dir");
            let cache = Arc::new(CacheStore::open(dir.path()).expect("failed to open cache"));
            Fixture {
                dir,
                cache,
                transport: Arc::new(ScriptedTransport::default()),
            }
        }

        fn cached_run(&self, status: RunStatus, steps: u64) -> Uuid {
            let mut identity = RunIdentity::new("cached", RunMode::Offline);
            identity.status = status;
            self.cache.write_identity(&identity).unwrap();
            for seq in 1..=steps {
                self.cache
                    .append(
                        identity.run_id,
                        &SequencedRecord {
                            seq,
                            record: TelemetryRecord::metric("loss", 0.1, seq as i64),
                        },
                    )
                    .unwrap();
            }
            identity.run_id
        }

        fn sender(&self, config: Config) -> Sender {
            Sender::new(
                Arc::new(config),
                Arc::clone(&self.cache),
                Arc::clone(&self.transport) as Arc<dyn Transport>,
            )
        }

        async fn drain(&self, config: Config) -> DrainReport {
            match self.sender(config).drain().await.expect("drain failed") {
                DrainOutcome::Completed(report) => report,
                DrainOutcome::Busy { .. } => panic!("lock unexpectedly busy"),
            }
        }
    }

    fn small_batches() -> Config {
        Config {
            max_batch_records: 2,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_drain_replays_and_purges_completed_run() {
        let fixture = Fixture::new();
        let run_id = fixture.cached_run(RunStatus::Completed, 5);

        let report = fixture.drain(small_batches()).await;

        assert_eq!(fixture.transport.submitted(run_id), vec![1, 2, 3, 4, 5]);
        let run = report.run(run_id).unwrap();
        assert_eq!(run.delivered, 5);
        assert!(run.purged);
        assert!(!fixture.cache.contains(run_id));
        assert_eq!(
            *fixture.transport.statuses.lock().unwrap(),
            vec![(run_id, RunStatus::Completed)]
        );
        assert!(!fixture.dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_active_run_gets_heartbeat_and_is_kept() {
        let fixture = Fixture::new();
        let run_id = fixture.cached_run(RunStatus::Running, 2);

        let report = fixture.drain(small_batches()).await;

        assert_eq!(report.run(run_id).unwrap().delivered, 2);
        assert!(!report.run(run_id).unwrap().purged);
        assert!(fixture.cache.contains(run_id));
        assert!(!fixture.cache.has_pending(run_id).unwrap());
        assert_eq!(*fixture.transport.heartbeats.lock().unwrap(), vec![run_id]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_busy_lock_is_a_no_op() {
        let fixture = Fixture::new();
        let run_id = fixture.cached_run(RunStatus::Completed, 3);
        let held = LockManager::new(fixture.dir.path(), Config::default().lock_stale_after)
            .try_acquire()
            .unwrap();
        assert!(matches!(held, Acquire::Acquired(_)));

        let outcome = fixture.sender(Config::default()).drain().await.unwrap();
        match outcome {
            DrainOutcome::Busy { holder } => assert_eq!(holder.owner_pid, std::process::id()),
            DrainOutcome::Completed(_) => panic!("second sender must not drain"),
        }
        assert!(fixture.transport.submitted(run_id).is_empty());
        assert!(fixture.cache.has_pending(run_id).unwrap());
        assert!(logs_contain("nothing to do"));
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_records_without_marker() {
        let fixture = Fixture::new();
        let run_id = fixture.cached_run(RunStatus::Completed, 3);
        fixture.transport.unavailable.store(true, Ordering::SeqCst);

        let report = fixture.drain(small_batches()).await;

        assert!(report.run(run_id).unwrap().error.is_some());
        assert!(fixture.cache.has_pending(run_id).unwrap());
        assert_eq!(fixture.cache.read_failure(run_id).unwrap(), None);
    }

    #[tokio::test]
    async fn test_permanent_failure_isolates_run() {
        let fixture = Fixture::new();
        let bad = fixture.cached_run(RunStatus::Completed, 3);
        let good = fixture.cached_run(RunStatus::Completed, 3);
        *fixture.transport.rejected_run.lock().unwrap() = Some(bad);

        let report = fixture.drain(small_batches()).await;

        assert!(report.run(good).unwrap().purged);
        let failed = report.run(bad).unwrap();
        assert!(failed.error.is_some());
        assert_eq!(failed.delivered, 0);
        let marker = fixture.cache.read_failure(bad).unwrap().unwrap();
        assert_eq!((marker.seq, marker.status), (Some(1), Some(422)));
        assert_eq!(fixture.cache.read_pending(bad).unwrap().remaining(), 3);

        // marked runs are skipped until retried explicitly
        *fixture.transport.rejected_run.lock().unwrap() = None;
        let report = fixture.drain(small_batches()).await;
        assert!(report.run(bad).unwrap().skipped);
        assert!(fixture.cache.contains(bad));

        let report = fixture
            .drain(Config {
                retry_failed: true,
                ..small_batches()
            })
            .await;
        assert!(report.run(bad).unwrap().purged);
        assert_eq!(fixture.transport.submitted(bad), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_corrupt_record_stops_run_after_delivering_prefix() {
        let fixture = Fixture::new();
        let run_id = fixture.cached_run(RunStatus::Completed, 2);
        std::fs::write(
            fixture
                .dir
                .path()
                .join("runs")
                .join(run_id.to_string())
                .join("records")
                .join("00000000000000000003.json"),
            b"garbage",
        )
        .unwrap();

        let report = fixture.drain(Config::default()).await;

        let run = report.run(run_id).unwrap();
        assert_eq!(run.delivered, 2);
        assert!(run.error.is_some());
        assert!(!run.purged);
        assert!(fixture.cache.read_failure(run_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_identity_without_records_is_purged_after_status() {
        let fixture = Fixture::new();
        let run_id = fixture.cached_run(RunStatus::Failed, 0);

        let report = fixture.drain(Config::default()).await;

        assert!(report.run(run_id).unwrap().purged);
        assert_eq!(
            *fixture.transport.statuses.lock().unwrap(),
            vec![(run_id, RunStatus::Failed)]
        );
    }

    #[tokio::test]
    async fn test_runs_drain_with_single_worker() {
        let fixture = Fixture::new();
        let runs: Vec<Uuid> = (0..4)
            .map(|_| fixture.cached_run(RunStatus::Completed, 3))
            .collect();

        let report = fixture
            .drain(Config {
                max_workers: 1,
                ..small_batches()
            })
            .await;

        assert_eq!(report.purged(), 4);
        for run_id in runs {
            assert_eq!(fixture.transport.submitted(run_id), vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_kind_filter_holds_back_rest_of_run() {
        let fixture = Fixture::new();
        let run_id = fixture.cached_run(RunStatus::Completed, 2);
        let alert = TelemetryRecord::Alert(crate::record::AlertDeclaration {
            name: "nan-loss".to_string(),
            rule: serde_json::json!({ "metric": "loss" }),
        });
        for (seq, record) in [
            (3, alert),
            (4, TelemetryRecord::metric("loss", 0.1, 4)),
        ] {
            fixture
                .cache
                .append(run_id, &SequencedRecord { seq, record })
                .unwrap();
        }

        let metrics_only = Config {
            replay_kinds: Some(vec![RecordKind::Metric]),
            ..small_batches()
        };
        let report = fixture.drain(metrics_only).await;

        let run = report.run(run_id).unwrap();
        assert_eq!(run.delivered, 2);
        assert!(run.held_back);
        assert!(!run.purged);
        assert!(run.error.is_none());
        assert_eq!(fixture.transport.submitted(run_id), vec![1, 2]);
        assert!(fixture.transport.statuses.lock().unwrap().is_empty());
        assert_eq!(fixture.cache.read_pending(run_id).unwrap().remaining(), 2);

        let report = fixture.drain(small_batches()).await;
        assert!(report.run(run_id).unwrap().purged);
        assert_eq!(fixture.transport.submitted(run_id), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_lost_lock_stops_before_next_run() {
        let fixture = Fixture::new();
        for _ in 0..2 {
            fixture.cached_run(RunStatus::Completed, 2);
        }
        *fixture.transport.steal_lock.lock().unwrap() =
            Some(fixture.dir.path().join(LOCK_FILE_NAME));

        let report = fixture
            .drain(Config {
                max_workers: 1,
                ..small_batches()
            })
            .await;

        // The run in flight when the lock changed hands still finishes
        assert_eq!(report.purged(), 1);
        assert_eq!(report.runs.iter().filter(|r| r.skipped).count(), 1);
        assert!(logs_contain("taken over"));
        // The foreign lock is left in place
        assert!(fixture.dir.path().join(LOCK_FILE_NAME).exists());
    }
}
