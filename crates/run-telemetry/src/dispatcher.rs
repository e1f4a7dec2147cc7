// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-run background batcher between producers and delivery.
//!
//! ```text
//!    ┌──────────────┐
//!    │   Handles    │ (any number of producers)
//!    └──────┬───────┘
//!           │ bounded channel, records stamped with seq on receipt
//!           v
//!    ┌──────────────┐   size or age trigger   ┌─────────────┐
//!    │   Service    │ ──────────────────────> │  Transport  │ (online)
//!    │  task (1/run)│ ──────────┐             └─────────────┘
//!    └──────────────┘           │ offline, or after a failed delivery
//!                               v
//!                        ┌─────────────┐
//!                        │ Cache Store │ ──> Sender
//!                        └─────────────┘
//! ```
//!
//! Sequence numbers are assigned by the service task in channel order, so
//! records from concurrent producers still get contiguous numbers.
//!
//! Once an online run falls back to the cache it keeps writing there until
//! the sender has drained the run's pending log; the server never sees a
//! later record before an earlier one.
//!
//! While the run is active a heartbeat goes out every heartbeat interval,
//! to the server when online and to the cache entry otherwise.
//!
//! With `max_requests_per_second` set, online submissions are spaced at
//! least `1 / rate` apart. The wait counts against the shutdown deadline.
//!
//! Delivery failures never reach producers. Shutdown drains the channel and
//! keeps delivering until its deadline; whatever is left is written to the
//! cache.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{Batch, Batcher};
use crate::cache::{CacheError, CacheStore};
use crate::config::Config;
use crate::record::{RunIdentity, RunMode, RunStatus, SequencedRecord, TelemetryRecord};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher has been shut down")]
    Closed,
    #[error("dispatch queue still full after {0:?}")]
    CapacityExceeded(Duration),
    #[error("record of {size} bytes exceeds the {limit} byte limit")]
    RecordTooLarge { size: usize, limit: usize },
    #[error("cannot encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("dispatcher task failed: {0}")]
    Task(String),
}

/// Where the records of a dispatcher ended up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Records confirmed by the server.
    pub delivered: u64,
    /// Records written to the cache for the sender.
    pub cached: u64,
    /// Records that could be neither delivered nor cached.
    pub lost: u64,
}

enum DispatchCommand {
    Record {
        record: TelemetryRecord,
        size: usize,
    },
    Flush(oneshot::Sender<()>),
    Close(RunStatus, oneshot::Sender<()>),
}

/// Cloneable producer side of a [`Dispatcher`].
#[derive(Clone, Debug)]
pub struct DispatcherHandle {
    run_id: Uuid,
    tx: mpsc::Sender<DispatchCommand>,
    closed: Arc<AtomicBool>,
    enqueue_timeout: Duration,
    max_record_bytes: usize,
}

impl std::fmt::Debug for DispatchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchCommand::Record { record, size } => f
                .debug_struct("Record")
                .field("kind", &record.kind())
                .field("size", size)
                .finish(),
            DispatchCommand::Flush(_) => f.write_str("Flush"),
            DispatchCommand::Close(status, _) => f.debug_tuple("Close").field(status).finish(),
        }
    }
}

impl DispatcherHandle {
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Queues a record for delivery.
    ///
    /// Waits up to the enqueue timeout when the queue is full; never waits on
    /// network or disk.
    pub async fn enqueue(&self, record: TelemetryRecord) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Closed);
        }
        let size = serde_json::to_vec(&record)?.len();
        if size > self.max_record_bytes {
            return Err(DispatchError::RecordTooLarge {
                size,
                limit: self.max_record_bytes,
            });
        }
        match self
            .tx
            .send_timeout(DispatchCommand::Record { record, size }, self.enqueue_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Err(DispatchError::CapacityExceeded(self.enqueue_timeout))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Flushes everything queued before this call and waits for it.
    pub async fn flush_now(&self) -> Result<(), DispatchError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.request(DispatchCommand::Flush(ack_tx), ack_rx).await
    }

    /// Flushes queued records, then records the run's final status.
    pub async fn close(&self, status: RunStatus) -> Result<(), DispatchError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.request(DispatchCommand::Close(status, ack_tx), ack_rx)
            .await
    }

    async fn request(
        &self,
        command: DispatchCommand,
        ack: oneshot::Receiver<()>,
    ) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Closed);
        }
        self.tx
            .send(command)
            .await
            .map_err(|_| DispatchError::Closed)?;
        ack.await.map_err(|_| DispatchError::Closed)
    }
}

/// Owner of a run's dispatch task.
///
/// Dropping every handle and the dispatcher also drains the queue, with
/// the configured shutdown timeout, but only [`Dispatcher::shutdown`] lets
/// the caller wait for it.
#[derive(Debug)]
pub struct Dispatcher {
    handle: DispatcherHandle,
    shutdown_tx: watch::Sender<Option<Instant>>,
    shutdown_timeout: Duration,
    task: JoinHandle<DispatchStats>,
}

impl Dispatcher {
    /// Spawns the dispatch task for `identity`.
    ///
    /// Numbering continues after the highest sequence already cached for
    /// the run, and an online run with pending cached records starts in
    /// fallback.
    pub async fn start(
        identity: RunIdentity,
        config: Arc<Config>,
        cache: Arc<CacheStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, DispatchError> {
        let run_id = identity.run_id;
        let (next_seq, has_pending) = {
            let cache = Arc::clone(&cache);
            tokio::task::spawn_blocking(move || -> Result<(u64, bool), CacheError> {
                if !cache.contains(run_id) {
                    return Ok((1, false));
                }
                let next_seq = cache.last_sequence(run_id)?.map_or(1, |seq| seq + 1);
                Ok((next_seq, cache.has_pending(run_id)?))
            })
            .await
            .map_err(|e| DispatchError::Task(e.to_string()))??
        };

        let fallback = identity.mode == RunMode::Online && has_pending;
        if next_seq > 1 {
            debug!("Run {run_id}: resuming at sequence {next_seq}");
        }
        if fallback {
            info!("Run {run_id} has cached records, writing to cache until drained");
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let closed = Arc::new(AtomicBool::new(false));
        let handle = DispatcherHandle {
            run_id,
            tx,
            closed: Arc::clone(&closed),
            enqueue_timeout: config.enqueue_timeout,
            max_record_bytes: config.max_record_bytes,
        };
        let service = DispatchService {
            batcher: Batcher::new(run_id, config.batch_limits()),
            shutdown_timeout: config.shutdown_timeout,
            flush_interval: config.flush_interval,
            heartbeat_interval: config.heartbeat_interval,
            next_heartbeat: instant_after(Instant::now(), config.heartbeat_interval),
            pacer: RequestPacer::new(config.max_requests_per_second),
            identity,
            cache,
            transport,
            rx,
            shutdown_rx,
            deadline: None,
            next_seq,
            oldest: None,
            fallback,
            registered: false,
            stats: DispatchStats::default(),
        };

        Ok(Dispatcher {
            handle,
            shutdown_tx,
            shutdown_timeout: config.shutdown_timeout,
            task: tokio::spawn(service.run()),
        })
    }

    #[must_use]
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.handle.run_id
    }

    pub async fn enqueue(&self, record: TelemetryRecord) -> Result<(), DispatchError> {
        self.handle.enqueue(record).await
    }

    pub async fn flush_now(&self) -> Result<(), DispatchError> {
        self.handle.flush_now().await
    }

    pub async fn close(&self, status: RunStatus) -> Result<(), DispatchError> {
        self.handle.close(status).await
    }

    /// Stops accepting records, drains the queue and waits for the task.
    ///
    /// Delivery is attempted until the shutdown timeout elapses; every
    /// record not delivered by then is written to the cache.
    pub async fn shutdown(self) -> Result<DispatchStats, DispatchError> {
        self.handle.closed.store(true, Ordering::Release);
        let deadline = instant_after(Instant::now(), self.shutdown_timeout);
        // The task may already have exited if every handle was dropped.
        let _ = self.shutdown_tx.send(Some(deadline));
        let stats = self
            .task
            .await
            .map_err(|e| DispatchError::Task(e.to_string()))?;
        debug!(
            "Run {} shut down: {} delivered, {} cached, {} lost",
            self.handle.run_id, stats.delivered, stats.cached, stats.lost
        );
        Ok(stats)
    }
}

struct DispatchService {
    identity: RunIdentity,
    cache: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    rx: mpsc::Receiver<DispatchCommand>,
    shutdown_rx: watch::Receiver<Option<Instant>>,
    /// Set once draining; delivery attempts stop at this instant.
    deadline: Option<Instant>,
    batcher: Batcher,
    flush_interval: Duration,
    heartbeat_interval: Duration,
    next_heartbeat: Instant,
    pacer: RequestPacer,
    shutdown_timeout: Duration,
    next_seq: u64,
    /// Arrival time of the oldest unflushed record.
    oldest: Option<Instant>,
    fallback: bool,
    registered: bool,
    stats: DispatchStats,
}

impl DispatchService {
    async fn run(mut self) -> DispatchStats {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let flush_at = self
                .oldest
                .map(|oldest| instant_after(oldest, self.flush_interval));
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("All handles dropped, draining");
                        self.drain(instant_after(Instant::now(), self.shutdown_timeout))
                            .await;
                        break;
                    }
                },
                deadline = wait_for_shutdown(&mut shutdown) => {
                    self.drain(deadline).await;
                    break;
                }
                () = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    self.flush().await;
                }
                () = sleep_until(self.next_heartbeat), if !self.identity.status.is_terminal() => {
                    self.heartbeat().await;
                }
            }
        }
        self.stats
    }

    async fn handle(&mut self, command: DispatchCommand) {
        match command {
            DispatchCommand::Record { record, size } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.batcher.push(SequencedRecord { seq, record }, size);
                if self.oldest.is_none() {
                    self.oldest = Some(Instant::now());
                }
                if self.batcher.is_full() {
                    self.flush().await;
                }
            }
            DispatchCommand::Flush(ack) => {
                self.flush().await;
                let _ = ack.send(());
            }
            DispatchCommand::Close(status, ack) => {
                self.flush().await;
                self.close_run(status).await;
                let _ = ack.send(());
            }
        }
    }

    async fn drain(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
        self.rx.close();
        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
        }
        self.flush().await;
    }

    fn delivers_online(&self) -> bool {
        self.identity.mode == RunMode::Online && !self.fallback
    }

    async fn flush(&mut self) {
        self.oldest = None;
        if self.batcher.is_empty() {
            return;
        }
        self.resume_if_drained().await;

        while let Some(batch) = self.batcher.next_batch() {
            if self.delivers_online() {
                match self.deliver(&batch).await {
                    Ok(()) => {
                        self.stats.delivered += batch.len() as u64;
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            "Run {}: delivery of {}..={} failed ({}), caching from now on",
                            batch.run_id,
                            batch.first_seq(),
                            batch.last_seq(),
                            e
                        );
                        self.fallback = true;
                    }
                }
            }
            self.persist(batch).await;
        }
    }

    async fn deliver(&mut self, batch: &Batch) -> Result<(), TransportError> {
        self.ensure_registered().await?;
        let slot = self.pacer.reserve();
        let transport = Arc::clone(&self.transport);
        guarded(self.cutoff(), self.shutdown_rx.clone(), async move {
            if let Some(slot) = slot {
                sleep_until(slot).await;
            }
            transport.submit(batch).await
        })
        .await
    }

    async fn ensure_registered(&mut self) -> Result<(), TransportError> {
        if !self.registered {
            guarded(
                self.cutoff(),
                self.shutdown_rx.clone(),
                self.transport.create_run(&self.identity),
            )
            .await?;
            self.registered = true;
        }
        Ok(())
    }

    /// Deadline for transport calls, once shutdown has started.
    fn cutoff(&self) -> Option<Instant> {
        let published = *self.shutdown_rx.borrow();
        self.deadline.or(published)
    }

    async fn heartbeat(&mut self) {
        self.next_heartbeat = instant_after(Instant::now(), self.heartbeat_interval);
        let run_id = self.identity.run_id;
        let now = OffsetDateTime::now_utc();

        if self.delivers_online() {
            let result = match self.ensure_registered().await {
                Ok(()) => {
                    guarded(
                        self.cutoff(),
                        self.shutdown_rx.clone(),
                        self.transport.heartbeat(run_id, now),
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                debug!("Run {run_id}: heartbeat failed: {e}");
            }
            return;
        }

        let cache = Arc::clone(&self.cache);
        let result = tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            if cache.contains(run_id) {
                cache.touch_heartbeat(run_id, now)?;
            }
            Ok(())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Run {run_id}: cannot stamp heartbeat: {e}"),
            Err(e) => debug!("Run {run_id}: heartbeat task failed: {e}"),
        }
    }

    /// Leaves fallback once the sender has confirmed every cached record.
    async fn resume_if_drained(&mut self) {
        if self.identity.mode != RunMode::Online || !self.fallback {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let run_id = self.identity.run_id;
        match tokio::task::spawn_blocking(move || cache.has_pending(run_id)).await {
            Ok(Ok(false)) => {
                info!("Run {run_id}: cache drained, resuming online delivery");
                self.fallback = false;
            }
            Ok(Ok(true)) => {}
            Ok(Err(e)) => debug!("Run {run_id}: cannot inspect cache: {e}"),
            Err(e) => debug!("Run {run_id}: cache inspection task failed: {e}"),
        }
    }

    async fn persist(&mut self, batch: Batch) {
        let cache = Arc::clone(&self.cache);
        let identity = self.identity.clone();
        let count = batch.len() as u64;
        let (first, last) = (batch.first_seq(), batch.last_seq());
        let result = tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            cache.ensure_identity(&identity)?;
            cache.append_batch(&batch)?;
            cache.touch_heartbeat(identity.run_id, OffsetDateTime::now_utc())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.stats.cached += count;
                debug!(
                    "Run {}: cached {}..={}",
                    self.identity.run_id, first, last
                );
            }
            Ok(Err(e)) => {
                self.stats.lost += count;
                error!(
                    "Run {}: failed to cache {}..={}: {}",
                    self.identity.run_id, first, last, e
                );
            }
            Err(e) => {
                self.stats.lost += count;
                error!(
                    "Run {}: cache task for {}..={} failed: {}",
                    self.identity.run_id, first, last, e
                );
            }
        }
    }

    async fn close_run(&mut self, status: RunStatus) {
        let run_id = self.identity.run_id;
        if !self.identity.status.can_transition_to(status) {
            warn!(
                "Run {run_id}: ignoring status {status} after {}",
                self.identity.status
            );
            return;
        }
        self.identity.status = status;

        if self.delivers_online() {
            let result = match self.ensure_registered().await {
                Ok(()) => {
                    guarded(
                        self.cutoff(),
                        self.shutdown_rx.clone(),
                        self.transport.update_status(run_id, status),
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    debug!("Run {run_id}: status {status} delivered");
                    // An entry left by an earlier fallback must reach a
                    // terminal status too, or the sender never purges it.
                    self.cache_status(false).await;
                    return;
                }
                Err(e) => {
                    warn!("Run {run_id}: status update failed ({e}), caching it");
                    self.fallback = true;
                }
            }
        }

        self.cache_status(true).await;
    }

    /// Writes the run's status to its cache entry. Without `create`, a run
    /// that has no entry is left alone.
    async fn cache_status(&self, create: bool) {
        let cache = Arc::clone(&self.cache);
        let identity = self.identity.clone();
        let (run_id, status) = (identity.run_id, identity.status);
        let result = tokio::task::spawn_blocking(move || -> Result<bool, CacheError> {
            if !create && !cache.contains(identity.run_id) {
                return Ok(false);
            }
            cache.ensure_identity(&identity)?;
            cache.update_status(identity.run_id, identity.status)?;
            Ok(true)
        })
        .await;
        match result {
            Ok(Ok(true)) => debug!("Run {run_id}: status {status} cached"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => error!("Run {run_id}: failed to cache status {status}: {e}"),
            Err(e) => error!("Run {run_id}: status cache task failed: {e}"),
        }
    }
}

/// Spaces online submissions at least `1 / rate` apart.
#[derive(Debug)]
struct RequestPacer {
    interval: Option<Duration>,
    next_slot: Option<Instant>,
}

impl RequestPacer {
    fn new(max_per_second: u32) -> Self {
        RequestPacer {
            interval: (max_per_second > 0).then(|| Duration::from_secs(1) / max_per_second),
            next_slot: None,
        }
    }

    /// Claims the next free slot, or `None` when unlimited.
    fn reserve(&mut self) -> Option<Instant> {
        let interval = self.interval?;
        let now = Instant::now();
        let slot = self.next_slot.map_or(now, |next| next.max(now));
        self.next_slot = Some(slot + interval);
        Some(slot)
    }
}

/// `from + delay`, saturating far in the future instead of overflowing.
fn instant_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Runs a transport call, cutting it off at the shutdown deadline.
///
/// Without a deadline yet, the call runs freely until shutdown publishes
/// one.
async fn guarded<F>(
    cutoff: Option<Instant>,
    mut shutdown: watch::Receiver<Option<Instant>>,
    call: F,
) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    tokio::pin!(call);
    let deadline = match cutoff {
        Some(deadline) => deadline,
        None => tokio::select! {
            result = &mut call => return result,
            deadline = wait_for_shutdown(&mut shutdown) => deadline,
        },
    };
    match timeout_at(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Transient(
            "shutdown deadline reached".to_string(),
        )),
    }
}

/// Resolves with the shutdown deadline once one is published; never
/// resolves if the dispatcher went away without publishing one.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<Option<Instant>>) -> Instant {
    loop {
        let published = *shutdown.borrow_and_update();
        if let Some(deadline) = published {
            return deadline;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
