//! Batched Mutation Pipeline
//!
//! All writes flow through per-(tenant, sheet) lanes that coalesce bursts
//! into batched remote calls, absorb the remote store's quota rejections
//! with retries, and resolve each caller's ticket once its operation has
//! actually landed.
//!
//! ```text
//! enqueue ──→ lane (tenant, sheet) ──→ drain task
//!               FIFO VecDeque            │ linger window, cut short once a
//!                                        │   full batch is queued
//!                                        │ coalesce appends (≤ max_batch_rows)
//!                                        │ tenant-bucket admission
//!                                        │ remote call + timeout + retries
//!                                        │ invalidate sheet cache
//!                                        ▼
//!                                  resolve tickets
//! ```
//!
//! ## Ordering
//!
//! One drain task owns a lane at a time, so operations on the same
//! (tenant, sheet) apply in submission order even across retries. Distinct
//! lanes drain concurrently, bounded by a global worker budget.
//!
//! ## Retry and Resolution
//!
//! A batch is retried as a whole on transient errors with jittered
//! exponential backoff; exhaustion or a terminal error rejects every ticket
//! in the batch. Tenant-bucket throttling is absorbed inside the drain task
//! (the caller already holds a ticket) rather than surfaced. After a batch
//! succeeds, the written sheet's cache entries are dropped *before* any
//! ticket resolves, so a caller that awaits its ticket and then reads can
//! never see the pre-write state.

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::invalidation::Invalidator;
use crate::pool::ConnectionPool;
use crate::rate_limiter::{RateLimiter, Scope};
use crate::registry::TenantRegistry;
use crate::remote::RemoteError;
use crate::retry::RetryPolicy;
use rowgate_core::{CellMap, OpId, RowPatch, RowRef, WriteKind};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// A single queued mutation.
#[derive(Debug, Clone)]
pub enum WriteOp {
    AddRows { rows: Vec<CellMap> },
    UpdateRow { row_ref: RowRef, patch: RowPatch },
    DeleteRow { row_ref: RowRef },
}

impl WriteOp {
    pub fn kind(&self) -> WriteKind {
        match self {
            WriteOp::AddRows { .. } => WriteKind::AddRows,
            WriteOp::UpdateRow { .. } => WriteKind::UpdateRow,
            WriteOp::DeleteRow { .. } => WriteKind::DeleteRow,
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            WriteOp::AddRows { rows } => rows.len(),
            _ => 1,
        }
    }
}

/// What a resolved write produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Row references assigned by the store, in submission order.
    Appended(Vec<RowRef>),
    Updated,
    Deleted,
}

/// Caller's handle to a queued write.
///
/// Dropping the ticket abandons the result; the write still applies.
#[derive(Debug)]
pub struct WriteTicket {
    pub op_id: OpId,
    receiver: oneshot::Receiver<Result<WriteOutcome>>,
}

impl WriteTicket {
    /// Wait for the operation to land remotely (or fail terminally).
    pub async fn wait(self) -> Result<WriteOutcome> {
        match self.receiver.await {
            Ok(result) => result,
            // Sender dropped without resolving: the queue was torn down.
            Err(_) => Err(Error::ShuttingDown),
        }
    }
}

struct PendingOp {
    op_id: OpId,
    op: WriteOp,
    done: oneshot::Sender<Result<WriteOutcome>>,
}

/// Where a lane's current batch stands. Inspectable for telemetry and tests;
/// the drain task is the only writer.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchPhase {
    /// Operations queued, no batch in flight yet.
    Pending,
    /// A remote call is in progress.
    InFlight,
    /// The last attempt failed transiently; waiting out the backoff.
    Retrying { attempt: usize, next_delay: Duration },
    /// The most recent batch completed (resolved or rejected).
    Done,
}

struct Lane {
    ops: VecDeque<PendingOp>,
    draining: bool,
    phase: BatchPhase,
    /// Signalled when the lane holds a full batch, cutting the linger short.
    full: Arc<Notify>,
}

impl Lane {
    fn queued_rows(&self) -> usize {
        self.ops.iter().map(|p| p.op.row_count()).sum()
    }
}

impl Default for Lane {
    fn default() -> Self {
        Self {
            ops: VecDeque::new(),
            draining: false,
            phase: BatchPhase::Pending,
            full: Arc::new(Notify::new()),
        }
    }
}

type LaneKey = (String, String); // (tenant_id, sheet)

/// Queue counters.
#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    batches_sent: AtomicU64,
    rows_written: AtomicU64,
    batches_failed: AtomicU64,
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub depth: usize,
    pub enqueued: u64,
    pub batches_sent: u64,
    pub rows_written: u64,
    pub batches_failed: u64,
}

/// Per-(tenant, sheet) write queue with batching, admission and retry.
pub struct BatchQueue {
    config: QueueConfig,
    remote_timeout: Duration,
    limiter: Arc<RateLimiter>,
    registry: Arc<TenantRegistry>,
    pool: Arc<ConnectionPool>,
    invalidator: Arc<Invalidator>,
    lanes: Mutex<HashMap<LaneKey, Lane>>,
    drain_budget: Arc<Semaphore>,
    next_op: AtomicU64,
    closing: AtomicBool,
    counters: QueueCounters,
}

impl BatchQueue {
    pub fn new(
        config: QueueConfig,
        remote_timeout: Duration,
        limiter: Arc<RateLimiter>,
        registry: Arc<TenantRegistry>,
        pool: Arc<ConnectionPool>,
        invalidator: Arc<Invalidator>,
    ) -> Self {
        let budget = config.worker_budget.max(1);
        Self {
            config,
            remote_timeout,
            limiter,
            registry,
            pool,
            invalidator,
            lanes: Mutex::new(HashMap::new()),
            drain_budget: Arc::new(Semaphore::new(budget)),
            next_op: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            counters: QueueCounters::default(),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.max_attempts,
            Duration::from_millis(self.config.retry_base_ms),
            Duration::from_millis(self.config.retry_cap_ms),
            self.config.retry_multiplier,
        )
    }

    /// Queue a mutation, returning a ticket that resolves when it lands.
    ///
    /// Returns immediately; admission, batching and retries all happen in the
    /// lane's drain task.
    pub fn enqueue(
        self: &Arc<Self>,
        tenant_id: &str,
        sheet: &str,
        op: WriteOp,
    ) -> Result<WriteTicket> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if op.row_count() == 0 {
            return Err(Error::Invalid("empty write".to_string()));
        }

        let op_id = OpId(self.next_op.fetch_add(1, Ordering::SeqCst));
        let (done, receiver) = oneshot::channel();
        let key: LaneKey = (tenant_id.to_string(), sheet.to_string());

        let spawn_drain = {
            let mut lanes = self.lanes.lock().unwrap();
            let lane = lanes.entry(key.clone()).or_default();
            lane.ops.push_back(PendingOp { op_id, op, done });
            if lane.queued_rows() >= self.config.max_batch_rows {
                lane.full.notify_one();
            }
            if lane.draining {
                false
            } else {
                lane.draining = true;
                true
            }
        };
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(tenant = tenant_id, sheet = sheet, op = %op_id, "write queued");

        if spawn_drain {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.drain_lane(key).await;
            });
        }

        Ok(WriteTicket { op_id, receiver })
    }

    /// Drain one lane until it is empty. Exactly one task runs per lane;
    /// the `draining` flag hands the lane back only after a locked
    /// empty-check, so no op can be stranded between task exit and the
    /// next enqueue.
    async fn drain_lane(self: Arc<Self>, key: LaneKey) {
        loop {
            // Linger so a burst of enqueues coalesces into one batch — but a
            // lane that already holds a full batch flushes immediately.
            let (full, already_full) = {
                let lanes = self.lanes.lock().unwrap();
                let Some(lane) = lanes.get(&key) else {
                    return;
                };
                (
                    lane.full.clone(),
                    lane.queued_rows() >= self.config.max_batch_rows,
                )
            };
            if !already_full {
                tokio::select! {
                    _ = sleep(self.config.linger()) => {}
                    _ = full.notified() => {}
                }
            }

            // The budget semaphore is never closed.
            let Ok(_permit) = self.drain_budget.acquire().await else {
                return;
            };

            let batch = {
                let mut lanes = self.lanes.lock().unwrap();
                let Some(lane) = lanes.get_mut(&key) else {
                    return;
                };
                match take_batch(&mut lane.ops, self.config.max_batch_rows) {
                    Some(batch) => batch,
                    None => {
                        // Re-check emptiness under the lock before handing
                        // the lane back.
                        lane.draining = false;
                        return;
                    }
                }
            };

            self.send_batch(&key, batch).await;
        }
    }

    fn set_phase(&self, key: &LaneKey, phase: BatchPhase) {
        if let Some(lane) = self.lanes.lock().unwrap().get_mut(key) {
            lane.phase = phase;
        }
    }

    /// Current phase of one lane's batch, if the lane exists.
    pub fn phase(&self, tenant_id: &str, sheet: &str) -> Option<BatchPhase> {
        self.lanes
            .lock()
            .unwrap()
            .get(&(tenant_id.to_string(), sheet.to_string()))
            .map(|lane| lane.phase.clone())
    }

    /// Apply one batch: admission, remote call with timeout and retries,
    /// cache invalidation, then ticket resolution — in that order. The lane's
    /// `BatchPhase` tracks every step.
    async fn send_batch(&self, key: &LaneKey, batch: Vec<PendingOp>) {
        let (tenant_id, sheet) = (key.0.as_str(), key.1.as_str());
        let kind = batch[0].op.kind();
        let rows: usize = batch.iter().map(|p| p.op.row_count()).sum();

        let plan = match self.registry.resolve(tenant_id).await {
            Ok(config) => config.plan,
            Err(err) => {
                // Tenant vanished from the registry mid-flight.
                self.set_phase(key, BatchPhase::Done);
                self.fail_batch(batch, err);
                return;
            }
        };

        // Tenant-bucket admission. The callers already hold tickets, so
        // throttling is absorbed here instead of surfaced.
        loop {
            let decision =
                self.limiter
                    .try_acquire(Scope::Tenant(tenant_id.to_string()), plan, 1.0);
            match decision.retry_after() {
                None => break,
                Some(wait) => {
                    debug!(
                        tenant = tenant_id,
                        sheet = sheet,
                        wait_ms = wait.as_millis(),
                        "tenant bucket empty, delaying batch"
                    );
                    sleep(wait).await;
                }
            }
        }

        let client = match self.pool.acquire(tenant_id).await {
            Ok(client) => client,
            Err(err) => {
                self.set_phase(key, BatchPhase::Done);
                self.fail_batch(batch, err);
                return;
            }
        };

        // Whole-batch retry as an explicit loop so the lane's phase is
        // inspectable mid-flight.
        let policy = self.retry_policy();
        let timeout = self.remote_timeout;
        let mut attempt = 0;
        let result: std::result::Result<BatchResult, RemoteError> = loop {
            self.set_phase(key, BatchPhase::InFlight);

            let attempt_result = {
                let fut = apply_batch(client.as_ref(), sheet, &batch);
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout(format!(
                        "batch on {sheet} exceeded {}ms",
                        timeout.as_millis()
                    ))),
                }
            };

            match attempt_result {
                Ok(outcome) => {
                    if attempt > 0 {
                        debug!(
                            tenant = tenant_id,
                            sheet = sheet,
                            attempt = attempt + 1,
                            "batch landed after retry"
                        );
                    }
                    break Ok(outcome);
                }
                Err(err) if !err.is_transient() => break Err(err),
                Err(err) if attempt + 1 >= policy.max_attempts => {
                    warn!(
                        tenant = tenant_id,
                        sheet = sheet,
                        attempts = attempt + 1,
                        error = %err,
                        "batch attempts exhausted"
                    );
                    break Err(err);
                }
                Err(err) => {
                    let next_delay = policy.jittered_backoff(attempt);
                    warn!(
                        tenant = tenant_id,
                        sheet = sheet,
                        attempt = attempt + 1,
                        backoff_ms = next_delay.as_millis(),
                        error = %err,
                        "batch attempt failed, backing off"
                    );
                    self.set_phase(
                        key,
                        BatchPhase::Retrying {
                            attempt: attempt + 1,
                            next_delay,
                        },
                    );
                    sleep(next_delay).await;
                    attempt += 1;
                }
            }
        };
        self.set_phase(key, BatchPhase::Done);

        match result {
            Ok(outcome) => {
                self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .rows_written
                    .fetch_add(rows as u64, Ordering::Relaxed);

                // Invalidate before resolving: a caller that awaits its
                // ticket and immediately reads must miss the stale cache.
                self.invalidator
                    .on_write_completed(tenant_id, sheet, kind, rows);
                resolve_batch(batch, outcome);
            }
            Err(err) => {
                self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                if err.breaks_handle() {
                    self.pool.mark_broken(tenant_id).await;
                }
                warn!(
                    tenant = tenant_id,
                    sheet = sheet,
                    kind = %kind,
                    rows = rows,
                    error = %err,
                    "batch rejected"
                );
                self.fail_batch(batch, Error::from_remote(err));
            }
        }
    }

    fn fail_batch(&self, batch: Vec<PendingOp>, err: Error) {
        for pending in batch {
            let _ = pending.done.send(Err(err.clone()));
        }
    }

    /// Total operations currently queued across all lanes.
    pub fn depth(&self) -> usize {
        self.lanes
            .lock()
            .unwrap()
            .values()
            .map(|lane| lane.ops.len())
            .sum()
    }

    pub fn stats(&self) -> QueueSnapshot {
        QueueSnapshot {
            depth: self.depth(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            batches_sent: self.counters.batches_sent.load(Ordering::Relaxed),
            rows_written: self.counters.rows_written.load(Ordering::Relaxed),
            batches_failed: self.counters.batches_failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting writes and wait for every lane to drain.
    pub async fn flush_and_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        info!(depth = self.depth(), "queue closing, draining lanes");
        loop {
            let idle = {
                let lanes = self.lanes.lock().unwrap();
                lanes.values().all(|lane| lane.ops.is_empty() && !lane.draining)
            };
            if idle {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        info!("queue drained");
    }
}

/// Take the next batch from the front of a lane: consecutive operations of
/// one kind, coalescing appends up to the row limit. Updates and deletes
/// batch by count so a single remote rejection maps to whole operations.
fn take_batch(ops: &mut VecDeque<PendingOp>, max_rows: usize) -> Option<Vec<PendingOp>> {
    let kind = ops.front()?.op.kind();
    let mut batch = Vec::new();
    let mut rows = 0;

    loop {
        let take = match ops.front() {
            Some(front) if front.op.kind() == kind => {
                let count = front.op.row_count();
                batch.is_empty() || rows + count <= max_rows
            }
            _ => false,
        };
        if !take {
            break;
        }
        if let Some(pending) = ops.pop_front() {
            rows += pending.op.row_count();
            batch.push(pending);
        }
        if rows >= max_rows {
            break;
        }
    }
    Some(batch)
}

enum BatchResult {
    /// Assigned references for a coalesced append, in submission order.
    Appended(Vec<RowRef>),
    /// Per-op outcomes for update/delete batches.
    PerOp(Vec<WriteOutcome>),
}

/// Issue the remote calls for one batch.
///
/// Appends coalesce into a single `add_rows` call. Updates and deletes go
/// row by row; a failure part-way is returned whole, and since the memory
/// of what already applied lives remotely, the retry relies on these calls
/// being idempotent per row reference.
async fn apply_batch(
    client: &dyn crate::remote::DocumentClient,
    sheet: &str,
    batch: &[PendingOp],
) -> std::result::Result<BatchResult, RemoteError> {
    match batch[0].op.kind() {
        WriteKind::AddRows => {
            let mut all_rows: Vec<CellMap> = Vec::new();
            for pending in batch {
                if let WriteOp::AddRows { rows } = &pending.op {
                    all_rows.extend(rows.iter().cloned());
                }
            }
            let refs = client.add_rows(sheet, &all_rows).await?;
            Ok(BatchResult::Appended(refs))
        }
        WriteKind::UpdateRow | WriteKind::DeleteRow => {
            let mut outcomes = Vec::with_capacity(batch.len());
            for pending in batch {
                match &pending.op {
                    WriteOp::UpdateRow { row_ref, patch } => {
                        client.update_row(sheet, *row_ref, patch).await?;
                        outcomes.push(WriteOutcome::Updated);
                    }
                    WriteOp::DeleteRow { row_ref } => {
                        client.delete_row(sheet, *row_ref).await?;
                        outcomes.push(WriteOutcome::Deleted);
                    }
                    WriteOp::AddRows { .. } => unreachable!("mixed batch"),
                }
            }
            Ok(BatchResult::PerOp(outcomes))
        }
    }
}

/// Hand each ticket its slice of the batch result.
fn resolve_batch(batch: Vec<PendingOp>, result: BatchResult) {
    match result {
        BatchResult::Appended(refs) => {
            let mut offset = 0;
            for pending in batch {
                let count = pending.op.row_count();
                let slice = refs
                    .get(offset..offset + count)
                    .map(|s| s.to_vec())
                    .unwrap_or_default();
                offset += count;
                let _ = pending.done.send(Ok(WriteOutcome::Appended(slice)));
            }
        }
        BatchResult::PerOp(outcomes) => {
            for (pending, outcome) in batch.into_iter().zip(outcomes) {
                let _ = pending.done.send(Ok(outcome));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ReadCache;
    use crate::config::{CacheConfig, LimiterConfig, PoolConfig};
    use crate::registry::StaticTenantSource;
    use crate::remote::memory::{CallKind, InMemoryRowStore};
    use rowgate_core::{TenantConfig, TenantPlan};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn cells(col: &str, val: &str) -> CellMap {
        let mut map = BTreeMap::new();
        map.insert(col.to_string(), json!(val));
        map
    }

    fn tenant(id: &str) -> TenantConfig {
        TenantConfig {
            tenant_id: id.to_string(),
            document_id: format!("doc-{id}"),
            credentials_ref: format!("secret/{id}"),
            plan: TenantPlan::Enterprise,
            enabled: true,
            refreshed_at: 0,
        }
    }

    struct Fixture {
        store: Arc<InMemoryRowStore>,
        cache: Arc<ReadCache>,
        queue: Arc<BatchQueue>,
    }

    async fn fixture(config: QueueConfig) -> Fixture {
        let store = Arc::new(InMemoryRowStore::new());
        let source = Arc::new(StaticTenantSource::new(vec![tenant("t1"), tenant("t2")]));
        let registry = Arc::new(TenantRegistry::new(source));
        registry.refresh().await;

        let limiter = Arc::new(RateLimiter::new(LimiterConfig::default()));
        let pool = Arc::new(ConnectionPool::new(
            store.clone(),
            registry.clone(),
            PoolConfig {
                connect_backoff_ms: 1,
                ..Default::default()
            },
        ));
        let cache = Arc::new(ReadCache::new(CacheConfig::default()));
        let invalidator = Arc::new(Invalidator::new(cache.clone()));
        let queue = Arc::new(BatchQueue::new(
            config,
            Duration::from_secs(10),
            limiter,
            registry,
            pool,
            invalidator,
        ));
        Fixture { store, cache, queue }
    }

    fn fast_queue() -> QueueConfig {
        QueueConfig {
            linger_ms: 5,
            retry_base_ms: 1,
            retry_cap_ms: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_append_resolves_with_assigned_refs() {
        let fx = fixture(fast_queue()).await;
        let ticket = fx
            .queue
            .enqueue("t1", "CONFIG", WriteOp::AddRows { rows: vec![cells("k", "v")] })
            .unwrap();

        let outcome = ticket.wait().await.unwrap();
        match outcome {
            WriteOutcome::Appended(refs) => assert_eq!(refs.len(), 1),
            other => panic!("expected Appended, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_remote_call() {
        let fx = fixture(fast_queue()).await;

        let tickets: Vec<_> = (0..10)
            .map(|i| {
                fx.queue
                    .enqueue(
                        "t1",
                        "EVENTS",
                        WriteOp::AddRows { rows: vec![cells("n", &i.to_string())] },
                    )
                    .unwrap()
            })
            .collect();
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        // Burst fit into one coalesced add_rows call
        let adds = fx.store.calls_of(CallKind::AddRows);
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].rows, 10);
    }

    #[tokio::test]
    async fn test_batch_splits_at_row_limit() {
        let fx = fixture(QueueConfig {
            max_batch_rows: 4,
            ..fast_queue()
        })
        .await;

        let tickets: Vec<_> = (0..10)
            .map(|i| {
                fx.queue
                    .enqueue(
                        "t1",
                        "EVENTS",
                        WriteOp::AddRows { rows: vec![cells("n", &i.to_string())] },
                    )
                    .unwrap()
            })
            .collect();
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        let adds = fx.store.calls_of(CallKind::AddRows);
        assert!(adds.len() >= 3, "10 rows at limit 4 need at least 3 calls");
        assert!(adds.iter().all(|c| c.rows <= 4));
        assert_eq!(adds.iter().map(|c| c.rows).sum::<usize>(), 10);
    }

    #[tokio::test]
    async fn test_full_batch_flushes_before_linger_expires() {
        let fx = fixture(QueueConfig {
            linger_ms: 5_000,
            max_batch_rows: 5,
            retry_base_ms: 1,
            retry_cap_ms: 5,
            ..Default::default()
        })
        .await;

        let tickets: Vec<_> = (0..5)
            .map(|i| {
                fx.queue
                    .enqueue(
                        "t1",
                        "S",
                        WriteOp::AddRows { rows: vec![cells("n", &i.to_string())] },
                    )
                    .unwrap()
            })
            .collect();

        let all = async {
            for ticket in tickets {
                ticket.wait().await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(1), all)
            .await
            .expect("full batch waited out the linger window");

        let adds = fx.store.calls_of(CallKind::AddRows);
        assert_eq!(adds.iter().map(|c| c.rows).sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn test_refs_map_back_to_submitters_in_order() {
        let fx = fixture(fast_queue()).await;

        let t1 = fx
            .queue
            .enqueue(
                "t1",
                "S",
                WriteOp::AddRows { rows: vec![cells("a", "1"), cells("a", "2")] },
            )
            .unwrap();
        let t2 = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "3")] })
            .unwrap();

        let r1 = match t1.wait().await.unwrap() {
            WriteOutcome::Appended(refs) => refs,
            other => panic!("{other:?}"),
        };
        let r2 = match t2.wait().await.unwrap() {
            WriteOutcome::Appended(refs) => refs,
            other => panic!("{other:?}"),
        };
        assert_eq!(r1.len(), 2);
        assert_eq!(r2.len(), 1);
        // Earlier submission gets earlier references
        assert!(r1.iter().all(|r| r.0 < r2[0].0));
    }

    #[tokio::test]
    async fn test_transient_failures_retried_then_succeed() {
        let fx = fixture(fast_queue()).await;
        fx.store
            .fail_next(3, RemoteError::QuotaExceeded("window".into()));

        let ticket = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "1")] })
            .unwrap();
        ticket.wait().await.unwrap();

        // Exactly 3 failures then 1 success, in order
        let adds = fx.store.calls_of(CallKind::AddRows);
        assert_eq!(adds.len(), 4);
        assert_eq!(adds.iter().filter(|c| !c.ok).count(), 3);
        assert!(adds[3].ok);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_rejects_all_tickets() {
        let fx = fixture(QueueConfig {
            max_attempts: 2,
            ..fast_queue()
        })
        .await;
        fx.store.fail_next(10, RemoteError::Unavailable("down".into()));

        let t1 = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "1")] })
            .unwrap();
        let t2 = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "2")] })
            .unwrap();

        assert!(matches!(t1.wait().await, Err(Error::Unavailable(_))));
        assert!(matches!(t2.wait().await, Err(Error::Unavailable(_))));
        assert_eq!(fx.queue.stats().batches_failed, 1);
    }

    #[tokio::test]
    async fn test_terminal_error_rejects_without_retry() {
        let fx = fixture(fast_queue()).await;
        fx.store.fail_next(1, RemoteError::Invalid("bad row".into()));

        let ticket = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "1")] })
            .unwrap();
        assert!(matches!(ticket.wait().await, Err(Error::Invalid(_))));
        assert_eq!(fx.store.calls_of(CallKind::AddRows).len(), 1);
    }

    #[tokio::test]
    async fn test_fifo_preserved_across_retry() {
        let fx = fixture(fast_queue()).await;
        // First batch fails once, then succeeds; second batch a different
        // kind so it cannot coalesce with the first.
        fx.store.fail_next(1, RemoteError::Unavailable("blip".into()));

        let add = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "1")] })
            .unwrap();
        let refs = match add.wait().await.unwrap() {
            WriteOutcome::Appended(refs) => refs,
            other => panic!("{other:?}"),
        };

        fx.store.fail_next(1, RemoteError::Unavailable("blip".into()));
        let add2 = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "2")] })
            .unwrap();
        let del = fx
            .queue
            .enqueue("t1", "S", WriteOp::DeleteRow { row_ref: refs[0] })
            .unwrap();

        add2.wait().await.unwrap();
        assert_eq!(del.wait().await.unwrap(), WriteOutcome::Deleted);

        // The delete ran after the retried append, never before it
        let calls = fx.store.calls();
        let last_add = calls
            .iter()
            .rposition(|c| c.kind == CallKind::AddRows)
            .unwrap();
        let delete = calls
            .iter()
            .position(|c| c.kind == CallKind::DeleteRow)
            .unwrap();
        assert!(delete > last_add);
    }

    #[tokio::test]
    async fn test_lanes_are_independent() {
        let fx = fixture(fast_queue()).await;

        let a = fx
            .queue
            .enqueue("t1", "A", WriteOp::AddRows { rows: vec![cells("x", "1")] })
            .unwrap();
        let b = fx
            .queue
            .enqueue("t2", "B", WriteOp::AddRows { rows: vec![cells("y", "2")] })
            .unwrap();

        a.wait().await.unwrap();
        b.wait().await.unwrap();

        // Each lane produced its own remote call against its own document
        let adds = fx.store.calls_of(CallKind::AddRows);
        assert_eq!(adds.len(), 2);
        let docs: std::collections::HashSet<_> =
            adds.iter().map(|c| c.document_id.clone()).collect();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn test_completed_write_invalidates_sheet_cache() {
        let fx = fixture(fast_queue()).await;
        let key = crate::cache::CacheKey::rows("t1", "S", None);
        fx.cache.insert(key.clone(), json!([]));

        let ticket = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "1")] })
            .unwrap();
        ticket.wait().await.unwrap();

        // Resolution implies the stale entry is already gone
        assert!(fx.cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_empty_write_rejected() {
        let fx = fixture(fast_queue()).await;
        let err = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![] })
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn test_flush_and_close_drains_then_rejects() {
        let fx = fixture(fast_queue()).await;
        let ticket = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "1")] })
            .unwrap();

        fx.queue.flush_and_close().await;
        // The queued write landed before close returned
        assert_eq!(ticket.wait().await.unwrap(), WriteOutcome::Appended(vec![RowRef(1)]));

        let err = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "2")] })
            .unwrap_err();
        assert_eq!(err, Error::ShuttingDown);
    }

    #[tokio::test]
    async fn test_phase_tracks_retry_state() {
        let fx = fixture(QueueConfig {
            linger_ms: 1,
            retry_base_ms: 300,
            retry_cap_ms: 400,
            ..Default::default()
        })
        .await;
        fx.store.fail_next(1, RemoteError::Unavailable("blip".into()));

        let ticket = fx
            .queue
            .enqueue("t1", "S", WriteOp::AddRows { rows: vec![cells("a", "1")] })
            .unwrap();

        // First attempt fails quickly; the backoff (225-375ms) is still
        // running at this point.
        tokio::time::sleep(Duration::from_millis(100)).await;
        match fx.queue.phase("t1", "S") {
            Some(BatchPhase::Retrying { attempt: 1, next_delay }) => {
                assert!(next_delay >= Duration::from_millis(225));
            }
            other => panic!("expected Retrying, got {other:?}"),
        }

        ticket.wait().await.unwrap();
        assert_eq!(fx.queue.phase("t1", "S"), Some(BatchPhase::Done));
    }

    #[tokio::test]
    async fn test_stats_track_rows() {
        let fx = fixture(fast_queue()).await;
        let ticket = fx
            .queue
            .enqueue(
                "t1",
                "S",
                WriteOp::AddRows { rows: vec![cells("a", "1"), cells("a", "2")] },
            )
            .unwrap();
        ticket.wait().await.unwrap();

        let stats = fx.queue.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.rows_written, 2);
        assert_eq!(stats.depth, 0);
    }
}
