//! Background sync dispatcher.
//!
//! Drains the sync queue to the remote endpoint in FIFO batches. One cycle is
//! `Idle -> Draining -> (Success | Failed) -> Idle`; cycles never overlap.
//! Failures leave the queue untouched and push the next attempt out with an
//! exponential backoff, which a connectivity-restored signal resets.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{PosError, PosResult};
use crate::queue::{RejectionKind, SyncOpType, SyncOperation, SyncQueue, SyncRejection};
use crate::remote::{BatchOutcome, OperationOutcome, RemoteSyncClient};

/// Exponent ceiling; `2^20` seconds is far above any sensible cap.
const MAX_BACKOFF_EXPONENT: u32 = 20;

const ACK_CHANNEL_CAPACITY: usize = 256;

/// `min(2^attempt, cap)` seconds.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let secs = 1u64 << attempt.min(MAX_BACKOFF_EXPONENT);
    Duration::from_secs(secs).min(cap)
}

/// Broadcast for every operation the remote acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckedOperation {
    pub operation_id: i64,
    pub order_id: String,
    pub op_type: SyncOpType,
    /// Version of the snapshot the remote now has.
    pub order_version: u64,
}

impl From<&SyncOperation> for AckedOperation {
    fn from(op: &SyncOperation) -> Self {
        Self {
            operation_id: op.id,
            order_id: op.order_id.clone(),
            op_type: op.op_type,
            order_version: op.payload.version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyDraining,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    /// Nothing queued.
    Empty,
    Success {
        shipped: usize,
        acknowledged: usize,
        rejected: usize,
        conflicts: usize,
        /// Operations the remote asked us to resend later.
        retained: usize,
        full_batch: bool,
    },
    Failed {
        error: PosError,
        backoff: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// When the loop should run the next cycle.
    pub next_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    Idle,
    Draining,
    Offline,
    BackingOff,
}

/// Snapshot for the UI and the periodic status log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: DispatcherState,
    pub is_online: bool,
    pub queue_depth: u64,
    pub backoff: u32,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub rejected_total: u64,
    pub conflicts_total: u64,
    pub cycles_run: u64,
}

#[derive(Debug, Default)]
struct StatusInner {
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Single-flight flag, released on every exit path.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncDispatcher {
    queue: Arc<SyncQueue>,
    remote: Arc<dyn RemoteSyncClient>,
    connectivity: Arc<ConnectivityMonitor>,
    config: DispatcherConfig,
    draining: AtomicBool,
    backoff: AtomicU32,
    cycles: AtomicU64,
    rejected_total: AtomicU64,
    conflicts_total: AtomicU64,
    status: Mutex<StatusInner>,
    acks: broadcast::Sender<AckedOperation>,
}

impl SyncDispatcher {
    pub fn new(
        queue: Arc<SyncQueue>,
        remote: Arc<dyn RemoteSyncClient>,
        connectivity: Arc<ConnectivityMonitor>,
        config: DispatcherConfig,
    ) -> Self {
        let (acks, _) = broadcast::channel(ACK_CHANNEL_CAPACITY);
        Self {
            queue,
            remote,
            connectivity,
            config,
            draining: AtomicBool::new(false),
            backoff: AtomicU32::new(0),
            cycles: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            conflicts_total: AtomicU64::new(0),
            status: Mutex::new(StatusInner::default()),
            acks,
        }
    }

    /// Run one cycle now. Used by the background loop and by `force_sync`.
    pub async fn run_cycle(&self) -> CycleReport {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!("Sync cycle already in progress; skipping");
            return self.report(CycleOutcome::Skipped(SkipReason::AlreadyDraining));
        };

        if !self.connectivity.is_online() {
            debug!("Offline; sync cycle skipped");
            return self.report(CycleOutcome::Skipped(SkipReason::Offline));
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);

        let batch = match self.queue.peek_batch(self.config.max_batch_size) {
            Ok(batch) => batch,
            Err(e) => return self.fail(e),
        };
        if batch.is_empty() {
            self.mark_synced_now(None);
            return self.report(CycleOutcome::Empty);
        }

        debug!(
            operations = batch.len(),
            first_op = batch[0].id,
            "Shipping sync batch"
        );

        let pushed =
            match tokio::time::timeout(self.config.request_timeout, self.remote.push_batch(&batch))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PosError::TransientSync(format!(
                    "sync request timed out after {}s",
                    self.config.request_timeout.as_secs()
                ))),
            };

        match pushed {
            Ok(outcome) => self.settle(&batch, outcome),
            Err(e) => self.fail(e),
        }
    }

    /// Run a cycle on demand, outside the regular schedule.
    pub async fn force_sync(&self) -> CycleReport {
        let report = self.run_cycle().await;
        info!(outcome = ?report.outcome, "Force sync complete");
        report
    }

    /// Connectivity came back: forget accumulated backoff.
    pub fn connectivity_restored(&self) {
        let previous = self.backoff.swap(0, Ordering::SeqCst);
        if previous > 0 {
            info!(previous_backoff = previous, "Connectivity restored; backoff reset");
        }
    }

    pub fn backoff(&self) -> u32 {
        self.backoff.load(Ordering::SeqCst)
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn subscribe_acks(&self) -> broadcast::Receiver<AckedOperation> {
        self.acks.subscribe()
    }

    /// Operations removed without an acknowledgement, oldest first.
    pub fn rejections(&self) -> PosResult<Vec<SyncRejection>> {
        self.queue.rejections()
    }

    pub fn status(&self) -> SyncStatus {
        let is_online = self.connectivity.is_online();
        let backoff = self.backoff();
        let state = if self.draining.load(Ordering::Acquire) {
            DispatcherState::Draining
        } else if !is_online {
            DispatcherState::Offline
        } else if backoff > 0 {
            DispatcherState::BackingOff
        } else {
            DispatcherState::Idle
        };
        let queue_depth = self.queue.depth().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read sync queue depth");
            0
        });
        let (last_sync_at, last_error) = match self.status.lock() {
            Ok(inner) => (inner.last_sync_at, inner.last_error.clone()),
            Err(_) => (None, None),
        };

        SyncStatus {
            state,
            is_online,
            queue_depth,
            backoff,
            last_sync_at,
            last_error,
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            conflicts_total: self.conflicts_total.load(Ordering::Relaxed),
            cycles_run: self.cycles_run(),
        }
    }

    /// Start the background loop. The first cycle runs immediately.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = this.config.interval.as_secs(),
                max_batch_size = this.config.max_batch_size,
                "Sync dispatcher started"
            );
            let mut online_rx = this.connectivity.subscribe();
            let mut watch_open = true;
            let mut deadline = Instant::now();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        let report = this.run_cycle().await;
                        deadline = Instant::now() + report.next_delay;
                    }
                    changed = online_rx.changed(), if watch_open => {
                        if changed.is_err() {
                            watch_open = false;
                            continue;
                        }
                        let online = *online_rx.borrow_and_update();
                        if online {
                            this.connectivity_restored();
                            let report = this.run_cycle().await;
                            deadline = Instant::now() + report.next_delay;
                        }
                    }
                }
            }
            info!("Sync dispatcher stopped");
        })
    }

    fn report(&self, outcome: CycleOutcome) -> CycleReport {
        let next_delay = match &outcome {
            CycleOutcome::Success {
                full_batch: true,
                retained: 0,
                ..
            } => self.config.drain_delay,
            CycleOutcome::Failed { backoff, .. } => backoff_delay(*backoff, self.config.backoff_cap),
            _ => self.config.interval,
        };
        CycleReport {
            outcome,
            next_delay,
        }
    }

    fn fail(&self, error: PosError) -> CycleReport {
        let backoff = self
            .backoff
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1)
            .min(MAX_BACKOFF_EXPONENT);
        self.backoff.store(backoff, Ordering::SeqCst);
        let retry_in = backoff_delay(backoff, self.config.backoff_cap);
        warn!(
            error = %error,
            backoff,
            retry_in_secs = retry_in.as_secs(),
            "Sync cycle failed; queue kept for retry"
        );
        if let Ok(mut inner) = self.status.lock() {
            inner.last_error = Some(error.to_string());
        }
        self.report(CycleOutcome::Failed { error, backoff })
    }

    /// Apply per-operation results. Once an operation of an order stays
    /// queued, every later operation of that order in the batch stays too, so
    /// the remote never sees an older snapshot after a newer one.
    fn settle(&self, batch: &[SyncOperation], outcome: BatchOutcome) -> CycleReport {
        let mut handled = Vec::with_capacity(batch.len());
        let mut acked = Vec::new();
        let mut held: HashSet<&str> = HashSet::new();
        let mut retained = 0usize;
        let mut rejected = 0usize;
        let mut conflicts = 0usize;
        let mut first_transient = None;
        let mut last_rejection = None;

        for op in batch {
            if held.contains(op.order_id.as_str()) {
                debug!(op_id = op.id, order_id = %op.order_id, "Operation held behind an earlier one");
                retained += 1;
                continue;
            }
            let (kind, reason) = match outcome.get(op.id) {
                OperationOutcome::Acknowledged => {
                    handled.push(op.id);
                    acked.push(AckedOperation::from(op));
                    continue;
                }
                OperationOutcome::RejectedTransient(reason) => {
                    debug!(op_id = op.id, reason = %reason, "Operation kept for retry");
                    retained += 1;
                    held.insert(&op.order_id);
                    first_transient.get_or_insert(reason);
                    continue;
                }
                OperationOutcome::RejectedPermanent(reason) => (RejectionKind::Permanent, reason),
                OperationOutcome::Conflict(reason) => (RejectionKind::Conflict, reason),
            };

            let rejection = SyncRejection::new(op, kind, reason);
            // Only drop it from the queue once the rejection itself is on disk.
            if let Err(e) = self.queue.record_rejection(&rejection) {
                warn!(op_id = op.id, error = %e, "Failed to record rejection; keeping operation queued");
                retained += 1;
                held.insert(&op.order_id);
                continue;
            }
            let err = rejection.to_error();
            error!(op_id = op.id, order_id = %op.order_id, "{err}");
            match kind {
                RejectionKind::Conflict => conflicts += 1,
                _ => rejected += 1,
            }
            handled.push(op.id);
            last_rejection = Some(err);
        }

        if handled.is_empty() {
            let reason = first_transient.unwrap_or_else(|| "no operation accepted".to_string());
            return self.fail(PosError::TransientSync(format!(
                "remote deferred all {} operations: {reason}",
                batch.len()
            )));
        }

        if let Err(e) = self.queue.remove(&handled) {
            // Everything stays queued and is resent; the remote deduplicates.
            return self.fail(e);
        }

        self.rejected_total
            .fetch_add(rejected as u64, Ordering::Relaxed);
        self.conflicts_total
            .fetch_add(conflicts as u64, Ordering::Relaxed);
        self.backoff.store(0, Ordering::SeqCst);
        self.mark_synced_now(last_rejection.map(|e| e.to_string()));

        for ack in &acked {
            let _ = self.acks.send(ack.clone());
        }

        info!(
            shipped = batch.len(),
            acknowledged = acked.len(),
            rejected,
            conflicts,
            retained,
            "Sync cycle complete"
        );

        self.report(CycleOutcome::Success {
            shipped: batch.len(),
            acknowledged: acked.len(),
            rejected,
            conflicts,
            retained,
            full_batch: batch.len() >= self.config.max_batch_size,
        })
    }

    fn mark_synced_now(&self, last_error: Option<String>) {
        if let Ok(mut inner) = self.status.lock() {
            inner.last_sync_at = Some(Utc::now());
            inner.last_error = last_error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::order::Order;
    use crate::queue::SyncDraft;
    use crate::store::{DurableStore, SqliteStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    type Responder = Box<dyn Fn(&[SyncOperation]) -> PosResult<BatchOutcome> + Send + Sync>;

    struct MockRemote {
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
        respond: Responder,
        delay: Option<Duration>,
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl MockRemote {
        fn new(respond: Responder) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
                respond,
                delay: None,
                gate: None,
            }
        }

        fn acking() -> Self {
            Self::new(Box::new(|batch| Ok(BatchOutcome::acknowledge_all(batch))))
        }

        fn failing() -> Self {
            Self::new(Box::new(|_| {
                Err(PosError::TransientSync("HTTP 503".into()))
            }))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteSyncClient for MockRemote {
        async fn push_batch(&self, batch: &[SyncOperation]) -> PosResult<BatchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(batch.len());
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.respond)(batch)
        }
    }

    struct Fixture {
        queue: Arc<SyncQueue>,
        monitor: Arc<ConnectivityMonitor>,
        remote: Arc<MockRemote>,
        dispatcher: Arc<SyncDispatcher>,
    }

    fn fixture(remote: MockRemote, config: DispatcherConfig) -> Fixture {
        let store: Arc<dyn DurableStore> =
            Arc::new(SqliteStore::new(Arc::new(db::open_in_memory().unwrap())));
        let queue = Arc::new(SyncQueue::open(Arc::clone(&store)).unwrap());
        let monitor = Arc::new(ConnectivityMonitor::new(true));
        let remote = Arc::new(remote);
        let dispatcher = Arc::new(SyncDispatcher::new(
            Arc::clone(&queue),
            remote.clone(),
            Arc::clone(&monitor),
            config,
        ));
        Fixture {
            queue,
            monitor,
            remote,
            dispatcher,
        }
    }

    fn enqueue(queue: &SyncQueue, n: usize) -> Vec<SyncOperation> {
        (0..n)
            .map(|i| {
                let order = Order::new(format!("order-{i}"), Utc::now());
                queue
                    .enqueue(SyncDraft::new(SyncOpType::CreateOrder, order))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_backoff_delay_doubles_until_cap() {
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(0, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(8, cap), Duration::from_secs(256));
        assert_eq!(backoff_delay(9, cap), cap);
        assert_eq!(backoff_delay(u32::MAX, cap), cap);
    }

    #[tokio::test]
    async fn test_full_batches_drain_back_to_back() {
        let f = fixture(MockRemote::acking(), DispatcherConfig::default());
        enqueue(&f.queue, 120);

        let first = f.dispatcher.run_cycle().await;
        assert_eq!(first.next_delay, Duration::from_millis(250));
        let second = f.dispatcher.run_cycle().await;
        assert_eq!(second.next_delay, Duration::from_millis(250));
        let third = f.dispatcher.run_cycle().await;
        assert_eq!(third.next_delay, Duration::from_secs(5));
        assert!(matches!(
            third.outcome,
            CycleOutcome::Success {
                shipped: 20,
                full_batch: false,
                ..
            }
        ));

        assert_eq!(*f.remote.batch_sizes.lock().unwrap(), vec![50, 50, 20]);
        assert_eq!(f.queue.depth().unwrap(), 0);
        assert_eq!(f.dispatcher.run_cycle().await.outcome, CycleOutcome::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_drains_120_ops_in_three_quick_cycles() {
        let f = fixture(MockRemote::acking(), DispatcherConfig::default());
        let ops = enqueue(&f.queue, 120);
        let mut acks = f.dispatcher.subscribe_acks();
        let shutdown = CancellationToken::new();
        let handle = f.dispatcher.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.remote.calls(), 3);
        assert_eq!(f.queue.depth().unwrap(), 0);

        let mut acked_ids = Vec::new();
        while let Ok(ack) = acks.try_recv() {
            acked_ids.push(ack.operation_id);
        }
        assert_eq!(acked_ids, ops.iter().map(|op| op.id).collect::<Vec<_>>());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_back_off_and_keep_queue() {
        let config = DispatcherConfig {
            backoff_cap: Duration::from_secs(30),
            ..DispatcherConfig::default()
        };
        let f = fixture(MockRemote::failing(), config);
        enqueue(&f.queue, 3);

        let mut delays = Vec::new();
        for _ in 0..6 {
            let report = f.dispatcher.run_cycle().await;
            assert!(matches!(
                report.outcome,
                CycleOutcome::Failed {
                    error: PosError::TransientSync(_),
                    ..
                }
            ));
            delays.push(report.next_delay.as_secs());
        }
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(f.queue.depth().unwrap(), 3);
        assert_eq!(f.dispatcher.status().state, DispatcherState::BackingOff);
        assert!(f.dispatcher.status().last_error.is_some());

        f.dispatcher.connectivity_restored();
        assert_eq!(f.dispatcher.backoff(), 0);
        let report = f.dispatcher.run_cycle().await;
        assert_eq!(report.next_delay, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_success_resets_backoff() {
        let fail_first = AtomicBool::new(true);
        let remote = MockRemote::new(Box::new(move |batch| {
            if fail_first.swap(false, Ordering::SeqCst) {
                Err(PosError::TransientSync("connection reset".into()))
            } else {
                Ok(BatchOutcome::acknowledge_all(batch))
            }
        }));
        let f = fixture(remote, DispatcherConfig::default());
        enqueue(&f.queue, 1);

        f.dispatcher.run_cycle().await;
        assert_eq!(f.dispatcher.backoff(), 1);
        f.dispatcher.run_cycle().await;
        assert_eq!(f.dispatcher.backoff(), 0);
        let status = f.dispatcher.status();
        assert_eq!(status.state, DispatcherState::Idle);
        assert!(status.last_sync_at.is_some());
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_offline_cycle_is_skipped() {
        let f = fixture(MockRemote::acking(), DispatcherConfig::default());
        enqueue(&f.queue, 2);
        f.monitor.set_online(false);

        let report = f.dispatcher.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Skipped(SkipReason::Offline));
        assert_eq!(f.remote.calls(), 0);
        assert_eq!(f.dispatcher.status().state, DispatcherState::Offline);
        assert_eq!(f.queue.depth().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_connectivity_triggers_immediate_cycle() {
        let f = fixture(MockRemote::acking(), DispatcherConfig::default());
        f.monitor.set_online(false);
        let shutdown = CancellationToken::new();
        let handle = f.dispatcher.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        enqueue(&f.queue, 1);
        f.monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.remote.calls(), 1);
        assert_eq!(f.queue.depth().unwrap(), 0);
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cycles_never_overlap() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let mut remote = MockRemote::acking();
        remote.gate = Some((entered.clone(), release.clone()));
        let f = fixture(remote, DispatcherConfig::default());
        enqueue(&f.queue, 1);

        let dispatcher = f.dispatcher.clone();
        let first = tokio::spawn(async move { dispatcher.run_cycle().await });
        entered.notified().await;

        let second = f.dispatcher.run_cycle().await;
        assert_eq!(
            second.outcome,
            CycleOutcome::Skipped(SkipReason::AlreadyDraining)
        );
        assert_eq!(f.dispatcher.status().state, DispatcherState::Draining);

        release.notify_one();
        let first = first.await.unwrap();
        assert!(matches!(first.outcome, CycleOutcome::Success { .. }));
        assert_eq!(f.remote.calls(), 1);
        assert_eq!(f.dispatcher.status().state, DispatcherState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let mut remote = MockRemote::acking();
        remote.delay = Some(Duration::from_secs(60));
        let config = DispatcherConfig {
            request_timeout: Duration::from_secs(1),
            ..DispatcherConfig::default()
        };
        let f = fixture(remote, config);
        enqueue(&f.queue, 2);

        let report = f.dispatcher.run_cycle().await;
        assert!(matches!(
            report.outcome,
            CycleOutcome::Failed {
                error: PosError::TransientSync(_),
                backoff: 1
            }
        ));
        assert_eq!(f.queue.depth().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_partial_results() {
        let remote = MockRemote::new(Box::new(|batch| {
            let outcomes: HashMap<i64, OperationOutcome> = batch
                .iter()
                .enumerate()
                .map(|(i, op)| {
                    let outcome = match i {
                        0 => OperationOutcome::Acknowledged,
                        1 => OperationOutcome::RejectedPermanent("unknown menu item".into()),
                        2 => OperationOutcome::Conflict("edited on terminal 2".into()),
                        _ => OperationOutcome::RejectedTransient("try later".into()),
                    };
                    (op.id, outcome)
                })
                .collect();
            Ok(BatchOutcome { outcomes })
        }));
        let f = fixture(remote, DispatcherConfig::default());
        let ops = enqueue(&f.queue, 4);
        let mut acks = f.dispatcher.subscribe_acks();

        let report = f.dispatcher.run_cycle().await;
        assert_eq!(
            report.outcome,
            CycleOutcome::Success {
                shipped: 4,
                acknowledged: 1,
                rejected: 1,
                conflicts: 1,
                retained: 1,
                full_batch: false,
            }
        );
        assert_eq!(report.next_delay, Duration::from_secs(5));

        let pending = f.queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ops[3].id);

        let rejections = f.dispatcher.rejections().unwrap();
        assert_eq!(rejections.len(), 2);
        assert_eq!(rejections[0].operation_id, ops[1].id);
        assert_eq!(rejections[0].kind, RejectionKind::Permanent);
        assert_eq!(rejections[1].kind, RejectionKind::Conflict);
        assert_eq!(rejections[1].order_id(), Some(ops[2].order_id.as_str()));

        let status = f.dispatcher.status();
        assert_eq!(status.rejected_total, 1);
        assert_eq!(status.conflicts_total, 1);
        assert!(status.last_error.unwrap().contains("edited on terminal 2"));

        assert_eq!(acks.try_recv().unwrap().operation_id, ops[0].id);
        assert!(acks.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_later_operations_of_a_retained_order_stay_queued() {
        // The remote defers the first snapshot of "table-4" and drops its
        // PAY_ORDER from the results; "table-7" goes through.
        let remote = MockRemote::new(Box::new(|batch| {
            let outcomes: HashMap<i64, OperationOutcome> = batch
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != 3)
                .map(|(i, op)| {
                    let outcome = if i == 0 {
                        OperationOutcome::RejectedTransient("locked".into())
                    } else {
                        OperationOutcome::Acknowledged
                    };
                    (op.id, outcome)
                })
                .collect();
            Ok(BatchOutcome { outcomes })
        }));
        let f = fixture(remote, DispatcherConfig::default());
        let mut table4 = Order::new("table-4", Utc::now());
        let mut ops = Vec::new();
        for op_type in [SyncOpType::CreateOrder, SyncOpType::UpdateOrder] {
            table4.version += 1;
            ops.push(f.queue.enqueue(SyncDraft::new(op_type, table4.clone())).unwrap());
        }
        ops.push(
            f.queue
                .enqueue(SyncDraft::new(
                    SyncOpType::CreateOrder,
                    Order::new("table-7", Utc::now()),
                ))
                .unwrap(),
        );
        table4.version += 1;
        ops.push(f.queue.enqueue(SyncDraft::new(SyncOpType::PayOrder, table4)).unwrap());
        let mut acks = f.dispatcher.subscribe_acks();

        let report = f.dispatcher.run_cycle().await;
        assert!(matches!(
            report.outcome,
            CycleOutcome::Success {
                shipped: 4,
                acknowledged: 1,
                retained: 3,
                ..
            }
        ));

        let pending: Vec<i64> = f.queue.pending().unwrap().iter().map(|op| op.id).collect();
        assert_eq!(pending, vec![ops[0].id, ops[1].id, ops[3].id]);
        assert_eq!(acks.try_recv().unwrap().order_id, "table-7");
        assert!(acks.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_acked_snapshot_after_deferred_one_is_not_removed() {
        let remote = MockRemote::new(Box::new(|batch| {
            let outcomes = batch
                .iter()
                .enumerate()
                .map(|(i, op)| {
                    let outcome = if i == 0 {
                        OperationOutcome::RejectedTransient("try later".into())
                    } else {
                        OperationOutcome::Acknowledged
                    };
                    (op.id, outcome)
                })
                .collect();
            Ok(BatchOutcome { outcomes })
        }));
        let f = fixture(remote, DispatcherConfig::default());
        let mut order = Order::new("o1", Utc::now());
        for op_type in [SyncOpType::CreateOrder, SyncOpType::UpdateOrder] {
            order.version += 1;
            f.queue.enqueue(SyncDraft::new(op_type, order.clone())).unwrap();
        }
        let mut acks = f.dispatcher.subscribe_acks();

        let report = f.dispatcher.run_cycle().await;
        assert!(matches!(report.outcome, CycleOutcome::Failed { backoff: 1, .. }));
        assert_eq!(f.queue.depth().unwrap(), 2);
        assert!(acks.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cuts_pending_backoff_short() {
        let healthy = Arc::new(AtomicBool::new(false));
        let remote = {
            let healthy = Arc::clone(&healthy);
            MockRemote::new(Box::new(move |batch| {
                if healthy.load(Ordering::SeqCst) {
                    Ok(BatchOutcome::acknowledge_all(batch))
                } else {
                    Err(PosError::TransientSync("HTTP 502".into()))
                }
            }))
        };
        let f = fixture(remote, DispatcherConfig::default());
        enqueue(&f.queue, 2);
        let shutdown = CancellationToken::new();
        let handle = f.dispatcher.spawn(shutdown.clone());

        // Attempts at 0s, 2s and 6s; the next one is due at 14s.
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(f.remote.calls(), 3);
        assert_eq!(f.dispatcher.backoff(), 3);

        healthy.store(true, Ordering::SeqCst);
        f.monitor.set_online(false);
        assert!(f.monitor.set_online(true));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.remote.calls(), 4);
        assert_eq!(f.dispatcher.backoff(), 0);
        assert_eq!(f.queue.depth().unwrap(), 0);
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_all_transient_is_a_failed_cycle() {
        let remote = MockRemote::new(Box::new(|_| Ok(BatchOutcome::default())));
        let f = fixture(remote, DispatcherConfig::default());
        enqueue(&f.queue, 2);
        let report = f.dispatcher.run_cycle().await;
        assert!(matches!(report.outcome, CycleOutcome::Failed { backoff: 1, .. }));
        assert_eq!(f.queue.depth().unwrap(), 2);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let f = fixture(MockRemote::acking(), DispatcherConfig::default());
        let json = serde_json::to_value(f.dispatcher.status()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["queueDepth"], 0);
        assert!(json.get("lastSyncAt").is_some());
    }
}
