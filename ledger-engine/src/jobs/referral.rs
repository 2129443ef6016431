//! Referral distribution
//!
//! The dispatcher finds packages whose referral earnings still lack a
//! settlement hash and enqueues one job per package. The worker consumes the
//! queue, asks a [`ReferralPayer`] for a hash and attaches it to every
//! hashless line of the package in one store operation.
//!
//! Delivery is at-least-once: a package stays in the queue's dedupe set until
//! the worker either settles it or runs out of attempts, and settling an
//! already-settled package is a no-op.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{log_item_error, CronJob, JobKind, JobReport};
use crate::context::EngineContext;
use crate::error::{LedgerError, LedgerResult};
use crate::retry::{RetryState, RetryStrategy};
use crate::storage::LedgerStore;
use crate::types::{total, PackageId, ReferralLine};

/// Settles a batch of referral lines and returns the settlement hash
#[async_trait]
pub trait ReferralPayer: Send + Sync {
    async fn settle(&self, lines: &[ReferralLine]) -> LedgerResult<String>;
}

/// Ledger-only settlement with a deterministic internal hash
///
/// The same set of lines always yields the same hash.
#[derive(Debug, Clone, Default)]
pub struct LedgerSettlementPayer;

#[async_trait]
impl ReferralPayer for LedgerSettlementPayer {
    async fn settle(&self, lines: &[ReferralLine]) -> LedgerResult<String> {
        if lines.is_empty() {
            return Err(LedgerError::Settlement("empty referral batch".to_string()));
        }
        let mut ids: Vec<String> = lines
            .iter()
            .map(|l| format!("{}:{}:{}", l.earning.id, l.transaction.id, l.earning.amount))
            .collect();
        ids.sort();

        let mut hasher = Sha256::new();
        for id in &ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        Ok(format!("internal:{}", hex::encode(hasher.finalize())))
    }
}

// ==================== Queue ====================

/// Bounded package queue that never holds the same package twice
#[derive(Clone)]
pub struct ReferralQueue {
    tx: mpsc::Sender<PackageId>,
    queued: Arc<Mutex<HashSet<PackageId>>>,
}

impl ReferralQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<PackageId>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                queued: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    /// Enqueue a package; `false` if it is already queued or the queue is full
    pub async fn enqueue(&self, package_id: PackageId) -> bool {
        let mut queued = self.queued.lock().await;
        if queued.contains(&package_id) {
            return false;
        }
        match self.tx.try_send(package_id) {
            Ok(()) => {
                queued.insert(package_id);
                true
            }
            Err(e) => {
                warn!(package_id = %package_id, error = %e, "Referral queue rejected package");
                false
            }
        }
    }

    /// Put a package back for another attempt; it keeps its dedupe slot
    async fn requeue(&self, package_id: PackageId) {
        if self.tx.send(package_id).await.is_err() {
            self.complete(&package_id).await;
        }
    }

    /// Release the dedupe slot once a package is settled or given up on
    async fn complete(&self, package_id: &PackageId) {
        self.queued.lock().await.remove(package_id);
    }

    /// Packages queued or being retried
    pub async fn len(&self) -> usize {
        self.queued.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ==================== Dispatcher ====================

pub struct ReferralDispatchJob<S: LedgerStore + 'static> {
    ctx: EngineContext<S>,
    queue: ReferralQueue,
}

impl<S: LedgerStore + 'static> ReferralDispatchJob<S> {
    pub fn new(ctx: EngineContext<S>, queue: ReferralQueue) -> Self {
        Self { ctx, queue }
    }
}

#[async_trait]
impl<S: LedgerStore + 'static> CronJob for ReferralDispatchJob<S> {
    fn kind(&self) -> JobKind {
        JobKind::ReferralDispatch
    }

    async fn run(&self) -> LedgerResult<JobReport> {
        let packages = self.ctx.store.list_undistributed_referral_packages().await?;
        let mut report = JobReport::default();
        for package_id in packages {
            if self.queue.enqueue(package_id).await {
                report.success();
            } else {
                report.skipped();
            }
        }
        if report.succeeded > 0 {
            info!(enqueued = report.succeeded, "Referral distributions dispatched");
        }
        Ok(report)
    }
}

// ==================== Worker ====================

/// What the worker did with one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionOutcome {
    /// Lines settled under this hash
    Distributed { tx_hash: String, lines: u64 },
    /// Nothing left to distribute
    Nothing,
    /// Failed, scheduled for another attempt
    Retrying { attempt: u32 },
    /// Failed on the last allowed attempt
    Exhausted,
}

/// Queue consumer performing the distributions
pub struct ReferralWorker<S: LedgerStore + 'static> {
    ctx: EngineContext<S>,
    payer: Arc<dyn ReferralPayer>,
    queue: ReferralQueue,
    receiver: Mutex<Option<mpsc::Receiver<PackageId>>>,
    strategy: RetryStrategy,
    retries: Mutex<HashMap<PackageId, RetryState>>,
}

impl<S: LedgerStore + 'static> ReferralWorker<S> {
    pub fn new(
        ctx: EngineContext<S>,
        payer: Arc<dyn ReferralPayer>,
        queue: ReferralQueue,
        receiver: mpsc::Receiver<PackageId>,
    ) -> Self {
        let strategy = RetryStrategy::from_referral(&ctx.config.referral);
        Self {
            ctx,
            payer,
            queue,
            receiver: Mutex::new(Some(receiver)),
            strategy,
            retries: Mutex::new(HashMap::new()),
        }
    }

    /// Set retry strategy
    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Settle the package's undistributed lines, `None` if there are none
    pub async fn distribute(&self, package_id: &PackageId) -> LedgerResult<Option<(String, u64)>> {
        let lines = self.ctx.store.list_undistributed_referrals(package_id).await?;
        if lines.is_empty() {
            return Ok(None);
        }

        let tx_hash = self.payer.settle(&lines).await?;
        let marked = self
            .ctx
            .store
            .mark_referrals_distributed(&lines, &tx_hash, self.ctx.now())
            .await?;
        info!(
            package_id = %package_id,
            lines = marked,
            amount = %total(lines.iter().map(|l| &l.earning.amount)),
            tx_hash = %tx_hash,
            "Referral commissions distributed"
        );
        Ok(Some((tx_hash, marked)))
    }

    /// One delivery attempt with retry bookkeeping
    pub async fn handle(&self, package_id: PackageId) -> DistributionOutcome {
        match self.distribute(&package_id).await {
            Ok(result) => {
                self.retries.lock().await.remove(&package_id);
                self.queue.complete(&package_id).await;
                match result {
                    Some((tx_hash, lines)) => {
                        self.ctx.metrics.referral_batch_settled();
                        DistributionOutcome::Distributed { tx_hash, lines }
                    }
                    None => {
                        debug!(package_id = %package_id, "No undistributed referral lines");
                        DistributionOutcome::Nothing
                    }
                }
            }
            Err(e) => {
                self.ctx.metrics.referral_batch_failed();
                log_item_error(JobKind::ReferralDispatch, &package_id, &e);

                let state = {
                    let mut retries = self.retries.lock().await;
                    let state = retries
                        .entry(package_id)
                        .or_insert_with(|| RetryState::new(self.ctx.config.referral.max_attempts));
                    state.record_failure(self.ctx.now(), e.to_string());
                    state.clone()
                };

                if state.is_exhausted() || !self.strategy.retries() {
                    error!(
                        package_id = %package_id,
                        attempts = state.attempts,
                        last_error = state.last_error.as_deref().unwrap_or_default(),
                        "Referral distribution gave up until next dispatch"
                    );
                    self.retries.lock().await.remove(&package_id);
                    self.queue.complete(&package_id).await;
                    return DistributionOutcome::Exhausted;
                }

                let delay = self.strategy.delay_for_attempt(state.attempts);
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.requeue(package_id).await;
                });
                DistributionOutcome::Retrying { attempt: state.attempts }
            }
        }
    }

    /// Handle every package currently in the queue without waiting for more
    pub async fn drain(&self) -> JobReport {
        let mut report = JobReport::default();
        loop {
            let next = match self.receiver.lock().await.as_mut() {
                Some(rx) => rx.try_recv().ok(),
                None => None,
            };
            let Some(package_id) = next else { break };
            match self.handle(package_id).await {
                DistributionOutcome::Distributed { .. } => report.success(),
                DistributionOutcome::Nothing => report.skipped(),
                DistributionOutcome::Retrying { .. } | DistributionOutcome::Exhausted => report.failure(),
            }
        }
        report
    }

    /// Consume the queue on a background task until shut down
    pub async fn start(self: Arc<Self>) -> LedgerResult<WorkerHandle> {
        let mut rx = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| LedgerError::InvalidState("referral worker already started".to_string()))?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let join = tokio::spawn(async move {
            info!("Referral worker started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Referral worker received shutdown signal");
                        break;
                    }
                    next = rx.recv() => match next {
                        Some(package_id) => {
                            self.handle(package_id).await;
                        }
                        None => break,
                    }
                }
            }
            info!("Referral worker stopped");
        });

        Ok(WorkerHandle { shutdown_tx, join })
    }
}

/// Handle to a running referral worker
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop after the package in hand, if any, is finished
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.join.await {
            warn!(error = %e, "Referral worker task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{harness, Harness};
    use crate::clock::Clock;
    use crate::storage::MemoryLedgerStore;
    use crate::types::*;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn referral_rows(package_id: PackageId, level: u8, now: Timestamp) -> (Transaction, Earning) {
        let user = Uuid::new_v4();
        let tx = Transaction::new(
            user,
            TransactionType::ReferralCommission,
            Decimal::from(10),
            TransactionStatus::Pending,
            "referral commission",
            now,
        );
        let earning = Earning::new(user, EarningType::LevelReferral, Decimal::from(10), EarningStatus::Pending, "referral", now)
            .for_package(package_id)
            .paired_with(tx.id)
            .at_level(level);
        (tx, earning)
    }

    async fn seed_referrals(h: &Harness, package_id: PackageId, count: usize) {
        let now = h.clock.now();
        for level in 1..=count {
            let (tx, earning) = referral_rows(package_id, level as u8, now);
            h.store.insert_transaction(&tx).await.unwrap();
            h.store.insert_earning(&earning).await.unwrap();
        }
    }

    /// Fails the first `failures` settlements
    struct FlakyPayer {
        failures: AtomicU32,
    }

    #[async_trait]
    impl ReferralPayer for FlakyPayer {
        async fn settle(&self, lines: &[ReferralLine]) -> LedgerResult<String> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(LedgerError::RpcConnection("payer offline".to_string()));
            }
            LedgerSettlementPayer.settle(lines).await
        }
    }

    /// Writes one more commission for the package while it settles
    struct InterleavingPayer {
        store: Arc<MemoryLedgerStore>,
        package_id: PackageId,
        at: Timestamp,
    }

    #[async_trait]
    impl ReferralPayer for InterleavingPayer {
        async fn settle(&self, lines: &[ReferralLine]) -> LedgerResult<String> {
            let (tx, earning) = referral_rows(self.package_id, 9, self.at);
            self.store.insert_transaction(&tx).await?;
            self.store.insert_earning(&earning).await?;
            LedgerSettlementPayer.settle(lines).await
        }
    }

    #[tokio::test]
    async fn test_line_written_during_settlement_stays_undistributed() {
        let h = harness();
        let package_id = Uuid::new_v4();
        seed_referrals(&h, package_id, 1).await;

        let (queue, rx) = ReferralQueue::bounded(8);
        let payer = Arc::new(InterleavingPayer {
            store: h.store.clone(),
            package_id,
            at: h.clock.now(),
        });
        let worker = ReferralWorker::new(h.ctx.clone(), payer, queue, rx);

        let (tx_hash, marked) = worker.distribute(&package_id).await.unwrap().unwrap();
        assert_eq!(marked, 1);

        let remaining = h.store.list_undistributed_referrals(&package_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].earning.level, Some(9));
        assert!(remaining[0].transaction.tx_hash.is_none());

        // The late line goes out in its own settlement
        let (next_hash, marked) = worker.distribute(&package_id).await.unwrap().unwrap();
        assert_eq!(marked, 1);
        assert_ne!(next_hash, tx_hash);
        assert!(h.store.list_undistributed_referrals(&package_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_dedupes_and_worker_settles() {
        let h = harness();
        let package_id = Uuid::new_v4();
        seed_referrals(&h, package_id, 3).await;

        let (queue, rx) = ReferralQueue::bounded(8);
        let dispatcher = ReferralDispatchJob::new(h.ctx.clone(), queue.clone());
        assert_eq!(dispatcher.run().await.unwrap().succeeded, 1);
        assert_eq!(dispatcher.run().await.unwrap().succeeded, 0);

        let worker = ReferralWorker::new(h.ctx.clone(), Arc::new(LedgerSettlementPayer), queue.clone(), rx);
        assert_eq!(worker.drain().await.succeeded, 1);
        assert!(queue.is_empty().await);
        assert!(h.store.list_undistributed_referrals(&package_id).await.unwrap().is_empty());

        // Nothing left, so a second dispatch finds nothing
        assert_eq!(dispatcher.run().await.unwrap().processed, 0);
        assert_eq!(worker.handle(package_id).await, DistributionOutcome::Nothing);
    }

    #[tokio::test]
    async fn test_failed_settlement_is_retried() {
        let h = harness();
        let package_id = Uuid::new_v4();
        seed_referrals(&h, package_id, 2).await;

        let (queue, rx) = ReferralQueue::bounded(8);
        let payer = Arc::new(FlakyPayer { failures: AtomicU32::new(1) });
        let worker = ReferralWorker::new(h.ctx.clone(), payer, queue.clone(), rx);

        assert!(queue.enqueue(package_id).await);
        assert_eq!(worker.handle(package_id).await, DistributionOutcome::Retrying { attempt: 1 });
        assert!(!queue.enqueue(package_id).await, "still held while retrying");

        match worker.handle(package_id).await {
            DistributionOutcome::Distributed { tx_hash, lines } => {
                assert!(tx_hash.starts_with("internal:"));
                assert_eq!(lines, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_exhausted_package_is_released() {
        let h = harness();
        let package_id = Uuid::new_v4();
        seed_referrals(&h, package_id, 1).await;

        let (queue, rx) = ReferralQueue::bounded(8);
        let payer = Arc::new(FlakyPayer { failures: AtomicU32::new(100) });
        let worker = ReferralWorker::new(h.ctx.clone(), payer, queue.clone(), rx).with_strategy(RetryStrategy::None);

        assert!(queue.enqueue(package_id).await);
        assert_eq!(worker.handle(package_id).await, DistributionOutcome::Exhausted);
        assert!(queue.enqueue(package_id).await);
    }

    #[tokio::test]
    async fn test_settlement_hash_is_deterministic() {
        let h = harness();
        let package_id = Uuid::new_v4();
        seed_referrals(&h, package_id, 2).await;
        let mut lines = h.store.list_undistributed_referrals(&package_id).await.unwrap();
        let a = LedgerSettlementPayer.settle(&lines).await.unwrap();
        lines.reverse();
        let b = LedgerSettlementPayer.settle(&lines).await.unwrap();
        assert_eq!(a, b);
        assert!(LedgerSettlementPayer.settle(&[]).await.is_err());
    }
}
