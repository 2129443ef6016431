//! Cron Orchestrator
//!
//! Runs every registered [`CronJob`] on its own timer. Each job has a
//! one-permit semaphore as its single-flight guard: a fire that finds the job
//! already running is dropped and counted as skipped, never queued. Manual
//! triggers go through the same guard.
//!
//! # Lifecycle
//!
//! ```text
//! IDLE ──fire──→ RUNNING ──done──→ IDLE
//!                   │
//!              fire │ (dropped, skipped += 1)
//! ```
//!
//! `stop_all` stops the timers and then waits for in-flight runs to finish;
//! it never cancels a run halfway through a store operation.

mod guard;

pub use guard::{JobGuard, JobState, JobStatusSnapshot, RunPermit};

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::ScheduleConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::jobs::{CronJob, JobKind, JobReport};
use crate::metrics::LedgerMetrics;

/// Result of a guarded fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The job ran to completion
    Ran(JobReport),
    /// The job was already running; nothing was done
    Skipped,
}

/// A registered job with its guard
struct JobSlot {
    job: Arc<dyn CronJob>,
    guard: JobGuard,
    interval: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
}

impl JobSlot {
    /// One guarded run
    async fn fire(&self) -> LedgerResult<TriggerOutcome> {
        let kind = self.job.kind();
        let permit = match self.guard.try_enter(self.clock.now()).await {
            Some(permit) => permit,
            None => {
                self.metrics.job_skipped();
                debug!(job = %kind, "Job already running, fire skipped");
                return Ok(TriggerOutcome::Skipped);
            }
        };

        debug!(job = %kind, "Job started");
        let started = Instant::now();
        let result = self.job.run().await;
        let elapsed = started.elapsed();

        self.metrics.job_run();
        self.metrics.observe_job_duration(elapsed).await;
        match &result {
            Ok(report) if report.failed > 0 => warn!(
                job = %kind,
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                duration_ms = elapsed.as_millis() as u64,
                "Job finished with item failures"
            ),
            Ok(report) => debug!(
                job = %kind,
                processed = report.processed,
                succeeded = report.succeeded,
                duration_ms = elapsed.as_millis() as u64,
                "Job finished"
            ),
            Err(e) => {
                self.metrics.job_failed();
                match e.class() {
                    crate::error::ErrorClass::InvariantViolation => {
                        error!(job = %kind, error = %e, "Job aborted on invariant violation")
                    }
                    _ => warn!(job = %kind, error = %e, "Job run failed, retrying on next fire"),
                }
            }
        }
        self.guard.finish(permit, self.clock.now(), elapsed, &result).await;

        result.map(TriggerOutcome::Ran)
    }
}

/// Timer tasks of a started orchestrator
struct Running {
    shutdown_tx: watch::Sender<bool>,
    timers: Vec<JoinHandle<()>>,
}

/// Scheduler for the recurring jobs
pub struct Orchestrator {
    slots: BTreeMap<JobKind, Arc<JobSlot>>,
    schedule: ScheduleConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
    running: Mutex<Option<Running>>,
}

impl Orchestrator {
    pub fn new(schedule: ScheduleConfig, clock: Arc<dyn Clock>, metrics: Arc<LedgerMetrics>) -> Self {
        Self {
            slots: BTreeMap::new(),
            schedule,
            clock,
            metrics,
            running: Mutex::new(None),
        }
    }

    /// Register a job on its configured interval, replacing any job of the same kind
    pub fn register(&mut self, job: Arc<dyn CronJob>) {
        let interval = self.schedule.interval(job.kind());
        self.register_with_interval(job, interval);
    }

    pub fn register_with_interval(&mut self, job: Arc<dyn CronJob>, interval: Duration) {
        let kind = job.kind();
        let slot = JobSlot {
            job,
            guard: JobGuard::new(kind, interval),
            interval,
            clock: self.clock.clone(),
            metrics: self.metrics.clone(),
        };
        self.slots.insert(kind, Arc::new(slot));
    }

    pub fn jobs(&self) -> Vec<JobKind> {
        self.slots.keys().copied().collect()
    }

    fn slot(&self, kind: JobKind) -> LedgerResult<&Arc<JobSlot>> {
        self.slots
            .get(&kind)
            .ok_or_else(|| LedgerError::NotFound(format!("job {} is not registered", kind)))
    }

    // ==================== Admin surface ====================

    /// Run a job now through its guard
    pub async fn trigger_manually(&self, kind: JobKind) -> LedgerResult<TriggerOutcome> {
        info!(job = %kind, "Manual trigger");
        self.slot(kind)?.fire().await
    }

    pub async fn status(&self, kind: JobKind) -> LedgerResult<JobStatusSnapshot> {
        Ok(self.slot(kind)?.guard.status().await)
    }

    pub async fn status_all(&self) -> Vec<JobStatusSnapshot> {
        join_all(self.slots.values().map(|s| s.guard.status())).await
    }

    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawn one timer per job; the first fire happens one interval from now
    pub async fn start_all(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("Orchestrator already started");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        let timers = self
            .slots
            .values()
            .map(|slot| Self::spawn_timer(slot.clone(), started, shutdown_rx.clone()))
            .collect();

        info!(jobs = self.slots.len(), "Orchestrator started");
        *running = Some(Running { shutdown_tx, timers });
    }

    /// Ticks are anchored to `started`, not to when the task is first polled.
    /// The timer task only ends once every fire it spawned has finished.
    fn spawn_timer(
        slot: Arc<JobSlot>,
        started: tokio::time::Instant,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let kind = slot.job.kind();
            let period = slot.interval.max(Duration::from_millis(1));
            let mut ticker = interval_at(started + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(job = %kind, interval_secs = period.as_secs(), "Job scheduled");

            let mut fires = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        // Runs on its own task so the timer keeps firing and
                        // overlapping fires hit the guard.
                        let slot = slot.clone();
                        fires.spawn(async move {
                            let _ = slot.fire().await;
                        });
                    }
                    Some(done) = fires.join_next(), if !fires.is_empty() => {
                        if let Err(e) = done {
                            warn!(job = %kind, error = %e, "Job fire ended abnormally");
                        }
                    }
                }
            }

            while let Some(done) = fires.join_next().await {
                if let Err(e) = done {
                    warn!(job = %kind, error = %e, "Job fire ended abnormally");
                }
            }
            debug!(job = %kind, "Job timer stopped");
        })
    }

    /// Stop all timers, then wait for in-flight runs to finish, including
    /// fires a tick spawned that have not reached their guard yet
    pub async fn stop_all(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        for timer in join_all(running.timers).await {
            if let Err(e) = timer {
                warn!(error = %e, "Job timer ended abnormally");
            }
        }
        join_all(self.slots.values().map(|s| s.guard.wait_idle())).await;
        info!("Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Notify;

    /// Blocks until released, counting runs
    struct GatedJob {
        kind: JobKind,
        gate: Arc<Notify>,
        runs: Arc<AtomicU64>,
        fail: bool,
    }

    #[async_trait]
    impl CronJob for GatedJob {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn run(&self) -> LedgerResult<JobReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                return Err(LedgerError::RpcConnection("node down".to_string()));
            }
            let mut report = JobReport::default();
            report.success();
            Ok(report)
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(ScheduleConfig::default(), Arc::new(SystemClock), Arc::new(LedgerMetrics::new()))
    }

    fn gated(kind: JobKind, fail: bool) -> (Arc<GatedJob>, Arc<Notify>, Arc<AtomicU64>) {
        let gate = Arc::new(Notify::new());
        let runs = Arc::new(AtomicU64::new(0));
        let job = Arc::new(GatedJob {
            kind,
            gate: gate.clone(),
            runs: runs.clone(),
            fail,
        });
        (job, gate, runs)
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let mut orch = orchestrator();
        let (job, gate, runs) = gated(JobKind::RoiPayout, false);
        orch.register(job);
        let orch = Arc::new(orch);

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.trigger_manually(JobKind::RoiPayout).await })
        };
        while runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(orch.trigger_manually(JobKind::RoiPayout).await.unwrap(), TriggerOutcome::Skipped);
        assert_eq!(orch.status(JobKind::RoiPayout).await.unwrap().state, JobState::Running);

        gate.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, TriggerOutcome::Ran(r) if r.succeeded == 1));

        let status = orch.status(JobKind::RoiPayout).await.unwrap();
        assert_eq!(status.state, JobState::Idle);
        assert_eq!(status.runs, 1);
        assert_eq!(status.skipped, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_run_releases_guard() {
        let mut orch = orchestrator();
        let (job, gate, _) = gated(JobKind::BlockchainSync, true);
        orch.register(job);

        gate.notify_one();
        assert!(orch.trigger_manually(JobKind::BlockchainSync).await.is_err());
        let status = orch.status(JobKind::BlockchainSync).await.unwrap();
        assert_eq!(status.failures, 1);
        assert!(status.last_error.is_some());

        gate.notify_one();
        assert!(orch.trigger_manually(JobKind::BlockchainSync).await.is_err());
        assert_eq!(orch.status(JobKind::BlockchainSync).await.unwrap().runs, 2);
    }

    #[tokio::test]
    async fn test_unknown_job_is_rejected() {
        let orch = orchestrator();
        assert!(matches!(
            orch.trigger_manually(JobKind::SessionCleanup).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_stop_waits() {
        let mut orch = orchestrator();
        let (job, gate, runs) = gated(JobKind::SessionCleanup, false);
        orch.register_with_interval(job, Duration::from_secs(10));
        orch.start_all().await;
        assert!(orch.is_started().await);

        // Three ticks while the first run is still blocked: one run, two skips
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(10)).await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(orch.status(JobKind::SessionCleanup).await.unwrap().skipped, 2);

        gate.notify_one();
        orch.stop_all().await;
        assert!(!orch.is_started().await);
        let status = orch.status(JobKind::SessionCleanup).await.unwrap();
        assert_eq!(status.runs, 1);
        assert_eq!(status.state, JobState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_fire_spawned_by_last_tick() {
        let mut orch = orchestrator();
        let (job, gate, runs) = gated(JobKind::ReferralDispatch, false);
        orch.register_with_interval(job, Duration::from_secs(10));
        let orch = Arc::new(orch);
        orch.start_all().await;

        // Stop while the tick's fire is in flight
        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let stop = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.stop_all().await })
        };
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!stop.is_finished(), "stop returned while a fire was running");

        gate.notify_one();
        stop.await.unwrap();
        let status = orch.status(JobKind::ReferralDispatch).await.unwrap();
        assert_eq!(status.runs, 1);
        assert_eq!(status.state, JobState::Idle);
    }
}
