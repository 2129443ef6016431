//! Single-flight guard and run bookkeeping for one job

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

use crate::error::LedgerError;
use crate::jobs::{JobKind, JobReport};
use crate::types::Timestamp;

/// Job execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Idle,
    Running,
}

/// Point-in-time view of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusSnapshot {
    pub kind: JobKind,
    pub state: JobState,
    pub interval_secs: u64,
    pub last_started_at: Option<Timestamp>,
    pub last_finished_at: Option<Timestamp>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_report: Option<JobReport>,
    /// Completed runs, successful or not
    pub runs: u64,
    /// Runs that returned an error
    pub failures: u64,
    /// Fires dropped because the job was already running
    pub skipped: u64,
    /// Cumulative item counts across runs
    pub totals: JobReport,
}

impl JobStatusSnapshot {
    fn new(kind: JobKind, interval: Duration) -> Self {
        Self {
            kind,
            state: JobState::Idle,
            interval_secs: interval.as_secs(),
            last_started_at: None,
            last_finished_at: None,
            last_duration_ms: None,
            last_error: None,
            last_report: None,
            runs: 0,
            failures: 0,
            skipped: 0,
            totals: JobReport::default(),
        }
    }
}

/// Held for the duration of one run
pub struct RunPermit {
    _permit: OwnedSemaphorePermit,
}

/// One-permit semaphore plus the job's status record
pub struct JobGuard {
    semaphore: Arc<Semaphore>,
    status: RwLock<JobStatusSnapshot>,
}

impl JobGuard {
    pub fn new(kind: JobKind, interval: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            status: RwLock::new(JobStatusSnapshot::new(kind, interval)),
        }
    }

    /// Enter the job, or `None` when a run is already in flight
    pub async fn try_enter(&self, at: Timestamp) -> Option<RunPermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let mut status = self.status.write().await;
                status.state = JobState::Running;
                status.last_started_at = Some(at);
                Some(RunPermit { _permit: permit })
            }
            Err(_) => {
                self.status.write().await.skipped += 1;
                None
            }
        }
    }

    /// Record the end of a run; the permit is released afterwards
    pub async fn finish(
        &self,
        permit: RunPermit,
        at: Timestamp,
        elapsed: Duration,
        result: &Result<JobReport, LedgerError>,
    ) {
        {
            let mut status = self.status.write().await;
            status.state = JobState::Idle;
            status.last_finished_at = Some(at);
            status.last_duration_ms = Some(elapsed.as_millis() as u64);
            status.runs += 1;
            match result {
                Ok(report) => {
                    status.last_error = None;
                    status.last_report = Some(*report);
                    status.totals.merge(*report);
                }
                Err(e) => {
                    status.failures += 1;
                    status.last_error = Some(e.to_string());
                }
            }
        }
        drop(permit);
    }

    pub async fn status(&self) -> JobStatusSnapshot {
        self.status.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Wait for an in-flight run, if any, to finish
    pub async fn wait_idle(&self) {
        let _ = self.semaphore.acquire().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_second_entry_is_skipped() {
        let guard = JobGuard::new(JobKind::RoiPayout, Duration::from_secs(900));
        let permit = guard.try_enter(Utc::now()).await.expect("first entry");
        assert!(guard.is_running());
        assert!(guard.try_enter(Utc::now()).await.is_none());

        let report = JobReport { processed: 2, succeeded: 2, failed: 0 };
        guard.finish(permit, Utc::now(), Duration::from_millis(5), &Ok(report)).await;
        assert!(!guard.is_running());

        let status = guard.status().await;
        assert_eq!(status.state, JobState::Idle);
        assert_eq!(status.runs, 1);
        assert_eq!(status.skipped, 1);
        assert_eq!(status.totals.succeeded, 2);
        assert!(guard.try_enter(Utc::now()).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_run_keeps_error() {
        let guard = JobGuard::new(JobKind::Expiration, Duration::from_secs(60));
        let permit = guard.try_enter(Utc::now()).await.unwrap();
        let err = LedgerError::StoreUnavailable("pool closed".to_string());
        guard.finish(permit, Utc::now(), Duration::ZERO, &Err(err)).await;
        let status = guard.status().await;
        assert_eq!(status.failures, 1);
        assert!(status.last_error.unwrap().contains("pool closed"));
    }
}
