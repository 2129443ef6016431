//! Recurring jobs
//!
//! Each job is one [`CronJob`]: a single pass over the rows it owns. Item
//! failures inside a pass are logged and counted, never propagated; an `Err`
//! from [`CronJob::run`] means the pass itself could not proceed (store down,
//! for instance) and is retried on the next fire.

pub mod expiration;
pub mod payment_scan;
pub mod referral;
pub mod roi;
pub mod session;
pub mod sync;

pub use expiration::ExpirationJob;
pub use payment_scan::PaymentScanJob;
pub use referral::{LedgerSettlementPayer, ReferralDispatchJob, ReferralPayer, ReferralQueue, ReferralWorker};
pub use roi::RoiPayoutJob;
pub use session::SessionCleanupJob;
pub use sync::BlockchainSyncJob;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, warn};

use crate::error::{ErrorClass, LedgerError, LedgerResult};

/// Recurring job identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    PaymentScan,
    RoiPayout,
    Expiration,
    BlockchainSync,
    ReferralDispatch,
    SessionCleanup,
}

impl JobKind {
    pub fn all() -> [JobKind; 6] {
        [
            JobKind::PaymentScan,
            JobKind::RoiPayout,
            JobKind::Expiration,
            JobKind::BlockchainSync,
            JobKind::ReferralDispatch,
            JobKind::SessionCleanup,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::PaymentScan => "payment_scan",
            JobKind::RoiPayout => "roi_payout",
            JobKind::Expiration => "expiration",
            JobKind::BlockchainSync => "blockchain_sync",
            JobKind::ReferralDispatch => "referral_dispatch",
            JobKind::SessionCleanup => "session_cleanup",
        }
    }

    /// Accepts `roi_payout` and `roi-payout`
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::all().into_iter().find(|k| k.as_str() == normalized)
    }

    /// Segment used in `LEDGER_SCHEDULE_<JOB>_SECS`
    pub fn env_name(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts from one pass of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    /// Items examined
    pub processed: u64,
    /// Items that produced their effect
    pub succeeded: u64,
    /// Items that failed and were left for the next pass
    pub failed: u64,
}

impl JobReport {
    pub fn success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    /// Examined without producing an effect
    pub fn skipped(&mut self) {
        self.processed += 1;
    }

    pub fn merge(&mut self, other: JobReport) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

/// One recurring job
#[async_trait]
pub trait CronJob: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Run one pass
    async fn run(&self) -> LedgerResult<JobReport>;
}

/// Log a failure of one batch item at the level its class calls for
pub(crate) fn log_item_error(job: JobKind, item: &dyn fmt::Display, e: &LedgerError) {
    match e.class() {
        ErrorClass::InvariantViolation => error!(job = %job, item = %item, error = %e, "Invariant violated"),
        _ => warn!(job = %job, item = %item, error = %e, "Item failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_kind_names() {
        assert_eq!(JobKind::parse("roi-payout"), Some(JobKind::RoiPayout));
        assert_eq!(JobKind::parse("Blockchain_Sync"), Some(JobKind::BlockchainSync));
        assert_eq!(JobKind::parse("backup"), None);
        assert_eq!(JobKind::SessionCleanup.env_name(), "SESSION_CLEANUP");
    }

    #[test]
    fn test_report_merge() {
        let mut a = JobReport::default();
        a.success();
        a.failure();
        let mut b = JobReport::default();
        b.skipped();
        a.merge(b);
        assert_eq!(a, JobReport { processed: 3, succeeded: 1, failed: 1 });
    }
}
