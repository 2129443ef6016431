//! Ledger engine metrics
//!
//! Counters for every financial effect the engine commits, plus a run
//! duration histogram shared by all jobs.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ledger_engine::metrics::LedgerMetrics;
//!
//! let metrics = LedgerMetrics::new();
//! metrics.roi_paid();
//! metrics.observe_job_duration(Duration::from_millis(420)).await;
//!
//! let snapshot = metrics.snapshot().await;
//! println!("ROI payouts: {}", snapshot.roi_payouts);
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::types::Timestamp;

/// Metrics collector
pub struct LedgerMetrics {
    counters: Arc<Counters>,
    job_duration_ms: Arc<RwLock<HistogramBuckets>>,
    start_time: Timestamp,
}

/// Monotonic counters
#[derive(Default)]
struct Counters {
    // Payments
    payment_requests_created: AtomicU64,
    payments_confirming: AtomicU64,
    payments_completed: AtomicU64,
    payments_expired: AtomicU64,
    payments_failed: AtomicU64,
    manual_verifications: AtomicU64,

    // Payouts
    roi_payouts: AtomicU64,
    roi_races_lost: AtomicU64,
    capital_returns: AtomicU64,
    bots_expired: AtomicU64,

    // Audit
    audit_checks: AtomicU64,
    audit_verified: AtomicU64,
    audit_discrepancies: AtomicU64,
    audit_unavailable: AtomicU64,
    audit_failures: AtomicU64,

    // Referral distribution
    referral_batches: AtomicU64,
    referral_failures: AtomicU64,

    sessions_deleted: AtomicU64,

    // Orchestrator
    job_runs: AtomicU64,
    job_failures: AtomicU64,
    job_skips: AtomicU64,
}

#[derive(Clone)]
struct HistogramBuckets {
    /// Bucket upper limits
    boundaries: Vec<f64>,
    /// One count per boundary plus the overflow bucket
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramBuckets {
    fn new(boundaries: Vec<f64>) -> Self {
        let num_buckets = boundaries.len() + 1;
        Self {
            boundaries,
            counts: vec![0; num_buckets],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        let index = self
            .boundaries
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.boundaries.len());
        self.counts[index] += 1;
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        let target = (self.count as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                if let Some(boundary) = self.boundaries.get(i) {
                    return *boundary;
                }
                break;
            }
        }
        *self.boundaries.last().unwrap_or(&0.0)
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            count: self.count,
            sum: self.sum,
            mean: self.mean(),
            p50: self.percentile(50.0),
            p95: self.percentile(95.0),
            p99: self.percentile(99.0),
        }
    }
}

impl Default for LedgerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($($(#[$doc:meta])* $method:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $method(&self) {
                self.counters.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            job_duration_ms: Arc::new(RwLock::new(HistogramBuckets::new(vec![
                10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0, 120000.0,
            ]))),
            start_time: Utc::now(),
        }
    }

    // ========== Counter Methods ==========

    counter! {
        payment_request_created => payment_requests_created;
        payment_confirming => payments_confirming;
        payment_completed => payments_completed;
        payment_failed => payments_failed;
        manual_verification_opened => manual_verifications;
        roi_paid => roi_payouts;
        /// CAS on the package lost to a concurrent payout
        roi_race_lost => roi_races_lost;
        capital_returned => capital_returns;
        bot_expired => bots_expired;
        audit_checked => audit_checks;
        audit_verified => audit_verified;
        audit_discrepancy => audit_discrepancies;
        audit_unavailable => audit_unavailable;
        audit_failed => audit_failures;
        referral_batch_settled => referral_batches;
        referral_batch_failed => referral_failures;
        job_run => job_runs;
        job_failed => job_failures;
        job_skipped => job_skips;
    }

    pub fn payments_expired(&self, count: u64) {
        self.counters.payments_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn sessions_deleted(&self, count: u64) {
        self.counters.sessions_deleted.fetch_add(count, Ordering::Relaxed);
    }

    // ========== Histogram Methods ==========

    pub async fn observe_job_duration(&self, duration: Duration) {
        self.job_duration_ms
            .write()
            .await
            .observe(duration.as_secs_f64() * 1000.0);
    }

    // ========== Snapshot Methods ==========

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);

        MetricsSnapshot {
            payment_requests_created: load(&c.payment_requests_created),
            payments_confirming: load(&c.payments_confirming),
            payments_completed: load(&c.payments_completed),
            payments_expired: load(&c.payments_expired),
            payments_failed: load(&c.payments_failed),
            manual_verifications: load(&c.manual_verifications),
            roi_payouts: load(&c.roi_payouts),
            roi_races_lost: load(&c.roi_races_lost),
            capital_returns: load(&c.capital_returns),
            bots_expired: load(&c.bots_expired),
            audit_checks: load(&c.audit_checks),
            audit_verified: load(&c.audit_verified),
            audit_discrepancies: load(&c.audit_discrepancies),
            audit_unavailable: load(&c.audit_unavailable),
            audit_failures: load(&c.audit_failures),
            referral_batches: load(&c.referral_batches),
            referral_failures: load(&c.referral_failures),
            sessions_deleted: load(&c.sessions_deleted),
            job_runs: load(&c.job_runs),
            job_failures: load(&c.job_failures),
            job_skips: load(&c.job_skips),
            job_duration_ms: self.job_duration_ms.read().await.summary(),
            uptime_secs: (Utc::now() - self.start_time).num_seconds().max(0) as u64,
            snapshot_timestamp: Utc::now(),
        }
    }

    /// Export metrics in Prometheus text format
    pub async fn prometheus_export(&self) -> String {
        let s = self.snapshot().await;
        let mut output = String::new();

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("ledger_payment_requests_created_total", "Payment requests issued", "counter", s.payment_requests_created);
        metric!("ledger_payments_completed_total", "Payment requests completed", "counter", s.payments_completed);
        metric!("ledger_payments_expired_total", "Payment requests expired", "counter", s.payments_expired);
        metric!("ledger_payments_failed_total", "Payment requests failed or cancelled", "counter", s.payments_failed);
        metric!("ledger_roi_payouts_total", "ROI payouts committed", "counter", s.roi_payouts);
        metric!("ledger_capital_returns_total", "Capital returns committed", "counter", s.capital_returns);
        metric!("ledger_bots_expired_total", "Bot activations expired", "counter", s.bots_expired);
        metric!("ledger_audit_checks_total", "Transactions audited against the chain", "counter", s.audit_checks);
        metric!("ledger_audit_discrepancies_total", "Amount discrepancies found by audit", "counter", s.audit_discrepancies);
        metric!("ledger_referral_batches_total", "Referral batches settled", "counter", s.referral_batches);
        metric!("ledger_sessions_deleted_total", "Expired sessions deleted", "counter", s.sessions_deleted);
        metric!("ledger_job_runs_total", "Job runs started", "counter", s.job_runs);
        metric!("ledger_job_failures_total", "Job runs that failed", "counter", s.job_failures);
        metric!("ledger_job_skips_total", "Job fires dropped by the single-flight guard", "counter", s.job_skips);
        metric!("ledger_job_duration_ms_p95", "95th percentile job duration", "gauge", s.job_duration_ms.p95);
        metric!("ledger_uptime_seconds", "Engine uptime", "gauge", s.uptime_secs);

        output
    }
}

/// Histogram summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time copy of every metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub payment_requests_created: u64,
    pub payments_confirming: u64,
    pub payments_completed: u64,
    pub payments_expired: u64,
    pub payments_failed: u64,
    pub manual_verifications: u64,
    pub roi_payouts: u64,
    pub roi_races_lost: u64,
    pub capital_returns: u64,
    pub bots_expired: u64,
    pub audit_checks: u64,
    pub audit_verified: u64,
    pub audit_discrepancies: u64,
    pub audit_unavailable: u64,
    pub audit_failures: u64,
    pub referral_batches: u64,
    pub referral_failures: u64,
    pub sessions_deleted: u64,
    pub job_runs: u64,
    pub job_failures: u64,
    pub job_skips: u64,
    pub job_duration_ms: HistogramSummary,
    pub uptime_secs: u64,
    pub snapshot_timestamp: Timestamp,
}

impl MetricsSnapshot {
    /// Share of job runs that finished without error, as a percentage
    pub fn job_success_rate(&self) -> f64 {
        if self.job_runs == 0 {
            100.0
        } else {
            let ok = self.job_runs.saturating_sub(self.job_failures);
            (ok as f64 / self.job_runs as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters() {
        let metrics = LedgerMetrics::new();
        metrics.roi_paid();
        metrics.roi_paid();
        metrics.payments_expired(3);
        metrics.job_run();
        metrics.job_run();
        metrics.job_failed();

        let s = metrics.snapshot().await;
        assert_eq!(s.roi_payouts, 2);
        assert_eq!(s.payments_expired, 3);
        assert!((s.job_success_rate() - 50.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_job_duration_histogram() {
        let metrics = LedgerMetrics::new();
        metrics.observe_job_duration(Duration::from_millis(5)).await;
        metrics.observe_job_duration(Duration::from_millis(40)).await;
        metrics.observe_job_duration(Duration::from_millis(75)).await;
        metrics.observe_job_duration(Duration::from_millis(200)).await;

        let s = metrics.snapshot().await;
        assert_eq!(s.job_duration_ms.count, 4);
        assert!((s.job_duration_ms.mean - 80.0).abs() < 0.01);
        assert_eq!(s.job_duration_ms.p50, 50.0);
    }

    #[tokio::test]
    async fn test_prometheus_export() {
        let metrics = LedgerMetrics::new();
        metrics.capital_returned();
        let text = metrics.prometheus_export().await;
        assert!(text.contains("ledger_capital_returns_total 1"));
        assert!(text.contains("# TYPE ledger_job_runs_total counter"));
    }
}
