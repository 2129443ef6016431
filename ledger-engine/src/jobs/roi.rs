//! ROI payout job
//!
//! Pays one interval of ROI to every due package whose owner holds a matching
//! active bot. Each payout is a single compare-and-set store operation keyed
//! on the package's paid count and next ROI date, so two overlapping or
//! repeated runs commit at most one payment per interval.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::{log_item_error, CronJob, JobKind, JobReport};
use crate::context::EngineContext;
use crate::error::LedgerResult;
use crate::storage::LedgerStore;
use crate::types::*;

/// What happened to one due package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoiOutcome {
    Paid,
    /// No active bot of the package's type
    NoBot,
    /// Already at the payment cap; left for the expiration sweep
    Capped,
    /// Another run paid this interval first
    RaceLost,
    /// The configured percentage is zero or negative
    RateDisabled,
}

pub struct RoiPayoutJob<S: LedgerStore + 'static> {
    ctx: EngineContext<S>,
}

impl<S: LedgerStore + 'static> RoiPayoutJob<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    /// Live percentage from SystemSetting. Only a missing or unparsable
    /// setting falls back to the default table; a parsed value is returned
    /// as configured, even when it is zero or negative.
    pub async fn roi_percentage(&self, package_type: PackageType) -> LedgerResult<Decimal> {
        let key = package_type.roi_setting_key();
        let fallback = package_type.default_roi_percentage();
        match self.ctx.store.get_setting(&key).await? {
            Some(raw) => match Decimal::from_str(raw.trim()) {
                Ok(pct) => Ok(pct),
                Err(_) => {
                    warn!(key = %key, value = %raw, fallback = %fallback, "Unparsable ROI percentage, using default");
                    Ok(fallback)
                }
            },
            None => {
                warn!(key = %key, fallback = %fallback, "ROI percentage setting missing, using default");
                Ok(fallback)
            }
        }
    }

    /// Pay one package if it is still due
    pub async fn pay_package(&self, package: &Package) -> LedgerResult<RoiOutcome> {
        let now = self.ctx.now();
        if self
            .ctx
            .store
            .find_active_bot(&package.user_id, package.package_type, now)
            .await?
            .is_none()
        {
            debug!(package_id = %package.id, package_type = %package.package_type, "No active bot, ROI skipped");
            return Ok(RoiOutcome::NoBot);
        }
        if package.roi_paid_count >= MAX_ROI_PAYMENTS {
            return Ok(RoiOutcome::Capped);
        }

        let percentage = self.roi_percentage(package.package_type).await?;
        if percentage <= Decimal::ZERO {
            warn!(
                package_id = %package.id,
                package_type = %package.package_type,
                percentage = %percentage,
                "ROI percentage is not positive, payout skipped"
            );
            return Ok(RoiOutcome::RateDisabled);
        }
        let interval = self.ctx.config.roi.interval_for(package.package_type);
        let payout = RoiPayout::build(package, percentage, now, interval)?;

        if !self.ctx.store.apply_roi_payout(&payout).await? {
            self.ctx.metrics.roi_race_lost();
            debug!(package_id = %package.id, "ROI already paid for this interval");
            return Ok(RoiOutcome::RaceLost);
        }

        self.ctx.metrics.roi_paid();
        info!(
            package_id = %package.id,
            user_id = %package.user_id,
            amount = %payout.amount,
            percentage = %percentage,
            month = payout.payment.month_number,
            "ROI paid"
        );
        self.ctx
            .notify(
                &package.user_id,
                "ROI payment received",
                &format!(
                    "You received {} USDT ROI ({}/{}) on your {} package.",
                    payout.amount, payout.payment.month_number, MAX_ROI_PAYMENTS, package.package_type
                ),
            )
            .await;
        Ok(RoiOutcome::Paid)
    }
}

#[async_trait]
impl<S: LedgerStore + 'static> CronJob for RoiPayoutJob<S> {
    fn kind(&self) -> JobKind {
        JobKind::RoiPayout
    }

    async fn run(&self) -> LedgerResult<JobReport> {
        let due = self.ctx.store.list_due_packages(self.ctx.now()).await?;
        let mut report = JobReport::default();
        for package in &due {
            match self.pay_package(package).await {
                Ok(RoiOutcome::Paid) => report.success(),
                Ok(_) => report.skipped(),
                Err(e) => {
                    report.failure();
                    log_item_error(JobKind::RoiPayout, &package.id, &e);
                }
            }
        }
        if !due.is_empty() {
            info!(due = due.len(), paid = report.succeeded, failed = report.failed, "ROI pass finished");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::context::testing::{harness, Harness};
    use chrono::Duration;
    use uuid::Uuid;

    async fn funded_package(h: &Harness, package_type: PackageType, with_bot: bool) -> Package {
        let now = h.clock.now();
        let user = Uuid::new_v4();
        let mut package = Package::pending(user, package_type, Decimal::from(1000), Network::Bep20, now);
        let interval = h.ctx.config.roi.interval_for(package_type);
        package.activate(now, now + interval * MAX_ROI_PAYMENTS as i32, now + interval);
        h.store.save_package(&package).await.unwrap();
        if with_bot {
            let mut bot = BotActivation::pending(user, package_type, now);
            bot.activate(now, now + Duration::days(365));
            h.store.save_bot(&bot).await.unwrap();
        }
        package
    }

    #[tokio::test]
    async fn test_pays_configured_percentage_once_per_interval() {
        let h = harness();
        h.store.put_setting("NEO_ROI_PERCENTAGE", "3").await.unwrap();
        let package = funded_package(&h, PackageType::Neo, true).await;
        let job = RoiPayoutJob::new(h.ctx.clone());

        h.clock.advance(Duration::days(30));
        assert_eq!(job.run().await.unwrap().succeeded, 1);
        assert_eq!(job.run().await.unwrap().processed, 0);

        let package = h.store.get_package(&package.id).await.unwrap().unwrap();
        assert_eq!(package.roi_paid_count, 1);
        assert_eq!(package.total_roi_paid, Decimal::from(30));
        let payments = h.store.list_roi_payments(&package.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, Decimal::from(30));
        assert_eq!(payments[0].month_number, 1);
    }

    #[tokio::test]
    async fn test_concurrent_runs_pay_once() {
        let h = harness();
        let package = funded_package(&h, PackageType::Neural, true).await;
        h.clock.advance(Duration::days(30));
        let a = RoiPayoutJob::new(h.ctx.clone());
        let b = RoiPayoutJob::new(h.ctx.clone());
        let (ra, rb) = tokio::join!(a.run(), b.run());
        assert_eq!(ra.unwrap().succeeded + rb.unwrap().succeeded, 1);
        assert_eq!(h.store.list_roi_payments(&package.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_bot_means_no_payment() {
        let h = harness();
        let package = funded_package(&h, PackageType::Oracle, false).await;
        h.clock.advance(Duration::days(31));
        let report = RoiPayoutJob::new(h.ctx.clone()).run().await.unwrap();
        assert_eq!(report, JobReport { processed: 1, succeeded: 0, failed: 0 });
        let package = h.store.get_package(&package.id).await.unwrap().unwrap();
        assert_eq!(package.roi_paid_count, 0);
    }

    #[tokio::test]
    async fn test_bad_setting_falls_back_to_default() {
        let h = harness();
        h.store.put_setting("NEO_ROI_PERCENTAGE", "three").await.unwrap();
        let job = RoiPayoutJob::new(h.ctx.clone());
        assert_eq!(job.roi_percentage(PackageType::Neo).await.unwrap(), Decimal::from(3));
        assert_eq!(job.roi_percentage(PackageType::Oracle).await.unwrap(), Decimal::from(5));
    }

    #[tokio::test]
    async fn test_zero_percentage_pays_nothing() {
        let h = harness();
        h.store.put_setting("NEO_ROI_PERCENTAGE", "0").await.unwrap();
        let package = funded_package(&h, PackageType::Neo, true).await;
        let job = RoiPayoutJob::new(h.ctx.clone());
        assert_eq!(job.roi_percentage(PackageType::Neo).await.unwrap(), Decimal::ZERO);

        h.clock.advance(Duration::days(30));
        let due = h.store.get_package(&package.id).await.unwrap().unwrap();
        assert_eq!(job.pay_package(&due).await.unwrap(), RoiOutcome::RateDisabled);

        h.store.put_setting("NEO_ROI_PERCENTAGE", "-2").await.unwrap();
        let report = job.run().await.unwrap();
        assert_eq!(report, JobReport { processed: 1, succeeded: 0, failed: 0 });

        let package = h.store.get_package(&package.id).await.unwrap().unwrap();
        assert_eq!(package.roi_paid_count, 0);
        assert_eq!(package.total_roi_paid, Decimal::ZERO);
        assert!(h.store.list_roi_payments(&package.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_demo_package_stops_at_twelve_payments() {
        let h = harness();
        let package = funded_package(&h, PackageType::Demo, true).await;
        let job = RoiPayoutJob::new(h.ctx.clone());
        let interval = h.ctx.config.roi.interval_for(PackageType::Demo);
        for _ in 0..15 {
            h.clock.advance(interval);
            job.run().await.unwrap();
        }
        let package = h.store.get_package(&package.id).await.unwrap().unwrap();
        assert_eq!(package.roi_paid_count, MAX_ROI_PAYMENTS);
        assert_eq!(h.store.list_roi_payments(&package.id).await.unwrap().len(), 12);
    }
}
