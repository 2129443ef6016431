//! Expiration job
//!
//! Two independent sweeps run concurrently. Packages past their term (or at
//! the payment cap) expire and get their principal back in the same store
//! operation; bots past their term just expire. Both flips are compare-and-set,
//! so a retried or overlapping sweep finds nothing left to do.

use async_trait::async_trait;
use tracing::info;

use super::{log_item_error, CronJob, JobKind, JobReport};
use crate::context::EngineContext;
use crate::error::LedgerResult;
use crate::storage::LedgerStore;
use crate::types::*;

pub struct ExpirationJob<S: LedgerStore + 'static> {
    ctx: EngineContext<S>,
}

impl<S: LedgerStore + 'static> ExpirationJob<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    /// Expire finished packages and return their capital
    pub async fn sweep_packages(&self) -> LedgerResult<JobReport> {
        let now = self.ctx.now();
        let mut report = JobReport::default();
        for package in self.ctx.store.list_expirable_packages(now).await? {
            let capital_return = CapitalReturn::build(&package, now);
            match self.ctx.store.apply_capital_return(&capital_return).await {
                Ok(true) => {
                    report.success();
                    self.ctx.metrics.capital_returned();
                    info!(
                        package_id = %package.id,
                        user_id = %package.user_id,
                        principal = %package.amount,
                        roi_paid_count = package.roi_paid_count,
                        "Package expired, capital returned"
                    );
                    self.ctx
                        .notify(
                            &package.user_id,
                            "Package completed",
                            &format!(
                                "Your {} package has completed. {} USDT capital has been returned.",
                                package.package_type, package.amount
                            ),
                        )
                        .await;
                }
                Ok(false) => report.skipped(),
                Err(e) => {
                    report.failure();
                    log_item_error(JobKind::Expiration, &package.id, &e);
                }
            }
        }
        Ok(report)
    }

    /// Expire bots past their term
    pub async fn sweep_bots(&self) -> LedgerResult<JobReport> {
        let now = self.ctx.now();
        let mut report = JobReport::default();
        for bot in self.ctx.store.list_expirable_bots(now).await? {
            match self.ctx.store.expire_bot(&bot.id, now).await {
                Ok(true) => {
                    report.success();
                    self.ctx.metrics.bot_expired();
                    info!(bot_id = %bot.id, user_id = %bot.user_id, bot_type = %bot.bot_type, "Bot expired");
                    self.ctx
                        .notify(
                            &bot.user_id,
                            "Bot expired",
                            &format!("Your {} bot has expired. Renew it to keep receiving ROI.", bot.bot_type),
                        )
                        .await;
                }
                Ok(false) => report.skipped(),
                Err(e) => {
                    report.failure();
                    log_item_error(JobKind::Expiration, &bot.id, &e);
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl<S: LedgerStore + 'static> CronJob for ExpirationJob<S> {
    fn kind(&self) -> JobKind {
        JobKind::Expiration
    }

    async fn run(&self) -> LedgerResult<JobReport> {
        let (packages, bots) = tokio::join!(self.sweep_packages(), self.sweep_bots());
        let mut report = packages?;
        report.merge(bots?);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::context::testing::harness;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_capped_package_returns_capital_exactly_once() {
        let h = harness();
        let now = h.clock.now();
        let mut package = Package::pending(Uuid::new_v4(), PackageType::Neo, Decimal::from(1000), Network::Trc20, now);
        package.activate(now, now + Duration::days(360), now + Duration::days(30));
        package.roi_paid_count = MAX_ROI_PAYMENTS;
        h.store.save_package(&package).await.unwrap();

        let job = ExpirationJob::new(h.ctx.clone());
        let (a, b) = tokio::join!(job.run(), job.run());
        assert_eq!(a.unwrap().succeeded + b.unwrap().succeeded, 1);
        assert_eq!(job.run().await.unwrap().processed, 0);

        let stored = h.store.get_package(&package.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PackageStatus::Expired);
        assert!(stored.is_expired);
        let returns: Vec<_> = h
            .store
            .list_transactions(&package.user_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.tx_type == TransactionType::CapitalReturn)
            .collect();
        assert_eq!(returns.len(), 1);
        assert_eq!(returns[0].amount, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_bots_expire_without_ledger_entry() {
        let h = harness();
        let now = h.clock.now();
        let user = Uuid::new_v4();
        let mut bot = BotActivation::pending(user, PackageType::Neo, now);
        bot.activate(now, now + Duration::days(365));
        h.store.save_bot(&bot).await.unwrap();

        let job = ExpirationJob::new(h.ctx.clone());
        assert_eq!(job.run().await.unwrap().succeeded, 0);

        h.clock.advance(Duration::days(365));
        assert_eq!(job.run().await.unwrap().succeeded, 1);
        let bot = h.store.get_bot(&bot.id).await.unwrap().unwrap();
        assert_eq!(bot.status, BotStatus::Expired);
        assert!(h.store.list_transactions(&user).await.unwrap().is_empty());
    }
}
