//! Packages, bots and the atomic payout/return records applied to them
//!
//! # Package lifecycle
//!
//! ```text
//! PENDING ──→ ACTIVE ──(12 ROI payments or expiry date)──→ EXPIRED
//! ```
//!
//! While ACTIVE a package earns one ROI payment per interval, at most
//! [`MAX_ROI_PAYMENTS`] times. `next_roi_date` only moves forward and only in
//! the same store operation that writes the matching [`RoiPayment`].

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::common::*;
use super::ledger::*;
use super::payment::Activation;
use crate::error::{LedgerError, LedgerResult};

/// Upper bound of ROI payments per package
pub const MAX_ROI_PAYMENTS: u32 = 12;

/// Package (and bot) type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PackageType {
    Neo,
    Neural,
    Oracle,
    /// Short-interval package used for demos
    Demo,
}

impl PackageType {
    pub fn all() -> [PackageType; 4] {
        [
            PackageType::Neo,
            PackageType::Neural,
            PackageType::Oracle,
            PackageType::Demo,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageType::Neo => "NEO",
            PackageType::Neural => "NEURAL",
            PackageType::Oracle => "ORACLE",
            PackageType::Demo => "DEMO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NEO" => Some(PackageType::Neo),
            "NEURAL" => Some(PackageType::Neural),
            "ORACLE" => Some(PackageType::Oracle),
            "DEMO" => Some(PackageType::Demo),
            _ => None,
        }
    }

    pub fn is_demo(&self) -> bool {
        matches!(self, PackageType::Demo)
    }

    /// SystemSetting key holding the live percentage
    pub fn roi_setting_key(&self) -> String {
        format!("{}_ROI_PERCENTAGE", self.as_str())
    }

    /// Hardcoded percentage used only when the setting row is missing
    pub fn default_roi_percentage(&self) -> Decimal {
        match self {
            PackageType::Neo => Decimal::from(3),
            PackageType::Neural => Decimal::from(4),
            PackageType::Oracle => Decimal::from(5),
            PackageType::Demo => Decimal::from(1),
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageStatus {
    Pending,
    Active,
    Expired,
    Withdrawn,
    Cancelled,
    Completed,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Pending => "PENDING",
            PackageStatus::Active => "ACTIVE",
            PackageStatus::Expired => "EXPIRED",
            PackageStatus::Withdrawn => "WITHDRAWN",
            PackageStatus::Cancelled => "CANCELLED",
            PackageStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PackageStatus::Pending),
            "ACTIVE" => Some(PackageStatus::Active),
            "EXPIRED" => Some(PackageStatus::Expired),
            "WITHDRAWN" => Some(PackageStatus::Withdrawn),
            "CANCELLED" => Some(PackageStatus::Cancelled),
            "COMPLETED" => Some(PackageStatus::Completed),
            _ => None,
        }
    }
}

/// Investment position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    pub user_id: UserId,
    pub amount: Amount,
    pub package_type: PackageType,
    pub status: PackageStatus,
    /// Redundant with `status`, kept as the fast filter for sweeps
    pub is_expired: bool,
    pub network: Network,
    pub investment_date: Timestamp,
    pub expiry_date: Timestamp,
    pub last_roi_date: Option<Timestamp>,
    pub next_roi_date: Timestamp,
    pub roi_paid_count: u32,
    pub total_roi_paid: Amount,
    pub created_at: Timestamp,
}

impl Package {
    /// Package awaiting its purchase payment
    pub fn pending(
        user_id: UserId,
        package_type: PackageType,
        amount: Amount,
        network: Network,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            package_type,
            status: PackageStatus::Pending,
            is_expired: false,
            network,
            investment_date: now,
            expiry_date: now,
            last_roi_date: None,
            next_roi_date: now,
            roi_paid_count: 0,
            total_roi_paid: Decimal::ZERO,
            created_at: now,
        }
    }

    /// Apply an activation computed by [`Package::activation_at`]
    pub fn activate(&mut self, investment_date: Timestamp, expiry_date: Timestamp, next_roi_date: Timestamp) {
        self.status = PackageStatus::Active;
        self.is_expired = false;
        self.investment_date = investment_date;
        self.expiry_date = expiry_date;
        self.next_roi_date = next_roi_date;
    }

    /// Activation dates for a package funded at `now`
    ///
    /// The term spans exactly [`MAX_ROI_PAYMENTS`] intervals.
    pub fn activation_at(&self, now: Timestamp, interval: Duration) -> Activation {
        Activation::Package {
            package_id: self.id,
            investment_date: now,
            expiry_date: now + interval * MAX_ROI_PAYMENTS as i32,
            next_roi_date: now + interval,
        }
    }

    pub fn is_payable_at(&self, now: Timestamp) -> bool {
        self.status == PackageStatus::Active && !self.is_expired && self.next_roi_date <= now
    }

    pub fn is_expirable_at(&self, now: Timestamp) -> bool {
        self.status == PackageStatus::Active
            && !self.is_expired
            && (self.expiry_date <= now || self.roi_paid_count >= MAX_ROI_PAYMENTS)
    }
}

/// Bot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStatus {
    Pending,
    Active,
    Expired,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Pending => "PENDING",
            BotStatus::Active => "ACTIVE",
            BotStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BotStatus::Pending),
            "ACTIVE" => Some(BotStatus::Active),
            "EXPIRED" => Some(BotStatus::Expired),
            _ => None,
        }
    }
}

/// Time-boxed capability gating ROI for packages of the same type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotActivation {
    pub id: BotId,
    pub user_id: UserId,
    pub bot_type: PackageType,
    pub status: BotStatus,
    pub is_expired: bool,
    pub activation_date: Timestamp,
    pub expiry_date: Timestamp,
}

impl BotActivation {
    pub fn pending(user_id: UserId, bot_type: PackageType, now: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            bot_type,
            status: BotStatus::Pending,
            is_expired: false,
            activation_date: now,
            expiry_date: now,
        }
    }

    pub fn activate(&mut self, activation_date: Timestamp, expiry_date: Timestamp) {
        self.status = BotStatus::Active;
        self.is_expired = false;
        self.activation_date = activation_date;
        self.expiry_date = expiry_date;
    }

    /// Whether this bot unlocks ROI for `package` at `now`
    pub fn gates(&self, package: &Package, now: Timestamp) -> bool {
        self.user_id == package.user_id
            && self.bot_type == package.package_type
            && self.status == BotStatus::Active
            && !self.is_expired
            && self.expiry_date > now
    }

    pub fn is_expirable_at(&self, now: Timestamp) -> bool {
        self.status == BotStatus::Active && !self.is_expired && self.expiry_date <= now
    }
}

/// Everything one ROI payout writes, applied atomically
///
/// The store applies it only if the package still has
/// `roi_paid_count == expected_paid_count` and
/// `next_roi_date == expected_next_roi_date`, so a concurrent or repeated run
/// commits nothing.
#[derive(Debug, Clone)]
pub struct RoiPayout {
    pub package_id: PackageId,
    pub user_id: UserId,
    pub amount: Amount,
    pub percentage: Decimal,
    pub expected_paid_count: u32,
    pub expected_next_roi_date: Timestamp,
    pub paid_at: Timestamp,
    pub next_roi_date: Timestamp,
    pub payment: RoiPayment,
    pub transaction: Transaction,
    pub earning: Earning,
}

impl RoiPayout {
    /// Build the payout for `package` at `percentage` percent
    pub fn build(
        package: &Package,
        percentage: Decimal,
        now: Timestamp,
        interval: Duration,
    ) -> LedgerResult<Self> {
        if package.roi_paid_count >= MAX_ROI_PAYMENTS {
            return Err(LedgerError::InvariantViolation(format!(
                "package {} already received {} ROI payments",
                package.id, package.roi_paid_count
            )));
        }
        if percentage <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(format!(
                "non-positive ROI percentage {} for {}",
                percentage, package.package_type
            )));
        }

        let amount = (package.amount * percentage / Decimal::ONE_HUNDRED).round_dp(8);
        let month_number = package.roi_paid_count + 1;
        let description = format!(
            "ROI payment {}/{} for {} package ({}%)",
            month_number, MAX_ROI_PAYMENTS, package.package_type, percentage
        );

        let transaction = Transaction::new(
            package.user_id,
            TransactionType::RoiPayment,
            amount,
            TransactionStatus::Completed,
            description.clone(),
            now,
        )
        .with_network(package.network);

        let earning = Earning::new(
            package.user_id,
            EarningType::Roi,
            amount,
            EarningStatus::Paid,
            description,
            now,
        )
        .for_package(package.id)
        .paired_with(transaction.id);

        Ok(Self {
            package_id: package.id,
            user_id: package.user_id,
            amount,
            percentage,
            expected_paid_count: package.roi_paid_count,
            expected_next_roi_date: package.next_roi_date,
            paid_at: now,
            next_roi_date: now + interval,
            payment: RoiPayment {
                id: Uuid::new_v4(),
                package_id: package.id,
                user_id: package.user_id,
                amount,
                month_number,
                payment_date: now,
            },
            transaction,
            earning,
        })
    }
}

/// Everything one capital return writes, applied atomically
///
/// Applied only while the package is still ACTIVE and not expired.
#[derive(Debug, Clone)]
pub struct CapitalReturn {
    pub package_id: PackageId,
    pub user_id: UserId,
    pub principal: Amount,
    pub expired_at: Timestamp,
    pub transaction: Transaction,
    pub earning: Earning,
}

impl CapitalReturn {
    pub fn build(package: &Package, now: Timestamp) -> Self {
        let description = format!(
            "Capital return for {} package after {} ROI payments",
            package.package_type, package.roi_paid_count
        );
        let transaction = Transaction::new(
            package.user_id,
            TransactionType::CapitalReturn,
            package.amount,
            TransactionStatus::Completed,
            description.clone(),
            now,
        )
        .with_network(package.network);
        let earning = Earning::new(
            package.user_id,
            EarningType::CapitalReturn,
            package.amount,
            EarningStatus::Paid,
            description,
            now,
        )
        .for_package(package.id)
        .paired_with(transaction.id);

        Self {
            package_id: package.id,
            user_id: package.user_id,
            principal: package.amount,
            expired_at: now,
            transaction,
            earning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn active_package(amount: i64, package_type: PackageType) -> Package {
        let now = Utc::now();
        let mut package = Package::pending(Uuid::new_v4(), package_type, Decimal::from(amount), Network::Bep20, now);
        package.activate(now, now + Duration::days(360), now);
        package
    }

    #[test]
    fn test_roi_payout_amount_and_month() {
        let package = active_package(1000, PackageType::Neo);
        let now = Utc::now();
        let payout = RoiPayout::build(&package, Decimal::from(3), now, Duration::days(30)).unwrap();
        assert_eq!(payout.amount, Decimal::from(30));
        assert_eq!(payout.payment.month_number, 1);
        assert_eq!(payout.expected_paid_count, 0);
        assert_eq!(payout.next_roi_date, now + Duration::days(30));
        assert_eq!(payout.earning.transaction_id, Some(payout.transaction.id));
    }

    #[test]
    fn test_roi_payout_refuses_thirteenth_payment() {
        let mut package = active_package(1000, PackageType::Neo);
        package.roi_paid_count = MAX_ROI_PAYMENTS;
        let err = RoiPayout::build(&package, Decimal::from(3), Utc::now(), Duration::days(30)).unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation(_)));
    }

    #[test]
    fn test_bot_gating() {
        let package = active_package(500, PackageType::Oracle);
        let now = Utc::now();
        let mut bot = BotActivation::pending(package.user_id, PackageType::Oracle, now);
        assert!(!bot.gates(&package, now));
        bot.activate(now, now + Duration::days(30));
        assert!(bot.gates(&package, now));
        assert!(!bot.gates(&package, now + Duration::days(31)));

        let mut other_type = BotActivation::pending(package.user_id, PackageType::Neo, now);
        other_type.activate(now, now + Duration::days(30));
        assert!(!other_type.gates(&package, now));
    }

    #[test]
    fn test_activation_term_spans_twelve_intervals() {
        let package = Package::pending(Uuid::new_v4(), PackageType::Demo, Decimal::from(10), Network::Trc20, Utc::now());
        let now = Utc::now();
        match package.activation_at(now, Duration::hours(1)) {
            Activation::Package { expiry_date, next_roi_date, .. } => {
                assert_eq!(expiry_date, now + Duration::hours(12));
                assert_eq!(next_roi_date, now + Duration::hours(1));
            }
            other => panic!("unexpected activation {:?}", other),
        }
    }

    #[test]
    fn test_setting_key() {
        assert_eq!(PackageType::Neo.roi_setting_key(), "NEO_ROI_PERCENTAGE");
    }
}
