//! Ledger rows: transactions, earnings, ROI payments and bookkeeping records

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::common::*;

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    RoiPayment,
    CapitalReturn,
    Deposit,
    Withdrawal,
    ReferralCommission,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::RoiPayment => "ROI_PAYMENT",
            TransactionType::CapitalReturn => "CAPITAL_RETURN",
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Withdrawal => "WITHDRAWAL",
            TransactionType::ReferralCommission => "REFERRAL_COMMISSION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ROI_PAYMENT" => Some(TransactionType::RoiPayment),
            "CAPITAL_RETURN" => Some(TransactionType::CapitalReturn),
            "DEPOSIT" => Some(TransactionType::Deposit),
            "WITHDRAWAL" => Some(TransactionType::Withdrawal),
            "REFERRAL_COMMISSION" => Some(TransactionType::ReferralCommission),
            _ => None,
        }
    }

    /// Entries backed by a real chain transfer; their hashes are unique
    pub fn is_on_chain(&self) -> bool {
        matches!(self, TransactionType::Deposit | TransactionType::Withdrawal)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TransactionStatus::Pending),
            "COMPLETED" => Some(TransactionStatus::Completed),
            "FAILED" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only ledger entry
///
/// Financial columns are written once. `verified`, `last_checked_at` and
/// `audit_note` are audit bookkeeping and are the only columns the chain
/// audit touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub tx_type: TransactionType,
    pub amount: Amount,
    pub status: TransactionStatus,
    pub network: Option<Network>,
    pub tx_hash: Option<String>,
    pub description: String,
    /// Chain data has been checked against the claimed amount
    pub verified: bool,
    pub last_checked_at: Option<Timestamp>,
    pub audit_note: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Transaction {
    pub fn new(
        user_id: UserId,
        tx_type: TransactionType,
        amount: Amount,
        status: TransactionStatus,
        description: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            tx_type,
            amount,
            status,
            network: None,
            tx_hash: None,
            description: description.into(),
            verified: false,
            last_checked_at: None,
            audit_note: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn on_chain(mut self, network: Network, tx_hash: impl Into<String>) -> Self {
        self.network = Some(network);
        self.tx_hash = Some(tx_hash.into());
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    pub fn mark_verified(mut self, at: Timestamp) -> Self {
        self.verified = true;
        self.last_checked_at = Some(at);
        self
    }
}

/// Earning type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EarningType {
    DirectReferral,
    LevelReferral,
    Roi,
    CapitalReturn,
}

impl EarningType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EarningType::DirectReferral => "DIRECT_REFERRAL",
            EarningType::LevelReferral => "LEVEL_REFERRAL",
            EarningType::Roi => "ROI",
            EarningType::CapitalReturn => "CAPITAL_RETURN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DIRECT_REFERRAL" => Some(EarningType::DirectReferral),
            "LEVEL_REFERRAL" => Some(EarningType::LevelReferral),
            "ROI" => Some(EarningType::Roi),
            "CAPITAL_RETURN" => Some(EarningType::CapitalReturn),
            _ => None,
        }
    }

    pub fn is_referral(&self) -> bool {
        matches!(self, EarningType::DirectReferral | EarningType::LevelReferral)
    }
}

/// Earning status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EarningStatus {
    Pending,
    Paid,
    Cancelled,
}

impl EarningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EarningStatus::Pending => "PENDING",
            EarningStatus::Paid => "PAID",
            EarningStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(EarningStatus::Pending),
            "PAID" => Some(EarningStatus::Paid),
            "CANCELLED" => Some(EarningStatus::Cancelled),
            _ => None,
        }
    }
}

/// Credit to a user, optionally paired with a ledger transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Earning {
    pub id: EarningId,
    pub user_id: UserId,
    pub amount: Amount,
    pub earning_type: EarningType,
    /// Referral depth, 1 = direct
    pub level: Option<u8>,
    pub package_id: Option<PackageId>,
    pub transaction_id: Option<TransactionId>,
    pub status: EarningStatus,
    pub description: String,
    pub created_at: Timestamp,
}

impl Earning {
    pub fn new(
        user_id: UserId,
        earning_type: EarningType,
        amount: Amount,
        status: EarningStatus,
        description: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            earning_type,
            level: None,
            package_id: None,
            transaction_id: None,
            status,
            description: description.into(),
            created_at: now,
        }
    }

    pub fn for_package(mut self, package_id: PackageId) -> Self {
        self.package_id = Some(package_id);
        self
    }

    pub fn paired_with(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn at_level(mut self, level: u8) -> Self {
        self.level = Some(level);
        self
    }
}

/// One row per successful ROI payout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiPayment {
    pub id: RoiPaymentId,
    pub package_id: PackageId,
    pub user_id: UserId,
    pub amount: Amount,
    /// 1..=12, equal to the package's pre-increment paid count + 1
    pub month_number: u32,
    pub payment_date: Timestamp,
}

/// Platform user, as far as notifications need it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub referrer_id: Option<UserId>,
}

/// Login session row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub expires_at: Timestamp,
}

/// Per-network cursor kept by the blockchain sync job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainScanState {
    pub network: Network,
    pub last_scanned_block: u64,
    pub last_scan_time: Timestamp,
}

/// Outcome of auditing one transaction against the chain
#[derive(Debug, Clone, PartialEq)]
pub enum AuditOutcome {
    /// Hash not visible on chain yet
    Unavailable,
    /// Chain amount matches the claimed amount
    Matched { confirmed: bool, confirmations: u32 },
    /// Chain amount differs beyond tolerance; never corrected automatically
    Discrepancy { claimed: Amount, on_chain: Amount },
    /// The check itself failed (RPC error, bad response)
    CheckFailed(String),
}

/// Bookkeeping written after every audit attempt
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub transaction_id: TransactionId,
    pub checked_at: Timestamp,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    /// Whether this record flips an unverified row to verified
    pub fn verifies(&self) -> bool {
        matches!(self.outcome, AuditOutcome::Matched { confirmed: true, .. })
    }

    /// Note stored on the transaction row
    pub fn note(&self) -> Option<String> {
        match &self.outcome {
            AuditOutcome::Unavailable => Some("not found on chain".to_string()),
            AuditOutcome::Matched { .. } => None,
            AuditOutcome::Discrepancy { claimed, on_chain } => Some(format!(
                "amount discrepancy: claimed {} on-chain {} (diff {})",
                claimed,
                on_chain,
                (*claimed - *on_chain).abs()
            )),
            AuditOutcome::CheckFailed(reason) => Some(format!("check failed: {}", reason)),
        }
    }
}

/// Referral earning together with its paired ledger transaction
#[derive(Debug, Clone, PartialEq)]
pub struct ReferralLine {
    pub earning: Earning,
    pub transaction: Transaction,
}

/// Sum of amounts, zero for an empty iterator
pub fn total<'a>(amounts: impl IntoIterator<Item = &'a Amount>) -> Amount {
    amounts.into_iter().fold(Decimal::ZERO, |acc, a| acc + a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_audit_record_note() {
        let record = AuditRecord {
            transaction_id: Uuid::new_v4(),
            checked_at: Utc::now(),
            outcome: AuditOutcome::Discrepancy {
                claimed: Decimal::from(100),
                on_chain: Decimal::new(995, 1),
            },
        };
        assert!(!record.verifies());
        assert_eq!(
            record.note().as_deref(),
            Some("amount discrepancy: claimed 100 on-chain 99.5 (diff 0.5)")
        );
    }

    #[test]
    fn test_enum_round_trip_names() {
        for t in [
            TransactionType::RoiPayment,
            TransactionType::CapitalReturn,
            TransactionType::Deposit,
            TransactionType::Withdrawal,
            TransactionType::ReferralCommission,
        ] {
            assert_eq!(TransactionType::parse(t.as_str()), Some(t));
        }
        assert!(EarningType::LevelReferral.is_referral());
        assert!(!EarningType::Roi.is_referral());
    }
}
