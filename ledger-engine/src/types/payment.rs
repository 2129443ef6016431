//! PaymentRequest - an issued, time-boxed invitation to deposit
//!
//! # State machine
//!
//! ```text
//! PENDING ──┬──→ CONFIRMING ──┬──→ COMPLETED
//!           │                 └──→ FAILED
//!           ├──→ AWAITING_ADMIN_APPROVAL ──→ COMPLETED
//!           ├──→ EXPIRED
//!           └──→ FAILED (cancelled)
//! ```
//!
//! COMPLETED, EXPIRED and FAILED are terminal. A request is never revived once
//! it reaches one of them, even if a matching deposit shows up later.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::common::*;
use super::ledger::Transaction;

/// What the deposit pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentPurpose {
    PackagePurchase,
    BotActivation,
    ManualDeposit,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::PackagePurchase => "PACKAGE_PURCHASE",
            PaymentPurpose::BotActivation => "BOT_ACTIVATION",
            PaymentPurpose::ManualDeposit => "MANUAL_DEPOSIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PACKAGE_PURCHASE" => Some(PaymentPurpose::PackagePurchase),
            "BOT_ACTIVATION" => Some(PaymentPurpose::BotActivation),
            "MANUAL_DEPOSIT" => Some(PaymentPurpose::ManualDeposit),
            _ => None,
        }
    }
}

/// Payment request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Issued, waiting for a deposit
    Pending,
    /// Matching deposit seen, below the confirmation threshold
    Confirming,
    /// User-reported hash verified, waiting for an operator
    AwaitingAdminApproval,
    /// Deposit credited
    Completed,
    /// Expired without a deposit
    Expired,
    /// Cancelled or failed on chain
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Confirming => "CONFIRMING",
            PaymentStatus::AwaitingAdminApproval => "AWAITING_ADMIN_APPROVAL",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Expired => "EXPIRED",
            PaymentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PaymentStatus::Pending),
            "CONFIRMING" => Some(PaymentStatus::Confirming),
            "AWAITING_ADMIN_APPROVAL" => Some(PaymentStatus::AwaitingAdminApproval),
            "COMPLETED" => Some(PaymentStatus::Completed),
            "EXPIRED" => Some(PaymentStatus::Expired),
            "FAILED" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are never left
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::Expired | PaymentStatus::Failed
        )
    }

    /// Legal edges of the state machine
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirming)
                | (Pending, AwaitingAdminApproval)
                | (Pending, Completed)
                | (Pending, Expired)
                | (Pending, Failed)
                | (Confirming, Completed)
                | (Confirming, Failed)
                | (AwaitingAdminApproval, Completed)
                | (AwaitingAdminApproval, Failed)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity a payment request pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LinkedEntity {
    Package(PackageId),
    Bot(BotId),
    None,
}

impl LinkedEntity {
    /// Stored as a (kind, id) column pair
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            LinkedEntity::Package(_) => Some("package"),
            LinkedEntity::Bot(_) => Some("bot"),
            LinkedEntity::None => None,
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        match self {
            LinkedEntity::Package(id) | LinkedEntity::Bot(id) => Some(*id),
            LinkedEntity::None => None,
        }
    }

    pub fn from_parts(kind: Option<&str>, id: Option<Uuid>) -> Option<Self> {
        match (kind, id) {
            (Some("package"), Some(id)) => Some(LinkedEntity::Package(id)),
            (Some("bot"), Some(id)) => Some(LinkedEntity::Bot(id)),
            (None, None) => Some(LinkedEntity::None),
            _ => None,
        }
    }
}

/// Payment request row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub id: PaymentRequestId,
    pub user_id: UserId,
    pub purpose: PaymentPurpose,
    pub amount: Amount,
    pub network: Network,
    pub deposit_address: String,
    pub status: PaymentStatus,
    pub tx_hash: Option<String>,
    pub confirmations: u32,
    pub failure_reason: Option<String>,
    pub linked: LinkedEntity,
    pub expires_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl PaymentRequest {
    /// Build a fresh PENDING request
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        purpose: PaymentPurpose,
        amount: Amount,
        network: Network,
        deposit_address: String,
        linked: LinkedEntity,
        now: Timestamp,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            purpose,
            amount,
            network,
            deposit_address,
            status: PaymentStatus::Pending,
            tx_hash: None,
            confirmations: 0,
            failure_reason: None,
            linked,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        }
    }

    /// PENDING and past its deadline
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.status == PaymentStatus::Pending && now > self.expires_at
    }

    /// Still eligible for deposit discovery
    pub fn is_open_at(&self, now: Timestamp) -> bool {
        match self.status {
            PaymentStatus::Pending => now <= self.expires_at,
            PaymentStatus::Confirming => true,
            _ => false,
        }
    }

    pub fn snapshot(&self) -> PaymentStatusSnapshot {
        PaymentStatusSnapshot {
            id: self.id,
            status: self.status,
            amount: self.amount,
            network: self.network,
            deposit_address: self.deposit_address.clone(),
            tx_hash: self.tx_hash.clone(),
            confirmations: self.confirmations,
            expires_at: self.expires_at,
            failure_reason: self.failure_reason.clone(),
        }
    }
}

/// Scannable payment descriptor handed to the rendering layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDescriptor {
    pub network: Network,
    pub address: String,
    /// Human-readable amount, e.g. `100.5`
    pub amount: String,
    pub token: String,
    /// Wallet URI encoded into the QR code
    pub uri: String,
}

/// Read model returned by status lookups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatusSnapshot {
    pub id: PaymentRequestId,
    pub status: PaymentStatus,
    pub amount: Amount,
    pub network: Network,
    pub deposit_address: String,
    pub tx_hash: Option<String>,
    pub confirmations: u32,
    pub expires_at: Timestamp,
    pub failure_reason: Option<String>,
}

/// Compare-and-set status change on one payment request
#[derive(Debug, Clone)]
pub struct PaymentTransition {
    pub request_id: PaymentRequestId,
    /// Status the row must still have for the change to apply
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub tx_hash: Option<String>,
    pub confirmations: Option<u32>,
    pub failure_reason: Option<String>,
    pub at: Timestamp,
}

impl PaymentTransition {
    pub fn new(request_id: PaymentRequestId, from: PaymentStatus, to: PaymentStatus, at: Timestamp) -> Self {
        Self {
            request_id,
            from,
            to,
            tx_hash: None,
            confirmations: None,
            failure_reason: None,
            at,
        }
    }

    pub fn with_hash(mut self, tx_hash: impl Into<String>, confirmations: u32) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self.confirmations = Some(confirmations);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}

/// Ledger row credited when a payment request completes
#[derive(Debug, Clone)]
pub enum DepositEntry {
    /// Insert a new DEPOSIT transaction
    Insert(Transaction),
    /// Complete the tracking transaction opened by a manual verification
    CompleteExisting(TransactionId),
}

/// Linked entity activation applied together with a settlement
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    Package {
        package_id: PackageId,
        investment_date: Timestamp,
        expiry_date: Timestamp,
        next_roi_date: Timestamp,
    },
    Bot {
        bot_id: BotId,
        activation_date: Timestamp,
        expiry_date: Timestamp,
    },
}

/// Atomic completion of a payment request
///
/// Status flip, deposit entry and linked entity activation commit together or
/// not at all.
#[derive(Debug, Clone)]
pub struct PaymentSettlement {
    pub request_id: PaymentRequestId,
    pub from: PaymentStatus,
    pub tx_hash: String,
    pub confirmations: u32,
    pub deposit: DepositEntry,
    pub activation: Option<Activation>,
    pub at: Timestamp,
}

/// Atomic PENDING → AWAITING_ADMIN_APPROVAL with its tracking transaction
#[derive(Debug, Clone)]
pub struct ManualVerification {
    pub request_id: PaymentRequestId,
    pub tx_hash: String,
    pub confirmations: u32,
    pub tracking: Transaction,
    pub at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            PaymentStatus::Pending,
            PaymentStatus::Confirming,
            PaymentStatus::AwaitingAdminApproval,
            PaymentStatus::Completed,
            PaymentStatus::Expired,
            PaymentStatus::Failed,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Expired));
        assert!(!PaymentStatus::Confirming.can_transition_to(PaymentStatus::Expired));
    }

    #[test]
    fn test_expiry_window() {
        let now = Utc::now();
        let req = PaymentRequest::new(
            Uuid::new_v4(),
            PaymentPurpose::ManualDeposit,
            Decimal::from(100),
            Network::Trc20,
            "TAddr".to_string(),
            LinkedEntity::None,
            now,
            Duration::minutes(30),
        );
        assert!(!req.is_expired_at(now + Duration::minutes(30)));
        assert!(req.is_expired_at(now + Duration::minutes(31)));
        assert!(req.is_open_at(now));
        assert!(!req.is_open_at(now + Duration::minutes(31)));
    }

    #[test]
    fn test_linked_entity_parts() {
        let id = Uuid::new_v4();
        let linked = LinkedEntity::Package(id);
        assert_eq!(
            LinkedEntity::from_parts(linked.kind(), linked.id()),
            Some(linked)
        );
        assert_eq!(LinkedEntity::from_parts(None, None), Some(LinkedEntity::None));
        assert_eq!(LinkedEntity::from_parts(Some("bot"), None), None);
    }
}
