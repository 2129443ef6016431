//! Ledger storage layer
//!
//! The store is the single writer of truth for every ledger entity.
//!
//! # Atomicity
//!
//! Each method that changes a financial entity is one atomic operation: the
//! implementation runs it inside a single database transaction (or under a
//! single lock) so the status flip and its paired ledger rows commit together
//! or not at all. State changes are compare-and-set on the row's current
//! state and report `false` when another writer got there first.

pub mod memory;
pub mod postgres;
pub mod query;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerResult;
use crate::types::*;

/// Ledger storage interface
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ==================== Health ====================

    /// Round-trip to the backing store
    async fn ping(&self) -> LedgerResult<()>;

    /// Row counts for operator status
    async fn get_stats(&self) -> LedgerResult<LedgerStats>;

    // ==================== Users & sessions ====================

    async fn save_user(&self, user: &User) -> LedgerResult<()>;

    async fn get_user(&self, id: &UserId) -> LedgerResult<Option<User>>;

    async fn save_session(&self, session: &Session) -> LedgerResult<()>;

    /// Delete sessions with `expires_at < now`, returning how many were removed
    async fn delete_expired_sessions(&self, now: Timestamp) -> LedgerResult<u64>;

    // ==================== Payment requests ====================

    async fn insert_payment_request(&self, request: &PaymentRequest) -> LedgerResult<()>;

    async fn get_payment_request(&self, id: &PaymentRequestId) -> LedgerResult<Option<PaymentRequest>>;

    /// PENDING and CONFIRMING requests, oldest first
    async fn list_open_payment_requests(&self) -> LedgerResult<Vec<PaymentRequest>>;

    /// Compare-and-set status change
    ///
    /// Returns `false` if the row no longer has `from`. Illegal edges fail with
    /// `InvariantViolation`; a hash already recorded elsewhere fails with
    /// `DuplicateTxHash`.
    async fn transition_payment_request(&self, transition: &PaymentTransition) -> LedgerResult<bool>;

    /// PENDING requests with `expires_at < now` become EXPIRED
    async fn expire_payment_requests(&self, now: Timestamp) -> LedgerResult<Vec<PaymentRequestId>>;

    /// Completion, deposit entry and linked entity activation in one operation
    async fn settle_payment_request(&self, settlement: &PaymentSettlement) -> LedgerResult<bool>;

    /// PENDING → AWAITING_ADMIN_APPROVAL plus the tracking transaction
    async fn open_manual_verification(&self, verification: &ManualVerification) -> LedgerResult<bool>;

    // ==================== Packages & bots ====================

    async fn save_package(&self, package: &Package) -> LedgerResult<()>;

    async fn get_package(&self, id: &PackageId) -> LedgerResult<Option<Package>>;

    /// ACTIVE, unexpired packages with `next_roi_date <= now`
    async fn list_due_packages(&self, now: Timestamp) -> LedgerResult<Vec<Package>>;

    /// ACTIVE, unexpired packages past expiry or at the payment cap
    async fn list_expirable_packages(&self, now: Timestamp) -> LedgerResult<Vec<Package>>;

    async fn save_bot(&self, bot: &BotActivation) -> LedgerResult<()>;

    async fn get_bot(&self, id: &BotId) -> LedgerResult<Option<BotActivation>>;

    /// ACTIVE, unexpired bot of `bot_type` owned by `user_id` still valid at `now`
    async fn find_active_bot(
        &self,
        user_id: &UserId,
        bot_type: PackageType,
        now: Timestamp,
    ) -> LedgerResult<Option<BotActivation>>;

    /// ACTIVE, unexpired bots with `expiry_date <= now`
    async fn list_expirable_bots(&self, now: Timestamp) -> LedgerResult<Vec<BotActivation>>;

    /// Apply one ROI payout; `false` when the package moved on in the meantime
    async fn apply_roi_payout(&self, payout: &RoiPayout) -> LedgerResult<bool>;

    /// Expire a package and return its principal; `false` if already expired
    async fn apply_capital_return(&self, capital_return: &CapitalReturn) -> LedgerResult<bool>;

    /// Expire a bot; `false` if already expired or not yet due
    async fn expire_bot(&self, id: &BotId, now: Timestamp) -> LedgerResult<bool>;

    /// ROI payments of a package ordered by month
    async fn list_roi_payments(&self, package_id: &PackageId) -> LedgerResult<Vec<RoiPayment>>;

    // ==================== System settings ====================

    async fn get_setting(&self, key: &str) -> LedgerResult<Option<String>>;

    async fn put_setting(&self, key: &str, value: &str) -> LedgerResult<()>;

    // ==================== Ledger rows ====================

    async fn insert_transaction(&self, transaction: &Transaction) -> LedgerResult<()>;

    async fn get_transaction(&self, id: &TransactionId) -> LedgerResult<Option<Transaction>>;

    async fn find_transaction_by_hash(&self, tx_hash: &str) -> LedgerResult<Option<Transaction>>;

    async fn list_transactions(&self, user_id: &UserId) -> LedgerResult<Vec<Transaction>>;

    async fn insert_earning(&self, earning: &Earning) -> LedgerResult<()>;

    async fn list_earnings(&self, user_id: &UserId) -> LedgerResult<Vec<Earning>>;

    // ==================== Chain audit ====================

    /// On-chain transactions due for an audit, highest priority first
    ///
    /// Never-checked rows come first, then PENDING rows, then other unverified
    /// rows, then verified rows last checked before `recheck_before`.
    async fn list_audit_candidates(&self, recheck_before: Timestamp, limit: usize) -> LedgerResult<Vec<Transaction>>;

    /// Write audit bookkeeping; flips `verified` only for unverified rows
    async fn record_audit(&self, record: &AuditRecord) -> LedgerResult<()>;

    async fn get_scan_state(&self, network: Network) -> LedgerResult<Option<BlockchainScanState>>;

    async fn save_scan_state(&self, state: &BlockchainScanState) -> LedgerResult<()>;

    // ==================== Referral distribution ====================

    /// Packages with referral earnings whose paired transaction has no hash
    async fn list_undistributed_referral_packages(&self) -> LedgerResult<Vec<PackageId>>;

    async fn list_undistributed_referrals(&self, package_id: &PackageId) -> LedgerResult<Vec<ReferralLine>>;

    /// Attach `tx_hash` to the given lines that are still hashless; lines
    /// written after they were listed are left for the next settlement
    async fn mark_referrals_distributed(
        &self,
        lines: &[ReferralLine],
        tx_hash: &str,
        now: Timestamp,
    ) -> LedgerResult<u64>;
}

/// Row counts for operator status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub open_payment_requests: u64,
    pub active_packages: u64,
    pub active_bots: u64,
    pub transactions: u64,
    pub unverified_transactions: u64,
}

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
