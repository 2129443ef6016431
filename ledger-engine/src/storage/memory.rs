//! In-memory ledger store
//!
//! Used by tests and development mode. All tables sit behind one `RwLock`, so
//! every trait method runs as a single serializable transaction: validation
//! happens before the first mutation and a failed operation leaves no trace.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{LedgerStats, LedgerStore};
use crate::error::{LedgerError, LedgerResult};
use crate::types::*;

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    sessions: HashMap<SessionId, Session>,
    payment_requests: HashMap<PaymentRequestId, PaymentRequest>,
    packages: HashMap<PackageId, Package>,
    bots: HashMap<BotId, BotActivation>,
    transactions: HashMap<TransactionId, Transaction>,
    earnings: HashMap<EarningId, Earning>,
    roi_payments: Vec<RoiPayment>,
    settings: HashMap<String, String>,
    scan_states: HashMap<Network, BlockchainScanState>,
}

impl Tables {
    /// Reject a hash already claimed by another request or ledger row
    fn check_hash_unclaimed(
        &self,
        tx_hash: &str,
        request_id: &PaymentRequestId,
        allowed_tx: Option<&TransactionId>,
    ) -> LedgerResult<()> {
        let claimed_by_request = self
            .payment_requests
            .values()
            .any(|r| r.id != *request_id && r.tx_hash.as_deref() == Some(tx_hash));
        let claimed_by_tx = self
            .transactions
            .values()
            .any(|t| Some(&t.id) != allowed_tx && t.tx_hash.as_deref() == Some(tx_hash));
        if claimed_by_request || claimed_by_tx {
            return Err(LedgerError::DuplicateTxHash(tx_hash.to_string()));
        }
        Ok(())
    }

    fn undistributed_lines(&self, package_id: Option<&PackageId>) -> Vec<ReferralLine> {
        let mut lines: Vec<ReferralLine> = self
            .earnings
            .values()
            .filter(|e| e.earning_type.is_referral())
            .filter(|e| matches!(e.status, EarningStatus::Paid | EarningStatus::Pending))
            .filter(|e| e.package_id.is_some() && (package_id.is_none() || e.package_id.as_ref() == package_id))
            .filter_map(|e| {
                let tx = self.transactions.get(e.transaction_id.as_ref()?)?;
                if tx.tx_hash.is_some() {
                    return None;
                }
                Some(ReferralLine {
                    earning: e.clone(),
                    transaction: tx.clone(),
                })
            })
            .collect();
        lines.sort_by_key(|l| l.earning.created_at);
        lines
    }
}

/// In-memory ledger store
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    tables: Arc<RwLock<Tables>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> LedgerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::StoreUnavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    /// All ledger transactions, for assertions
    pub async fn all_transactions(&self) -> Vec<Transaction> {
        self.tables.read().await.transactions.values().cloned().collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    // ==================== Health ====================

    async fn ping(&self) -> LedgerResult<()> {
        self.check_available()
    }

    async fn get_stats(&self) -> LedgerResult<LedgerStats> {
        self.check_available()?;
        let t = self.tables.read().await;
        Ok(LedgerStats {
            open_payment_requests: t
                .payment_requests
                .values()
                .filter(|r| matches!(r.status, PaymentStatus::Pending | PaymentStatus::Confirming))
                .count() as u64,
            active_packages: t
                .packages
                .values()
                .filter(|p| p.status == PackageStatus::Active && !p.is_expired)
                .count() as u64,
            active_bots: t
                .bots
                .values()
                .filter(|b| b.status == BotStatus::Active && !b.is_expired)
                .count() as u64,
            transactions: t.transactions.len() as u64,
            unverified_transactions: t.transactions.values().filter(|tx| !tx.verified).count() as u64,
        })
    }

    // ==================== Users & sessions ====================

    async fn save_user(&self, user: &User) -> LedgerResult<()> {
        self.check_available()?;
        self.tables.write().await.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: &UserId) -> LedgerResult<Option<User>> {
        self.check_available()?;
        Ok(self.tables.read().await.users.get(id).cloned())
    }

    async fn save_session(&self, session: &Session) -> LedgerResult<()> {
        self.check_available()?;
        self.tables.write().await.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn delete_expired_sessions(&self, now: Timestamp) -> LedgerResult<u64> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        let before = t.sessions.len();
        t.sessions.retain(|_, s| s.expires_at >= now);
        Ok((before - t.sessions.len()) as u64)
    }

    // ==================== Payment requests ====================

    async fn insert_payment_request(&self, request: &PaymentRequest) -> LedgerResult<()> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        if t.payment_requests.contains_key(&request.id) {
            return Err(LedgerError::InvalidState(format!(
                "payment request {} already exists",
                request.id
            )));
        }
        t.payment_requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_payment_request(&self, id: &PaymentRequestId) -> LedgerResult<Option<PaymentRequest>> {
        self.check_available()?;
        Ok(self.tables.read().await.payment_requests.get(id).cloned())
    }

    async fn list_open_payment_requests(&self) -> LedgerResult<Vec<PaymentRequest>> {
        self.check_available()?;
        let t = self.tables.read().await;
        let mut open: Vec<PaymentRequest> = t
            .payment_requests
            .values()
            .filter(|r| matches!(r.status, PaymentStatus::Pending | PaymentStatus::Confirming))
            .cloned()
            .collect();
        open.sort_by_key(|r| r.created_at);
        Ok(open)
    }

    async fn transition_payment_request(&self, transition: &PaymentTransition) -> LedgerResult<bool> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        let current = match t.payment_requests.get(&transition.request_id) {
            Some(r) => r.status,
            None => return Err(LedgerError::NotFound(format!("payment request {}", transition.request_id))),
        };
        if current != transition.from {
            return Ok(false);
        }
        if !transition.from.can_transition_to(transition.to) {
            return Err(LedgerError::InvariantViolation(format!(
                "illegal payment transition {} -> {}",
                transition.from, transition.to
            )));
        }
        if let Some(hash) = &transition.tx_hash {
            t.check_hash_unclaimed(hash, &transition.request_id, None)?;
        }

        if let Some(request) = t.payment_requests.get_mut(&transition.request_id) {
            request.status = transition.to;
            if let Some(hash) = &transition.tx_hash {
                request.tx_hash = Some(hash.clone());
            }
            if let Some(confirmations) = transition.confirmations {
                request.confirmations = confirmations;
            }
            if let Some(reason) = &transition.failure_reason {
                request.failure_reason = Some(reason.clone());
            }
            request.updated_at = transition.at;
        }
        Ok(true)
    }

    async fn expire_payment_requests(&self, now: Timestamp) -> LedgerResult<Vec<PaymentRequestId>> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        let mut expired = Vec::new();
        for request in t.payment_requests.values_mut() {
            if request.status == PaymentStatus::Pending && request.expires_at < now {
                request.status = PaymentStatus::Expired;
                request.updated_at = now;
                expired.push(request.id);
            }
        }
        Ok(expired)
    }

    async fn settle_payment_request(&self, settlement: &PaymentSettlement) -> LedgerResult<bool> {
        self.check_available()?;
        let mut t = self.tables.write().await;

        let request = match t.payment_requests.get(&settlement.request_id) {
            Some(r) => r.clone(),
            None => return Err(LedgerError::NotFound(format!("payment request {}", settlement.request_id))),
        };
        if request.status != settlement.from {
            return Ok(false);
        }
        if !settlement.from.can_transition_to(PaymentStatus::Completed) {
            return Err(LedgerError::InvariantViolation(format!(
                "illegal payment transition {} -> COMPLETED",
                settlement.from
            )));
        }

        let existing_tx = match &settlement.deposit {
            DepositEntry::Insert(_) => None,
            DepositEntry::CompleteExisting(id) => {
                if !t.transactions.contains_key(id) {
                    return Err(LedgerError::NotFound(format!("tracking transaction {}", id)));
                }
                Some(*id)
            }
        };
        t.check_hash_unclaimed(&settlement.tx_hash, &settlement.request_id, existing_tx.as_ref())?;

        match &settlement.activation {
            Some(Activation::Package { package_id, .. }) => match t.packages.get(package_id) {
                Some(p) if p.status == PackageStatus::Pending => {}
                Some(p) => {
                    return Err(LedgerError::InvalidState(format!(
                        "package {} is {}, expected PENDING",
                        package_id,
                        p.status.as_str()
                    )))
                }
                None => return Err(LedgerError::NotFound(format!("package {}", package_id))),
            },
            Some(Activation::Bot { bot_id, .. }) => match t.bots.get(bot_id) {
                Some(b) if b.status == BotStatus::Pending => {}
                Some(b) => {
                    return Err(LedgerError::InvalidState(format!(
                        "bot {} is {}, expected PENDING",
                        bot_id,
                        b.status.as_str()
                    )))
                }
                None => return Err(LedgerError::NotFound(format!("bot {}", bot_id))),
            },
            None => {}
        }

        // Validation done; mutate.
        match &settlement.deposit {
            DepositEntry::Insert(tx) => {
                t.transactions.insert(tx.id, tx.clone());
            }
            DepositEntry::CompleteExisting(id) => {
                if let Some(tx) = t.transactions.get_mut(id) {
                    tx.status = TransactionStatus::Completed;
                    tx.updated_at = settlement.at;
                }
            }
        }
        match &settlement.activation {
            Some(Activation::Package {
                package_id,
                investment_date,
                expiry_date,
                next_roi_date,
            }) => {
                if let Some(p) = t.packages.get_mut(package_id) {
                    p.activate(*investment_date, *expiry_date, *next_roi_date);
                }
            }
            Some(Activation::Bot {
                bot_id,
                activation_date,
                expiry_date,
            }) => {
                if let Some(b) = t.bots.get_mut(bot_id) {
                    b.activate(*activation_date, *expiry_date);
                }
            }
            None => {}
        }
        if let Some(r) = t.payment_requests.get_mut(&settlement.request_id) {
            r.status = PaymentStatus::Completed;
            r.tx_hash = Some(settlement.tx_hash.clone());
            r.confirmations = settlement.confirmations;
            r.updated_at = settlement.at;
        }
        Ok(true)
    }

    async fn open_manual_verification(&self, verification: &ManualVerification) -> LedgerResult<bool> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        match t.payment_requests.get(&verification.request_id) {
            Some(r) if r.status == PaymentStatus::Pending => {}
            Some(_) => return Ok(false),
            None => return Err(LedgerError::NotFound(format!("payment request {}", verification.request_id))),
        }
        t.check_hash_unclaimed(&verification.tx_hash, &verification.request_id, None)?;

        t.transactions
            .insert(verification.tracking.id, verification.tracking.clone());
        if let Some(r) = t.payment_requests.get_mut(&verification.request_id) {
            r.status = PaymentStatus::AwaitingAdminApproval;
            r.tx_hash = Some(verification.tx_hash.clone());
            r.confirmations = verification.confirmations;
            r.updated_at = verification.at;
        }
        Ok(true)
    }

    // ==================== Packages & bots ====================

    async fn save_package(&self, package: &Package) -> LedgerResult<()> {
        self.check_available()?;
        self.tables.write().await.packages.insert(package.id, package.clone());
        Ok(())
    }

    async fn get_package(&self, id: &PackageId) -> LedgerResult<Option<Package>> {
        self.check_available()?;
        Ok(self.tables.read().await.packages.get(id).cloned())
    }

    async fn list_due_packages(&self, now: Timestamp) -> LedgerResult<Vec<Package>> {
        self.check_available()?;
        let t = self.tables.read().await;
        let mut due: Vec<Package> = t.packages.values().filter(|p| p.is_payable_at(now)).cloned().collect();
        due.sort_by_key(|p| p.next_roi_date);
        Ok(due)
    }

    async fn list_expirable_packages(&self, now: Timestamp) -> LedgerResult<Vec<Package>> {
        self.check_available()?;
        let t = self.tables.read().await;
        let mut expirable: Vec<Package> = t
            .packages
            .values()
            .filter(|p| p.is_expirable_at(now))
            .cloned()
            .collect();
        expirable.sort_by_key(|p| p.expiry_date);
        Ok(expirable)
    }

    async fn save_bot(&self, bot: &BotActivation) -> LedgerResult<()> {
        self.check_available()?;
        self.tables.write().await.bots.insert(bot.id, bot.clone());
        Ok(())
    }

    async fn get_bot(&self, id: &BotId) -> LedgerResult<Option<BotActivation>> {
        self.check_available()?;
        Ok(self.tables.read().await.bots.get(id).cloned())
    }

    async fn find_active_bot(
        &self,
        user_id: &UserId,
        bot_type: PackageType,
        now: Timestamp,
    ) -> LedgerResult<Option<BotActivation>> {
        self.check_available()?;
        let t = self.tables.read().await;
        Ok(t
            .bots
            .values()
            .filter(|b| {
                b.user_id == *user_id
                    && b.bot_type == bot_type
                    && b.status == BotStatus::Active
                    && !b.is_expired
                    && b.expiry_date > now
            })
            .max_by_key(|b| b.expiry_date)
            .cloned())
    }

    async fn list_expirable_bots(&self, now: Timestamp) -> LedgerResult<Vec<BotActivation>> {
        self.check_available()?;
        let t = self.tables.read().await;
        Ok(t.bots.values().filter(|b| b.is_expirable_at(now)).cloned().collect())
    }

    async fn apply_roi_payout(&self, payout: &RoiPayout) -> LedgerResult<bool> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        let package = match t.packages.get(&payout.package_id) {
            Some(p) => p,
            None => return Err(LedgerError::NotFound(format!("package {}", payout.package_id))),
        };
        if package.status != PackageStatus::Active
            || package.is_expired
            || package.roi_paid_count != payout.expected_paid_count
            || package.next_roi_date != payout.expected_next_roi_date
        {
            return Ok(false);
        }
        if package.roi_paid_count >= MAX_ROI_PAYMENTS {
            return Err(LedgerError::InvariantViolation(format!(
                "package {} would exceed {} ROI payments",
                package.id, MAX_ROI_PAYMENTS
            )));
        }

        t.roi_payments.push(payout.payment.clone());
        t.transactions.insert(payout.transaction.id, payout.transaction.clone());
        t.earnings.insert(payout.earning.id, payout.earning.clone());
        if let Some(p) = t.packages.get_mut(&payout.package_id) {
            p.last_roi_date = Some(payout.paid_at);
            p.next_roi_date = payout.next_roi_date;
            p.roi_paid_count += 1;
            p.total_roi_paid += payout.amount;
        }
        Ok(true)
    }

    async fn apply_capital_return(&self, capital_return: &CapitalReturn) -> LedgerResult<bool> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        match t.packages.get_mut(&capital_return.package_id) {
            Some(p) if p.status == PackageStatus::Active && !p.is_expired => {
                p.status = PackageStatus::Expired;
                p.is_expired = true;
            }
            Some(_) => return Ok(false),
            None => return Err(LedgerError::NotFound(format!("package {}", capital_return.package_id))),
        }
        t.transactions
            .insert(capital_return.transaction.id, capital_return.transaction.clone());
        t.earnings
            .insert(capital_return.earning.id, capital_return.earning.clone());
        Ok(true)
    }

    async fn expire_bot(&self, id: &BotId, now: Timestamp) -> LedgerResult<bool> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        match t.bots.get_mut(id) {
            Some(b) if b.is_expirable_at(now) => {
                b.status = BotStatus::Expired;
                b.is_expired = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(LedgerError::NotFound(format!("bot {}", id))),
        }
    }

    async fn list_roi_payments(&self, package_id: &PackageId) -> LedgerResult<Vec<RoiPayment>> {
        self.check_available()?;
        let t = self.tables.read().await;
        let mut payments: Vec<RoiPayment> = t
            .roi_payments
            .iter()
            .filter(|p| p.package_id == *package_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.month_number);
        Ok(payments)
    }

    // ==================== System settings ====================

    async fn get_setting(&self, key: &str) -> LedgerResult<Option<String>> {
        self.check_available()?;
        Ok(self.tables.read().await.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> LedgerResult<()> {
        self.check_available()?;
        self.tables
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    // ==================== Ledger rows ====================

    async fn insert_transaction(&self, transaction: &Transaction) -> LedgerResult<()> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        if let (Some(hash), true) = (&transaction.tx_hash, transaction.tx_type.is_on_chain()) {
            if t.transactions.values().any(|x| x.tx_hash.as_ref() == Some(hash)) {
                return Err(LedgerError::DuplicateTxHash(hash.clone()));
            }
        }
        t.transactions.insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn get_transaction(&self, id: &TransactionId) -> LedgerResult<Option<Transaction>> {
        self.check_available()?;
        Ok(self.tables.read().await.transactions.get(id).cloned())
    }

    async fn find_transaction_by_hash(&self, tx_hash: &str) -> LedgerResult<Option<Transaction>> {
        self.check_available()?;
        let t = self.tables.read().await;
        Ok(t
            .transactions
            .values()
            .find(|tx| tx.tx_hash.as_deref() == Some(tx_hash))
            .cloned())
    }

    async fn list_transactions(&self, user_id: &UserId) -> LedgerResult<Vec<Transaction>> {
        self.check_available()?;
        let t = self.tables.read().await;
        let mut rows: Vec<Transaction> = t
            .transactions
            .values()
            .filter(|tx| tx.user_id == *user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|tx| tx.created_at);
        Ok(rows)
    }

    async fn insert_earning(&self, earning: &Earning) -> LedgerResult<()> {
        self.check_available()?;
        self.tables.write().await.earnings.insert(earning.id, earning.clone());
        Ok(())
    }

    async fn list_earnings(&self, user_id: &UserId) -> LedgerResult<Vec<Earning>> {
        self.check_available()?;
        let t = self.tables.read().await;
        let mut rows: Vec<Earning> = t
            .earnings
            .values()
            .filter(|e| e.user_id == *user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.created_at);
        Ok(rows)
    }

    // ==================== Chain audit ====================

    async fn list_audit_candidates(&self, recheck_before: Timestamp, limit: usize) -> LedgerResult<Vec<Transaction>> {
        self.check_available()?;
        let t = self.tables.read().await;
        let mut candidates: Vec<(u8, Timestamp, Transaction)> = t
            .transactions
            .values()
            .filter(|tx| tx.tx_type.is_on_chain())
            .filter(|tx| tx.network.is_some() && tx.tx_hash.is_some())
            .filter(|tx| tx.status != TransactionStatus::Failed)
            .filter_map(|tx| {
                let priority = match tx.last_checked_at {
                    None => 0,
                    Some(_) if tx.status == TransactionStatus::Pending => 1,
                    Some(checked) if checked < recheck_before && !tx.verified => 2,
                    Some(checked) if checked < recheck_before => 3,
                    Some(_) => return None,
                };
                Some((priority, tx.last_checked_at.unwrap_or(tx.created_at), tx.clone()))
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(candidates.into_iter().take(limit).map(|(_, _, tx)| tx).collect())
    }

    async fn record_audit(&self, record: &AuditRecord) -> LedgerResult<()> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        let tx = t
            .transactions
            .get_mut(&record.transaction_id)
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", record.transaction_id)))?;
        tx.last_checked_at = Some(record.checked_at);
        tx.audit_note = record.note();
        if record.verifies() && !tx.verified {
            tx.verified = true;
            if tx.status == TransactionStatus::Pending {
                tx.status = TransactionStatus::Completed;
            }
            tx.updated_at = record.checked_at;
        }
        Ok(())
    }

    async fn get_scan_state(&self, network: Network) -> LedgerResult<Option<BlockchainScanState>> {
        self.check_available()?;
        Ok(self.tables.read().await.scan_states.get(&network).cloned())
    }

    async fn save_scan_state(&self, state: &BlockchainScanState) -> LedgerResult<()> {
        self.check_available()?;
        self.tables
            .write()
            .await
            .scan_states
            .insert(state.network, state.clone());
        Ok(())
    }

    // ==================== Referral distribution ====================

    async fn list_undistributed_referral_packages(&self) -> LedgerResult<Vec<PackageId>> {
        self.check_available()?;
        let t = self.tables.read().await;
        let mut seen = HashSet::new();
        Ok(t
            .undistributed_lines(None)
            .into_iter()
            .filter_map(|l| l.earning.package_id)
            .filter(|id| seen.insert(*id))
            .collect())
    }

    async fn list_undistributed_referrals(&self, package_id: &PackageId) -> LedgerResult<Vec<ReferralLine>> {
        self.check_available()?;
        Ok(self.tables.read().await.undistributed_lines(Some(package_id)))
    }

    async fn mark_referrals_distributed(
        &self,
        lines: &[ReferralLine],
        tx_hash: &str,
        now: Timestamp,
    ) -> LedgerResult<u64> {
        self.check_available()?;
        let mut t = self.tables.write().await;
        let mut marked = 0;
        for line in lines {
            let Some(tx) = t.transactions.get_mut(&line.transaction.id) else {
                continue;
            };
            if tx.tx_hash.is_some() {
                continue;
            }
            tx.tx_hash = Some(tx_hash.to_string());
            tx.status = TransactionStatus::Completed;
            tx.updated_at = now;
            if let Some(e) = t.earnings.get_mut(&line.earning.id) {
                e.status = EarningStatus::Paid;
            }
            marked += 1;
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn pending_request(now: Timestamp) -> PaymentRequest {
        PaymentRequest::new(
            Uuid::new_v4(),
            PaymentPurpose::ManualDeposit,
            Decimal::from(100),
            Network::Bep20,
            "0xabc".to_string(),
            LinkedEntity::None,
            now,
            Duration::minutes(30),
        )
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = MemoryLedgerStore::new();
        let now = Utc::now();
        let request = pending_request(now);
        store.insert_payment_request(&request).await.unwrap();

        let to_confirming = PaymentTransition::new(request.id, PaymentStatus::Pending, PaymentStatus::Confirming, now)
            .with_hash("0xhash", 3);
        assert!(store.transition_payment_request(&to_confirming).await.unwrap());
        // Second attempt sees CONFIRMING, not PENDING
        assert!(!store.transition_payment_request(&to_confirming).await.unwrap());

        let stored = store.get_payment_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Confirming);
        assert_eq!(stored.confirmations, 3);
    }

    #[tokio::test]
    async fn test_duplicate_hash_rejected() {
        let store = MemoryLedgerStore::new();
        let now = Utc::now();
        let a = pending_request(now);
        let b = pending_request(now);
        store.insert_payment_request(&a).await.unwrap();
        store.insert_payment_request(&b).await.unwrap();

        let first = PaymentTransition::new(a.id, PaymentStatus::Pending, PaymentStatus::Confirming, now)
            .with_hash("0xsame", 1);
        assert!(store.transition_payment_request(&first).await.unwrap());

        let second = PaymentTransition::new(b.id, PaymentStatus::Pending, PaymentStatus::Confirming, now)
            .with_hash("0xsame", 1);
        let err = store.transition_payment_request(&second).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateTxHash(_)));
    }

    #[tokio::test]
    async fn test_failed_settlement_leaves_no_trace() {
        let store = MemoryLedgerStore::new();
        let now = Utc::now();
        let mut request = pending_request(now);
        let missing_package = Uuid::new_v4();
        request.linked = LinkedEntity::Package(missing_package);
        store.insert_payment_request(&request).await.unwrap();

        let deposit = Transaction::new(
            request.user_id,
            TransactionType::Deposit,
            request.amount,
            TransactionStatus::Completed,
            "deposit",
            now,
        )
        .on_chain(Network::Bep20, "0xdep");
        let settlement = PaymentSettlement {
            request_id: request.id,
            from: PaymentStatus::Pending,
            tx_hash: "0xdep".to_string(),
            confirmations: 20,
            deposit: DepositEntry::Insert(deposit),
            activation: Some(Activation::Package {
                package_id: missing_package,
                investment_date: now,
                expiry_date: now,
                next_roi_date: now,
            }),
            at: now,
        };
        assert!(store.settle_payment_request(&settlement).await.is_err());
        assert!(store.find_transaction_by_hash("0xdep").await.unwrap().is_none());
        let stored = store.get_payment_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryLedgerStore::new();
        store.set_unavailable(true);
        let err = store.ping().await.unwrap_err();
        assert!(err.is_transient());
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_session_cleanup_boundary() {
        let store = MemoryLedgerStore::new();
        let now = Utc::now();
        for offset in [-10, 0, 10] {
            store
                .save_session(&Session {
                    id: Uuid::new_v4(),
                    user_id: Uuid::new_v4(),
                    expires_at: now + Duration::minutes(offset),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.delete_expired_sessions(now).await.unwrap(), 1);
        assert_eq!(store.delete_expired_sessions(now).await.unwrap(), 0);
    }
}
