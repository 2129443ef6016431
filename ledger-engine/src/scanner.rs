//! Blockchain Scanner & Reconciler
//!
//! Two passes over the chain:
//!
//! - **Discovery** matches incoming transfers to open payment requests and
//!   drives them PENDING → CONFIRMING → COMPLETED (or FAILED).
//! - **Audit** re-checks on-chain ledger transactions against the chain and
//!   records what it finds. It never corrects an amount; discrepancies are
//!   logged and left for an operator.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::{LedgerError, LedgerResult};
use crate::gateway::plan_activation;
use crate::jobs::{log_item_error, JobKind, JobReport};
use crate::storage::LedgerStore;
use crate::types::*;

/// Failure reason for requests whose transfer reverted
pub const CHAIN_FAILURE_REASON: &str = "transfer failed on chain";

/// What discovery did to one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// No matching transfer, or no change in its state
    Unchanged,
    Confirming,
    Completed,
    Failed,
}

/// Result of one discovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub expired: u64,
    pub examined: u64,
    pub confirming: u64,
    pub completed: u64,
    pub failed: u64,
    pub errors: u64,
}

impl From<&DiscoveryReport> for JobReport {
    fn from(r: &DiscoveryReport) -> Self {
        JobReport {
            processed: r.examined + r.expired,
            succeeded: r.confirming + r.completed + r.failed + r.expired,
            failed: r.errors,
        }
    }
}

/// Result of one audit pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub checked: u64,
    pub verified: u64,
    pub discrepancies: u64,
    pub unavailable: u64,
    pub failed: u64,
    /// Highest block a checked transfer was found in, per network
    pub highest_blocks: BTreeMap<Network, u64>,
}

impl From<&AuditReport> for JobReport {
    fn from(r: &AuditReport) -> Self {
        JobReport {
            processed: r.checked,
            succeeded: r.checked - r.failed,
            failed: r.failed,
        }
    }
}

/// Deposit discovery and ledger audit
pub struct Scanner<S: LedgerStore + 'static> {
    ctx: EngineContext<S>,
}

impl<S: LedgerStore + 'static> Scanner<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    // ==================== Discovery ====================

    /// Expire stale requests, then look for deposits on every open one
    pub async fn discover(&self) -> LedgerResult<DiscoveryReport> {
        let now = self.ctx.now();
        let mut report = DiscoveryReport::default();

        let expired = self.ctx.store.expire_payment_requests(now).await?;
        report.expired = expired.len() as u64;
        if !expired.is_empty() {
            self.ctx.metrics.payments_expired(report.expired);
            info!(count = expired.len(), "Expired stale payment requests");
        }

        let open = self.ctx.store.list_open_payment_requests().await?;
        for request in open.iter().filter(|r| r.is_open_at(now)) {
            report.examined += 1;
            match self.reconcile_request(request).await {
                Ok(DiscoveryOutcome::Unchanged) => {}
                Ok(DiscoveryOutcome::Confirming) => report.confirming += 1,
                Ok(DiscoveryOutcome::Completed) => report.completed += 1,
                Ok(DiscoveryOutcome::Failed) => report.failed += 1,
                Err(e) => {
                    report.errors += 1;
                    log_item_error(JobKind::PaymentScan, &request.id, &e);
                }
            }
        }

        debug!(?report, "Discovery pass finished");
        Ok(report)
    }

    /// Advance one open request as far as the chain allows
    pub async fn reconcile_request(&self, request: &PaymentRequest) -> LedgerResult<DiscoveryOutcome> {
        match (request.status, request.tx_hash.as_deref()) {
            (PaymentStatus::Confirming, Some(hash)) => self.follow_confirming(request, hash).await,
            (PaymentStatus::Pending, _) => self.match_pending(request).await,
            _ => Ok(DiscoveryOutcome::Unchanged),
        }
    }

    async fn match_pending(&self, request: &PaymentRequest) -> LedgerResult<DiscoveryOutcome> {
        let mut transfers = self
            .ctx
            .chain
            .transfers_to(&request.deposit_address, request.network, request.created_at)
            .await?;
        transfers.sort_by_key(|t| t.timestamp);

        let threshold = self.ctx.config.required_confirmations(request.network);
        for transfer in transfers {
            if transfer.status == TransferStatus::Failed || !transfer.pays(&request.deposit_address, request.amount) {
                continue;
            }
            if self.ctx.store.find_transaction_by_hash(&transfer.tx_hash).await?.is_some() {
                continue;
            }

            let result = if transfer.is_final(threshold) {
                self.complete(request, PaymentStatus::Pending, &transfer).await
            } else {
                let transition = PaymentTransition::new(
                    request.id,
                    PaymentStatus::Pending,
                    PaymentStatus::Confirming,
                    self.ctx.now(),
                )
                .with_hash(&transfer.tx_hash, transfer.confirmations);
                self.ctx
                    .store
                    .transition_payment_request(&transition)
                    .await
                    .map(|moved| if moved { DiscoveryOutcome::Confirming } else { DiscoveryOutcome::Unchanged })
            };

            match result {
                // Another request with the same amount took this transfer
                Err(LedgerError::DuplicateTxHash(hash)) => {
                    debug!(request_id = %request.id, tx_hash = %hash, "Transfer already claimed, trying next");
                    continue;
                }
                Ok(DiscoveryOutcome::Confirming) => {
                    self.ctx.metrics.payment_confirming();
                    info!(
                        request_id = %request.id,
                        tx_hash = %transfer.tx_hash,
                        confirmations = transfer.confirmations,
                        threshold,
                        "Deposit seen, waiting for confirmations"
                    );
                    return Ok(DiscoveryOutcome::Confirming);
                }
                other => return other,
            }
        }
        Ok(DiscoveryOutcome::Unchanged)
    }

    async fn follow_confirming(&self, request: &PaymentRequest, hash: &str) -> LedgerResult<DiscoveryOutcome> {
        let transfer = match self.ctx.chain.fetch_transfer(hash, request.network).await? {
            Some(t) => t,
            None => {
                warn!(request_id = %request.id, tx_hash = hash, "Confirming transfer no longer visible on chain");
                return Ok(DiscoveryOutcome::Unchanged);
            }
        };

        if transfer.status == TransferStatus::Failed {
            let transition = PaymentTransition::new(
                request.id,
                PaymentStatus::Confirming,
                PaymentStatus::Failed,
                self.ctx.now(),
            )
            .with_reason(CHAIN_FAILURE_REASON);
            if !self.ctx.store.transition_payment_request(&transition).await? {
                return Ok(DiscoveryOutcome::Unchanged);
            }
            self.ctx.metrics.payment_failed();
            warn!(request_id = %request.id, tx_hash = hash, "Deposit failed on chain");
            self.ctx
                .notify(
                    &request.user_id,
                    "Payment failed",
                    &format!("Your payment {} failed on {}.", hash, request.network),
                )
                .await;
            return Ok(DiscoveryOutcome::Failed);
        }

        let threshold = self.ctx.config.required_confirmations(request.network);
        if !transfer.is_final(threshold) {
            debug!(
                request_id = %request.id,
                confirmations = transfer.confirmations,
                threshold,
                "Still confirming"
            );
            return Ok(DiscoveryOutcome::Unchanged);
        }
        if !transfer.pays(&request.deposit_address, request.amount) {
            return Err(LedgerError::InvariantViolation(format!(
                "confirming hash {} no longer pays {} to {}",
                hash, request.amount, request.deposit_address
            )));
        }
        self.complete(request, PaymentStatus::Confirming, &transfer).await
    }

    /// Settlement with a verified deposit row and the linked activation
    async fn complete(
        &self,
        request: &PaymentRequest,
        from: PaymentStatus,
        transfer: &ChainTransfer,
    ) -> LedgerResult<DiscoveryOutcome> {
        let now = self.ctx.now();
        let deposit = Transaction::new(
            request.user_id,
            TransactionType::Deposit,
            request.amount,
            TransactionStatus::Completed,
            format!("{} deposit", request.purpose.as_str()),
            now,
        )
        .on_chain(request.network, &transfer.tx_hash)
        .mark_verified(now);

        let settlement = PaymentSettlement {
            request_id: request.id,
            from,
            tx_hash: transfer.tx_hash.clone(),
            confirmations: transfer.confirmations,
            deposit: DepositEntry::Insert(deposit),
            activation: plan_activation(&self.ctx, &request.linked, now).await?,
            at: now,
        };
        if !self.ctx.store.settle_payment_request(&settlement).await? {
            return Ok(DiscoveryOutcome::Unchanged);
        }

        self.ctx.metrics.payment_completed();
        info!(
            request_id = %request.id,
            tx_hash = %transfer.tx_hash,
            confirmations = transfer.confirmations,
            amount = %request.amount,
            "Deposit completed"
        );
        self.ctx
            .notify(
                &request.user_id,
                "Payment confirmed",
                &format!(
                    "Your payment of {} {} on {} has been confirmed.",
                    request.amount,
                    request.network.token_symbol(),
                    request.network
                ),
            )
            .await;
        Ok(DiscoveryOutcome::Completed)
    }

    // ==================== Audit ====================

    /// Audit the highest-priority candidates in throttled batches
    pub async fn audit(&self) -> LedgerResult<AuditReport> {
        let audit = &self.ctx.config.audit;
        let now = self.ctx.now();
        let candidates = self
            .ctx
            .store
            .list_audit_candidates(now - audit.recheck_after(), audit.max_per_run)
            .await?;

        let mut report = AuditReport::default();
        for (i, batch) in candidates.chunks(audit.batch_size.max(1)).enumerate() {
            if i > 0 && !audit.batch_pause().is_zero() {
                tokio::time::sleep(audit.batch_pause()).await;
            }
            for transaction in batch {
                report.checked += 1;
                self.ctx.metrics.audit_checked();
                let (outcome, block) = self.audit_transaction(transaction).await;
                match &outcome {
                    AuditOutcome::Matched { confirmed: true, .. } if !transaction.verified => {
                        report.verified += 1;
                        self.ctx.metrics.audit_verified();
                    }
                    AuditOutcome::Discrepancy { .. } => {
                        report.discrepancies += 1;
                        self.ctx.metrics.audit_discrepancy();
                    }
                    AuditOutcome::Unavailable => {
                        report.unavailable += 1;
                        self.ctx.metrics.audit_unavailable();
                    }
                    AuditOutcome::CheckFailed(_) => {
                        report.failed += 1;
                        self.ctx.metrics.audit_failed();
                    }
                    AuditOutcome::Matched { .. } => {}
                }
                if let (Some(network), Some(block)) = (transaction.network, block) {
                    let highest = report.highest_blocks.entry(network).or_insert(0);
                    *highest = (*highest).max(block);
                }

                let record = AuditRecord {
                    transaction_id: transaction.id,
                    checked_at: self.ctx.now(),
                    outcome,
                };
                if let Err(e) = self.ctx.store.record_audit(&record).await {
                    if !matches!(record.outcome, AuditOutcome::CheckFailed(_)) {
                        report.failed += 1;
                    }
                    log_item_error(JobKind::BlockchainSync, &transaction.id, &e);
                }
            }
        }

        if report.checked > 0 {
            info!(
                checked = report.checked,
                verified = report.verified,
                discrepancies = report.discrepancies,
                unavailable = report.unavailable,
                failed = report.failed,
                "Audit pass finished"
            );
        }
        Ok(report)
    }

    /// Compare one ledger row with the chain; never fails
    async fn audit_transaction(&self, transaction: &Transaction) -> (AuditOutcome, Option<u64>) {
        let (network, hash) = match (transaction.network, transaction.tx_hash.as_deref()) {
            (Some(network), Some(hash)) => (network, hash),
            _ => return (AuditOutcome::CheckFailed("no network or hash".to_string()), None),
        };

        let transfer = match self.ctx.chain.fetch_transfer(hash, network).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                debug!(transaction_id = %transaction.id, tx_hash = hash, "Hash not found on chain yet");
                return (AuditOutcome::Unavailable, None);
            }
            Err(e) => {
                warn!(transaction_id = %transaction.id, tx_hash = hash, error = %e, "Chain check failed");
                return (AuditOutcome::CheckFailed(e.to_string()), None);
            }
        };

        let block = Some(transfer.block_number).filter(|b| *b > 0);
        if !amounts_match(transaction.amount, transfer.amount) {
            warn!(
                transaction_id = %transaction.id,
                user_id = %transaction.user_id,
                tx_hash = hash,
                claimed = %transaction.amount,
                on_chain = %transfer.amount,
                difference = %(transaction.amount - transfer.amount).abs(),
                "Amount discrepancy between ledger and chain"
            );
            return (
                AuditOutcome::Discrepancy {
                    claimed: transaction.amount,
                    on_chain: transfer.amount,
                },
                block,
            );
        }

        let threshold = self.ctx.config.required_confirmations(network);
        (
            AuditOutcome::Matched {
                confirmed: transfer.is_final(threshold),
                confirmations: transfer.confirmations,
            },
            block,
        )
    }
}
