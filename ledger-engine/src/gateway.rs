//! Payment Gateway
//!
//! Issues payment requests against the fixed per-network deposit addresses
//! and handles everything a user (or operator) does to a request directly:
//! status lookup, cancellation, manual hash submission and approval.
//! Automatic discovery lives in [`crate::scanner`].

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::error::{LedgerError, LedgerResult};
use crate::storage::LedgerStore;
use crate::types::*;

/// Reason recorded on user-cancelled requests
pub const CANCELLED_REASON: &str = "cancelled";

/// Payment request lifecycle operations
pub struct PaymentGateway<S: LedgerStore + 'static> {
    ctx: EngineContext<S>,
}

impl<S: LedgerStore + 'static> PaymentGateway<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    /// Issue a PENDING request and its scannable descriptor
    pub async fn create_payment_request(
        &self,
        user_id: UserId,
        purpose: PaymentPurpose,
        amount: Amount,
        network: Network,
        linked: LinkedEntity,
    ) -> LedgerResult<(PaymentRequest, PaymentDescriptor)> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "payment amount must be positive, got {}",
                amount
            )));
        }
        let address = self.ctx.config.deposit_address(network)?.to_string();
        let now = self.ctx.now();

        let request = PaymentRequest::new(
            user_id,
            purpose,
            amount,
            network,
            address,
            linked,
            now,
            self.ctx.config.payment.request_ttl(),
        );
        let descriptor = payment_descriptor(&request, &self.ctx.config.network(network).token_contract)?;
        self.ctx.store.insert_payment_request(&request).await?;
        self.ctx.metrics.payment_request_created();

        info!(
            request_id = %request.id,
            %user_id,
            purpose = request.purpose.as_str(),
            %amount,
            %network,
            expires_at = %request.expires_at,
            "Payment request created"
        );
        Ok((request, descriptor))
    }

    /// Current status; an overdue PENDING request is expired first
    pub async fn get_status(&self, id: &PaymentRequestId) -> LedgerResult<PaymentStatusSnapshot> {
        let request = self.load(id).await?;
        let now = self.ctx.now();
        if !request.is_expired_at(now) {
            return Ok(request.snapshot());
        }

        let transition = PaymentTransition::new(request.id, PaymentStatus::Pending, PaymentStatus::Expired, now);
        if self.ctx.store.transition_payment_request(&transition).await? {
            self.ctx.metrics.payments_expired(1);
            info!(request_id = %id, "Payment request expired on read");
        }
        Ok(self.load(id).await?.snapshot())
    }

    /// Cancel a PENDING request owned by `user_id`
    pub async fn cancel(&self, id: &PaymentRequestId, user_id: &UserId) -> LedgerResult<()> {
        let request = self.load(id).await?;
        if request.user_id != *user_id {
            return Err(LedgerError::Unauthorized(format!(
                "payment request {} belongs to another user",
                id
            )));
        }
        if request.status != PaymentStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "payment request {} is {}, only PENDING can be cancelled",
                id, request.status
            )));
        }

        let transition = PaymentTransition::new(request.id, PaymentStatus::Pending, PaymentStatus::Failed, self.ctx.now())
            .with_reason(CANCELLED_REASON);
        if !self.ctx.store.transition_payment_request(&transition).await? {
            return Err(LedgerError::InvalidState(format!(
                "payment request {} changed while cancelling",
                id
            )));
        }
        self.ctx.metrics.payment_failed();
        info!(request_id = %id, %user_id, "Payment request cancelled");
        Ok(())
    }

    /// Verify a user-reported hash and queue the request for operator approval
    pub async fn manually_verify(&self, id: &PaymentRequestId, tx_hash: &str) -> LedgerResult<PaymentStatusSnapshot> {
        let tx_hash = tx_hash.trim();
        if tx_hash.is_empty() {
            return Err(LedgerError::InvalidInput("transaction hash is empty".to_string()));
        }

        let request = self.load(id).await?;
        let now = self.ctx.now();
        if request.status != PaymentStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "payment request {} is {}, expected PENDING",
                id, request.status
            )));
        }
        if request.is_expired_at(now) {
            return Err(LedgerError::InvalidState(format!("payment request {} has expired", id)));
        }

        if self.ctx.store.find_transaction_by_hash(tx_hash).await?.is_some() {
            return Err(LedgerError::VerificationFailed(format!(
                "hash {} is already recorded in the ledger",
                tx_hash
            )));
        }

        let transfer = match self.ctx.chain.fetch_transfer(tx_hash, request.network).await? {
            Some(t) => t,
            None => {
                return Err(LedgerError::VerificationFailed(format!(
                    "hash {} not found on {}",
                    tx_hash, request.network
                )))
            }
        };
        if transfer.status == TransferStatus::Failed {
            return Err(LedgerError::VerificationFailed(format!("transfer {} failed on chain", tx_hash)));
        }
        if !transfer.sends_to(&request.deposit_address) {
            return Err(LedgerError::VerificationFailed(format!(
                "transfer {} pays {}, expected {}",
                tx_hash, transfer.to, request.deposit_address
            )));
        }
        if transfer.amount != request.amount {
            return Err(LedgerError::VerificationFailed(format!(
                "transfer {} carries {}, expected {}",
                tx_hash, transfer.amount, request.amount
            )));
        }

        let tracking = Transaction::new(
            request.user_id,
            TransactionType::Deposit,
            request.amount,
            TransactionStatus::Pending,
            format!("{} deposit awaiting approval", request.purpose.as_str()),
            now,
        )
        .on_chain(request.network, tx_hash);

        let verification = ManualVerification {
            request_id: request.id,
            tx_hash: tx_hash.to_string(),
            confirmations: transfer.confirmations,
            tracking,
            at: now,
        };
        let opened = match self.ctx.store.open_manual_verification(&verification).await {
            Ok(opened) => opened,
            Err(LedgerError::DuplicateTxHash(h)) => {
                return Err(LedgerError::VerificationFailed(format!(
                    "hash {} is already claimed",
                    h
                )))
            }
            Err(e) => return Err(e),
        };
        if !opened {
            return Err(LedgerError::InvalidState(format!(
                "payment request {} changed during verification",
                id
            )));
        }

        self.ctx.metrics.manual_verification_opened();
        info!(request_id = %id, tx_hash, confirmations = transfer.confirmations, "Manual payment verified, awaiting approval");
        Ok(self.load(id).await?.snapshot())
    }

    /// Operator approval of a manually verified request
    pub async fn approve_manual(&self, id: &PaymentRequestId) -> LedgerResult<PaymentStatusSnapshot> {
        let request = self.load(id).await?;
        if request.status != PaymentStatus::AwaitingAdminApproval {
            return Err(LedgerError::InvalidState(format!(
                "payment request {} is {}, expected AWAITING_ADMIN_APPROVAL",
                id, request.status
            )));
        }
        let tx_hash = request.tx_hash.clone().ok_or_else(|| {
            LedgerError::InvariantViolation(format!("payment request {} awaits approval without a hash", id))
        })?;
        let tracking = self.ctx.store.find_transaction_by_hash(&tx_hash).await?.ok_or_else(|| {
            LedgerError::InvariantViolation(format!("no tracking transaction for hash {}", tx_hash))
        })?;

        let now = self.ctx.now();
        let settlement = PaymentSettlement {
            request_id: request.id,
            from: PaymentStatus::AwaitingAdminApproval,
            tx_hash: tx_hash.clone(),
            confirmations: request.confirmations,
            deposit: DepositEntry::CompleteExisting(tracking.id),
            activation: plan_activation(&self.ctx, &request.linked, now).await?,
            at: now,
        };
        if !self.ctx.store.settle_payment_request(&settlement).await? {
            return Err(LedgerError::InvalidState(format!(
                "payment request {} changed during approval",
                id
            )));
        }

        self.ctx.metrics.payment_completed();
        info!(request_id = %id, tx_hash = %tx_hash, "Manual payment approved");
        self.ctx
            .notify(
                &request.user_id,
                "Payment confirmed",
                &format!("Your payment of {} {} has been confirmed.", request.amount, request.network.token_symbol()),
            )
            .await;
        Ok(self.load(id).await?.snapshot())
    }

    /// Expire every overdue PENDING request; idempotent
    pub async fn expire_old_requests(&self) -> LedgerResult<Vec<PaymentRequestId>> {
        let expired = self.ctx.store.expire_payment_requests(self.ctx.now()).await?;
        if !expired.is_empty() {
            self.ctx.metrics.payments_expired(expired.len() as u64);
            info!(count = expired.len(), "Expired stale payment requests");
        }
        Ok(expired)
    }

    async fn load(&self, id: &PaymentRequestId) -> LedgerResult<PaymentRequest> {
        self.ctx
            .store
            .get_payment_request(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("payment request {}", id)))
    }
}

/// Activation to apply when a request for `linked` completes at `now`
pub(crate) async fn plan_activation<S: LedgerStore + 'static>(
    ctx: &EngineContext<S>,
    linked: &LinkedEntity,
    now: Timestamp,
) -> LedgerResult<Option<Activation>> {
    match linked {
        LinkedEntity::Package(id) => {
            let package = ctx
                .store
                .get_package(id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("package {}", id)))?;
            if package.status != PackageStatus::Pending {
                warn!(package_id = %id, status = package.status.as_str(), "Linked package is not PENDING");
            }
            Ok(Some(package.activation_at(now, ctx.config.roi.interval_for(package.package_type))))
        }
        LinkedEntity::Bot(id) => {
            if ctx.store.get_bot(id).await?.is_none() {
                return Err(LedgerError::NotFound(format!("bot {}", id)));
            }
            Ok(Some(Activation::Bot {
                bot_id: *id,
                activation_date: now,
                expiry_date: now + ctx.config.roi.bot_term(),
            }))
        }
        LinkedEntity::None => Ok(None),
    }
}

/// Scannable descriptor: address, amount, token and a wallet URI
pub fn payment_descriptor(request: &PaymentRequest, token_contract: &str) -> LedgerResult<PaymentDescriptor> {
    let amount = request.amount.normalize();
    let uri = match request.network {
        // EIP-681 token transfer on BSC (chain id 56), amount in base units
        Network::Bep20 => {
            let scale = Decimal::from(10u64.pow(request.network.token_decimals()));
            let raw = amount
                .checked_mul(scale)
                .ok_or_else(|| LedgerError::InvalidAmount(format!("amount {} out of range", amount)))?
                .trunc()
                .normalize();
            format!(
                "ethereum:{}@56/transfer?address={}&uint256={}",
                token_contract, request.deposit_address, raw
            )
        }
        Network::Trc20 => format!(
            "tron:{}?amount={}&token={}",
            request.deposit_address, amount, token_contract
        ),
    };

    Ok(PaymentDescriptor {
        network: request.network,
        address: request.deposit_address.clone(),
        amount: amount.to_string(),
        token: request.network.token_symbol().to_string(),
        uri,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::context::testing::harness;
    use chrono::Duration;
    use uuid::Uuid;

    fn deposit(hash: &str, network: Network, to: &str, amount: Decimal, at: Timestamp) -> ChainTransfer {
        ChainTransfer {
            tx_hash: hash.to_string(),
            network,
            from: "sender".to_string(),
            to: to.to_string(),
            amount,
            block_number: 100,
            confirmations: 3,
            status: TransferStatus::Confirmed,
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_non_positive_amount() {
        let h = harness();
        let gateway = PaymentGateway::new(h.ctx.clone());
        let err = gateway
            .create_payment_request(Uuid::new_v4(), PaymentPurpose::ManualDeposit, Decimal::ZERO, Network::Bep20, LinkedEntity::None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_create_builds_descriptor() {
        let h = harness();
        let gateway = PaymentGateway::new(h.ctx.clone());
        let (request, descriptor) = gateway
            .create_payment_request(
                Uuid::new_v4(),
                PaymentPurpose::ManualDeposit,
                Decimal::new(1005, 1),
                Network::Bep20,
                LinkedEntity::None,
            )
            .await
            .unwrap();

        assert_eq!(request.status, PaymentStatus::Pending);
        assert_eq!(request.expires_at - request.created_at, Duration::minutes(30));
        assert_eq!(descriptor.amount, "100.5");
        assert_eq!(descriptor.token, "USDT");
        assert!(descriptor.uri.ends_with("&uint256=100500000000000000000"));
    }

    #[tokio::test]
    async fn test_lazy_expiry_and_idempotent_sweep() {
        let h = harness();
        let gateway = PaymentGateway::new(h.ctx.clone());
        let (request, _) = gateway
            .create_payment_request(Uuid::new_v4(), PaymentPurpose::ManualDeposit, Decimal::from(100), Network::Trc20, LinkedEntity::None)
            .await
            .unwrap();

        h.clock.advance(Duration::minutes(31));
        assert_eq!(gateway.get_status(&request.id).await.unwrap().status, PaymentStatus::Expired);
        assert!(gateway.expire_old_requests().await.unwrap().is_empty());
        assert_eq!(gateway.get_status(&request.id).await.unwrap().status, PaymentStatus::Expired);
    }

    #[tokio::test]
    async fn test_cancel_checks_owner_and_state() {
        let h = harness();
        let gateway = PaymentGateway::new(h.ctx.clone());
        let owner = Uuid::new_v4();
        let (request, _) = gateway
            .create_payment_request(owner, PaymentPurpose::ManualDeposit, Decimal::from(50), Network::Bep20, LinkedEntity::None)
            .await
            .unwrap();

        let err = gateway.cancel(&request.id, &Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        gateway.cancel(&request.id, &owner).await.unwrap();
        let snapshot = gateway.get_status(&request.id).await.unwrap();
        assert_eq!(snapshot.status, PaymentStatus::Failed);
        assert_eq!(snapshot.failure_reason.as_deref(), Some(CANCELLED_REASON));

        let err = gateway.cancel(&request.id, &owner).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_manual_verification_then_approval() {
        let h = harness();
        let gateway = PaymentGateway::new(h.ctx.clone());
        let user = Uuid::new_v4();
        let now = h.clock.now();

        let mut bot = BotActivation::pending(user, PackageType::Neo, now);
        h.store.save_bot(&bot).await.unwrap();
        let (request, _) = gateway
            .create_payment_request(user, PaymentPurpose::BotActivation, Decimal::from(25), Network::Bep20, LinkedEntity::Bot(bot.id))
            .await
            .unwrap();

        // Wrong amount never mutates the request
        h.chain.insert(deposit("0xshort", Network::Bep20, &request.deposit_address, Decimal::new(2499, 2), now));
        let err = gateway.manually_verify(&request.id, "0xshort").await.unwrap_err();
        assert!(matches!(err, LedgerError::VerificationFailed(_)));
        let err = gateway.manually_verify(&request.id, "0xunknown").await.unwrap_err();
        assert!(matches!(err, LedgerError::VerificationFailed(_)));
        assert_eq!(gateway.get_status(&request.id).await.unwrap().status, PaymentStatus::Pending);

        h.chain.insert(deposit("0xgood", Network::Bep20, &request.deposit_address.to_uppercase(), Decimal::from(25), now));
        let snapshot = gateway.manually_verify(&request.id, "0xgood").await.unwrap();
        assert_eq!(snapshot.status, PaymentStatus::AwaitingAdminApproval);

        let tracking = h.store.find_transaction_by_hash("0xgood").await.unwrap().unwrap();
        assert_eq!(tracking.status, TransactionStatus::Pending);
        assert!(!tracking.verified);

        let snapshot = gateway.approve_manual(&request.id).await.unwrap();
        assert_eq!(snapshot.status, PaymentStatus::Completed);
        let tracking = h.store.get_transaction(&tracking.id).await.unwrap().unwrap();
        assert_eq!(tracking.status, TransactionStatus::Completed);

        bot = h.store.get_bot(&bot.id).await.unwrap().unwrap();
        assert_eq!(bot.status, BotStatus::Active);
        assert_eq!(bot.expiry_date, now + Duration::days(365));
    }

    #[tokio::test]
    async fn test_manual_verification_rejects_claimed_hash() {
        let h = harness();
        let gateway = PaymentGateway::new(h.ctx.clone());
        let now = h.clock.now();
        let (request, _) = gateway
            .create_payment_request(Uuid::new_v4(), PaymentPurpose::ManualDeposit, Decimal::from(10), Network::Bep20, LinkedEntity::None)
            .await
            .unwrap();
        h.chain.insert(deposit("0xdup", Network::Bep20, &request.deposit_address, Decimal::from(10), now));

        let earlier = Transaction::new(Uuid::new_v4(), TransactionType::Deposit, Decimal::from(10), TransactionStatus::Completed, "", now)
            .on_chain(Network::Bep20, "0xdup");
        h.store.insert_transaction(&earlier).await.unwrap();

        let err = gateway.manually_verify(&request.id, "0xdup").await.unwrap_err();
        assert!(matches!(err, LedgerError::VerificationFailed(_)));
    }
}
