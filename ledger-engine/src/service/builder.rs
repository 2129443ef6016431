//! Ledger Engine Builder

use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::chain::{ChainReader, RpcChainReader};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::{LedgerError, LedgerResult};
use crate::gateway::PaymentGateway;
use crate::jobs::{
    BlockchainSyncJob, ExpirationJob, LedgerSettlementPayer, PaymentScanJob, ReferralDispatchJob, ReferralPayer,
    ReferralQueue, ReferralWorker, RoiPayoutJob, SessionCleanupJob,
};
use crate::metrics::LedgerMetrics;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::orchestrator::Orchestrator;
use crate::storage::LedgerStore;

use super::{LedgerEngine, ServiceStatus};

/// Ledger Engine Builder
///
/// Only the store is required. The chain reader defaults to the RPC reader
/// built from the config, the notifier to the webhook when one is configured
/// (log otherwise), the clock to the system clock and the referral payer to
/// ledger-only settlement.
pub struct LedgerEngineBuilder<S: LedgerStore + 'static> {
    config: Option<EngineConfig>,
    store: Option<Arc<S>>,
    chain: Option<Arc<dyn ChainReader>>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Arc<dyn Clock>>,
    referral_payer: Option<Arc<dyn ReferralPayer>>,
    metrics: Option<Arc<LedgerMetrics>>,
}

impl<S: LedgerStore + 'static> LedgerEngineBuilder<S> {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            chain: None,
            notifier: None,
            clock: None,
            referral_payer: None,
            metrics: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn chain(mut self, chain: Arc<dyn ChainReader>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn referral_payer(mut self, payer: Arc<dyn ReferralPayer>) -> Self {
        self.referral_payer = Some(payer);
        self
    }

    pub fn metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assemble the engine and register every job
    pub async fn build(self) -> LedgerResult<LedgerEngine<S>> {
        let config = Arc::new(self.config.unwrap_or_default());
        let store = self
            .store
            .ok_or_else(|| LedgerError::Configuration("Store is required".to_string()))?;

        let chain: Arc<dyn ChainReader> = match self.chain {
            Some(chain) => chain,
            None => Arc::new(RpcChainReader::new(&config)?),
        };
        let notifier: Arc<dyn Notifier> = match (self.notifier, config.notify.webhook_url.as_deref()) {
            (Some(notifier), _) => notifier,
            (None, Some(url)) => Arc::new(WebhookNotifier::new(url)?),
            (None, None) => Arc::new(LogNotifier),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(LedgerMetrics::new()));
        let payer = self.referral_payer.unwrap_or_else(|| Arc::new(LedgerSettlementPayer));

        let ctx = EngineContext {
            store,
            chain,
            notifier,
            clock: clock.clone(),
            config: config.clone(),
            metrics: metrics.clone(),
        };

        let (referral_queue, referral_rx) = ReferralQueue::bounded(config.referral.queue_capacity);
        let referral_worker = Arc::new(ReferralWorker::new(
            ctx.clone(),
            payer,
            referral_queue.clone(),
            referral_rx,
        ));

        let mut orchestrator = Orchestrator::new(config.schedule.clone(), clock, metrics);
        orchestrator.register(Arc::new(PaymentScanJob::new(ctx.clone())));
        orchestrator.register(Arc::new(RoiPayoutJob::new(ctx.clone())));
        orchestrator.register(Arc::new(ExpirationJob::new(ctx.clone())));
        orchestrator.register(Arc::new(BlockchainSyncJob::new(ctx.clone())));
        orchestrator.register(Arc::new(ReferralDispatchJob::new(ctx.clone(), referral_queue.clone())));
        orchestrator.register(Arc::new(SessionCleanupJob::new(ctx.clone())));
        info!(jobs = orchestrator.jobs().len(), "Ledger engine assembled");

        Ok(LedgerEngine {
            gateway: PaymentGateway::new(ctx.clone()),
            ctx,
            orchestrator: Arc::new(orchestrator),
            referral_queue,
            referral_worker,
            worker_handle: Mutex::new(None),
            status: RwLock::new(ServiceStatus::Initializing),
            started_at: RwLock::new(None),
        })
    }
}

impl<S: LedgerStore + 'static> Default for LedgerEngineBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChainReader;
    use crate::jobs::JobKind;
    use crate::storage::MemoryLedgerStore;

    #[tokio::test]
    async fn test_builder_requires_store() {
        let result = LedgerEngineBuilder::<MemoryLedgerStore>::new()
            .config(EngineConfig::development())
            .build()
            .await;

        assert!(matches!(result, Err(LedgerError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_builder_registers_every_job() {
        let engine = LedgerEngineBuilder::new()
            .config(EngineConfig::development())
            .store(Arc::new(MemoryLedgerStore::new()))
            .chain(Arc::new(MemoryChainReader::new()))
            .build()
            .await
            .unwrap();

        assert_eq!(engine.orchestrator().jobs(), JobKind::all().to_vec());
        assert_eq!(engine.status().await, ServiceStatus::Initializing);
    }
}
