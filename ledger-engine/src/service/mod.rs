//! Ledger Engine Service Layer
//!
//! Wires the payment gateway, the scanner jobs and the referral worker into
//! one engine driven by the [`Orchestrator`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use ledger_engine::{EngineConfig, LedgerEngine, MemoryLedgerStore};
//!
//! async fn example() -> ledger_engine::LedgerResult<()> {
//!     let engine = LedgerEngine::builder()
//!         .config(EngineConfig::development())
//!         .store(Arc::new(MemoryLedgerStore::new()))
//!         .build()
//!         .await?;
//!
//!     engine.start().await?;
//!     let (request, descriptor) = engine
//!         .gateway()
//!         .create_payment_request(user, PaymentPurpose::ManualDeposit, amount, Network::Trc20, LinkedEntity::None)
//!         .await?;
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

mod builder;

pub use builder::LedgerEngineBuilder;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::{LedgerError, LedgerResult};
use crate::gateway::PaymentGateway;
use crate::jobs::referral::WorkerHandle;
use crate::jobs::{JobKind, ReferralQueue, ReferralWorker};
use crate::metrics::MetricsSnapshot;
use crate::orchestrator::{JobStatusSnapshot, Orchestrator, TriggerOutcome};
use crate::storage::{LedgerStats, LedgerStore};
use crate::types::Timestamp;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Built, not started
    Initializing,
    Running,
    Stopped,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Operator view of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub status: ServiceStatus,
    pub started_at: Option<Timestamp>,
    pub ledger: LedgerStats,
    pub jobs: Vec<JobStatusSnapshot>,
    pub referral_queue: usize,
    pub metrics: MetricsSnapshot,
}

/// The assembled engine
pub struct LedgerEngine<S: LedgerStore + 'static> {
    ctx: EngineContext<S>,
    gateway: PaymentGateway<S>,
    orchestrator: Arc<Orchestrator>,
    referral_queue: ReferralQueue,
    referral_worker: Arc<ReferralWorker<S>>,
    worker_handle: Mutex<Option<WorkerHandle>>,
    status: RwLock<ServiceStatus>,
    started_at: RwLock<Option<Timestamp>>,
}

impl<S: LedgerStore + 'static> LedgerEngine<S> {
    pub fn builder() -> LedgerEngineBuilder<S> {
        LedgerEngineBuilder::new()
    }

    pub fn gateway(&self) -> &PaymentGateway<S> {
        &self.gateway
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn context(&self) -> &EngineContext<S> {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn referral_worker(&self) -> &Arc<ReferralWorker<S>> {
        &self.referral_worker
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    /// Ping the store, start the referral worker and every job timer
    pub async fn start(&self) -> LedgerResult<()> {
        if self.status().await == ServiceStatus::Running {
            return Err(LedgerError::InvalidState("engine already running".to_string()));
        }
        info!("Starting ledger engine...");
        self.ctx.store.ping().await?;

        {
            let mut handle = self.worker_handle.lock().await;
            if handle.is_none() {
                *handle = Some(self.referral_worker.clone().start().await?);
            }
        }
        self.orchestrator.start_all().await;

        *self.status.write().await = ServiceStatus::Running;
        *self.started_at.write().await = Some(self.ctx.now());
        info!("Ledger engine started");
        Ok(())
    }

    /// Stop timers, wait for in-flight runs, then stop the referral worker
    pub async fn stop(&self) {
        info!("Stopping ledger engine...");
        self.orchestrator.stop_all().await;
        if let Some(handle) = self.worker_handle.lock().await.take() {
            handle.shutdown().await;
        }
        *self.status.write().await = ServiceStatus::Stopped;
        info!("Ledger engine stopped");
    }

    /// Run one job now through its single-flight guard
    pub async fn trigger(&self, kind: JobKind) -> LedgerResult<TriggerOutcome> {
        self.orchestrator.trigger_manually(kind).await
    }

    /// Process whatever the referral queue holds right now
    pub async fn drain_referrals(&self) -> crate::jobs::JobReport {
        self.referral_worker.drain().await
    }

    pub async fn job_status(&self) -> Vec<JobStatusSnapshot> {
        self.orchestrator.status_all().await
    }

    pub async fn stats(&self) -> LedgerResult<EngineStats> {
        Ok(EngineStats {
            status: self.status().await,
            started_at: *self.started_at.read().await,
            ledger: self.ctx.store.get_stats().await?,
            jobs: self.job_status().await,
            referral_queue: self.referral_queue.len().await,
            metrics: self.ctx.metrics.snapshot().await,
        })
    }

    /// Metrics in Prometheus text format
    pub async fn prometheus_metrics(&self) -> String {
        self.ctx.metrics.prometheus_export().await
    }
}
