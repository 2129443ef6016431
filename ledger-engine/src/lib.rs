//! Ledger Engine - Scheduling & Blockchain Reconciliation
//!
//! This crate runs the financial core of a deposit-funded investment ledger:
//! it issues payment requests, discovers and verifies the on-chain deposits
//! that pay them, and drives the recurring jobs that pay ROI, expire packages
//! and bots, audit the ledger against the chain and distribute referral
//! commissions.
//!
//! # Architecture
//!
//! - **Payment Gateway**: payment request lifecycle, manual verification
//! - **Scanner**: deposit discovery and ledger audit against the chain
//! - **Jobs**: ROI payout, expiration, blockchain sync, referral
//!   distribution, session cleanup
//! - **Orchestrator**: per-job timers with single-flight guards
//! - **Ledger Store**: single writer of truth; every financial mutation is one
//!   atomic compare-and-set operation
//! - **Chain Reader**: read-only BEP-20 (JSON-RPC) and TRC-20 (TronGrid) access
//!
//! # Exactly-once effects
//!
//! Jobs may overlap with each other, crash mid-batch or be re-run. None of
//! that can pay an ROI interval twice, return capital twice or credit one
//! deposit twice: each effect is committed together with the state flip that
//! marks it done, and that flip only applies to the state it was computed
//! from.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ledger_engine::{EngineConfig, JobKind, LedgerEngine, MemoryLedgerStore};
//!
//! async fn example() -> ledger_engine::LedgerResult<()> {
//!     let engine = LedgerEngine::builder()
//!         .config(EngineConfig::from_env())
//!         .store(Arc::new(MemoryLedgerStore::new()))
//!         .build()
//!         .await?;
//!
//!     engine.trigger(JobKind::PaymentScan).await?;
//!     engine.start().await?;
//!     // ...
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod retry;
pub mod scanner;
pub mod service;
pub mod storage;
pub mod types;

pub use chain::{ChainReader, MemoryChainReader, RpcChainReader};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuditConfig, EngineConfig, NetworkConfig, RoiPolicy, ScheduleConfig};
pub use context::EngineContext;
pub use error::{ErrorClass, LedgerError, LedgerResult};
pub use gateway::PaymentGateway;
pub use jobs::{CronJob, JobKind, JobReport, LedgerSettlementPayer, ReferralPayer};
pub use metrics::{LedgerMetrics, MetricsSnapshot};
pub use notify::{LogNotifier, MemoryNotifier, Notifier, WebhookNotifier};
pub use orchestrator::{JobState, JobStatusSnapshot, Orchestrator, TriggerOutcome};
pub use retry::RetryStrategy;
pub use scanner::{AuditReport, DiscoveryReport, Scanner};
pub use service::{EngineStats, LedgerEngine, LedgerEngineBuilder, ServiceStatus};
pub use storage::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use types::*;
