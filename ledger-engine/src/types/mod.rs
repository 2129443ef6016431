//! Core ledger types
//!
//! - [`PaymentRequest`]: issued deposit invitation and its state machine
//! - [`Package`] / [`BotActivation`]: positions earning ROI and the bots gating them
//! - [`Transaction`] / [`Earning`] / [`RoiPayment`]: append-only ledger rows
//! - [`ChainTransfer`]: what the chain says happened
//!
//! Composite records such as [`RoiPayout`], [`CapitalReturn`] and
//! [`PaymentSettlement`] describe one atomic store operation each.

pub mod chain;
pub mod common;
pub mod ledger;
pub mod package;
pub mod payment;

pub use chain::*;
pub use common::*;
pub use ledger::*;
pub use package::*;
pub use payment::*;
