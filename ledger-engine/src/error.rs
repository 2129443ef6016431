//! Ledger Engine Error Types
//!
//! Error definitions for payment, payout and reconciliation operations.
//! Every variant maps onto one [`ErrorClass`], which decides whether a
//! failure is retried on the next scheduled run, surfaced to the caller,
//! or treated as fatal.

use thiserror::Error;

/// Ledger engine error
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Store connection or pool error
    #[error("Ledger store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store query error
    #[error("Ledger store query failed: {0}")]
    StoreQuery(String),

    /// Chain RPC connection error
    #[error("Chain RPC connection failed: {0}")]
    RpcConnection(String),

    /// Chain RPC response error
    #[error("Chain RPC response error ({code}): {message}")]
    RpcResponse { code: i64, message: String },

    /// Request timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Transaction hash not (yet) visible on chain
    #[error("Transaction not found on chain: {0}")]
    TransactionNotFound(String),

    /// Amount must be strictly positive
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Caller does not own the entity
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Operation not legal from the entity's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Self-reported payment could not be verified on chain
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Transaction hash already recorded against another ledger row
    #[error("Transaction hash already recorded: {0}")]
    DuplicateTxHash(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A structural guarantee was broken (double payout, count overflow, ...)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Referral settlement failed
    #[error("Settlement failed: {0}")]
    Settlement(String),

    /// Notification delivery failed
    #[error("Notification failed: {0}")]
    Notification(String),
}

/// Ledger result type
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection or timeout; retried on the next scheduled run, no alert
    TransientInfra,
    /// Chain data not available yet; marked checked and retried later
    ExternalDataUnavailable,
    /// Rejected input or state; surfaced to the caller, never retried
    Validation,
    /// Must never happen; logged at error level and never swallowed
    InvariantViolation,
}

impl LedgerError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::StoreUnavailable(_)
            | LedgerError::StoreQuery(_)
            | LedgerError::RpcConnection(_)
            | LedgerError::RpcResponse { .. }
            | LedgerError::Timeout(_)
            | LedgerError::Settlement(_)
            | LedgerError::Notification(_) => ErrorClass::TransientInfra,
            LedgerError::TransactionNotFound(_) => ErrorClass::ExternalDataUnavailable,
            LedgerError::InvalidAmount(_)
            | LedgerError::Unauthorized(_)
            | LedgerError::InvalidState(_)
            | LedgerError::VerificationFailed(_)
            | LedgerError::DuplicateTxHash(_)
            | LedgerError::NotFound(_)
            | LedgerError::InvalidInput(_)
            | LedgerError::Configuration(_)
            | LedgerError::Serialization(_) => ErrorClass::Validation,
            LedgerError::InvariantViolation(_) => ErrorClass::InvariantViolation,
        }
    }

    /// Whether the next scheduled run may succeed where this one failed
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::TransientInfra
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => LedgerError::Timeout("store pool acquire".to_string()),
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                LedgerError::StoreUnavailable(e.to_string())
            }
            other => LedgerError::StoreQuery(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LedgerError::Timeout(e.to_string())
        } else {
            LedgerError::RpcConnection(e.to_string())
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

impl From<rust_decimal::Error> for LedgerError {
    fn from(e: rust_decimal::Error) -> Self {
        LedgerError::Serialization(format!("Decimal error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            LedgerError::StoreUnavailable("down".into()).class(),
            ErrorClass::TransientInfra
        );
        assert_eq!(
            LedgerError::TransactionNotFound("0xabc".into()).class(),
            ErrorClass::ExternalDataUnavailable
        );
        assert_eq!(
            LedgerError::InvalidAmount("0".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            LedgerError::InvariantViolation("double payout".into()).class(),
            ErrorClass::InvariantViolation
        );
        assert!(LedgerError::Timeout("rpc".into()).is_transient());
        assert!(!LedgerError::Unauthorized("user".into()).is_transient());
    }
}
