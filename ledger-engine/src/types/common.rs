//! Shared primitive types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wall-clock timestamp
pub type Timestamp = DateTime<Utc>;

/// Monetary amount (token units, not base units)
pub type Amount = Decimal;

pub type UserId = Uuid;
pub type PackageId = Uuid;
pub type BotId = Uuid;
pub type TransactionId = Uuid;
pub type EarningId = Uuid;
pub type RoiPaymentId = Uuid;
pub type PaymentRequestId = Uuid;
pub type SessionId = Uuid;

/// Deposit network
///
/// Both networks carry the same stablecoin; they differ in finality depth and
/// token precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Network {
    /// Network A: EVM chain, BEP-20 token
    Bep20,
    /// Network B: Tron, TRC-20 token
    Trc20,
}

impl Network {
    /// All supported networks
    pub fn all() -> [Network; 2] {
        [Network::Bep20, Network::Trc20]
    }

    /// Canonical name, used as the stored column value
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Bep20 => "BEP20",
            Network::Trc20 => "TRC20",
        }
    }

    /// Parse from a stored or user-supplied name
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BEP20" | "BSC" => Some(Network::Bep20),
            "TRC20" | "TRON" => Some(Network::Trc20),
            _ => None,
        }
    }

    /// Token decimals on this network
    pub fn token_decimals(&self) -> u32 {
        match self {
            Network::Bep20 => 18,
            Network::Trc20 => 6,
        }
    }

    /// Token symbol shown in payment descriptors
    pub fn token_symbol(&self) -> &'static str {
        "USDT"
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Amounts closer than this are considered equal when comparing ledger and chain
pub fn amount_tolerance() -> Amount {
    Decimal::new(1, 2)
}

/// Whether two amounts match within [`amount_tolerance`]
pub fn amounts_match(a: Amount, b: Amount) -> bool {
    (a - b).abs() <= amount_tolerance()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parse() {
        assert_eq!(Network::parse("bep20"), Some(Network::Bep20));
        assert_eq!(Network::parse("TRON"), Some(Network::Trc20));
        assert_eq!(Network::parse("erc20"), None);
        assert_eq!(Network::Trc20.to_string(), "TRC20");
    }

    #[test]
    fn test_amount_tolerance() {
        assert!(amounts_match(Decimal::new(10000, 2), Decimal::new(10001, 2)));
        assert!(!amounts_match(Decimal::new(1000, 1), Decimal::new(995, 1)));
    }
}
