//! Chain-side view of a token transfer

use serde::{Deserialize, Serialize};

use super::common::*;

/// Transfer status as reported by the chain reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Seen but not yet included, or included without a final result
    Pending,
    /// Included and executed successfully
    Confirmed,
    /// Included but reverted
    Failed,
}

/// Token transfer details returned by a [`ChainReader`](crate::chain::ChainReader)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTransfer {
    pub tx_hash: String,
    pub network: Network,
    pub from: String,
    pub to: String,
    /// Token units, already scaled by the token's decimals
    pub amount: Amount,
    pub block_number: u64,
    pub confirmations: u32,
    pub status: TransferStatus,
    pub timestamp: Timestamp,
}

impl ChainTransfer {
    /// Whether the transfer pays `amount` (within tolerance) to `address`
    pub fn pays(&self, address: &str, amount: Amount) -> bool {
        self.sends_to(address) && amounts_match(self.amount, amount)
    }

    /// EVM addresses are compared case-insensitively since they come back in
    /// mixed checksum case; base58 addresses must match exactly.
    pub fn sends_to(&self, address: &str) -> bool {
        match self.network {
            Network::Bep20 => self.to.eq_ignore_ascii_case(address),
            Network::Trc20 => self.to == address,
        }
    }

    /// Confirmed with at least `threshold` confirmations
    pub fn is_final(&self, threshold: u32) -> bool {
        self.status == TransferStatus::Confirmed && self.confirmations >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn transfer(amount: Decimal, confirmations: u32) -> ChainTransfer {
        ChainTransfer {
            tx_hash: "0xabc".to_string(),
            network: Network::Bep20,
            from: "0xfrom".to_string(),
            to: "0xDeposit".to_string(),
            amount,
            block_number: 100,
            confirmations,
            status: TransferStatus::Confirmed,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_pays_and_finality() {
        let t = transfer(Decimal::from(100), 3);
        assert!(t.pays("0xdeposit", Decimal::from(100)));
        assert!(!t.pays("0xother", Decimal::from(100)));
        assert!(!t.pays("0xdeposit", Decimal::new(995, 1)));
        assert!(t.is_final(3));
        assert!(!t.is_final(15));
    }
}
