//! Chain readers
//!
//! Read-only access to the two deposit networks. The engine only ever asks
//! three questions: what does this hash transfer, which transfers reached this
//! address, and how high is the chain.

pub mod evm;
pub mod memory;
pub mod tron;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::config::EngineConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::types::{ChainTransfer, Network, Timestamp};

pub use evm::EvmClient;
pub use memory::MemoryChainReader;
pub use tron::TronClient;

/// `keccak256("Transfer(address,address,uint256)")`
pub const TRANSFER_TOPIC: &str = "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// ERC-20 / TRC-20 `transfer(address,uint256)` selector
pub const TRANSFER_SELECTOR: &str = "a9059cbb";

/// Read-only chain interface
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Token transfer carried by `tx_hash`, `None` if the hash is unknown
    async fn fetch_transfer(&self, tx_hash: &str, network: Network) -> LedgerResult<Option<ChainTransfer>>;

    /// Token transfers received by `address` at or after `since`
    async fn transfers_to(&self, address: &str, network: Network, since: Timestamp) -> LedgerResult<Vec<ChainTransfer>>;

    /// Current chain head
    async fn latest_block(&self, network: Network) -> LedgerResult<u64>;
}

/// RPC-backed reader for both networks
pub struct RpcChainReader {
    bep20: EvmClient,
    trc20: TronClient,
}

impl RpcChainReader {
    pub fn new(config: &EngineConfig) -> LedgerResult<Self> {
        Ok(Self {
            bep20: EvmClient::new(config.bep20.clone())?,
            trc20: TronClient::new(config.trc20.clone())?,
        })
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn fetch_transfer(&self, tx_hash: &str, network: Network) -> LedgerResult<Option<ChainTransfer>> {
        match network {
            Network::Bep20 => self.bep20.fetch_transfer(tx_hash).await,
            Network::Trc20 => self.trc20.fetch_transfer(tx_hash).await,
        }
    }

    async fn transfers_to(&self, address: &str, network: Network, since: Timestamp) -> LedgerResult<Vec<ChainTransfer>> {
        match network {
            Network::Bep20 => self.bep20.transfers_to(address, since).await,
            Network::Trc20 => self.trc20.transfers_to(address, since).await,
        }
    }

    async fn latest_block(&self, network: Network) -> LedgerResult<u64> {
        match network {
            Network::Bep20 => self.bep20.block_number().await,
            Network::Trc20 => self.trc20.block_number().await,
        }
    }
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

/// Parse a hex quantity (`0x1b4`)
pub fn parse_hex_u64(s: &str) -> LedgerResult<u64> {
    let digits = strip_0x(s);
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|e| LedgerError::Serialization(format!("bad hex quantity {}: {}", s, e)))
}

/// Convert a raw hex token amount into token units
pub fn raw_to_amount(raw_hex: &str, decimals: u32) -> LedgerResult<Decimal> {
    let digits = strip_0x(raw_hex).trim_start_matches('0');
    if digits.is_empty() {
        return Ok(Decimal::ZERO);
    }
    if digits.len() > 32 {
        return Err(LedgerError::Serialization(format!("token amount {} out of range", raw_hex)));
    }
    let raw = u128::from_str_radix(digits, 16)
        .map_err(|e| LedgerError::Serialization(format!("bad token amount {}: {}", raw_hex, e)))?;
    let raw = i128::try_from(raw)
        .map_err(|_| LedgerError::Serialization(format!("token amount {} out of range", raw_hex)))?;
    Ok(Decimal::try_from_i128_with_scale(raw, decimals)?.normalize())
}

/// Last 20 bytes of a 32-byte word, lowercase hex without prefix
pub fn word_to_address(word: &str) -> String {
    let digits = strip_0x(word);
    let start = digits.len().saturating_sub(40);
    digits[start..].to_lowercase()
}

/// Decode `transfer(address,uint256)` call data into (recipient word, amount word)
pub fn decode_transfer_call(input: &str) -> Option<(String, String)> {
    let data = strip_0x(input);
    if data.len() < 8 + 128 || !data[..8].eq_ignore_ascii_case(TRANSFER_SELECTOR) {
        return None;
    }
    Some((data[8..72].to_string(), data[72..136].to_string()))
}

/// Confirmations of a transaction included at `block`, given the head
pub fn confirmations(head: u64, block: u64) -> u32 {
    if head < block {
        return 0;
    }
    u32::try_from(head - block + 1).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_to_amount() {
        // 100 USDT with 18 decimals
        assert_eq!(raw_to_amount("0x56bc75e2d63100000", 18).unwrap(), Decimal::from(100));
        // 99.5 USDT with 6 decimals
        assert_eq!(raw_to_amount("0x5ee3fe0", 6).unwrap(), Decimal::new(995, 1));
        assert_eq!(raw_to_amount("0x0", 18).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_word_to_address() {
        let word = "0x000000000000000000000000ab5801a7d398351b8be11c439e05c5b3259aec9b";
        assert_eq!(word_to_address(word), "ab5801a7d398351b8be11c439e05c5b3259aec9b");
    }

    #[test]
    fn test_decode_transfer_call() {
        let input = format!(
            "0x{}{:0>64}{:0>64}",
            TRANSFER_SELECTOR, "ab5801a7d398351b8be11c439e05c5b3259aec9b", "5f5e100"
        );
        let (to, amount) = decode_transfer_call(&input).unwrap();
        assert_eq!(word_to_address(&to), "ab5801a7d398351b8be11c439e05c5b3259aec9b");
        assert_eq!(raw_to_amount(&amount, 6).unwrap(), Decimal::from(100));
        assert!(decode_transfer_call("0x095ea7b3").is_none());
    }

    #[test]
    fn test_confirmations() {
        assert_eq!(confirmations(100, 100), 1);
        assert_eq!(confirmations(114, 100), 15);
        assert_eq!(confirmations(99, 100), 0);
    }
}
