//! In-memory chain reader for tests and local runs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use super::ChainReader;
use crate::error::{LedgerError, LedgerResult};
use crate::types::{ChainTransfer, Network, Timestamp};

#[derive(Debug, Default)]
struct ChainState {
    transfers: HashMap<String, ChainTransfer>,
    heads: HashMap<Network, u64>,
}

/// Scripted chain: transfers are inserted by hand
#[derive(Debug, Clone, Default)]
pub struct MemoryChainReader {
    state: Arc<RwLock<ChainState>>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryChainReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a transfer
    pub fn insert(&self, transfer: ChainTransfer) {
        if let Ok(mut state) = self.state.write() {
            state.transfers.insert(transfer.tx_hash.clone(), transfer);
        }
    }

    /// Drop a transfer, as after a reorg
    pub fn remove(&self, tx_hash: &str) {
        if let Ok(mut state) = self.state.write() {
            state.transfers.remove(tx_hash);
        }
    }

    pub fn set_head(&self, network: Network, block: u64) {
        if let Ok(mut state) = self.state.write() {
            state.heads.insert(network, block);
        }
    }

    /// Make every call fail with a connection error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check(&self) -> LedgerResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(LedgerError::RpcConnection("chain unreachable".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> LedgerResult<std::sync::RwLockReadGuard<'_, ChainState>> {
        self.state
            .read()
            .map_err(|_| LedgerError::RpcConnection("chain state poisoned".to_string()))
    }
}

#[async_trait]
impl ChainReader for MemoryChainReader {
    async fn fetch_transfer(&self, tx_hash: &str, network: Network) -> LedgerResult<Option<ChainTransfer>> {
        self.check()?;
        Ok(self
            .read()?
            .transfers
            .get(tx_hash)
            .filter(|t| t.network == network)
            .cloned())
    }

    async fn transfers_to(&self, address: &str, network: Network, since: Timestamp) -> LedgerResult<Vec<ChainTransfer>> {
        self.check()?;
        let mut transfers: Vec<ChainTransfer> = self
            .read()?
            .transfers
            .values()
            .filter(|t| t.network == network && t.to.eq_ignore_ascii_case(address) && t.timestamp >= since)
            .cloned()
            .collect();
        transfers.sort_by_key(|t| t.timestamp);
        Ok(transfers)
    }

    async fn latest_block(&self, network: Network) -> LedgerResult<u64> {
        self.check()?;
        Ok(self.read()?.heads.get(&network).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransferStatus;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_filters_by_network_and_time() {
        let chain = MemoryChainReader::new();
        let now = Utc::now();
        chain.insert(ChainTransfer {
            tx_hash: "0x01".to_string(),
            network: Network::Bep20,
            from: "0xa".to_string(),
            to: "0xdeposit".to_string(),
            amount: Decimal::from(10),
            block_number: 1,
            confirmations: 20,
            status: TransferStatus::Confirmed,
            timestamp: now,
        });

        assert!(chain.fetch_transfer("0x01", Network::Trc20).await.unwrap().is_none());
        assert!(chain.fetch_transfer("0x01", Network::Bep20).await.unwrap().is_some());
        assert_eq!(
            chain
                .transfers_to("0xDEPOSIT", Network::Bep20, now - Duration::minutes(1))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(chain
            .transfers_to("0xdeposit", Network::Bep20, now + Duration::minutes(1))
            .await
            .unwrap()
            .is_empty());

        chain.set_unreachable(true);
        assert!(chain.latest_block(Network::Bep20).await.is_err());
    }
}
