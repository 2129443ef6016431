//! BEP20 reader over EVM JSON-RPC
//!
//! Uses only standard `eth_*` methods so any BSC node or hosted endpoint
//! works. Token transfers are read from `Transfer` logs of the configured
//! token contract; pending transactions are decoded from their call data.

use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{confirmations, decode_transfer_call, parse_hex_u64, raw_to_amount, word_to_address, TRANSFER_TOPIC};
use crate::config::NetworkConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::types::{ChainTransfer, Network, Timestamp, TransferStatus};

/// JSON-RPC request
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

/// JSON-RPC response
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Log {
    address: String,
    topics: Vec<String>,
    data: String,
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    transaction_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Receipt {
    block_number: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<Log>,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    from: String,
    to: Option<String>,
    input: String,
}

#[derive(Debug, Deserialize)]
struct Block {
    timestamp: String,
}

/// EVM JSON-RPC client for one token contract
pub struct EvmClient {
    client: Client,
    config: NetworkConfig,
    request_id: AtomicU64,
}

impl EvmClient {
    pub fn new(config: NetworkConfig) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LedgerError::RpcConnection(e.to_string()))?;

        Ok(Self {
            client,
            config,
            request_id: AtomicU64::new(0),
        })
    }

    /// Make an RPC call; `None` when the node answers `null`
    async fn call_optional<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> LedgerResult<Option<T>> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        debug!("BEP20 RPC call: {} id={}", method, id);

        let mut builder = self.client.post(&self.config.rpc_url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("x-api-key", key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::RpcResponse {
                code: status.as_u16() as i64,
                message: body,
            });
        }

        let rpc_response: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| LedgerError::RpcConnection(e.to_string()))?;

        if let Some(error) = rpc_response.error {
            return Err(LedgerError::RpcResponse {
                code: error.code,
                message: error.message,
            });
        }
        Ok(rpc_response.result)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> LedgerResult<T> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| LedgerError::RpcConnection(format!("empty response to {}", method)))
    }

    /// Current block number
    pub async fn block_number(&self) -> LedgerResult<u64> {
        let hex: String = self.call("eth_blockNumber", serde_json::json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn block_timestamp(&self, block: u64) -> LedgerResult<Timestamp> {
        let block: Block = self
            .call("eth_getBlockByNumber", serde_json::json!([format!("0x{:x}", block), false]))
            .await?;
        let secs = parse_hex_u64(&block.timestamp)?;
        Utc.timestamp_opt(secs as i64, 0)
            .single()
            .ok_or_else(|| LedgerError::Serialization(format!("bad block timestamp {}", secs)))
    }

    fn is_token(&self, address: &str) -> bool {
        address.eq_ignore_ascii_case(&self.config.token_contract)
    }

    fn token_transfer_log<'a>(&self, logs: &'a [Log]) -> Option<&'a Log> {
        logs.iter().find(|l| {
            self.is_token(&l.address)
                && l.topics.len() >= 3
                && l.topics[0].trim_start_matches("0x").eq_ignore_ascii_case(TRANSFER_TOPIC)
        })
    }

    /// Decode a transaction's call data as a token transfer
    async fn transfer_from_call(
        &self,
        tx_hash: &str,
        status: TransferStatus,
        block: u64,
        confirmations: u32,
        timestamp: Timestamp,
    ) -> LedgerResult<Option<ChainTransfer>> {
        let tx: Option<RpcTransaction> = self
            .call_optional("eth_getTransactionByHash", serde_json::json!([tx_hash]))
            .await?;
        let tx = match tx {
            Some(tx) if tx.to.as_deref().map(|to| self.is_token(to)).unwrap_or(false) => tx,
            _ => return Ok(None),
        };
        let (to_word, amount_word) = match decode_transfer_call(&tx.input) {
            Some(decoded) => decoded,
            None => return Ok(None),
        };
        Ok(Some(ChainTransfer {
            tx_hash: tx_hash.to_string(),
            network: Network::Bep20,
            from: tx.from.to_lowercase(),
            to: format!("0x{}", word_to_address(&to_word)),
            amount: raw_to_amount(&amount_word, Network::Bep20.token_decimals())?,
            block_number: block,
            confirmations,
            status,
            timestamp,
        }))
    }

    /// Token transfer carried by `tx_hash`
    pub async fn fetch_transfer(&self, tx_hash: &str) -> LedgerResult<Option<ChainTransfer>> {
        let receipt: Option<Receipt> = self
            .call_optional("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await?;

        let receipt = match receipt {
            Some(r) => r,
            // Known to the node but not mined yet
            None => {
                return self
                    .transfer_from_call(tx_hash, TransferStatus::Pending, 0, 0, Utc::now())
                    .await
            }
        };

        let block = parse_hex_u64(receipt.block_number.as_deref().unwrap_or("0x0"))?;
        let head = self.block_number().await?;
        let depth = confirmations(head, block);
        let timestamp = self.block_timestamp(block).await?;

        if receipt.status.as_deref() != Some("0x1") {
            return self
                .transfer_from_call(tx_hash, TransferStatus::Failed, block, depth, timestamp)
                .await;
        }

        let log = match self.token_transfer_log(&receipt.logs) {
            Some(log) => log,
            None => {
                debug!(tx_hash, "Receipt carries no token transfer");
                return Ok(None);
            }
        };

        Ok(Some(ChainTransfer {
            tx_hash: tx_hash.to_string(),
            network: Network::Bep20,
            from: format!("0x{}", word_to_address(&log.topics[1])),
            to: format!("0x{}", word_to_address(&log.topics[2])),
            amount: raw_to_amount(&log.data, Network::Bep20.token_decimals())?,
            block_number: block,
            confirmations: depth,
            status: TransferStatus::Confirmed,
            timestamp,
        }))
    }

    /// Token transfers received by `address` within the lookback window
    pub async fn transfers_to(&self, address: &str, since: Timestamp) -> LedgerResult<Vec<ChainTransfer>> {
        let head = self.block_number().await?;
        let from_block = head.saturating_sub(self.config.lookback_blocks);
        let recipient = word_to_address(address);
        let filter = serde_json::json!([{
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", head),
            "address": self.config.token_contract,
            "topics": [format!("0x{}", TRANSFER_TOPIC), null, format!("0x{:0>64}", recipient)],
        }]);
        let logs: Vec<Log> = self.call("eth_getLogs", filter).await?;

        let mut timestamps: HashMap<u64, Timestamp> = HashMap::new();
        let mut transfers = Vec::new();
        for log in logs {
            let (hash, block) = match (&log.transaction_hash, &log.block_number) {
                (Some(hash), Some(block)) => (hash.clone(), parse_hex_u64(block)?),
                _ => continue,
            };
            if log.topics.len() < 3 {
                continue;
            }
            let timestamp = match timestamps.get(&block) {
                Some(ts) => *ts,
                None => {
                    let ts = self.block_timestamp(block).await?;
                    timestamps.insert(block, ts);
                    ts
                }
            };
            if timestamp < since {
                continue;
            }
            transfers.push(ChainTransfer {
                tx_hash: hash,
                network: Network::Bep20,
                from: format!("0x{}", word_to_address(&log.topics[1])),
                to: format!("0x{}", word_to_address(&log.topics[2])),
                amount: raw_to_amount(&log.data, Network::Bep20.token_decimals())?,
                block_number: block,
                confirmations: confirmations(head, block),
                status: TransferStatus::Confirmed,
                timestamp,
            });
        }
        debug!(address, count = transfers.len(), "BEP20 transfers found");
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_deserializes() {
        let json = serde_json::json!({
            "blockNumber": "0x10",
            "status": "0x1",
            "logs": [{
                "address": "0x55d398326f99059fF775485246999027B3197955",
                "topics": [
                    format!("0x{}", TRANSFER_TOPIC),
                    "0x0000000000000000000000001111111111111111111111111111111111111111",
                    "0x0000000000000000000000002222222222222222222222222222222222222222"
                ],
                "data": "0x0000000000000000000000000000000000000000000000056bc75e2d63100000"
            }]
        });
        let receipt: Receipt = serde_json::from_value(json).unwrap();
        let client = EvmClient::new(NetworkConfig::defaults(Network::Bep20)).unwrap();
        let log = client.token_transfer_log(&receipt.logs).unwrap();
        assert_eq!(word_to_address(&log.topics[2]), "2222222222222222222222222222222222222222");
        assert_eq!(
            raw_to_amount(&log.data, 18).unwrap(),
            rust_decimal::Decimal::from(100)
        );
    }
}
