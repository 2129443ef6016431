//! TRC20 reader over the TronGrid HTTP API
//!
//! Addresses are exchanged with callers in base58check form (`T...`); the
//! node reports them as 20-byte hex without the `41` network prefix inside
//! event logs.

use chrono::{TimeZone, Utc};
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{confirmations, decode_transfer_call, raw_to_amount, word_to_address, TRANSFER_TOPIC};
use crate::config::NetworkConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::types::{ChainTransfer, Network, Timestamp, TransferStatus};

/// Tron mainnet address prefix byte
const ADDRESS_PREFIX: u8 = 0x41;

/// Page size for the account history endpoint
const HISTORY_LIMIT: u32 = 200;

/// Base58check address to 20-byte hex
pub fn tron_to_hex(address: &str) -> LedgerResult<String> {
    let bytes = bs58::decode(address)
        .with_check(None)
        .into_vec()
        .map_err(|e| LedgerError::InvalidInput(format!("bad TRON address {}: {}", address, e)))?;
    if bytes.len() != 21 || bytes[0] != ADDRESS_PREFIX {
        return Err(LedgerError::InvalidInput(format!("bad TRON address {}", address)));
    }
    Ok(hex::encode(&bytes[1..]))
}

/// 20-byte hex to base58check address
pub fn hex_to_tron(hex20: &str) -> LedgerResult<String> {
    let digits = hex20.trim_start_matches("0x");
    let digits = digits.strip_prefix("41").filter(|d| d.len() == 40).unwrap_or(digits);
    let body = hex::decode(digits).map_err(|e| LedgerError::Serialization(format!("bad address hex {}: {}", hex20, e)))?;
    if body.len() != 20 {
        return Err(LedgerError::Serialization(format!("bad address hex {}", hex20)));
    }
    let mut bytes = Vec::with_capacity(21);
    bytes.push(ADDRESS_PREFIX);
    bytes.extend_from_slice(&body);
    Ok(bs58::encode(bytes).with_check().into_string())
}

#[derive(Debug, Deserialize)]
struct NowBlock {
    block_header: BlockHeader,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    raw_data: BlockRaw,
}

#[derive(Debug, Deserialize)]
struct BlockRaw {
    #[serde(default)]
    number: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    block_number: Option<u64>,
    #[serde(default)]
    block_time_stamp: Option<i64>,
    #[serde(default)]
    receipt: Option<InfoReceipt>,
    #[serde(default)]
    log: Vec<EventLog>,
}

#[derive(Debug, Deserialize)]
struct InfoReceipt {
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventLog {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawTransaction {
    #[serde(rename = "txID", default)]
    tx_id: Option<String>,
    #[serde(default)]
    raw_data: Option<RawData>,
}

#[derive(Debug, Deserialize)]
struct RawData {
    #[serde(default)]
    contract: Vec<Contract>,
}

#[derive(Debug, Deserialize)]
struct Contract {
    parameter: ContractParameter,
}

#[derive(Debug, Deserialize)]
struct ContractParameter {
    value: ContractValue,
}

#[derive(Debug, Deserialize)]
struct ContractValue {
    #[serde(default)]
    owner_address: Option<String>,
    #[serde(default)]
    contract_address: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryPage {
    #[serde(default)]
    data: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    transaction_id: String,
    from: String,
    to: String,
    value: String,
    block_timestamp: i64,
}

/// TronGrid client for one TRC20 token
pub struct TronClient {
    client: Client,
    config: NetworkConfig,
    /// Token contract as 20-byte hex, for matching event logs
    contract_hex: String,
}

impl TronClient {
    pub fn new(config: NetworkConfig) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LedgerError::RpcConnection(e.to_string()))?;
        let contract_hex = tron_to_hex(&config.token_contract)
            .map_err(|e| LedgerError::Configuration(format!("TRC20 token contract: {}", e)))?;

        Ok(Self {
            client,
            config,
            contract_hex,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.rpc_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("TRON-PRO-API-KEY", key),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder, path: &str) -> LedgerResult<T> {
        debug!("TRC20 API call: {}", path);
        let response = self.authorize(builder).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::RpcResponse {
                code: status.as_u16() as i64,
                message: body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| LedgerError::RpcConnection(e.to_string()))
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> LedgerResult<T> {
        let builder = self.client.post(self.url(path)).json(&body);
        self.send(builder, path).await
    }

    /// Current block number
    pub async fn block_number(&self) -> LedgerResult<u64> {
        let block: NowBlock = self.post("/wallet/getnowblock", serde_json::json!({})).await?;
        Ok(block.block_header.raw_data.number)
    }

    fn token_transfer_log<'a>(&self, logs: &'a [EventLog]) -> Option<&'a EventLog> {
        logs.iter().find(|l| {
            l.address.trim_start_matches("41").eq_ignore_ascii_case(&self.contract_hex)
                && l.topics.len() >= 3
                && l.topics[0].trim_start_matches("0x").eq_ignore_ascii_case(TRANSFER_TOPIC)
        })
    }

    /// Decode a transaction's trigger data as a token transfer
    async fn transfer_from_call(
        &self,
        tx_hash: &str,
        status: TransferStatus,
        block: u64,
        confirmations: u32,
        timestamp: Timestamp,
    ) -> LedgerResult<Option<ChainTransfer>> {
        let tx: RawTransaction = self
            .post("/wallet/gettransactionbyid", serde_json::json!({ "value": tx_hash }))
            .await?;
        if tx.tx_id.is_none() {
            return Ok(None);
        }
        let value = match tx.raw_data.and_then(|raw| raw.contract.into_iter().next()) {
            Some(contract) => contract.parameter.value,
            None => return Ok(None),
        };
        let targets_token = value
            .contract_address
            .as_deref()
            .map(|c| c.trim_start_matches("41").eq_ignore_ascii_case(&self.contract_hex))
            .unwrap_or(false);
        if !targets_token {
            return Ok(None);
        }
        let (to_word, amount_word) = match value.data.as_deref().and_then(decode_transfer_call) {
            Some(decoded) => decoded,
            None => return Ok(None),
        };
        let from = match value.owner_address.as_deref() {
            Some(owner) => hex_to_tron(owner)?,
            None => String::new(),
        };
        Ok(Some(ChainTransfer {
            tx_hash: tx_hash.to_string(),
            network: Network::Trc20,
            from,
            to: hex_to_tron(&word_to_address(&to_word))?,
            amount: raw_to_amount(&amount_word, Network::Trc20.token_decimals())?,
            block_number: block,
            confirmations,
            status,
            timestamp,
        }))
    }

    /// Token transfer carried by `tx_hash`
    pub async fn fetch_transfer(&self, tx_hash: &str) -> LedgerResult<Option<ChainTransfer>> {
        let info: TransactionInfo = self
            .post("/wallet/gettransactioninfobyid", serde_json::json!({ "value": tx_hash }))
            .await?;

        // Unknown or not yet in a block
        if info.id.is_none() {
            return self
                .transfer_from_call(tx_hash, TransferStatus::Pending, 0, 0, Utc::now())
                .await;
        }

        let block = info.block_number.unwrap_or(0);
        let head = self.block_number().await?;
        let depth = confirmations(head, block);
        let timestamp = info
            .block_time_stamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        let succeeded = info
            .receipt
            .as_ref()
            .and_then(|r| r.result.as_deref())
            .map(|r| r == "SUCCESS")
            .unwrap_or(false);
        if !succeeded {
            return self
                .transfer_from_call(tx_hash, TransferStatus::Failed, block, depth, timestamp)
                .await;
        }

        let log = match self.token_transfer_log(&info.log) {
            Some(log) => log,
            None => {
                debug!(tx_hash, "Transaction carries no token transfer");
                return Ok(None);
            }
        };

        Ok(Some(ChainTransfer {
            tx_hash: tx_hash.to_string(),
            network: Network::Trc20,
            from: hex_to_tron(&word_to_address(&log.topics[1]))?,
            to: hex_to_tron(&word_to_address(&log.topics[2]))?,
            amount: raw_to_amount(&log.data, Network::Trc20.token_decimals())?,
            block_number: block,
            confirmations: depth,
            status: TransferStatus::Confirmed,
            timestamp,
        }))
    }

    /// Token transfers received by `address` at or after `since`
    pub async fn transfers_to(&self, address: &str, since: Timestamp) -> LedgerResult<Vec<ChainTransfer>> {
        let path = format!("/v1/accounts/{}/transactions/trc20", address);
        let builder = self.client.get(self.url(&path)).query(&[
            ("only_to", "true".to_string()),
            ("only_confirmed", "false".to_string()),
            ("limit", HISTORY_LIMIT.to_string()),
            ("contract_address", self.config.token_contract.clone()),
            ("min_timestamp", since.timestamp_millis().to_string()),
        ]);
        let page: HistoryPage = self.send(builder, &path).await?;

        let mut transfers = Vec::with_capacity(page.data.len());
        for entry in page.data {
            // The history index lags the node; fall back to its own view
            match self.fetch_transfer(&entry.transaction_id).await {
                Ok(Some(transfer)) => transfers.push(transfer),
                Ok(None) | Err(_) => {
                    let raw: i128 = match entry.value.parse() {
                        Ok(raw) => raw,
                        Err(_) => {
                            warn!(tx_hash = %entry.transaction_id, value = %entry.value, "Unparseable TRC20 amount");
                            continue;
                        }
                    };
                    transfers.push(ChainTransfer {
                        tx_hash: entry.transaction_id,
                        network: Network::Trc20,
                        from: entry.from,
                        to: entry.to,
                        amount: Decimal::try_from_i128_with_scale(raw, Network::Trc20.token_decimals())?.normalize(),
                        block_number: 0,
                        confirmations: 0,
                        status: TransferStatus::Pending,
                        timestamp: Utc
                            .timestamp_millis_opt(entry.block_timestamp)
                            .single()
                            .unwrap_or_else(Utc::now),
                    });
                }
            }
        }
        debug!(address, count = transfers.len(), "TRC20 transfers found");
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";
    const USDT_HEX: &str = "a614f803b6fd780986a42c78ec9c7f77e6ded13c";

    #[test]
    fn test_address_conversion() {
        assert_eq!(tron_to_hex(USDT).unwrap(), USDT_HEX);
        assert_eq!(hex_to_tron(USDT_HEX).unwrap(), USDT);
        assert_eq!(hex_to_tron(&format!("41{}", USDT_HEX)).unwrap(), USDT);
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(tron_to_hex("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6u").is_err());
        assert!(tron_to_hex("not-an-address").is_err());
    }

    #[test]
    fn test_matches_token_log() {
        let client = TronClient::new(NetworkConfig::defaults(Network::Trc20)).unwrap();
        let info: TransactionInfo = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "blockNumber": 100,
            "blockTimeStamp": 1_700_000_000_000i64,
            "receipt": { "result": "SUCCESS" },
            "log": [{
                "address": USDT_HEX,
                "topics": [
                    TRANSFER_TOPIC,
                    format!("{:0>64}", "1111111111111111111111111111111111111111"),
                    format!("{:0>64}", USDT_HEX)
                ],
                "data": format!("{:0>64}", "5f5e100")
            }]
        }))
        .unwrap();
        let log = client.token_transfer_log(&info.log).unwrap();
        assert_eq!(hex_to_tron(&word_to_address(&log.topics[2])).unwrap(), USDT);
        assert_eq!(raw_to_amount(&log.data, 6).unwrap(), Decimal::from(100));
    }
}
