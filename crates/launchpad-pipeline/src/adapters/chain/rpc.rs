//! JSON-RPC chain client
//!
//! Implements only the methods the pipeline needs. Transactions are
//! submitted with `eth_sendTransaction`, so the node holds the signing key of
//! the minter identity and the pipeline only chooses the nonce.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::abi;
use crate::core::{
    ChainClient, LogEntry, NetworkError, PipelineError, PipelineResult, TxReceipt, TxRequest,
    ValidationError,
};

/// `ownerOf(uint256)`
const OWNER_OF_SELECTOR: &str = "0x6352211e";

/// JSON-RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: String,
    topics: Vec<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RawLog>,
}

pub struct RpcChainClient {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
    request_id: AtomicU64,
}

impl RpcChainClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> PipelineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let url = url.into();
        info!(url = %url, "Chain RPC client configured");

        Ok(Self {
            url,
            http,
            timeout,
            request_id: AtomicU64::new(1),
        })
    }

    /// Make a JSON-RPC call, returning the raw `result`
    async fn call(&self, method: &str, params: Value) -> PipelineResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });

        debug!(method, id, "RPC call");

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response: RpcResponse = response.json().await.map_err(|e| self.transport_error(e))?;

        if let Some(error) = response.error {
            return Err(NetworkError::Rpc {
                code: error.code,
                message: error.message,
            }
            .into());
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    fn transport_error(&self, err: reqwest::Error) -> PipelineError {
        if err.is_timeout() {
            NetworkError::Timeout(self.timeout).into()
        } else {
            NetworkError::ConnectionFailed(err.to_string()).into()
        }
    }

    fn tx_object(tx: &TxRequest) -> Value {
        let mut object = json!({
            "from": tx.from,
            "to": tx.to,
            "data": tx.data,
            "value": format!("0x{:x}", tx.value_wei),
        });
        if let Some(nonce) = tx.nonce {
            object["nonce"] = Value::String(quantity(nonce));
        }
        if let Some(gas) = tx.gas {
            object["gas"] = Value::String(quantity(gas));
        }
        object
    }
}

fn quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

fn parse_quantity(value: &Value) -> PipelineResult<u64> {
    let text = value
        .as_str()
        .ok_or_else(|| PipelineError::Serialization(format!("expected hex quantity, got {}", value)))?;
    u64::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|e| PipelineError::Serialization(format!("bad quantity {}: {}", text, e)))
}

fn is_revert(err: &PipelineError) -> bool {
    match err {
        PipelineError::Network(NetworkError::Rpc { code, message }) => {
            *code == 3 || message.to_ascii_lowercase().contains("revert")
        }
        _ => false,
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn estimate_gas(&self, tx: &TxRequest) -> PipelineResult<u64> {
        let result = self.call("eth_estimateGas", json!([Self::tx_object(tx)])).await?;
        parse_quantity(&result)
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> PipelineResult<Option<TxReceipt>> {
        let result = self.call("eth_getTransactionReceipt", json!([tx_hash])).await?;
        if result.is_null() {
            return Ok(None);
        }

        let raw: RawReceipt = serde_json::from_value(result)?;
        // Some nodes return a receipt shell before the block is sealed
        let Some(block) = raw.block_number else {
            return Ok(None);
        };

        Ok(Some(TxReceipt {
            transaction_hash: raw.transaction_hash,
            block_number: parse_quantity(&Value::String(block))?,
            success: raw.status.as_deref() == Some("0x1"),
            logs: raw
                .logs
                .into_iter()
                .map(|log| LogEntry {
                    address: log.address.to_ascii_lowercase(),
                    topics: log.topics.into_iter().map(|t| t.to_ascii_lowercase()).collect(),
                    data: log.data,
                })
                .collect(),
        }))
    }

    async fn get_transaction_count(&self, address: &str) -> PipelineResult<u64> {
        let result = self
            .call("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_quantity(&result)
    }

    async fn get_block_number(&self) -> PipelineResult<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    async fn send_transaction(&self, tx: &TxRequest) -> PipelineResult<String> {
        let result = self
            .call("eth_sendTransaction", json!([Self::tx_object(tx)]))
            .await?;
        result
            .as_str()
            .map(|hash| hash.to_ascii_lowercase())
            .ok_or_else(|| PipelineError::Serialization(format!("unexpected tx hash {}", result)))
    }

    async fn owner_of(&self, contract: &str, token_id: i64) -> PipelineResult<Option<String>> {
        if token_id < 0 {
            return Err(ValidationError::Mismatch {
                field: "token id",
                expected: "non-negative".to_string(),
                found: token_id.to_string(),
            }
            .into());
        }
        let data = abi::encode_call(OWNER_OF_SELECTOR, &[abi::encode_uint(token_id as u128)]);
        let result = self
            .call("eth_call", json!([{ "to": contract, "data": data }, "latest"]))
            .await;

        match result {
            // ERC-721 reverts ownerOf for tokens that do not exist
            Err(err) if is_revert(&err) => Ok(None),
            Err(err) => Err(err),
            Ok(value) => {
                let word = value.as_str().unwrap_or("0x");
                if word.len() <= 2 {
                    return Ok(None);
                }
                let owner = abi::decode_address(word)?;
                if owner == abi::ZERO_ADDRESS {
                    Ok(None)
                } else {
                    Ok(Some(owner))
                }
            }
        }
    }
}
