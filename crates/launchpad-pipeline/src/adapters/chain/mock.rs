//! In-process chain for local development and tests
//!
//! Understands the mint and transferFrom calldata produced by the calldata
//! builder, tracks ERC-721 ownership, per-account nonces and blocks, and
//! counts every call so tests can assert on chain traffic.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use super::abi::{self, ZERO_ADDRESS};
use crate::config::ERC721_TRANSFER_TOPIC;
use crate::core::{ChainClient, LogEntry, NetworkError, PipelineResult, TxReceipt, TxRequest};

const MINT_SELECTOR: &str = "0x40c10f19";
const TRANSFER_FROM_SELECTOR: &str = "0x23b872dd";

#[derive(Debug, Clone)]
pub enum SendFailure {
    /// Rejected by the node; the nonce is not consumed
    Rejected(String),
    /// Accepted by the node but the client timed out waiting for the answer
    AcceptedThenTimeout,
}

#[derive(Default)]
struct MockState {
    block_number: u64,
    auto_mine: bool,
    nonces: HashMap<String, u64>,
    owners: HashMap<(String, i64), String>,
    receipts: HashMap<String, TxReceipt>,
    sent: Vec<TxRequest>,
    send_failures: Vec<SendFailure>,
    revert_next: usize,
    calls: HashMap<&'static str, usize>,
}

pub struct MockChain {
    state: Mutex<MockState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                block_number: 100,
                ..MockState::default()
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn record(&self, method: &'static str) {
        self.with_state(|state| *state.calls.entry(method).or_default() += 1);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.with_state(|state| state.calls.get(method).copied().unwrap_or(0))
    }

    pub fn set_block_number(&self, block: u64) {
        self.with_state(|state| state.block_number = block);
    }

    pub fn advance_blocks(&self, blocks: u64) {
        self.with_state(|state| state.block_number += blocks);
    }

    /// Mine one block per `get_block_number` call
    pub fn set_auto_mine(&self, enabled: bool) {
        self.with_state(|state| state.auto_mine = enabled);
    }

    pub fn set_nonce(&self, address: &str, nonce: u64) {
        self.with_state(|state| {
            state.nonces.insert(address.to_ascii_lowercase(), nonce);
        });
    }

    pub fn set_owner(&self, contract: &str, token_id: i64, owner: &str) {
        self.with_state(|state| {
            state.owners.insert(
                (contract.to_ascii_lowercase(), token_id),
                owner.to_ascii_lowercase(),
            );
        });
    }

    pub fn insert_receipt(&self, receipt: TxReceipt) {
        self.with_state(|state| {
            state
                .receipts
                .insert(receipt.transaction_hash.to_ascii_lowercase(), receipt);
        });
    }

    /// Queue failures consumed by the next `send_transaction` calls
    pub fn fail_next_sends(&self, failures: Vec<SendFailure>) {
        self.with_state(|state| state.send_failures.extend(failures));
    }

    /// The next `count` accepted transactions revert
    pub fn revert_next(&self, count: usize) {
        self.with_state(|state| state.revert_next += count);
    }

    pub fn sent_transactions(&self) -> Vec<TxRequest> {
        self.with_state(|state| state.sent.clone())
    }

    pub fn owner(&self, contract: &str, token_id: i64) -> Option<String> {
        self.with_state(|state| {
            state
                .owners
                .get(&(contract.to_ascii_lowercase(), token_id))
                .cloned()
        })
    }

    fn tx_hash(tx: &TxRequest, nonce: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tx.from.to_ascii_lowercase().as_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(tx.to.to_ascii_lowercase().as_bytes());
        hasher.update(tx.data.as_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }

    fn transfer_log(contract: &str, from: &str, to: &str, token_id: i64) -> PipelineResult<LogEntry> {
        Ok(LogEntry {
            address: contract.to_string(),
            topics: vec![
                ERC721_TRANSFER_TOPIC.to_string(),
                format!("0x{}", abi::encode_address(from)?),
                format!("0x{}", abi::encode_address(to)?),
                format!("0x{}", abi::encode_uint(token_id as u128)),
            ],
            data: "0x".to_string(),
        })
    }

    /// Apply the token effects of a call, returning its logs
    fn execute(state: &mut MockState, tx: &TxRequest) -> PipelineResult<Vec<LogEntry>> {
        let contract = tx.to.to_ascii_lowercase();
        let (selector, words) = abi::decode_call(&tx.data)?;

        match selector.as_str() {
            MINT_SELECTOR if words.len() == 2 => {
                let recipient = abi::decode_address(&words[0])?;
                let token_id = abi::decode_uint(&words[1])? as i64;
                let key = (contract.clone(), token_id);
                if state.owners.contains_key(&key) {
                    return Err(NetworkError::Rpc {
                        code: 3,
                        message: format!("execution reverted: token {} already minted", token_id),
                    }
                    .into());
                }
                state.owners.insert(key, recipient.clone());
                Ok(vec![Self::transfer_log(&contract, ZERO_ADDRESS, &recipient, token_id)?])
            }
            TRANSFER_FROM_SELECTOR if words.len() == 3 => {
                let from = abi::decode_address(&words[0])?;
                let to = abi::decode_address(&words[1])?;
                let token_id = abi::decode_uint(&words[2])? as i64;
                let key = (contract.clone(), token_id);
                match state.owners.get(&key) {
                    Some(owner) if *owner == from => {
                        state.owners.insert(key, to.clone());
                        Ok(vec![Self::transfer_log(&contract, &from, &to, token_id)?])
                    }
                    _ => Err(NetworkError::Rpc {
                        code: 3,
                        message: format!("execution reverted: {} does not own {}", from, token_id),
                    }
                    .into()),
                }
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn estimate_gas(&self, _tx: &TxRequest) -> PipelineResult<u64> {
        self.record("estimate_gas");
        Ok(120_000)
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> PipelineResult<Option<TxReceipt>> {
        self.record("get_transaction_receipt");
        Ok(self.with_state(|state| state.receipts.get(&tx_hash.to_ascii_lowercase()).cloned()))
    }

    async fn get_transaction_count(&self, address: &str) -> PipelineResult<u64> {
        self.record("get_transaction_count");
        Ok(self.with_state(|state| {
            state
                .nonces
                .get(&address.to_ascii_lowercase())
                .copied()
                .unwrap_or(0)
        }))
    }

    async fn get_block_number(&self) -> PipelineResult<u64> {
        self.record("get_block_number");
        Ok(self.with_state(|state| {
            if state.auto_mine {
                state.block_number += 1;
            }
            state.block_number
        }))
    }

    async fn send_transaction(&self, tx: &TxRequest) -> PipelineResult<String> {
        self.record("send_transaction");
        self.with_state(|state| {
            let from = tx.from.to_ascii_lowercase();
            let expected = state.nonces.get(&from).copied().unwrap_or(0);
            let nonce = tx.nonce.unwrap_or(expected);

            let failure = if state.send_failures.is_empty() {
                None
            } else {
                Some(state.send_failures.remove(0))
            };
            if let Some(SendFailure::Rejected(message)) = &failure {
                return Err(NetworkError::Rpc {
                    code: -32000,
                    message: message.clone(),
                }
                .into());
            }

            if nonce != expected {
                let message = if nonce < expected { "nonce too low" } else { "nonce too high" };
                return Err(NetworkError::Rpc {
                    code: -32000,
                    message: format!("{}: expected {}, got {}", message, expected, nonce),
                }
                .into());
            }

            let hash = Self::tx_hash(tx, nonce);
            // A reverted transaction consumes its nonce but leaves token state untouched
            let (success, logs) = if state.revert_next > 0 {
                state.revert_next -= 1;
                (false, Vec::new())
            } else {
                (true, Self::execute(state, tx)?)
            };

            state.nonces.insert(from, nonce + 1);
            state.block_number += 1;
            let mut submitted = tx.clone();
            submitted.nonce = Some(nonce);
            state.sent.push(submitted);
            state.receipts.insert(
                hash.clone(),
                TxReceipt {
                    transaction_hash: hash.clone(),
                    block_number: state.block_number,
                    success,
                    logs,
                },
            );
            debug!(tx_hash = %hash, nonce, "Mock chain accepted transaction");

            match failure {
                Some(SendFailure::AcceptedThenTimeout) => {
                    Err(NetworkError::Timeout(std::time::Duration::from_secs(15)).into())
                }
                _ => Ok(hash),
            }
        })
    }

    async fn owner_of(&self, contract: &str, token_id: i64) -> PipelineResult<Option<String>> {
        self.record("owner_of");
        Ok(self.owner(contract, token_id))
    }
}
