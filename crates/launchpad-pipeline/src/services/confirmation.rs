//! Transaction confirmation service
//!
//! Tri-state status of a transaction hash with a confirmation-depth threshold
//! and asymmetric cache TTLs, plus receipt validation against the operation a
//! transaction was authorized for.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::adapters::chain::abi::{self, ZERO_ADDRESS};
use crate::config::{ChainConfig, ConfirmationConfig};
use crate::core::{
    same_address, CachePort, ChainClient, ConfirmationState, LogEntry, NetworkError,
    PipelineResult, TxReceipt, TxStatus, ValidationError,
};

/// Event signatures the validator matches receipts against
#[derive(Debug, Clone)]
pub struct EventTopics {
    pub transfer: String,
    pub sale: Option<String>,
    pub cancel: Option<String>,
}

impl EventTopics {
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            transfer: config.transfer_topic.to_ascii_lowercase(),
            sale: config.sale_topic.as_ref().map(|t| t.to_ascii_lowercase()),
            cancel: config.cancel_topic.as_ref().map(|t| t.to_ascii_lowercase()),
        }
    }
}

/// The on-chain effect a transaction is expected to have
#[derive(Debug, Clone, PartialEq)]
pub enum ExpectedOperation {
    /// ERC-721 `Transfer(0x0, recipient, id)` for each id
    Mint {
        contract: String,
        recipient: String,
        token_ids: Vec<i64>,
    },
    /// Marketplace `ItemSold(seller, buyer, tokenId, price)`
    Sale {
        marketplace: String,
        seller: String,
        buyer: String,
        token_id: i64,
        price_wei: u128,
    },
    /// Marketplace `ListingCancelled(seller, tokenId)`
    Cancellation {
        marketplace: String,
        seller: String,
        token_id: i64,
    },
}

pub struct ConfirmationService<C: ChainClient, K: CachePort> {
    chain: Arc<C>,
    cache: Arc<K>,
    config: ConfirmationConfig,
    topics: EventTopics,
}

fn cache_key(tx_hash: &str) -> String {
    format!("launchpad:tx:{}", tx_hash.to_ascii_lowercase())
}

fn mismatch(field: &'static str, expected: impl ToString, found: impl ToString) -> ValidationError {
    ValidationError::Mismatch {
        field,
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

fn topic(log: &LogEntry, index: usize) -> Result<&str, ValidationError> {
    log.topics
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| ValidationError::MalformedLog(format!("missing topic {}", index)))
}

fn events<'a>(receipt: &'a TxReceipt, emitter: &str, signature: &str) -> Vec<&'a LogEntry> {
    receipt
        .logs
        .iter()
        .filter(|log| same_address(&log.address, emitter))
        .filter(|log| {
            log.topics
                .first()
                .map(|t| t.eq_ignore_ascii_case(signature))
                .unwrap_or(false)
        })
        .collect()
}

fn exactly_one<'a>(logs: Vec<&'a LogEntry>) -> Result<&'a LogEntry, ValidationError> {
    match logs.as_slice() {
        [log] => Ok(*log),
        other => Err(ValidationError::EventCount {
            expected: 1,
            found: other.len(),
        }),
    }
}

fn token_id_of(word: &str) -> Result<i64, ValidationError> {
    let value = abi::decode_uint(word)?;
    i64::try_from(value).map_err(|_| ValidationError::MalformedLog(format!("token id {} too large", value)))
}

impl<C: ChainClient, K: CachePort> ConfirmationService<C, K> {
    pub fn new(chain: Arc<C>, cache: Arc<K>, config: ConfirmationConfig, topics: EventTopics) -> Self {
        Self {
            chain,
            cache,
            config,
            topics,
        }
    }

    /// Cached status of `tx_hash`; a cache hit never touches the chain
    pub async fn get_status(&self, tx_hash: &str) -> PipelineResult<TxStatus> {
        let key = cache_key(tx_hash);
        match self.cache.get::<TxStatus>(&key).await {
            Ok(Some(status)) => {
                debug!(tx_hash, "Confirmation status served from cache");
                return Ok(status);
            }
            Ok(None) => {}
            Err(e) => warn!(tx_hash, error = %e, "Confirmation cache read failed"),
        }

        let status = self.fetch_status(tx_hash).await?;
        self.store(tx_hash, &status).await;
        Ok(status)
    }

    /// Status computed from the chain, bypassing the cache
    pub async fn fetch_status(&self, tx_hash: &str) -> PipelineResult<TxStatus> {
        let Some(receipt) = self.chain.get_transaction_receipt(tx_hash).await? else {
            return Ok(TxStatus::pending());
        };

        if !receipt.success {
            return Ok(TxStatus {
                status: ConfirmationState::Failed,
                block_number: Some(receipt.block_number),
                confirmations: None,
            });
        }

        let current = self.chain.get_block_number().await?;
        let confirmations = if current >= receipt.block_number {
            current - receipt.block_number + 1
        } else {
            0
        };
        let status = if confirmations >= self.config.required_confirmations {
            ConfirmationState::Confirmed
        } else {
            ConfirmationState::Pending
        };

        Ok(TxStatus {
            status,
            block_number: Some(receipt.block_number),
            confirmations: Some(confirmations),
        })
    }

    /// Recompute from the chain and overwrite the cached entry
    pub async fn refresh_status(&self, tx_hash: &str) -> PipelineResult<TxStatus> {
        let status = self.fetch_status(tx_hash).await?;
        self.store(tx_hash, &status).await;
        Ok(status)
    }

    async fn store(&self, tx_hash: &str, status: &TxStatus) {
        let ttl = match status.status {
            ConfirmationState::Confirmed => self.config.confirmed_ttl(),
            ConfirmationState::Pending | ConfirmationState::Failed => self.config.pending_ttl(),
        };
        if let Err(e) = self.cache.set(&cache_key(tx_hash), status, ttl).await {
            warn!(tx_hash, error = %e, "Confirmation cache write failed");
        }
    }

    /// Poll until the transaction is final or failed, or `timeout` elapses
    pub async fn wait_for_finality(
        &self,
        tx_hash: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> PipelineResult<TxStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.fetch_status(tx_hash).await?;
            if status.status != ConfirmationState::Pending {
                self.store(tx_hash, &status).await;
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(NetworkError::Timeout(timeout).into());
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Check that the receipt of `tx_hash` carries exactly the expected events
    pub async fn validate_operation(
        &self,
        tx_hash: &str,
        expected: &ExpectedOperation,
    ) -> PipelineResult<()> {
        let receipt = self
            .chain
            .get_transaction_receipt(tx_hash)
            .await?
            .ok_or_else(|| ValidationError::MissingReceipt(tx_hash.to_string()))?;
        if !receipt.success {
            return Err(ValidationError::TransactionFailed(tx_hash.to_string()).into());
        }

        match expected {
            ExpectedOperation::Mint {
                contract,
                recipient,
                token_ids,
            } => self.validate_mint(&receipt, contract, recipient, token_ids)?,
            ExpectedOperation::Sale {
                marketplace,
                seller,
                buyer,
                token_id,
                price_wei,
            } => self.validate_sale(&receipt, marketplace, seller, buyer, *token_id, *price_wei)?,
            ExpectedOperation::Cancellation {
                marketplace,
                seller,
                token_id,
            } => self.validate_cancellation(&receipt, marketplace, seller, *token_id)?,
        }
        Ok(())
    }

    fn validate_mint(
        &self,
        receipt: &TxReceipt,
        contract: &str,
        recipient: &str,
        token_ids: &[i64],
    ) -> Result<(), ValidationError> {
        let mut mints = Vec::new();
        for log in events(receipt, contract, &self.topics.transfer) {
            let from = abi::decode_address(topic(log, 1)?)?;
            if from == ZERO_ADDRESS {
                mints.push(log);
            }
        }
        if mints.len() != token_ids.len() {
            return Err(ValidationError::EventCount {
                expected: token_ids.len(),
                found: mints.len(),
            });
        }

        let mut minted = Vec::with_capacity(mints.len());
        for log in mints {
            let to = abi::decode_address(topic(log, 2)?)?;
            if !same_address(&to, recipient) {
                return Err(mismatch("recipient", recipient.to_ascii_lowercase(), to));
            }
            minted.push(token_id_of(topic(log, 3)?)?);
        }

        let mut expected = token_ids.to_vec();
        expected.sort_unstable();
        minted.sort_unstable();
        if minted != expected {
            return Err(mismatch("token ids", format!("{:?}", expected), format!("{:?}", minted)));
        }
        Ok(())
    }

    fn validate_sale(
        &self,
        receipt: &TxReceipt,
        marketplace: &str,
        seller: &str,
        buyer: &str,
        token_id: i64,
        price_wei: u128,
    ) -> Result<(), ValidationError> {
        let signature = self
            .topics
            .sale
            .as_deref()
            .ok_or(ValidationError::UnknownEvent("ItemSold"))?;
        let log = exactly_one(events(receipt, marketplace, signature))?;

        let logged_seller = abi::decode_address(topic(log, 1)?)?;
        if !same_address(&logged_seller, seller) {
            return Err(mismatch("seller", seller.to_ascii_lowercase(), logged_seller));
        }
        let logged_buyer = abi::decode_address(topic(log, 2)?)?;
        if !same_address(&logged_buyer, buyer) {
            return Err(mismatch("buyer", buyer.to_ascii_lowercase(), logged_buyer));
        }

        let words = abi::data_words(&log.data)?;
        let [token_word, price_word, ..] = words.as_slice() else {
            return Err(ValidationError::MalformedLog("sale data needs tokenId and price".to_string()));
        };
        let logged_token = token_id_of(token_word)?;
        if logged_token != token_id {
            return Err(mismatch("token id", token_id, logged_token));
        }
        let logged_price = abi::decode_uint(price_word)?;
        if logged_price != price_wei {
            return Err(mismatch("price", price_wei, logged_price));
        }
        Ok(())
    }

    fn validate_cancellation(
        &self,
        receipt: &TxReceipt,
        marketplace: &str,
        seller: &str,
        token_id: i64,
    ) -> Result<(), ValidationError> {
        let signature = self
            .topics
            .cancel
            .as_deref()
            .ok_or(ValidationError::UnknownEvent("ListingCancelled"))?;
        let log = exactly_one(events(receipt, marketplace, signature))?;

        let logged_seller = abi::decode_address(topic(log, 1)?)?;
        if !same_address(&logged_seller, seller) {
            return Err(mismatch("seller", seller.to_ascii_lowercase(), logged_seller));
        }
        let words = abi::data_words(&log.data)?;
        let token_word = words
            .first()
            .ok_or_else(|| ValidationError::MalformedLog("cancel data needs tokenId".to_string()))?;
        let logged_token = token_id_of(token_word)?;
        if logged_token != token_id {
            return Err(mismatch("token id", token_id, logged_token));
        }
        Ok(())
    }
}
