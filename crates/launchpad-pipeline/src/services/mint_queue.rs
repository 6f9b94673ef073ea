//! Mint queue processor
//!
//! Drains the durable work queue one message at a time under the global mint
//! lock. The lock covers nonce assignment and broadcast only; confirmation is
//! awaited after the lock is released and the processed marker keeps
//! redeliveries from minting twice.

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::allocator::{Allocator, PremintOutcome, SaleTerms};
use super::confirmation::{ConfirmationService, ExpectedOperation};
use super::lock::{DistributedLock, LockToken};
use super::nonce::NonceManager;
use crate::config::{PipelineConfig, QueueConfig, WorkerConfig};
use crate::core::{
    same_address, AllocationError, CachePort, ChainClient, ConfirmationState, EligibilityError,
    FailedMint, ItemStatus, LaunchStore, LockStore, MintAuthorizer, OrderStatus, PipelineError,
    PipelineResult, ReceivedMessage, StorageError, TxRequest, ValidationError, WorkQueue,
};
use crate::domain::message::peek_message_id;
use crate::domain::WorkMessage;
use crate::metrics::PipelineMetrics;

/// Cache key marking a message as fully committed
pub fn processed_key(message_id: Uuid) -> String {
    format!("launchpad:mint:processed:{}", message_id)
}

/// What happened to a received message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Minted {
        item_id: Uuid,
        tx_hashes: Vec<String>,
    },
    /// Already committed earlier; the message was dropped
    Duplicate,
    /// Transient failure, left for redelivery after the visibility timeout
    Retrying { attempt: u32, reason: String },
    /// Recorded as a failed mint and removed from the queue
    DeadLettered { reason: String },
}

/// Result of one pass of the worker loop
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// Another worker holds the mint lock
    LockBusy,
    Idle,
    Processed(MessageOutcome),
}

/// Collaborators of the processor
pub struct MintQueueDeps<S: LaunchStore, C: ChainClient, K: CachePort + LockStore> {
    pub store: Arc<S>,
    pub chain: Arc<C>,
    pub cache: Arc<K>,
    pub queue: Arc<dyn WorkQueue>,
    pub authorizer: Arc<dyn MintAuthorizer>,
    pub allocator: Arc<Allocator<S, C>>,
    pub confirmations: Arc<ConfirmationService<C, K>>,
    pub metrics: Arc<PipelineMetrics>,
}

#[derive(Debug, Clone)]
pub struct MintQueueSettings {
    pub worker_id: String,
    pub minter_address: String,
    pub custody_address: String,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
}

impl MintQueueSettings {
    pub fn from_config(config: &PipelineConfig, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            minter_address: config.chain.minter_address.to_ascii_lowercase(),
            custody_address: config.chain.custody().to_ascii_lowercase(),
            queue: config.queue.clone(),
            worker: config.worker.clone(),
        }
    }
}

/// A chain call in a mint plan
#[derive(Debug, Clone)]
struct PlannedCall {
    step: &'static str,
    /// Address expected to receive the minted token, for mint steps
    mint_recipient: Option<String>,
    data: String,
}

/// Chain work left for one message after the pre-mint check
struct MintPlan {
    item_id: Uuid,
    nft_id: i64,
    contract: String,
    calls: Vec<PlannedCall>,
}

pub struct MintQueueProcessor<S: LaunchStore, C: ChainClient, K: CachePort + LockStore> {
    store: Arc<S>,
    chain: Arc<C>,
    cache: Arc<K>,
    queue: Arc<dyn WorkQueue>,
    authorizer: Arc<dyn MintAuthorizer>,
    allocator: Arc<Allocator<S, C>>,
    confirmations: Arc<ConfirmationService<C, K>>,
    metrics: Arc<PipelineMetrics>,
    lock: DistributedLock<K>,
    nonces: NonceManager<C>,
    settings: MintQueueSettings,
}

impl<S, C, K> MintQueueProcessor<S, C, K>
where
    S: LaunchStore,
    C: ChainClient,
    K: CachePort + LockStore,
{
    pub fn new(deps: MintQueueDeps<S, C, K>, settings: MintQueueSettings) -> Self {
        let lock = DistributedLock::new(
            deps.cache.clone(),
            settings.worker.lock_key.clone(),
            Duration::from_secs(settings.worker.lock_ttl_secs),
        );
        Self {
            nonces: NonceManager::new(deps.chain.clone()),
            lock,
            store: deps.store,
            chain: deps.chain,
            cache: deps.cache,
            queue: deps.queue,
            authorizer: deps.authorizer,
            allocator: deps.allocator,
            confirmations: deps.confirmations,
            metrics: deps.metrics,
            settings,
        }
    }

    /// Run until `shutdown` is cancelled; the loop only stops between messages
    pub async fn run(&self, shutdown: CancellationToken) -> PipelineResult<()> {
        info!(worker_id = %self.settings.worker_id, "Mint queue processor started");
        let backoff = Duration::from_millis(self.settings.worker.lock_backoff_ms);
        let poll = Duration::from_millis(self.settings.queue.poll_interval_ms);

        while !shutdown.is_cancelled() {
            let pause = match self.tick().await {
                Ok(Tick::Processed(outcome)) => {
                    debug!(?outcome, "Processed message");
                    None
                }
                Ok(Tick::Idle) => Some(poll),
                Ok(Tick::LockBusy) => Some(backoff),
                Err(e) => {
                    error!(error = %e, "Mint queue tick failed");
                    Some(backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(worker_id = %self.settings.worker_id, "Mint queue processor stopped");
        Ok(())
    }

    /// Take the lock, handle at most one message, give the lock back
    pub async fn tick(&self) -> PipelineResult<Tick> {
        let Some(token) = self.lock.acquire(&self.settings.worker_id).await? else {
            return Ok(Tick::LockBusy);
        };
        self.metrics.set_lock_held(true);
        // Another worker may have submitted since our last lease
        self.nonces.mark_stale().await;

        let mut lease = Some(token);
        let result = self.tick_locked(&mut lease).await;

        if let Some(token) = lease.take() {
            if let Err(e) = self.lock.release(token).await {
                warn!(error = %e, "Failed to release mint lock");
            }
        }
        self.metrics.set_lock_held(false);
        result
    }

    async fn tick_locked(&self, lease: &mut Option<LockToken>) -> PipelineResult<Tick> {
        let messages = self
            .queue
            .receive(
                1,
                Duration::from_secs(self.settings.queue.visibility_timeout_secs),
                Duration::from_secs(self.settings.queue.wait_time_secs),
            )
            .await?;
        let Some(message) = messages.into_iter().next() else {
            return Ok(Tick::Idle);
        };

        let outcome = self.handle(&message, lease).await?;
        let label = match &outcome {
            MessageOutcome::Minted { .. } => "minted",
            MessageOutcome::Duplicate => "duplicate",
            MessageOutcome::Retrying { .. } => "retrying",
            MessageOutcome::DeadLettered { .. } => "dead_lettered",
        };
        self.metrics.queue_message(label);
        Ok(Tick::Processed(outcome))
    }

    async fn handle(
        &self,
        message: &ReceivedMessage,
        lease: &mut Option<LockToken>,
    ) -> PipelineResult<MessageOutcome> {
        let parsed = match WorkMessage::parse(&message.body) {
            Ok(parsed) => parsed,
            Err(e) => return self.dead_letter(message, None, &e.into()).await,
        };

        let started = Instant::now();
        match self.process(&parsed, message, lease).await {
            Ok(outcome) => {
                if matches!(outcome, MessageOutcome::Minted { .. }) {
                    self.metrics
                        .observe_mint(parsed.operation(), started.elapsed().as_secs_f64());
                }
                Ok(outcome)
            }
            Err(e) if e.is_retryable() && message.receive_count < self.settings.queue.max_attempts => {
                warn!(
                    message_id = %parsed.message_id(),
                    attempt = message.receive_count,
                    max_attempts = self.settings.queue.max_attempts,
                    error = %e,
                    "Mint attempt failed, leaving message for redelivery"
                );
                Ok(MessageOutcome::Retrying {
                    attempt: message.receive_count,
                    reason: e.to_string(),
                })
            }
            Err(e) => self.dead_letter(message, Some(&parsed), &e).await,
        }
    }

    async fn process(
        &self,
        message: &WorkMessage,
        received: &ReceivedMessage,
        lease: &mut Option<LockToken>,
    ) -> PipelineResult<MessageOutcome> {
        let request = message.request();
        let marker = processed_key(request.message_id);

        if self.cache.get::<String>(&marker).await?.is_some() {
            info!(message_id = %request.message_id, "Message already processed, dropping");
            self.queue.delete(&received.receipt_handle).await?;
            return Ok(MessageOutcome::Duplicate);
        }

        // Business preconditions. The order tracks the item currently held
        // for this message, which differs from the message after a
        // reassignment.
        let order = self
            .store
            .get_order(request.order_id)
            .await?
            .ok_or(AllocationError::OrderNotFound(request.order_id))?;

        if order.status == OrderStatus::Failed {
            return Err(AllocationError::InvalidOrderTransition {
                order_id: order.id,
                from: OrderStatus::Failed.to_string(),
                to: OrderStatus::Done.to_string(),
            }
            .into());
        }
        if order.status == OrderStatus::Done {
            return self.commit_duplicate(request.message_id, received).await;
        }

        let item = self
            .store
            .get_item(order.launch_item_id)
            .await?
            .ok_or(AllocationError::ItemNotFound(order.launch_item_id))?;
        let reassigned = item.id != request.launch_item_id;

        if item.status == ItemStatus::Sold {
            let sold_to_buyer = self
                .store
                .purchases_for_item(item.id)
                .await?
                .iter()
                .any(|purchase| purchase.buyer_id == Some(request.buyer_id));
            if sold_to_buyer {
                return self.commit_duplicate(request.message_id, received).await;
            }
            return Err(AllocationError::AlreadySold { item_id: item.id }.into());
        }
        if !item.is_held_by(request.buyer_id) {
            return Err(AllocationError::NotHeldByYou { item_id: item.id }.into());
        }

        let buyer = self
            .store
            .get_buyer(request.buyer_id)
            .await?
            .ok_or(AllocationError::BuyerNotFound(request.buyer_id))?;
        if !buyer.is_active {
            return Err(EligibilityError::BuyerInactive(buyer.id).into());
        }
        if !same_address(&buyer.wallet_address, &request.buyer_address) {
            return Err(mismatch("buyer address", &buyer.wallet_address, &request.buyer_address).into());
        }
        if !reassigned && item.collectible_id != request.collectible_id {
            return Err(mismatch("collectible", item.collectible_id, request.collectible_id).into());
        }

        let launch = self
            .store
            .get_launch(item.launch_id)
            .await?
            .ok_or(AllocationError::LaunchNotFound(item.launch_id))?;
        if launch.id != request.launch_id {
            return Err(mismatch("launch", launch.id, request.launch_id).into());
        }
        let collection = self
            .store
            .get_collection(launch.collection_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Consistency(format!("collection {} missing", launch.collection_id))
            })?;
        if !same_address(&collection.contract_address, &request.contract_address) {
            return Err(mismatch(
                "contract",
                &collection.contract_address,
                &request.contract_address,
            )
            .into());
        }

        let phase = self
            .allocator
            .sale_phase(&launch, Some(order.created_at))
            .ok();
        if let Some(phase) = &phase {
            self.allocator
                .check_limit(launch.id, phase, buyer.id, &buyer.wallet_address)
                .await?;
        }

        let plan = self
            .plan(message, item.id, &collection.contract_address, order.id)
            .await?;

        let tx_hashes = self.submit(&plan, lease).await?;
        self.await_finality(message, &plan, &tx_hashes).await?;

        let purchase = self
            .allocator
            .finalize(
                plan.item_id,
                buyer.id,
                SaleTerms {
                    buyer_address: buyer.wallet_address.clone(),
                    order_id: Some(order.id),
                    phase,
                    enforce_limit: false,
                    price: request.price,
                    tx_hash: tx_hashes.last().cloned(),
                },
            )
            .await?;

        self.cache
            .set(
                &marker,
                &order.id.to_string(),
                Duration::from_secs(self.settings.worker.processed_marker_ttl_secs),
            )
            .await?;
        self.queue.delete(&received.receipt_handle).await?;

        info!(
            message_id = %request.message_id,
            order_id = %order.id,
            purchase_id = %purchase.id,
            nft_id = plan.nft_id,
            "Mint committed"
        );
        Ok(MessageOutcome::Minted {
            item_id: plan.item_id,
            tx_hashes,
        })
    }

    /// Decide which chain calls are still needed for this message
    async fn plan(
        &self,
        message: &WorkMessage,
        item_id: Uuid,
        contract: &str,
        order_id: Uuid,
    ) -> PipelineResult<MintPlan> {
        let request = message.request();
        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or(AllocationError::ItemNotFound(item_id))?;
        let held_nft_id = self
            .store
            .get_collectible(item.collectible_id)
            .await?
            .map(|collectible| collectible.nft_id)
            .ok_or_else(|| {
                PipelineError::Consistency(format!("collectible {} missing", item.collectible_id))
            })?;

        let (item_id, nft_id, outcome) = match self
            .allocator
            .premint_check(item_id, request.buyer_id, Some(order_id))
            .await?
        {
            PremintOutcome::Reassigned { item, collectible } => {
                (item.id, collectible.nft_id, PremintOutcome::NotMinted)
            }
            PremintOutcome::Lost { owner } => {
                return Err(PipelineError::Consistency(format!(
                    "token {} of {} is owned by {}",
                    held_nft_id, contract, owner
                )))
            }
            other => (item_id, held_nft_id, other),
        };

        let buyer = request.buyer_address.as_str();
        let custody = self.settings.custody_address.as_str();
        let mint = |recipient: &str| -> PipelineResult<PlannedCall> {
            Ok(PlannedCall {
                step: "mint",
                mint_recipient: Some(recipient.to_string()),
                data: self.authorizer.mint_calldata(recipient, nft_id)?,
            })
        };
        let transfer = || -> PipelineResult<PlannedCall> {
            Ok(PlannedCall {
                step: "transfer",
                mint_recipient: None,
                data: self.authorizer.transfer_calldata(custody, buyer, nft_id)?,
            })
        };

        let calls = match (outcome, message.is_custodial()) {
            (PremintOutcome::NotMinted, false) => vec![mint(buyer)?],
            (PremintOutcome::NotMinted, true) => vec![mint(custody)?, transfer()?],
            (PremintOutcome::MintedToCustody, _) => vec![transfer()?],
            _ => Vec::new(),
        };

        debug!(
            message_id = %request.message_id,
            item_id = %item_id,
            nft_id,
            steps = calls.len(),
            "Planned mint"
        );
        Ok(MintPlan {
            item_id,
            nft_id,
            contract: contract.to_ascii_lowercase(),
            calls,
        })
    }

    /// Broadcast the plan under the lock, then hand the lock back
    async fn submit(
        &self,
        plan: &MintPlan,
        lease: &mut Option<LockToken>,
    ) -> PipelineResult<Vec<String>> {
        if plan.calls.is_empty() {
            return Ok(Vec::new());
        }

        let token = lease
            .as_ref()
            .ok_or_else(|| StorageError::Cache("mint lock not held".to_string()))?;
        if !self.lock.refresh(token).await? {
            lease.take();
            return Err(StorageError::Cache("mint lock lease lost before broadcast".to_string()).into());
        }

        let minter = self.settings.minter_address.as_str();
        let mut hashes = Vec::with_capacity(plan.calls.len());

        for (index, call) in plan.calls.iter().enumerate() {
            let nonce = self.nonces.reserve(minter).await?;
            let mut tx = TxRequest {
                from: minter.to_string(),
                to: plan.contract.clone(),
                data: call.data.clone(),
                value_wei: 0,
                nonce: Some(nonce),
                gas: None,
            };

            // Later steps depend on earlier ones, which are not mined yet
            if index == 0 {
                match self.chain.estimate_gas(&tx).await {
                    Ok(gas) => tx.gas = Some(gas.saturating_add(gas / 5)),
                    Err(e) => {
                        self.nonces.fail(minter, nonce).await;
                        return Err(e);
                    }
                }
            }

            match self.chain.send_transaction(&tx).await {
                Ok(hash) => {
                    self.nonces.commit(minter, nonce).await;
                    self.metrics.chain_submission(call.step, "accepted");
                    info!(step = call.step, nonce, tx_hash = %hash, "Broadcast transaction");
                    hashes.push(hash);
                }
                Err(e) => {
                    self.nonces.fail(minter, nonce).await;
                    self.metrics.chain_submission(call.step, "failed");
                    warn!(step = call.step, nonce, error = %e, "Broadcast failed");
                    return Err(e);
                }
            }
        }

        if let Some(token) = lease.take() {
            if let Err(e) = self.lock.release(token).await {
                warn!(error = %e, "Failed to release mint lock after broadcast");
            }
            self.metrics.set_lock_held(false);
        }
        Ok(hashes)
    }

    async fn await_finality(
        &self,
        message: &WorkMessage,
        plan: &MintPlan,
        tx_hashes: &[String],
    ) -> PipelineResult<()> {
        let request = message.request();
        let timeout = Duration::from_secs(self.settings.worker.receipt_timeout_secs);
        let poll = Duration::from_millis(self.settings.worker.receipt_poll_interval_ms);

        for (call, hash) in plan.calls.iter().zip(tx_hashes) {
            let status = self.confirmations.wait_for_finality(hash, timeout, poll).await?;
            if status.status == ConfirmationState::Failed {
                return Err(ValidationError::TransactionFailed(hash.clone()).into());
            }
            if let Some(recipient) = &call.mint_recipient {
                self.confirmations
                    .validate_operation(
                        hash,
                        &ExpectedOperation::Mint {
                            contract: plan.contract.clone(),
                            recipient: recipient.clone(),
                            token_ids: vec![plan.nft_id],
                        },
                    )
                    .await?;
            }
        }

        if message.is_custodial() {
            let owner = self
                .chain
                .owner_of(&plan.contract, plan.nft_id)
                .await?;
            if !owner.as_deref().is_some_and(|o| same_address(o, &request.buyer_address)) {
                return Err(PipelineError::Consistency(format!(
                    "token {} ended with owner {:?} instead of the buyer",
                    plan.nft_id, owner
                )));
            }
        }
        Ok(())
    }

    async fn commit_duplicate(
        &self,
        message_id: Uuid,
        received: &ReceivedMessage,
    ) -> PipelineResult<MessageOutcome> {
        info!(message_id = %message_id, "Sale already committed, marking message processed");
        self.cache
            .set(
                &processed_key(message_id),
                &message_id.to_string(),
                Duration::from_secs(self.settings.worker.processed_marker_ttl_secs),
            )
            .await?;
        self.queue.delete(&received.receipt_handle).await?;
        Ok(MessageOutcome::Duplicate)
    }

    /// Record the failure, return the item to the pool, fail the order and
    /// drop the message
    async fn dead_letter(
        &self,
        received: &ReceivedMessage,
        message: Option<&WorkMessage>,
        err: &PipelineError,
    ) -> PipelineResult<MessageOutcome> {
        let request = message.map(WorkMessage::request);
        // After a reassignment the order points at the item actually held
        let order = match request {
            Some(request) => self.store.get_order(request.order_id).await?,
            None => None,
        };
        let held_item_id = order
            .as_ref()
            .map(|order| order.launch_item_id)
            .or_else(|| request.map(|r| r.launch_item_id));
        error!(
            message_id = ?request.map(|r| r.message_id),
            attempts = received.receive_count,
            kind = %err.kind(),
            error = %err,
            "Dead-lettering mint message"
        );

        let failed = FailedMint {
            id: Uuid::new_v4(),
            message_id: request
                .map(|r| r.message_id)
                .or_else(|| peek_message_id(&received.body))
                .unwrap_or_else(Uuid::nil),
            order_id: request.map(|r| r.order_id),
            buyer_id: request.map(|r| r.buyer_id),
            launch_item_id: held_item_id,
            attempts: received.receive_count,
            error_kind: err.kind().to_string(),
            reason: err.to_string(),
            payload: serde_json::from_str(&received.body)
                .unwrap_or_else(|_| Value::String(received.body.clone())),
            failed_at: self.allocator.now(),
        };
        self.store.record_failed_mint(&failed).await?;

        if let Some(request) = request {
            if let Some(item_id) = held_item_id {
                self.allocator.release(item_id, Some(request.buyer_id)).await?;
            }
            if held_item_id != Some(request.launch_item_id) {
                self.allocator
                    .release(request.launch_item_id, Some(request.buyer_id))
                    .await?;
            }
            self.store
                .transition_order(
                    request.order_id,
                    &[OrderStatus::Pending, OrderStatus::InQueue],
                    OrderStatus::Failed,
                )
                .await?;
        }
        self.queue.delete(&received.receipt_handle).await?;

        Ok(MessageOutcome::DeadLettered {
            reason: err.to_string(),
        })
    }
}

fn mismatch(field: &'static str, expected: impl ToString, found: impl ToString) -> ValidationError {
    ValidationError::Mismatch {
        field,
        expected: expected.to_string(),
        found: found.to_string(),
    }
}
