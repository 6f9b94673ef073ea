//! Exposed launchpad operations
//!
//! Thin orchestration over the allocator, the confirmation service, the work
//! queue and the mint authorizer.

use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::allocator::{Allocator, Reservation, SaleTerms};
use super::confirmation::{ConfirmationService, ExpectedOperation};
use crate::core::{
    AllocationError, CachePort, ChainClient, ConfirmationState, EligibilityError, ErrorKind,
    LaunchStore, MintAuthorizer, NetworkError, Order, OrderStatus, PipelineError, PipelineResult,
    PreparedMint, Purchase, TxStatus, ValidationError, WorkQueue,
};
use crate::domain::{MintRequest, WorkMessage};
use crate::metrics::PipelineMetrics;

/// A held item plus the transaction the buyer signs to mint it
#[derive(Debug, Clone)]
pub struct ReservedMint {
    pub reservation: Reservation,
    pub prepared: PreparedMint,
}

pub struct Launchpad<S, C, K>
where
    S: LaunchStore,
    C: ChainClient,
    K: CachePort,
{
    store: Arc<S>,
    allocator: Arc<Allocator<S, C>>,
    confirmations: Arc<ConfirmationService<C, K>>,
    queue: Arc<dyn WorkQueue>,
    authorizer: Arc<dyn MintAuthorizer>,
    metrics: Arc<PipelineMetrics>,
}

impl<S, C, K> Launchpad<S, C, K>
where
    S: LaunchStore,
    C: ChainClient,
    K: CachePort,
{
    pub fn new(
        store: Arc<S>,
        allocator: Arc<Allocator<S, C>>,
        confirmations: Arc<ConfirmationService<C, K>>,
        queue: Arc<dyn WorkQueue>,
        authorizer: Arc<dyn MintAuthorizer>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            allocator,
            confirmations,
            queue,
            authorizer,
            metrics,
        }
    }

    /// Hold an item for the buyer and build the mint transaction they sign.
    ///
    /// Lost races are retried with a fresh selection up to `reserve_retries`.
    pub async fn reserve(&self, launch_id: Uuid, buyer_id: Uuid) -> PipelineResult<ReservedMint> {
        let attempts = self.allocator.config().reserve_retries.max(1);
        let mut attempt = 0;
        let reservation = loop {
            attempt += 1;
            match self.allocator.reserve(launch_id, buyer_id).await {
                Ok(reservation) => break reservation,
                Err(e) if e.kind() == ErrorKind::Conflict && attempt < attempts => {
                    self.metrics.reservation("conflict");
                    warn!(launch_id = %launch_id, buyer_id = %buyer_id, attempt, "Retrying reservation");
                }
                Err(e) => {
                    self.metrics.reservation(e.kind().to_string().as_str());
                    return Err(e);
                }
            }
        };

        let prepared = match self.authorizer.prepare(
            &reservation.collection,
            &reservation.collectible,
            &reservation.buyer.wallet_address,
            reservation.phase.price,
            reservation.phase.kind,
        ) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(item_id = %reservation.item.id, error = %e, "Mint authorization failed");
                self.allocator
                    .release(reservation.item.id, Some(buyer_id))
                    .await?;
                return Err(e);
            }
        };

        self.metrics.reservation("success");
        Ok(ReservedMint {
            reservation,
            prepared,
        })
    }

    /// Finalize a buyer-signed mint once its transaction is final and emits
    /// exactly the authorized Transfer.
    pub async fn finalize(
        &self,
        item_id: Uuid,
        buyer_id: Uuid,
        proof_tx_hash: &str,
    ) -> PipelineResult<Purchase> {
        let mut status = self.confirmations.get_status(proof_tx_hash).await?;
        if status.status == ConfirmationState::Pending {
            status = self.confirmations.refresh_status(proof_tx_hash).await?;
        }
        match status.status {
            ConfirmationState::Confirmed => {}
            ConfirmationState::Pending => {
                return Err(NetworkError::NotFinal(proof_tx_hash.to_string()).into())
            }
            ConfirmationState::Failed => {
                return Err(ValidationError::TransactionFailed(proof_tx_hash.to_string()).into())
            }
        }

        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or(AllocationError::ItemNotFound(item_id))?;
        let launch = self
            .store
            .get_launch(item.launch_id)
            .await?
            .ok_or(AllocationError::LaunchNotFound(item.launch_id))?;
        let collection = self
            .store
            .get_collection(launch.collection_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Consistency(format!("collection {} missing", launch.collection_id))
            })?;
        let collectible = self
            .store
            .get_collectible(item.collectible_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Consistency(format!("collectible {} missing", item.collectible_id))
            })?;
        let buyer = self
            .store
            .get_buyer(buyer_id)
            .await?
            .ok_or(AllocationError::BuyerNotFound(buyer_id))?;

        self.confirmations
            .validate_operation(
                proof_tx_hash,
                &ExpectedOperation::Mint {
                    contract: collection.contract_address.clone(),
                    recipient: buyer.wallet_address.clone(),
                    token_ids: vec![collectible.nft_id],
                },
            )
            .await?;

        // Priced and limited by the phase the hold was placed in, even when
        // that window closed while the transaction was confirming
        let phase = self.allocator.sale_phase(&launch, item.on_hold_since)?;

        let purchase = self
            .allocator
            .finalize(
                item_id,
                buyer_id,
                SaleTerms {
                    buyer_address: buyer.wallet_address,
                    order_id: None,
                    price: phase.price,
                    phase: Some(phase),
                    enforce_limit: true,
                    tx_hash: Some(proof_tx_hash.to_string()),
                },
            )
            .await?;
        Ok(purchase)
    }

    /// Queue a backend mint for a held item, returning the message id
    pub async fn enqueue_mint(&self, order: &Order) -> PipelineResult<Uuid> {
        let collection = self
            .store
            .get_collection(order.collection_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Consistency(format!("collection {} missing", order.collection_id))
            })?;
        if !collection.minting_model.is_backend_minted() {
            return Err(ValidationError::Mismatch {
                field: "minting model",
                expected: "backend minted".to_string(),
                found: collection.minting_model.to_string(),
            }
            .into());
        }

        let item = self
            .store
            .get_item(order.launch_item_id)
            .await?
            .ok_or(AllocationError::ItemNotFound(order.launch_item_id))?;
        if !item.is_held_by(order.buyer_id) {
            return Err(AllocationError::NotHeldByYou { item_id: item.id }.into());
        }
        let buyer = self
            .store
            .get_buyer(order.buyer_id)
            .await?
            .ok_or(AllocationError::BuyerNotFound(order.buyer_id))?;
        if !buyer.is_active {
            return Err(EligibilityError::BuyerInactive(buyer.id).into());
        }
        let collectible = self
            .store
            .get_collectible(item.collectible_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Consistency(format!("collectible {} missing", item.collectible_id))
            })?;

        let current = match self.store.get_order(order.id).await? {
            Some(existing) => existing,
            None => {
                let mut fresh = order.clone();
                fresh.status = OrderStatus::Pending;
                self.store.insert_order(&fresh).await?;
                fresh
            }
        };
        if !self
            .store
            .transition_order(order.id, &[OrderStatus::Pending], OrderStatus::InQueue)
            .await?
        {
            return Err(AllocationError::InvalidOrderTransition {
                order_id: order.id,
                from: current.status.to_string(),
                to: OrderStatus::InQueue.to_string(),
            }
            .into());
        }

        self.allocator
            .extend_hold(item.id, order.buyer_id, self.allocator.config().queued_hold_ttl())
            .await?;

        let request = MintRequest {
            message_id: Uuid::new_v4(),
            order_id: order.id,
            buyer_id: order.buyer_id,
            buyer_address: buyer.wallet_address.to_ascii_lowercase(),
            launch_id: order.launch_id,
            collection_id: collection.id,
            launch_item_id: item.id,
            collectible_id: collectible.id,
            nft_id: collectible.nft_id,
            contract_address: collection.contract_address.to_ascii_lowercase(),
            price: order.funding_amount,
        };
        let message_id = request.message_id;
        let message = WorkMessage::for_model(collection.minting_model, request).ok_or_else(|| {
            ValidationError::Mismatch {
                field: "minting model",
                expected: "backend minted".to_string(),
                found: collection.minting_model.to_string(),
            }
        })?;

        if let Err(e) = self.queue.send(&message.to_json()?).await {
            error!(order_id = %order.id, error = %e, "Failed to enqueue mint, reverting order");
            self.store
                .transition_order(order.id, &[OrderStatus::InQueue], OrderStatus::Pending)
                .await?;
            return Err(e);
        }

        info!(
            order_id = %order.id,
            message_id = %message_id,
            operation = message.operation(),
            "Enqueued mint"
        );
        Ok(message_id)
    }

    pub async fn get_confirmation_status(&self, tx_hash: &str) -> PipelineResult<TxStatus> {
        self.confirmations.get_status(tx_hash).await
    }

    /// Give up a hold the buyer owns
    pub async fn release(&self, item_id: Uuid, buyer_id: Uuid) -> PipelineResult<()> {
        if !self.allocator.release(item_id, Some(buyer_id)).await? {
            return Err(AllocationError::NotHeldByYou { item_id }.into());
        }
        info!(item_id = %item_id, buyer_id = %buyer_id, "Buyer released hold");
        Ok(())
    }
}
