//! Allocation state machine
//!
//! `ACTIVE --hold--> ON_HOLD --sell--> SOLD`, with `ON_HOLD --release/expire-->
//! ACTIVE`. Every transition is one conditional statement or one transaction
//! in the item store; nothing here holds a lock across awaits.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AllocationConfig;
use crate::core::{
    same_address, AllocationError, Buyer, ChainClient, Clock, Collectible, Collection,
    EligibilityError, Hold, Launch, LaunchItem, LaunchStore, MetadataUploader, MintingModel,
    PipelineError, PipelineResult, Purchase, Reconciliation, SaleRecord,
};
use crate::domain::{evaluate, ActivePhase, PhaseEvaluator};

/// A held item and the phase it was reserved under
#[derive(Debug, Clone)]
pub struct Reservation {
    pub item: LaunchItem,
    pub collectible: Collectible,
    pub collection: Collection,
    pub buyer: Buyer,
    pub phase: ActivePhase,
}

/// Terms of a sale being finalized
#[derive(Debug, Clone)]
pub struct SaleTerms {
    pub buyer_address: String,
    pub order_id: Option<Uuid>,
    /// Phase the sale counts against
    pub phase: Option<ActivePhase>,
    /// Re-check the phase wallet limit inside the sale transaction
    pub enforce_limit: bool,
    pub price: Decimal,
    pub tx_hash: Option<String>,
}

/// Chain state of a held item before the backend mints it
#[derive(Debug, Clone, PartialEq)]
pub enum PremintOutcome {
    NotMinted,
    /// A prior attempt already minted to the buyer
    MintedToHolder,
    /// Minted to custody, only the transfer remains
    MintedToCustody,
    /// Minted to someone else; the buyer now holds a fresh on-demand item
    Reassigned {
        item: LaunchItem,
        collectible: Collectible,
    },
    /// Minted to someone else and the launch has no supply left to offer
    Lost { owner: String },
}

pub struct Allocator<S: LaunchStore, C: ChainClient> {
    store: Arc<S>,
    chain: Arc<C>,
    uploader: Arc<dyn MetadataUploader>,
    clock: Arc<dyn Clock>,
    phases: PhaseEvaluator<S>,
    config: AllocationConfig,
    custody_address: String,
}

impl<S: LaunchStore, C: ChainClient> Allocator<S, C> {
    pub fn new(
        store: Arc<S>,
        chain: Arc<C>,
        uploader: Arc<dyn MetadataUploader>,
        clock: Arc<dyn Clock>,
        config: AllocationConfig,
        custody_address: impl Into<String>,
    ) -> Self {
        Self {
            phases: PhaseEvaluator::new(store.clone()),
            store,
            chain,
            uploader,
            clock,
            config,
            custody_address: custody_address.into().to_ascii_lowercase(),
        }
    }

    pub fn config(&self) -> &AllocationConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.staleness_window()
    }

    async fn load_buyer(&self, buyer_id: Uuid) -> PipelineResult<Buyer> {
        let buyer = self
            .store
            .get_buyer(buyer_id)
            .await?
            .ok_or(AllocationError::BuyerNotFound(buyer_id))?;
        if !buyer.is_active {
            return Err(EligibilityError::BuyerInactive(buyer_id).into());
        }
        Ok(buyer)
    }

    async fn load_collection(&self, collection_id: Uuid) -> PipelineResult<Collection> {
        self.store
            .get_collection(collection_id)
            .await?
            .ok_or_else(|| PipelineError::Consistency(format!("collection {} missing", collection_id)))
    }

    async fn load_collectible(&self, collectible_id: Uuid) -> PipelineResult<Collectible> {
        self.store
            .get_collectible(collectible_id)
            .await?
            .ok_or_else(|| PipelineError::Consistency(format!("collectible {} missing", collectible_id)))
    }

    /// Hold one unsold item of `launch_id` for `buyer_id`.
    ///
    /// Fails with `ReservationConflict` when another buyer won the race for
    /// the picked item; the caller retries with a fresh selection.
    pub async fn reserve(&self, launch_id: Uuid, buyer_id: Uuid) -> PipelineResult<Reservation> {
        let now = self.clock.now();
        let launch = self
            .store
            .get_launch(launch_id)
            .await?
            .ok_or(AllocationError::LaunchNotFound(launch_id))?;
        let buyer = self.load_buyer(buyer_id).await?;
        let phase = self
            .phases
            .evaluate_for(&launch, &buyer.wallet_address, now)
            .await?;
        let collection = self.load_collection(launch.collection_id).await?;

        let stale_before = self.stale_before(now);
        let candidate = self.store.pick_reservable_item(launch_id, stale_before).await?;

        let Some(candidate) = candidate else {
            if !launch.unlimited_supply {
                return Err(AllocationError::NoAvailableItem { launch_id }.into());
            }
            self.phases
                .check_limit(launch_id, &phase, buyer_id, &buyer.wallet_address)
                .await?;
            let hold = Hold {
                holder_id: buyer_id,
                since: now,
                until: now + self.config.hold_ttl(),
            };
            let (item, collectible) = self
                .create_on_demand(&collection, launch_id, &hold, None)
                .await?;
            info!(
                launch_id = %launch_id,
                buyer_id = %buyer_id,
                item_id = %item.id,
                nft_id = collectible.nft_id,
                "Reserved on-demand item"
            );
            return Ok(Reservation {
                item,
                collectible,
                collection,
                buyer,
                phase,
            });
        };

        self.phases
            .check_limit(launch_id, &phase, buyer_id, &buyer.wallet_address)
            .await?;

        let hold = Hold {
            holder_id: buyer_id,
            since: now,
            until: now + self.config.hold_ttl(),
        };
        let item = self
            .store
            .try_hold(candidate.id, &hold, stale_before)
            .await?
            .ok_or_else(|| {
                warn!(launch_id = %launch_id, item_id = %candidate.id, "Lost reservation race");
                AllocationError::ReservationConflict {
                    item_id: candidate.id,
                }
            })?;
        let collectible = self.load_collectible(item.collectible_id).await?;

        info!(
            launch_id = %launch_id,
            buyer_id = %buyer_id,
            item_id = %item.id,
            phase = %phase.kind,
            "Reserved item"
        );
        Ok(Reservation {
            item,
            collectible,
            collection,
            buyer,
            phase,
        })
    }

    /// Create a held collectible/item pair with the next numeric id and
    /// upload its metadata. Upload failure leaves `cid` empty.
    async fn create_on_demand(
        &self,
        collection: &Collection,
        launch_id: Uuid,
        hold: &Hold,
        order_id: Option<Uuid>,
    ) -> PipelineResult<(LaunchItem, Collectible)> {
        let (item, mut collectible) = self
            .store
            .create_on_demand_item(launch_id, hold, order_id)
            .await?;

        let metadata = render_metadata(collection, collectible.nft_id);
        let bytes = serde_json::to_vec(&metadata)?;
        match self.uploader.upload(bytes, "application/json").await {
            Ok(uri) => {
                self.store.set_collectible_cid(collectible.id, &uri).await?;
                debug!(collectible_id = %collectible.id, uri = %uri, "Uploaded metadata");
                collectible.cid = Some(uri);
            }
            Err(e) => warn!(
                collectible_id = %collectible.id,
                error = %e,
                "Metadata upload failed, continuing without cid"
            ),
        }

        Ok((item, collectible))
    }

    /// Turn the buyer's hold into a sale
    pub async fn finalize(
        &self,
        item_id: Uuid,
        holder_id: Uuid,
        terms: SaleTerms,
    ) -> PipelineResult<Purchase> {
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
        let collection = self.load_collection(launch.collection_id).await?;

        let sale = SaleRecord {
            item_id,
            holder_id,
            buyer_address: terms.buyer_address.to_ascii_lowercase(),
            contract_address: collection.contract_address.clone(),
            order_id: terms.order_id,
            phase: terms.phase.as_ref().map(|phase| phase.kind),
            price: terms.price,
            tx_hash: terms.tx_hash,
            limit: terms
                .phase
                .as_ref()
                .filter(|_| terms.enforce_limit)
                .and_then(ActivePhase::limit),
            sold_at: self.clock.now(),
        };

        let purchase = self.store.finalize_sale(&sale).await?;
        info!(
            item_id = %item_id,
            buyer_id = %holder_id,
            purchase_id = %purchase.id,
            "Finalized sale"
        );
        Ok(purchase)
    }

    /// Phase a sale counts against: the one active when the item was
    /// reserved, or the current one when nothing was active back then
    pub fn sale_phase(
        &self,
        launch: &Launch,
        reserved_at: Option<DateTime<Utc>>,
    ) -> PipelineResult<ActivePhase> {
        if let Some(phase) = reserved_at.and_then(|at| evaluate(launch, at).ok()) {
            return Ok(phase);
        }
        Ok(evaluate(launch, self.clock.now())?)
    }

    /// Wallet-limit check outside any hold, for callers that re-validate
    /// a reservation before acting on it
    pub async fn check_limit(
        &self,
        launch_id: Uuid,
        phase: &ActivePhase,
        buyer_id: Uuid,
        buyer_address: &str,
    ) -> PipelineResult<()> {
        self.phases
            .check_limit(launch_id, phase, buyer_id, buyer_address)
            .await
    }

    /// Return an item to the pool. With a holder the release only applies
    /// while that holder still owns the hold.
    pub async fn release(&self, item_id: Uuid, holder_id: Option<Uuid>) -> PipelineResult<bool> {
        let released = self.store.release_hold(item_id, holder_id).await?;
        if released {
            debug!(item_id = %item_id, "Released hold");
        }
        Ok(released)
    }

    pub async fn extend_hold(
        &self,
        item_id: Uuid,
        holder_id: Uuid,
        ttl: chrono::Duration,
    ) -> PipelineResult<bool> {
        let until = self.clock.now() + ttl;
        self.store.extend_hold(item_id, holder_id, until).await
    }

    /// Compare the chain's owner of the held item with local state.
    ///
    /// When the buyer is moved to a fresh item, `order_id` is pointed at it
    /// in the same transaction that creates the item.
    pub async fn premint_check(
        &self,
        item_id: Uuid,
        holder_id: Uuid,
        order_id: Option<Uuid>,
    ) -> PipelineResult<PremintOutcome> {
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
        let collection = self.load_collection(launch.collection_id).await?;
        let collectible = self.load_collectible(item.collectible_id).await?;
        let buyer = self
            .store
            .get_buyer(holder_id)
            .await?
            .ok_or(AllocationError::BuyerNotFound(holder_id))?;

        let Some(owner) = self
            .chain
            .owner_of(&collection.contract_address, collectible.nft_id)
            .await?
        else {
            return Ok(PremintOutcome::NotMinted);
        };

        if same_address(&owner, &buyer.wallet_address) {
            info!(item_id = %item_id, nft_id = collectible.nft_id, "Token already minted to holder");
            return Ok(PremintOutcome::MintedToHolder);
        }
        if collection.minting_model == MintingModel::BackendCustodial
            && same_address(&owner, &self.custody_address)
        {
            info!(item_id = %item_id, nft_id = collectible.nft_id, "Token already minted to custody");
            return Ok(PremintOutcome::MintedToCustody);
        }

        warn!(
            item_id = %item_id,
            nft_id = collectible.nft_id,
            owner = %owner,
            "Token minted outside the pipeline, reconciling"
        );
        self.store
            .reconcile_minted(&Reconciliation {
                item_id,
                owner_address: owner.clone(),
                contract_address: collection.contract_address.clone(),
                reconciled_at: self.clock.now(),
            })
            .await?;

        if !launch.unlimited_supply {
            return Ok(PremintOutcome::Lost { owner });
        }

        let now = self.clock.now();
        let hold = Hold {
            holder_id,
            since: now,
            until: now + self.config.queued_hold_ttl(),
        };
        let (item, collectible) = self
            .create_on_demand(&collection, launch.id, &hold, order_id)
            .await?;
        info!(
            old_item_id = %item_id,
            item_id = %item.id,
            nft_id = collectible.nft_id,
            "Reassigned buyer to a fresh item"
        );
        Ok(PremintOutcome::Reassigned { item, collectible })
    }
}

/// Render token metadata from the collection template.
///
/// String values may use `{nft_id}` and `{collection}` placeholders. Without
/// a template the metadata is just a name.
pub fn render_metadata(collection: &Collection, nft_id: i64) -> Value {
    match &collection.metadata_template {
        Some(template) => substitute(template, &collection.name, nft_id),
        None => json!({ "name": format!("{} #{}", collection.name, nft_id) }),
    }
}

fn substitute(value: &Value, collection_name: &str, nft_id: i64) -> Value {
    match value {
        Value::String(text) => Value::String(
            text.replace("{nft_id}", &nft_id.to_string())
                .replace("{collection}", collection_name),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, collection_name, nft_id))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), substitute(item, collection_name, nft_id)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection(template: Option<Value>) -> Collection {
        Collection {
            id: Uuid::new_v4(),
            name: "Genesis".to_string(),
            contract_address: "0x00000000000000000000000000000000000000c0".to_string(),
            minting_model: MintingModel::BackendDirect,
            last_nft_id: 0,
            metadata_template: template,
        }
    }

    #[test]
    fn test_default_metadata() {
        let metadata = render_metadata(&collection(None), 12);
        assert_eq!(metadata, json!({ "name": "Genesis #12" }));
    }

    #[test]
    fn test_template_placeholders() {
        let template = json!({
            "name": "{collection} #{nft_id}",
            "attributes": [{ "trait_type": "edition", "value": "{nft_id}" }],
            "royalty": 5
        });
        let metadata = render_metadata(&collection(Some(template)), 3);
        assert_eq!(metadata["name"], "Genesis #3");
        assert_eq!(metadata["attributes"][0]["value"], "3");
        assert_eq!(metadata["royalty"], 5);
    }
}
