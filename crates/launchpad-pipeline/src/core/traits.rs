//! Core trait abstractions (Ports in Hexagonal Architecture)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::error::PipelineResult;
use super::types::*;

/// Item store port - transactional persistence of the allocation state
///
/// Every mutating method is a single atomic unit: either a single conditional
/// statement or one database transaction. Implementations must never split a
/// conditional update into a read followed by a write.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Round-trip to the backing store
    async fn health_check(&self) -> PipelineResult<()> {
        Ok(())
    }

    /// Release pooled connections
    async fn close(&self) {}

    async fn get_launch(&self, launch_id: Uuid) -> PipelineResult<Option<Launch>>;

    async fn get_collection(&self, collection_id: Uuid) -> PipelineResult<Option<Collection>>;

    async fn get_buyer(&self, buyer_id: Uuid) -> PipelineResult<Option<Buyer>>;

    async fn get_item(&self, item_id: Uuid) -> PipelineResult<Option<LaunchItem>>;

    async fn get_collectible(&self, collectible_id: Uuid) -> PipelineResult<Option<Collectible>>;

    /// Pick one reservable item uniformly at random
    async fn pick_reservable_item(
        &self,
        launch_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> PipelineResult<Option<LaunchItem>>;

    /// Compare-and-set hold: succeeds only if the item is still ACTIVE or its
    /// hold expired before `stale_before`. `None` means the race was lost.
    async fn try_hold(
        &self,
        item_id: Uuid,
        hold: &Hold,
        stale_before: DateTime<Utc>,
    ) -> PipelineResult<Option<LaunchItem>>;

    /// Move the expiry of a hold owned by `holder_id`
    async fn extend_hold(
        &self,
        item_id: Uuid,
        holder_id: Uuid,
        hold_until: DateTime<Utc>,
    ) -> PipelineResult<bool>;

    /// Clear the hold, optionally conditioned on the current holder
    async fn release_hold(&self, item_id: Uuid, holder_id: Option<Uuid>) -> PipelineResult<bool>;

    /// Create a collectible and launch item already under `hold`, taking the
    /// next numeric id from the collection counter in the same transaction.
    /// With `order_id` the order is pointed at the new item in that
    /// transaction as well.
    async fn create_on_demand_item(
        &self,
        launch_id: Uuid,
        hold: &Hold,
        order_id: Option<Uuid>,
    ) -> PipelineResult<(LaunchItem, Collectible)>;

    async fn set_collectible_cid(&self, collectible_id: Uuid, cid: &str) -> PipelineResult<()>;

    /// Count purchases of a launch inside `[from, to)` by buyer id or address
    async fn count_purchases(
        &self,
        launch_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        buyer_id: Uuid,
        buyer_address: &str,
    ) -> PipelineResult<u32>;

    /// Mark item SOLD, collectible CONFIRMED, insert the purchase and complete
    /// the order in one transaction.
    async fn finalize_sale(&self, sale: &SaleRecord) -> PipelineResult<Purchase>;

    /// Record a chain-side mint the database missed, in one transaction
    async fn reconcile_minted(&self, reconciliation: &Reconciliation) -> PipelineResult<()>;

    async fn purchases_for_item(&self, item_id: Uuid) -> PipelineResult<Vec<Purchase>>;

    async fn insert_order(&self, order: &Order) -> PipelineResult<()>;

    async fn get_order(&self, order_id: Uuid) -> PipelineResult<Option<Order>>;

    /// Conditional status transition; false when the order was not in `from`
    async fn transition_order(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> PipelineResult<bool>;

    async fn record_failed_mint(&self, failed: &FailedMint) -> PipelineResult<()>;
}

/// Whitelist membership keyed by (launch, address, phase)
#[async_trait]
pub trait WhitelistLookup: Send + Sync {
    async fn is_eligible(
        &self,
        launch_id: Uuid,
        phase: PhaseKind,
        address: &str,
    ) -> PipelineResult<bool>;
}

/// Combined persistence capability used by the allocation services
pub trait LaunchStore: ItemStore + WhitelistLookup {}

impl<T: ItemStore + WhitelistLookup> LaunchStore for T {}

/// Chain client port
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn estimate_gas(&self, tx: &TxRequest) -> PipelineResult<u64>;

    async fn get_transaction_receipt(&self, tx_hash: &str) -> PipelineResult<Option<TxReceipt>>;

    /// Pending transaction count of `address`
    async fn get_transaction_count(&self, address: &str) -> PipelineResult<u64>;

    async fn get_block_number(&self) -> PipelineResult<u64>;

    /// Submit a transaction for the node-managed signing identity, returning its hash
    async fn send_transaction(&self, tx: &TxRequest) -> PipelineResult<String>;

    /// Current owner of an ERC-721 token, `None` when it was never minted
    async fn owner_of(&self, contract: &str, token_id: i64) -> PipelineResult<Option<String>>;
}

/// A message delivered from the durable queue
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub receipt_handle: String,
    /// Includes the current delivery
    pub receive_count: u32,
    pub body: String,
}

/// Durable at-least-once work queue port
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, body: &str) -> PipelineResult<()>;

    /// Receive up to `max_messages`, hiding them for `visibility_timeout` and
    /// waiting at most `wait_time` for work to arrive.
    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
        wait_time: Duration,
    ) -> PipelineResult<Vec<ReceivedMessage>>;

    async fn delete(&self, receipt_handle: &str) -> PipelineResult<()>;
}

/// Cache port - abstraction for caching operations
#[async_trait]
pub trait CachePort: Send + Sync {
    /// Get a value from cache
    async fn get<T>(&self, key: &str) -> PipelineResult<Option<T>>
    where
        T: DeserializeOwned + Send;

    /// Set a value in cache with TTL
    async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> PipelineResult<()>
    where
        T: Serialize + Send + Sync;

    /// Delete a key from cache
    async fn delete(&self, key: &str) -> PipelineResult<()>;

    /// Check if cache is healthy
    async fn health_check(&self) -> PipelineResult<()>;
}

/// Lock primitives of the distributed cache
#[async_trait]
pub trait LockStore: Send + Sync {
    /// `SET key value NX` with expiry; true when the key was created
    async fn set_if_not_exists(&self, key: &str, value: &str, ttl: Duration) -> PipelineResult<bool>;

    /// Delete `key` only while it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> PipelineResult<bool>;

    /// Reset the expiry of `key` only while it still holds `expected`
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
        -> PipelineResult<bool>;
}

/// Content/metadata upload port
#[async_trait]
pub trait MetadataUploader: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> PipelineResult<String>;
}

/// Authorized mint prepared for one (item, buyer, price, phase) tuple
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedMint {
    pub unsigned_tx: UnsignedTx,
    /// Hex-encoded backend approval over the tuple
    pub signature: String,
}

/// Signature/transaction builder port
pub trait MintAuthorizer: Send + Sync {
    fn prepare(
        &self,
        collection: &Collection,
        collectible: &Collectible,
        buyer_address: &str,
        price: rust_decimal::Decimal,
        phase: PhaseKind,
    ) -> PipelineResult<PreparedMint>;

    /// Calldata minting `token_id` to `recipient`
    fn mint_calldata(&self, recipient: &str, token_id: i64) -> PipelineResult<String>;

    /// Calldata transferring `token_id` from `from` to `to`
    fn transfer_calldata(&self, from: &str, to: &str, token_id: i64) -> PipelineResult<String>;
}

/// Time source
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
