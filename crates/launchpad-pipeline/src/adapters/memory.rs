//! In-memory adapters for local runs and tests
//!
//! Each store keeps its whole state behind one mutex, so every trait method
//! is atomic in the same way a single conditional statement or transaction
//! is atomic in the Postgres and Redis adapters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::core::{
    unique_idx, AllocationError, Buyer, CachePort, Collectible, CollectibleStatus, Collection,
    EligibilityError, FailedMint, Hold, ItemStatus, ItemStore, Launch, LaunchItem, LockStore,
    MetadataUploader, NetworkError, Order, OrderStatus, PhaseKind, PipelineError,
    PipelineResult, Purchase, ReceivedMessage, Reconciliation, SaleRecord, WhitelistLookup,
    WorkQueue, same_address,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Same predicate as the conditional hold in the Postgres store
fn reservable_before(item: &LaunchItem, stale_before: DateTime<Utc>) -> bool {
    item.is_reservable(stale_before, chrono::Duration::zero())
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<Uuid, Collection>,
    launches: HashMap<Uuid, Launch>,
    buyers: HashMap<Uuid, Buyer>,
    items: HashMap<Uuid, LaunchItem>,
    collectibles: HashMap<Uuid, Collectible>,
    orders: HashMap<Uuid, Order>,
    purchases: Vec<Purchase>,
    failed_mints: Vec<FailedMint>,
    whitelist: HashSet<(Uuid, PhaseKind, String)>,
}

impl StoreState {
    fn count_purchases(
        &self,
        launch_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        buyer_id: Uuid,
        buyer_address: &str,
    ) -> u32 {
        self.purchases
            .iter()
            .filter(|p| p.launch_id == launch_id)
            .filter(|p| from <= p.purchased_at && p.purchased_at < to)
            .filter(|p| p.buyer_id == Some(buyer_id) || same_address(&p.buyer_address, buyer_address))
            .count() as u32
    }

    /// Set CONFIRMED and the immutable unique index on a collectible
    fn confirm_collectible(&mut self, collectible_id: Uuid, contract: &str) -> PipelineResult<()> {
        let collectible = self
            .collectibles
            .get(&collectible_id)
            .ok_or_else(|| PipelineError::Consistency(format!("collectible {} missing", collectible_id)))?;
        let idx = unique_idx(contract, collectible.nft_id);

        if let Some(existing) = &collectible.unique_idx {
            if *existing != idx {
                return Err(PipelineError::Consistency(format!(
                    "collectible {} already indexed as {}",
                    collectible_id, existing
                )));
            }
        }
        let taken = self
            .collectibles
            .values()
            .any(|c| c.id != collectible_id && c.unique_idx.as_deref() == Some(idx.as_str()));
        if taken {
            return Err(PipelineError::Consistency(format!("unique index {} already used", idx)));
        }

        if let Some(collectible) = self.collectibles.get_mut(&collectible_id) {
            collectible.status = CollectibleStatus::Confirmed;
            collectible.unique_idx = Some(idx);
        }
        Ok(())
    }
}

/// Item store, whitelist and order book held in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_collection(&self, collection: Collection) {
        lock(&self.state).collections.insert(collection.id, collection);
    }

    pub fn insert_launch(&self, launch: Launch) {
        lock(&self.state).launches.insert(launch.id, launch);
    }

    pub fn insert_buyer(&self, buyer: Buyer) {
        lock(&self.state).buyers.insert(buyer.id, buyer);
    }

    pub fn set_buyer_active(&self, buyer_id: Uuid, active: bool) {
        if let Some(buyer) = lock(&self.state).buyers.get_mut(&buyer_id) {
            buyer.is_active = active;
        }
    }

    pub fn add_to_whitelist(&self, launch_id: Uuid, phase: PhaseKind, address: &str) {
        lock(&self.state)
            .whitelist
            .insert((launch_id, phase, address.to_ascii_lowercase()));
    }

    /// Seed an ACTIVE item backed by a fresh PENDING collectible
    pub fn seed_item(&self, launch_id: Uuid, nft_id: i64) -> PipelineResult<LaunchItem> {
        let mut state = lock(&self.state);
        let launch = state
            .launches
            .get(&launch_id)
            .ok_or(AllocationError::LaunchNotFound(launch_id))?;
        let now = Utc::now();

        let collectible = Collectible {
            id: Uuid::new_v4(),
            collection_id: launch.collection_id,
            nft_id,
            cid: None,
            status: CollectibleStatus::Pending,
            unique_idx: None,
            created_at: now,
        };
        let item = LaunchItem {
            id: Uuid::new_v4(),
            launch_id,
            collectible_id: collectible.id,
            status: ItemStatus::Active,
            on_hold_by: None,
            on_hold_since: None,
            on_hold_until: None,
            created_at: now,
            updated_at: now,
        };

        state.collectibles.insert(collectible.id, collectible);
        state.items.insert(item.id, item.clone());
        Ok(item)
    }

    /// Overwrite an item, e.g. to plant an expired hold
    pub fn put_item(&self, item: LaunchItem) {
        lock(&self.state).items.insert(item.id, item);
    }

    pub fn insert_purchase(&self, purchase: Purchase) {
        lock(&self.state).purchases.push(purchase);
    }

    pub fn items(&self, launch_id: Uuid) -> Vec<LaunchItem> {
        lock(&self.state)
            .items
            .values()
            .filter(|item| item.launch_id == launch_id)
            .cloned()
            .collect()
    }

    pub fn purchases(&self) -> Vec<Purchase> {
        lock(&self.state).purchases.clone()
    }

    pub fn failed_mints(&self) -> Vec<FailedMint> {
        lock(&self.state).failed_mints.clone()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn get_launch(&self, launch_id: Uuid) -> PipelineResult<Option<Launch>> {
        Ok(lock(&self.state).launches.get(&launch_id).cloned())
    }

    async fn get_collection(&self, collection_id: Uuid) -> PipelineResult<Option<Collection>> {
        Ok(lock(&self.state).collections.get(&collection_id).cloned())
    }

    async fn get_buyer(&self, buyer_id: Uuid) -> PipelineResult<Option<Buyer>> {
        Ok(lock(&self.state).buyers.get(&buyer_id).cloned())
    }

    async fn get_item(&self, item_id: Uuid) -> PipelineResult<Option<LaunchItem>> {
        Ok(lock(&self.state).items.get(&item_id).cloned())
    }

    async fn get_collectible(&self, collectible_id: Uuid) -> PipelineResult<Option<Collectible>> {
        Ok(lock(&self.state).collectibles.get(&collectible_id).cloned())
    }

    async fn pick_reservable_item(
        &self,
        launch_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> PipelineResult<Option<LaunchItem>> {
        let state = lock(&self.state);
        let candidates: Vec<&LaunchItem> = state
            .items
            .values()
            .filter(|item| item.launch_id == launch_id && reservable_before(item, stale_before))
            .collect();
        Ok(candidates.choose(&mut rand::thread_rng()).map(|item| (*item).clone()))
    }

    async fn try_hold(
        &self,
        item_id: Uuid,
        hold: &Hold,
        stale_before: DateTime<Utc>,
    ) -> PipelineResult<Option<LaunchItem>> {
        let mut state = lock(&self.state);
        match state.items.get_mut(&item_id) {
            Some(item) if reservable_before(item, stale_before) => {
                item.status = ItemStatus::OnHold;
                item.on_hold_by = Some(hold.holder_id);
                item.on_hold_since = Some(hold.since);
                item.on_hold_until = Some(hold.until);
                item.updated_at = Utc::now();
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn extend_hold(
        &self,
        item_id: Uuid,
        holder_id: Uuid,
        hold_until: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let mut state = lock(&self.state);
        match state.items.get_mut(&item_id) {
            Some(item) if item.is_held_by(holder_id) => {
                item.on_hold_until = Some(hold_until);
                item.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_hold(&self, item_id: Uuid, holder_id: Option<Uuid>) -> PipelineResult<bool> {
        let mut state = lock(&self.state);
        let Some(item) = state.items.get_mut(&item_id) else {
            return Ok(false);
        };
        if item.status != ItemStatus::OnHold {
            return Ok(false);
        }
        if let Some(holder) = holder_id {
            if item.on_hold_by != Some(holder) {
                return Ok(false);
            }
        }
        item.status = ItemStatus::Active;
        item.on_hold_by = None;
        item.on_hold_since = None;
        item.on_hold_until = None;
        item.updated_at = Utc::now();
        Ok(true)
    }

    async fn create_on_demand_item(
        &self,
        launch_id: Uuid,
        hold: &Hold,
        order_id: Option<Uuid>,
    ) -> PipelineResult<(LaunchItem, Collectible)> {
        let mut state = lock(&self.state);
        if let Some(order_id) = order_id {
            if !state.orders.contains_key(&order_id) {
                return Err(AllocationError::OrderNotFound(order_id).into());
            }
        }
        let collection_id = state
            .launches
            .get(&launch_id)
            .map(|launch| launch.collection_id)
            .ok_or(AllocationError::LaunchNotFound(launch_id))?;
        let collection = state.collections.get_mut(&collection_id).ok_or_else(|| {
            PipelineError::Consistency(format!("launch {} has no collection", launch_id))
        })?;
        collection.last_nft_id += 1;
        let nft_id = collection.last_nft_id;
        let now = Utc::now();

        let collectible = Collectible {
            id: Uuid::new_v4(),
            collection_id,
            nft_id,
            cid: None,
            status: CollectibleStatus::Pending,
            unique_idx: None,
            created_at: now,
        };
        let item = LaunchItem {
            id: Uuid::new_v4(),
            launch_id,
            collectible_id: collectible.id,
            status: ItemStatus::OnHold,
            on_hold_by: Some(hold.holder_id),
            on_hold_since: Some(hold.since),
            on_hold_until: Some(hold.until),
            created_at: now,
            updated_at: now,
        };

        state.collectibles.insert(collectible.id, collectible.clone());
        state.items.insert(item.id, item.clone());
        if let Some(order) = order_id.and_then(|id| state.orders.get_mut(&id)) {
            order.launch_item_id = item.id;
            order.updated_at = hold.since;
        }
        debug!(launch_id = %launch_id, nft_id, "Created on-demand item");
        Ok((item, collectible))
    }

    async fn set_collectible_cid(&self, collectible_id: Uuid, cid: &str) -> PipelineResult<()> {
        if let Some(collectible) = lock(&self.state).collectibles.get_mut(&collectible_id) {
            collectible.cid = Some(cid.to_string());
        }
        Ok(())
    }

    async fn count_purchases(
        &self,
        launch_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        buyer_id: Uuid,
        buyer_address: &str,
    ) -> PipelineResult<u32> {
        Ok(lock(&self.state).count_purchases(launch_id, from, to, buyer_id, buyer_address))
    }

    async fn finalize_sale(&self, sale: &SaleRecord) -> PipelineResult<Purchase> {
        let mut state = lock(&self.state);
        let item = state
            .items
            .get(&sale.item_id)
            .cloned()
            .ok_or(AllocationError::ItemNotFound(sale.item_id))?;

        if item.status == ItemStatus::Sold {
            return Err(AllocationError::AlreadySold { item_id: item.id }.into());
        }
        if !item.is_held_by(sale.holder_id) {
            return Err(AllocationError::NotHeldByYou { item_id: item.id }.into());
        }
        if let Some(limit) = &sale.limit {
            let purchased = state.count_purchases(
                item.launch_id,
                limit.window_start,
                limit.window_end,
                sale.holder_id,
                &sale.buyer_address,
            );
            if purchased >= limit.max_per_wallet {
                return Err(EligibilityError::WalletLimitReached {
                    phase: limit.phase.to_string(),
                    limit: limit.max_per_wallet,
                    purchased,
                }
                .into());
            }
        }

        // Validate everything before the first write so failures leave no trace
        if let Some(order_id) = sale.order_id {
            if !state.orders.contains_key(&order_id) {
                return Err(AllocationError::OrderNotFound(order_id).into());
            }
        }
        state.confirm_collectible(item.collectible_id, &sale.contract_address)?;

        if let Some(item) = state.items.get_mut(&sale.item_id) {
            item.status = ItemStatus::Sold;
            item.on_hold_by = None;
            item.on_hold_since = None;
            item.on_hold_until = None;
            item.updated_at = sale.sold_at;
        }
        let purchase = Purchase {
            id: Uuid::new_v4(),
            launch_id: item.launch_id,
            launch_item_id: item.id,
            buyer_id: Some(sale.holder_id),
            buyer_address: sale.buyer_address.to_ascii_lowercase(),
            phase: sale.phase,
            price: sale.price,
            tx_hash: sale.tx_hash.clone(),
            purchased_at: sale.sold_at,
        };
        state.purchases.push(purchase.clone());

        if let Some(order_id) = sale.order_id {
            if let Some(order) = state.orders.get_mut(&order_id) {
                order.status = OrderStatus::Done;
                order.tx_hash = sale.tx_hash.clone();
                order.updated_at = sale.sold_at;
            }
        }
        Ok(purchase)
    }

    async fn reconcile_minted(&self, reconciliation: &Reconciliation) -> PipelineResult<()> {
        let mut state = lock(&self.state);
        let item = state
            .items
            .get(&reconciliation.item_id)
            .cloned()
            .ok_or(AllocationError::ItemNotFound(reconciliation.item_id))?;

        state.confirm_collectible(item.collectible_id, &reconciliation.contract_address)?;
        if let Some(item) = state.items.get_mut(&reconciliation.item_id) {
            item.status = ItemStatus::Sold;
            item.on_hold_by = None;
            item.on_hold_since = None;
            item.on_hold_until = None;
            item.updated_at = reconciliation.reconciled_at;
        }
        if !state.purchases.iter().any(|p| p.launch_item_id == item.id) {
            state.purchases.push(Purchase {
                id: Uuid::new_v4(),
                launch_id: item.launch_id,
                launch_item_id: item.id,
                buyer_id: None,
                buyer_address: reconciliation.owner_address.to_ascii_lowercase(),
                phase: None,
                price: rust_decimal::Decimal::ZERO,
                tx_hash: None,
                purchased_at: reconciliation.reconciled_at,
            });
        }
        Ok(())
    }

    async fn purchases_for_item(&self, item_id: Uuid) -> PipelineResult<Vec<Purchase>> {
        Ok(lock(&self.state)
            .purchases
            .iter()
            .filter(|p| p.launch_item_id == item_id)
            .cloned()
            .collect())
    }

    async fn insert_order(&self, order: &Order) -> PipelineResult<()> {
        lock(&self.state).orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> PipelineResult<Option<Order>> {
        Ok(lock(&self.state).orders.get(&order_id).cloned())
    }

    async fn transition_order(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> PipelineResult<bool> {
        let mut state = lock(&self.state);
        match state.orders.get_mut(&order_id) {
            Some(order) if from.contains(&order.status) => {
                order.status = to;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failed_mint(&self, failed: &FailedMint) -> PipelineResult<()> {
        lock(&self.state).failed_mints.push(failed.clone());
        Ok(())
    }
}

#[async_trait]
impl WhitelistLookup for MemoryStore {
    async fn is_eligible(
        &self,
        launch_id: Uuid,
        phase: PhaseKind,
        address: &str,
    ) -> PipelineResult<bool> {
        Ok(lock(&self.state)
            .whitelist
            .contains(&(launch_id, phase, address.to_ascii_lowercase())))
    }
}

/// Expiring key/value cache with the lock primitives of Redis
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = lock(&self.entries);
        matches!(entries.get(key), Some((_, expires_at)) if *expires_at > Instant::now())
    }

    fn live_value(entries: &mut HashMap<String, (String, Instant)>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl CachePort for MemoryCache {
    async fn get<T>(&self, key: &str) -> PipelineResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let raw = Self::live_value(&mut lock(&self.entries), key);
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> PipelineResult<()>
    where
        T: Serialize + Send + Sync,
    {
        let raw = serde_json::to_string(value)?;
        lock(&self.entries).insert(key.to_string(), (raw, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> PipelineResult<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn health_check(&self) -> PipelineResult<()> {
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryCache {
    async fn set_if_not_exists(&self, key: &str, value: &str, ttl: Duration) -> PipelineResult<bool> {
        let mut entries = lock(&self.entries);
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> PipelineResult<bool> {
        let mut entries = lock(&self.entries);
        if Self::live_value(&mut entries, key).as_deref() == Some(expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> PipelineResult<bool> {
        let mut entries = lock(&self.entries);
        if Self::live_value(&mut entries, key).as_deref() == Some(expected) {
            entries.insert(key.to_string(), (expected.to_string(), Instant::now() + ttl));
            return Ok(true);
        }
        Ok(false)
    }
}

struct QueuedMessage {
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt_handle: Option<String>,
}

/// At-least-once queue with visibility timeouts and receive counts
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<Vec<QueuedMessage>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages not yet deleted, visible or in flight
    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expire every visibility timeout now
    pub fn make_all_visible(&self) {
        let now = Instant::now();
        for message in lock(&self.messages).iter_mut() {
            message.visible_at = now;
        }
    }

    fn take_visible(&self, max_messages: usize, visibility_timeout: Duration) -> Vec<ReceivedMessage> {
        let now = Instant::now();
        let mut received = Vec::new();
        for message in lock(&self.messages).iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            let handle = Uuid::new_v4().to_string();
            message.receive_count += 1;
            message.visible_at = now + visibility_timeout;
            message.receipt_handle = Some(handle.clone());
            received.push(ReceivedMessage {
                receipt_handle: handle,
                receive_count: message.receive_count,
                body: message.body.clone(),
            });
        }
        received
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, body: &str) -> PipelineResult<()> {
        lock(&self.messages).push(QueuedMessage {
            body: body.to_string(),
            receive_count: 0,
            visible_at: Instant::now(),
            receipt_handle: None,
        });
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
        wait_time: Duration,
    ) -> PipelineResult<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + wait_time;
        loop {
            let received = self.take_visible(max_messages, visibility_timeout);
            if !received.is_empty() || Instant::now() >= deadline {
                return Ok(received);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn delete(&self, receipt_handle: &str) -> PipelineResult<()> {
        lock(&self.messages)
            .retain(|message| message.receipt_handle.as_deref() != Some(receipt_handle));
        Ok(())
    }
}

/// Content-addressed uploader that keeps every blob
#[derive(Default)]
pub struct MemoryUploader {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<bool>,
}

impl MemoryUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        lock(&self.blobs).get(uri).cloned()
    }

    pub fn upload_count(&self) -> usize {
        lock(&self.blobs).len()
    }
}

#[async_trait]
impl MetadataUploader for MemoryUploader {
    async fn upload(&self, bytes: Vec<u8>, _content_type: &str) -> PipelineResult<String> {
        if *lock(&self.failing) {
            return Err(NetworkError::Upload("uploader unavailable".to_string()).into());
        }
        let uri = format!("mem://{}", hex::encode(Sha256::digest(&bytes)));
        lock(&self.blobs).insert(uri.clone(), bytes);
        Ok(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_visibility_and_receive_count() {
        let queue = MemoryQueue::new();
        queue.send("one").await.unwrap();

        let first = queue
            .receive(1, Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);

        // Hidden until the visibility timeout expires
        let none = queue
            .receive(1, Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();
        assert!(none.is_empty());

        queue.make_all_visible();
        let second = queue
            .receive(1, Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(second[0].receive_count, 2);

        // A stale handle no longer deletes the message
        queue.delete(&first[0].receipt_handle).await.unwrap();
        assert_eq!(queue.len(), 1);
        queue.delete(&second[0].receipt_handle).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_cache_ttl_expiry() {
        let cache = MemoryCache::new();
        cache.set("k", &5u32, Duration::from_millis(20)).await.unwrap();
        assert_eq!(cache.get::<u32>("k").await.unwrap(), Some(5));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_uploader_failure_toggle() {
        let uploader = MemoryUploader::new();
        let uri = uploader.upload(b"{}".to_vec(), "application/json").await.unwrap();
        assert!(uri.starts_with("mem://"));
        assert_eq!(uploader.get(&uri), Some(b"{}".to_vec()));

        uploader.set_failing(true);
        assert!(uploader.upload(b"x".to_vec(), "text/plain").await.is_err());
    }
}
