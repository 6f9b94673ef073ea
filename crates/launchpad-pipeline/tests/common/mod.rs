//! Shared fixtures for the integration tests
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use launchpad_pipeline::adapters::{MemoryCache, MemoryQueue, MemoryStore, MemoryUploader, MockChain};
use launchpad_pipeline::config::{ChainMode, PipelineConfig};
use launchpad_pipeline::core::{
    Buyer, ChainClient, Clock, Collection, Launch, LaunchItem, ManualClock, MintingModel, Order,
    OrderStatus, Phase, PhaseKind, PreparedMint, TxRequest,
};
use launchpad_pipeline::infrastructure::{Backends, InMemoryContainer, ServiceContainer};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

pub const CONTRACT: &str = "0x00000000000000000000000000000000000000c0";
pub const MINTER: &str = "0x0000000000000000000000000000000000000001";
pub const CUSTODY: &str = "0x00000000000000000000000000000000000000cc";
pub const STRANGER: &str = "0x00000000000000000000000000000000000000ee";
pub const BUYER_A: &str = "0x00000000000000000000000000000000000000a1";
pub const BUYER_B: &str = "0x00000000000000000000000000000000000000b2";
pub const BUYER_C: &str = "0x00000000000000000000000000000000000000c3";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn price(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub fn phase(kind: PhaseKind, from: Duration, to: Duration, price: Decimal, max_per_wallet: u32) -> Phase {
    Phase {
        kind,
        starts_at: t0() + from,
        ends_at: t0() + to,
        price,
        max_per_wallet,
    }
}

/// PUBLIC phase open from an hour before to an hour after t0
pub fn public_phase(price: Decimal, max_per_wallet: u32) -> Phase {
    phase(PhaseKind::Public, Duration::hours(-1), Duration::hours(1), price, max_per_wallet)
}

/// Fast polling, no long waits
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.chain.mode = ChainMode::Mock;
    config.chain.custody_address = Some(CUSTODY.to_string());
    config.queue.wait_time_secs = 0;
    config.queue.visibility_timeout_secs = 30;
    config.queue.poll_interval_ms = 10;
    config.worker.lock_backoff_ms = 10;
    config.worker.receipt_timeout_secs = 5;
    config.worker.receipt_poll_interval_ms = 10;
    config
}

pub struct LaunchFixture {
    pub collection: Collection,
    pub launch: Launch,
    pub items: Vec<LaunchItem>,
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub chain: Arc<MockChain>,
    pub cache: Arc<MemoryCache>,
    pub queue: Arc<MemoryQueue>,
    pub uploader: Arc<MemoryUploader>,
    pub clock: Arc<ManualClock>,
    pub container: InMemoryContainer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::new());
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(MemoryQueue::new());
        let uploader = Arc::new(MemoryUploader::new());
        let clock = Arc::new(ManualClock::new(t0()));

        let container = ServiceContainer::assemble(
            config,
            Backends {
                store: store.clone(),
                chain: chain.clone(),
                cache: cache.clone(),
                queue: queue.clone(),
                uploader: uploader.clone(),
                clock: clock.clone(),
            },
        )
        .expect("assemble in-memory container");

        Self {
            store,
            chain,
            cache,
            queue,
            uploader,
            clock,
            container,
        }
    }

    /// A second worker process over the same store, chain, cache and queue
    pub fn second_worker(&self) -> InMemoryContainer {
        ServiceContainer::assemble(
            self.container.config.clone(),
            Backends {
                store: self.store.clone(),
                chain: self.chain.clone(),
                cache: self.cache.clone(),
                queue: self.queue.clone(),
                uploader: self.uploader.clone(),
                clock: self.clock.clone(),
            },
        )
        .expect("assemble second container")
    }

    /// Collection plus launch with `items` pre-seeded slots numbered from 1
    pub fn seed_launch(
        &self,
        model: MintingModel,
        phases: Vec<Phase>,
        items: i64,
        unlimited_supply: bool,
    ) -> LaunchFixture {
        let collection = Collection {
            id: Uuid::new_v4(),
            name: "Genesis".to_string(),
            contract_address: CONTRACT.to_string(),
            minting_model: model,
            last_nft_id: items,
            metadata_template: None,
        };
        let launch = Launch {
            id: Uuid::new_v4(),
            collection_id: collection.id,
            unlimited_supply,
            phases,
        };
        self.store.insert_collection(collection.clone());
        self.store.insert_launch(launch.clone());

        let items = (1..=items)
            .map(|nft_id| self.store.seed_item(launch.id, nft_id).expect("seed item"))
            .collect();

        LaunchFixture {
            collection,
            launch,
            items,
        }
    }

    pub fn add_buyer(&self, address: &str) -> Buyer {
        let buyer = Buyer {
            id: Uuid::new_v4(),
            wallet_address: address.to_string(),
            is_active: true,
        };
        self.store.insert_buyer(buyer.clone());
        buyer
    }

    pub fn order_for(&self, fixture: &LaunchFixture, buyer: &Buyer, item_id: Uuid, amount: Decimal) -> Order {
        let now = self.clock.now();
        Order {
            id: Uuid::new_v4(),
            buyer_id: buyer.id,
            collection_id: fixture.collection.id,
            launch_id: fixture.launch.id,
            launch_item_id: item_id,
            funding_address: None,
            funding_amount: amount,
            status: OrderStatus::Pending,
            tx_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Broadcast a prepared mint from the buyer's wallet
    pub async fn buyer_sends(&self, buyer: &Buyer, prepared: &PreparedMint) -> String {
        self.chain
            .send_transaction(&TxRequest {
                from: buyer.wallet_address.clone(),
                to: prepared.unsigned_tx.to.clone(),
                data: prepared.unsigned_tx.data.clone(),
                value_wei: prepared.unsigned_tx.value_wei,
                nonce: None,
                gas: None,
            })
            .await
            .expect("buyer transaction accepted")
    }
}
