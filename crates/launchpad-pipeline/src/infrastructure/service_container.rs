//! Service container for dependency injection

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::adapters::{
    CalldataAuthorizer, HttpUploader, MemoryCache, MemoryQueue, MemoryStore, MemoryUploader,
    MockChain, RpcChainClient,
};
use crate::config::PipelineConfig;
use crate::core::{
    CachePort, ChainClient, Clock, LaunchStore, LockStore, MetadataUploader, MintAuthorizer,
    PipelineError, PipelineResult, SystemClock, WorkQueue,
};
use crate::database::{PostgresQueue, PostgresStore, RedisCache};
use crate::metrics::PipelineMetrics;
use crate::services::{
    Allocator, ConfirmationService, EventTopics, Launchpad, MintQueueDeps, MintQueueProcessor,
    MintQueueSettings,
};

/// Backends the services are assembled over
pub struct Backends<S, C, K> {
    pub store: Arc<S>,
    pub chain: Arc<C>,
    pub cache: Arc<K>,
    pub queue: Arc<dyn WorkQueue>,
    pub uploader: Arc<dyn MetadataUploader>,
    pub clock: Arc<dyn Clock>,
}

/// Service container managing all dependencies
pub struct ServiceContainer<S, C, K>
where
    S: LaunchStore,
    C: ChainClient,
    K: CachePort + LockStore,
{
    /// Configuration
    pub config: PipelineConfig,

    pub store: Arc<S>,
    pub chain: Arc<C>,
    pub cache: Arc<K>,
    pub queue: Arc<dyn WorkQueue>,
    pub authorizer: Arc<dyn MintAuthorizer>,
    pub metrics: Arc<PipelineMetrics>,

    pub allocator: Arc<Allocator<S, C>>,
    pub confirmations: Arc<ConfirmationService<C, K>>,
    pub launchpad: Arc<Launchpad<S, C, K>>,
    pub processor: Arc<MintQueueProcessor<S, C, K>>,

    shutdown: CancellationToken,
}

/// Production wiring: PostgreSQL, Redis and a JSON-RPC node
pub type PostgresContainer = ServiceContainer<PostgresStore, RpcChainClient, RedisCache>;

/// Everything in process memory, for local runs and tests
pub type InMemoryContainer = ServiceContainer<MemoryStore, MockChain, MemoryCache>;

impl<S, C, K> ServiceContainer<S, C, K>
where
    S: LaunchStore + 'static,
    C: ChainClient + 'static,
    K: CachePort + LockStore + 'static,
{
    /// Build every service once for the lifetime of the process
    pub fn assemble(config: PipelineConfig, backends: Backends<S, C, K>) -> PipelineResult<Self> {
        let metrics = Arc::new(
            PipelineMetrics::new().map_err(|e| PipelineError::Configuration(e.to_string()))?,
        );
        let authorizer: Arc<dyn MintAuthorizer> =
            Arc::new(CalldataAuthorizer::from_config(&config.chain));

        let allocator = Arc::new(Allocator::new(
            backends.store.clone(),
            backends.chain.clone(),
            backends.uploader.clone(),
            backends.clock.clone(),
            config.allocation.clone(),
            config.chain.custody(),
        ));
        let confirmations = Arc::new(ConfirmationService::new(
            backends.chain.clone(),
            backends.cache.clone(),
            config.confirmation.clone(),
            EventTopics::from_config(&config.chain),
        ));
        let launchpad = Arc::new(Launchpad::new(
            backends.store.clone(),
            allocator.clone(),
            confirmations.clone(),
            backends.queue.clone(),
            authorizer.clone(),
            metrics.clone(),
        ));

        let worker_id = format!("{}-{}", std::process::id(), Uuid::new_v4().simple());
        let processor = Arc::new(MintQueueProcessor::new(
            MintQueueDeps {
                store: backends.store.clone(),
                chain: backends.chain.clone(),
                cache: backends.cache.clone(),
                queue: backends.queue.clone(),
                authorizer: authorizer.clone(),
                allocator: allocator.clone(),
                confirmations: confirmations.clone(),
                metrics: metrics.clone(),
            },
            MintQueueSettings::from_config(&config, worker_id),
        ));

        info!("Services assembled");

        Ok(Self {
            config,
            store: backends.store,
            chain: backends.chain,
            cache: backends.cache,
            queue: backends.queue,
            authorizer,
            metrics,
            allocator,
            confirmations,
            launchpad,
            processor,
            shutdown: CancellationToken::new(),
        })
    }

    /// Perform health check on all backends
    pub async fn health_check(&self) -> PipelineResult<()> {
        info!("Performing health check");

        self.store.health_check().await?;
        self.cache.health_check().await?;
        let block = self.chain.get_block_number().await?;

        info!(block, "All services healthy");
        Ok(())
    }

    /// Token cancelled by `shutdown`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the mint queue worker on its own task
    pub fn spawn_worker(&self) -> JoinHandle<PipelineResult<()>> {
        let processor = self.processor.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { processor.run(shutdown).await })
    }

    /// Graceful shutdown
    pub async fn shutdown(&self) {
        info!("Shutting down service container");
        self.shutdown.cancel();
        self.store.close().await;
    }
}

impl PostgresContainer {
    /// Connect to PostgreSQL, Redis and the chain node
    pub async fn connect(config: PipelineConfig) -> PipelineResult<Self> {
        info!("Initializing service container");

        let store = Arc::new(PostgresStore::connect(&config.database).await?);
        let queue: Arc<dyn WorkQueue> = Arc::new(PostgresQueue::new(
            store.pool().clone(),
            Duration::from_millis(config.queue.poll_interval_ms),
        ));
        let cache = Arc::new(RedisCache::new(&config.redis)?);
        let chain = Arc::new(RpcChainClient::new(
            config.chain.rpc_url.clone(),
            Duration::from_secs(config.chain.request_timeout_secs),
        )?);
        let uploader: Arc<dyn MetadataUploader> = Arc::new(HttpUploader::new(
            config.upload.endpoint.clone(),
            config.upload.auth_token.clone(),
            Duration::from_secs(config.upload.timeout_secs),
        )?);

        info!("Storage backends initialized");

        Self::assemble(
            config,
            Backends {
                store,
                chain,
                cache,
                queue,
                uploader,
                clock: Arc::new(SystemClock),
            },
        )
    }
}

impl InMemoryContainer {
    /// Wire in-memory backends and a mock chain
    pub fn in_memory(config: PipelineConfig) -> PipelineResult<Self> {
        info!("Initializing in-memory service container");

        Self::assemble(
            config,
            Backends {
                store: Arc::new(MemoryStore::new()),
                chain: Arc::new(MockChain::new()),
                cache: Arc::new(MemoryCache::new()),
                queue: Arc::new(MemoryQueue::new()),
                uploader: Arc::new(MemoryUploader::new()),
                clock: Arc::new(SystemClock),
            },
        )
    }
}
