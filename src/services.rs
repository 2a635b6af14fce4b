//! Explicit construction of every component from a `Config`.
//!
//! Both binaries build their graph here; nothing is a global.

use crate::cache::RedisMarketCache;
use crate::chain::{abi, ChainGateway, EvmGateway};
use crate::config::Config;
use crate::coordinator::JobCoordinator;
use crate::indexer::{EventIndexer, LogSource};
use crate::oddyssey::OddysseyPipeline;
use crate::results::feed::{FixtureFeed, HttpFixtureFeed};
use crate::results::ResultIngestor;
use crate::settlement::PoolSettlement;
use crate::store::{
    AlertStore, CursorStore, CycleStore, KeeperStore, LockStore, PgStore, PoolStore, ResultStore,
};
use alloy::primitives::Address;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// The wired component graph.
pub struct Services {
    pub config: Config,
    pub coordinator: Arc<JobCoordinator>,
    pub results: Arc<dyn ResultStore>,
    pub ingestor: Arc<ResultIngestor>,
    pub cycles: Arc<dyn CycleStore>,
    pub pools: Arc<dyn PoolStore>,
    pub chain: Arc<dyn ChainGateway>,
    pub oddyssey: Arc<OddysseyPipeline>,
    pub settlement: Arc<PoolSettlement>,
    pub indexer: Arc<EventIndexer>,
}

impl Services {
    /// Wire components over any store implementing every capability and any
    /// chain that is also a log source.
    pub fn assemble<S, C>(
        config: Config,
        store: Arc<S>,
        chain: Arc<C>,
        feed: Arc<dyn FixtureFeed>,
        contracts: Vec<Address>,
        cache: Option<Arc<dyn crate::cache::MarketIdCache>>,
    ) -> Self
    where
        S: KeeperStore + 'static,
        C: ChainGateway + LogSource + 'static,
    {
        let locks: Arc<dyn LockStore> = store.clone();
        let alerts: Arc<dyn AlertStore> = store.clone();
        let results: Arc<dyn ResultStore> = store.clone();
        let cycles: Arc<dyn CycleStore> = store.clone();
        let pools: Arc<dyn PoolStore> = store.clone();
        let cursors: Arc<dyn CursorStore> = store;
        let gateway: Arc<dyn ChainGateway> = chain.clone();
        let source: Arc<dyn LogSource> = chain;

        let coordinator = Arc::new(JobCoordinator::new(locks, alerts.clone(), config.coordinator.clone()));
        let ingestor = Arc::new(ResultIngestor::new(results.clone(), feed));
        let oddyssey = Arc::new(OddysseyPipeline::new(
            cycles.clone(),
            results.clone(),
            gateway.clone(),
            ingestor.clone(),
            config.pipeline.clone(),
        ));
        let settlement = Arc::new(
            PoolSettlement::new(pools.clone(), gateway.clone())
                .with_cache(cache)
                .with_alerts(alerts.clone()),
        );
        let indexer = Arc::new(EventIndexer::new(
            source,
            cursors,
            pools.clone(),
            alerts,
            gateway.clone(),
            oddyssey.clone(),
            settlement.clone(),
            contracts,
            config.indexer.clone(),
        ));

        Self {
            config,
            coordinator,
            results,
            ingestor,
            cycles,
            pools,
            chain: gateway,
            oddyssey,
            settlement,
            indexer,
        }
    }

    /// Connect to Postgres, the RPC endpoint, the sports feed and, when
    /// configured, Redis.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        for (sig, ok) in abi::verify_topic_hashes() {
            if ok {
                info!(event = %sig, "topic hash verified");
            } else {
                error!(event = %sig, "topic hash mismatch");
                anyhow::bail!("topic hash mismatch for {}", sig);
            }
        }

        let store = PgStore::connect(
            &config.database.url,
            config.database.max_connections,
            config.statement_timeout(),
        )
        .await?;
        store.migrate().await?;
        let store = Arc::new(store);

        let gateway = Arc::new(EvmGateway::connect(&config.chain).await?);
        let contracts = gateway.indexed_contracts();

        let feed: Arc<dyn FixtureFeed> = Arc::new(HttpFixtureFeed::new(
            config.feed.base_url.clone(),
            config.feed.api_token.clone(),
            Duration::from_millis(config.feed.min_interval_ms),
        )?);
        let cache = RedisMarketCache::connect_optional(&config.cache).await;

        Ok(Self::assemble(config, store, gateway, feed, contracts, cache))
    }
}
