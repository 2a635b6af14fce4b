//! Contract event indexer.
//!
//! Polls `eth_getLogs` over HTTP in bounded block windows starting one block
//! past a persisted per-contract cursor. Within a window, events are handled
//! in block-then-log-index order and the cursor moves to the window's last
//! block only after every handler succeeded. There is no ordering across
//! contracts.
//!
//! Every handler is idempotent (keyed by `(tx_hash, log_index)` or by entity
//! id), so fallback reconciliation can replay any range.
//!
//! A handler failure that needs operator attention is written to
//! `oracle.system_alerts` and the event is skipped; it never holds the
//! cursor back.

pub mod decode;
pub mod events;

use crate::chain::ChainGateway;
use crate::config::IndexerConfig;
use crate::error::{ErrorKind, KeeperError, Result};
use crate::oddyssey::OddysseyPipeline;
use crate::settlement::{PoolSettlement, SettleOutcome};
use crate::store::models::{BetRecord, LiquidityRecord, PrizeClaimRecord, SystemAlert};
use crate::store::{AlertStore, CursorStore, PoolStore};
use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use events::{sort_events, ChainEvent, EventKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub use events::LogMeta;

/// Cursor stream name; one cursor per contract covers all of its events.
pub const STREAM_ALL: &str = "all";

#[async_trait]
pub trait LogSource: Send + Sync {
    async fn head_block(&self) -> Result<u64>;

    /// Decoded events of one contract in `[from_block, to_block]`, sorted by
    /// block then log index.
    async fn fetch_events(&self, contract: Address, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub head: u64,
    pub windows: usize,
    pub events: usize,
    pub handled: usize,
    pub skipped: usize,
}

pub struct EventIndexer {
    source: Arc<dyn LogSource>,
    cursors: Arc<dyn CursorStore>,
    pools: Arc<dyn PoolStore>,
    alerts: Arc<dyn AlertStore>,
    chain: Arc<dyn ChainGateway>,
    oddyssey: Arc<OddysseyPipeline>,
    settlement: Arc<PoolSettlement>,
    contracts: Vec<Address>,
    config: IndexerConfig,
}

fn hex_addr(a: &Address) -> String {
    format!("{:#x}", a)
}

impl EventIndexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn LogSource>,
        cursors: Arc<dyn CursorStore>,
        pools: Arc<dyn PoolStore>,
        alerts: Arc<dyn AlertStore>,
        chain: Arc<dyn ChainGateway>,
        oddyssey: Arc<OddysseyPipeline>,
        settlement: Arc<PoolSettlement>,
        contracts: Vec<Address>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            source,
            cursors,
            pools,
            alerts,
            chain,
            oddyssey,
            settlement,
            contracts,
            config,
        }
    }

    /// Process everything between each contract's cursor and the head.
    pub async fn poll_once(&self) -> Result<IndexSummary> {
        let head = self.source.head_block().await?;
        let mut summary = IndexSummary {
            head,
            ..Default::default()
        };
        for contract in &self.contracts {
            let start = match self.cursors.cursor(&hex_addr(contract), STREAM_ALL).await? {
                Some(last) => last + 1,
                None if self.config.start_block == 0 => head.saturating_sub(self.config.fallback_lookback_blocks),
                None => self.config.start_block,
            };
            if start > head {
                continue;
            }
            self.process_range(*contract, start, head, &mut summary).await?;
        }
        if summary.events > 0 {
            debug!(
                head = head,
                events = summary.events,
                handled = summary.handled,
                skipped = summary.skipped,
                "indexer poll complete"
            );
        }
        Ok(summary)
    }

    /// Replay the last `lookback` blocks for every contract. Handlers are
    /// idempotent, so only missing rows are written.
    pub async fn reconcile(&self, lookback: u64) -> Result<IndexSummary> {
        let head = self.source.head_block().await?;
        let from = head.saturating_sub(lookback);
        let mut summary = IndexSummary {
            head,
            ..Default::default()
        };
        for contract in &self.contracts {
            self.process_range(*contract, from, head, &mut summary).await?;
        }
        info!(
            from = from,
            head = head,
            events = summary.events,
            handled = summary.handled,
            skipped = summary.skipped,
            "fallback reconciliation complete"
        );
        Ok(summary)
    }

    async fn process_range(&self, contract: Address, from: u64, to: u64, summary: &mut IndexSummary) -> Result<()> {
        let window = self.config.window_blocks.max(1);
        let contract_hex = hex_addr(&contract);
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(window - 1).min(to);
            let mut events = self.source.fetch_events(contract, start, end).await?;
            sort_events(&mut events);
            summary.windows += 1;
            summary.events += events.len();

            for ev in &events {
                match self.handle(ev).await {
                    Ok(()) => summary.handled += 1,
                    Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::Validation) => {
                        summary.skipped += 1;
                        warn!(
                            event = ev.kind.name(),
                            block = ev.meta.block_number,
                            log_index = ev.meta.log_index,
                            error = %e,
                            "skipping event"
                        );
                    }
                    Err(e) if e.needs_alert() => {
                        summary.skipped += 1;
                        error!(
                            event = ev.kind.name(),
                            tx_hash = %ev.meta.tx_hash,
                            log_index = ev.meta.log_index,
                            kind = %e.kind(),
                            error = %e,
                            "event handler failed, alert raised"
                        );
                        self.raise_alert(&contract_hex, ev, &e).await;
                    }
                    Err(e) => {
                        warn!(
                            contract = %contract_hex,
                            from = start,
                            to = end,
                            error = %e,
                            "window failed, cursor not advanced"
                        );
                        return Err(e);
                    }
                }
            }

            self.cursors.advance_cursor(&contract_hex, STREAM_ALL, end).await?;
            start = end + 1;
        }
        Ok(())
    }

    async fn raise_alert(&self, contract: &str, ev: &ChainEvent, err: &KeeperError) {
        let alert = SystemAlert {
            alert_type: err.kind().to_string(),
            message: err.to_string(),
            details: serde_json::json!({
                "source": "event_indexer",
                "contract": contract,
                "event": ev.kind.name(),
                "block": ev.meta.block_number,
                "tx_hash": ev.meta.tx_hash,
                "log_index": ev.meta.log_index,
            }),
            created_at: Utc::now(),
        };
        if let Err(e) = self.alerts.record_alert(&alert).await {
            error!(event = ev.kind.name(), error = %e, "failed to record system alert");
        }
    }

    /// Apply one event to the store.
    pub async fn handle(&self, ev: &ChainEvent) -> Result<()> {
        let meta = &ev.meta;
        match &ev.kind {
            EventKind::CycleStarted { cycle_id, .. } => {
                self.oddyssey.sync_cycle_from_chain(*cycle_id).await?;
            }
            EventKind::SlipPlaced { slip_id, .. } => {
                self.oddyssey.ingest_slip(*slip_id, Some(meta.tx_hash.clone())).await?;
            }
            EventKind::CycleResolved { cycle_id, prize_pool } => {
                self.oddyssey
                    .record_cycle_resolved(*cycle_id, *prize_pool, &meta.tx_hash)
                    .await?;
            }
            EventKind::SlipEvaluated { slip_id, .. } => {
                self.oddyssey.record_slip_evaluated(*slip_id).await?;
            }
            EventKind::PoolCreated {
                pool_id,
                market_id_hash,
                ..
            } => {
                self.index_pool(*pool_id, Some(&meta.tx_hash)).await?;
                if let Some(pool) = self.pools.pool(*pool_id as i64).await? {
                    if !crate::settlement::market_matches(&pool.market_id, *market_id_hash) {
                        warn!(pool_id = pool_id, market_id = %pool.market_id, "PoolCreated market hash does not match stored market id");
                    }
                }
            }
            EventKind::BetPlaced {
                pool_id,
                bettor,
                amount,
                is_for_outcome,
            } => {
                let inserted = self
                    .pools
                    .insert_bet(&BetRecord {
                        log: meta.log_ref(),
                        pool_id: *pool_id as i64,
                        bettor: hex_addr(bettor),
                        amount: amount.to_string(),
                        is_for_outcome: *is_for_outcome,
                    })
                    .await?;
                if inserted {
                    debug!(pool_id = pool_id, tx_hash = %meta.tx_hash, log_index = meta.log_index, "bet recorded");
                }
            }
            EventKind::LiquidityAdded {
                pool_id,
                provider,
                amount,
            } => {
                self.pools
                    .insert_liquidity(&LiquidityRecord {
                        log: meta.log_ref(),
                        pool_id: *pool_id as i64,
                        provider: hex_addr(provider),
                        amount: amount.to_string(),
                    })
                    .await?;
            }
            EventKind::PoolSettled {
                pool_id,
                result,
                creator_side_won,
            } => {
                if self.pools.pool(*pool_id as i64).await?.is_none() {
                    self.index_pool(*pool_id, None).await?;
                }
                let changed = self
                    .pools
                    .mark_pool_settled(
                        *pool_id as i64,
                        Some(*creator_side_won),
                        &format!("{:#x}", result),
                        Some(&meta.tx_hash),
                    )
                    .await?;
                if changed {
                    info!(pool_id = pool_id, creator_side_won = creator_side_won, "pool settlement observed");
                }
            }
            EventKind::RewardClaimed { pool_id, user, amount } => {
                self.pools
                    .insert_prize_claim(&PrizeClaimRecord {
                        log: meta.log_ref(),
                        pool_id: *pool_id as i64,
                        claimant: hex_addr(user),
                        amount: amount.to_string(),
                    })
                    .await?;
            }
            EventKind::OutcomeSubmitted {
                market_id_hash,
                result_data,
                ..
            } => {
                for outcome in self.settlement.handle_outcome(*market_id_hash, result_data).await? {
                    if let SettleOutcome::Deferred { pool_id, .. } = outcome {
                        debug!(pool_id = pool_id, tx_hash = %meta.tx_hash, "settlement left to fallback job");
                    }
                }
            }
        }
        Ok(())
    }

    /// Read a pool from the contract and store it with its market id
    /// reverse lookups.
    async fn index_pool(&self, pool_id: u64, tx_hash: Option<&str>) -> Result<()> {
        let on_chain = self.chain.pool(pool_id).await?;
        let record = on_chain.to_record(tx_hash.map(str::to_string))?;
        self.pools.upsert_pool(&record).await?;
        self.settlement.remember_market_id(&record.market_id).await?;
        if on_chain.settled {
            self.pools
                .mark_pool_settled(
                    record.pool_id,
                    Some(on_chain.creator_side_won),
                    &format!("{:#x}", on_chain.result),
                    None,
                )
                .await?;
        }
        debug!(pool_id = pool_id, market_id = %record.market_id, "pool indexed");
        Ok(())
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            contracts = self.contracts.len(),
            interval_ms = poll_interval.as_millis() as u64,
            "event indexer started"
        );
        loop {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "indexer poll failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("event indexer stopped");
    }
}
