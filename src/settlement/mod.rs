//! Guided-oracle pool settlement.
//!
//! `OutcomeSubmitted` carries the market id as an indexed string, so only its
//! keccak hash reaches us. The hash is matched against each unsettled pool's
//! stored `market_id`, both raw and with leading control characters
//! stripped, and every match is settled through the oracle's `executeCall`.

use crate::cache::MarketIdCache;
use crate::chain::abi::{hash_hex, keccak256, market_id_hash};
use crate::chain::ChainGateway;
use crate::coordinator::JobContext;
use crate::error::{ErrorKind, KeeperError, Result};
use crate::outcome::OracleType;
use crate::store::models::{PoolRecord, SystemAlert};
use crate::store::{AlertStore, PoolStore};
use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Market ids are sometimes stored with leading control bytes.
pub fn clean_market_id(raw: &str) -> &str {
    raw.trim_start_matches(|c: char| c.is_control())
}

/// Whether a stored market id hashes to `hash`, raw or cleaned.
pub fn market_matches(market_id: &str, hash: B256) -> bool {
    market_id_hash(market_id) == hash || market_id_hash(clean_market_id(market_id)) == hash
}

/// The 32-byte outcome passed to `settlePool`. Exactly 32 bytes are used
/// as-is, shorter data is left-aligned and zero-padded, longer data is
/// hashed.
pub fn outcome_bytes32(result_data: &[u8]) -> B256 {
    match result_data.len() {
        32 => B256::from_slice(result_data),
        n if n < 32 => {
            let mut out = [0u8; 32];
            out[..n].copy_from_slice(result_data);
            B256::from(out)
        }
        _ => keccak256(result_data),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertClass {
    OnlyGuidedOracle,
    EventNotEnded,
    AlreadySettled,
    Other,
}

impl RevertClass {
    pub fn classify(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        if lower.contains("only guided oracle") {
            RevertClass::OnlyGuidedOracle
        } else if lower.contains("event not ended") {
            RevertClass::EventNotEnded
        } else if lower.contains("already settled") {
            RevertClass::AlreadySettled
        } else {
            RevertClass::Other
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, RevertClass::Other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettleOutcome {
    Settled { pool_id: i64, tx_hash: String },
    AlreadySettled { pool_id: i64 },
    NotEnded { pool_id: i64 },
    /// Open-oracle pools are settled by their own flow.
    Skipped { pool_id: i64 },
    /// The settle attempt failed; `pool_settlement_fallback` picks the pool
    /// up again under its lock.
    Deferred { pool_id: i64, kind: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FallbackSummary {
    pub checked: usize,
    pub settled: usize,
    pub already_settled: usize,
    pub awaiting_outcome: usize,
    pub not_ended: usize,
    pub failed: usize,
}

pub struct PoolSettlement {
    pools: Arc<dyn PoolStore>,
    chain: Arc<dyn ChainGateway>,
    cache: Option<Arc<dyn MarketIdCache>>,
    alerts: Option<Arc<dyn AlertStore>>,
}

impl PoolSettlement {
    pub fn new(pools: Arc<dyn PoolStore>, chain: Arc<dyn ChainGateway>) -> Self {
        Self {
            pools,
            chain,
            cache: None,
            alerts: None,
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertStore>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn MarketIdCache>>) -> Self {
        self.cache = cache;
        self
    }

    /// Record both the raw and cleaned hash of a pool's market id so later
    /// events resolve with a table lookup.
    pub async fn remember_market_id(&self, market_id: &str) -> Result<()> {
        self.pools
            .record_market_id(&hash_hex(&market_id_hash(market_id)), market_id)
            .await?;
        let cleaned = clean_market_id(market_id);
        if cleaned != market_id {
            self.pools
                .record_market_id(&hash_hex(&market_id_hash(cleaned)), cleaned)
                .await?;
        }
        Ok(())
    }

    /// Hash → original market id: cache, then lookup table, then a rehash of
    /// every unsettled pool's market id.
    pub async fn resolve_market_hash(&self, hash: B256) -> Result<Option<String>> {
        let key = hash_hex(&hash);

        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(id)) => return Ok(Some(id)),
                Ok(None) => {}
                Err(e) => warn!(hash = %key, error = %e, "market hash cache read failed"),
            }
        }

        let found = match self.pools.lookup_market_id(&key).await? {
            Some(id) => Some(id),
            None => {
                let mut found = None;
                for pool in self.pools.unsettled_pools().await? {
                    let candidate = if market_id_hash(&pool.market_id) == hash {
                        pool.market_id.as_str()
                    } else if market_id_hash(clean_market_id(&pool.market_id)) == hash {
                        clean_market_id(&pool.market_id)
                    } else {
                        continue;
                    };
                    self.pools.record_market_id(&key, candidate).await?;
                    found = Some(candidate.to_string());
                    break;
                }
                found
            }
        };

        if let (Some(cache), Some(id)) = (&self.cache, &found) {
            if let Err(e) = cache.put(&key, id).await {
                warn!(hash = %key, error = %e, "market hash cache write failed");
            }
        }
        Ok(found)
    }

    /// Settle every unsettled guided pool whose market hashes to
    /// `market_hash`. Each pool gets one attempt; a failed attempt is
    /// reported as `Deferred` (and alerted when it needs attention) so the
    /// event stream keeps moving. Only store failures propagate.
    pub async fn handle_outcome(&self, market_hash: B256, result_data: &[u8]) -> Result<Vec<SettleOutcome>> {
        let market_id = self.resolve_market_hash(market_hash).await?;
        let matched: Vec<PoolRecord> = self
            .pools
            .unsettled_pools()
            .await?
            .into_iter()
            .filter(|p| market_matches(&p.market_id, market_hash))
            .collect();

        if matched.is_empty() {
            warn!(
                market_hash = %hash_hex(&market_hash),
                market_id = ?market_id,
                "outcome submitted for a market with no unsettled pool"
            );
            return Ok(Vec::new());
        }

        let outcome = outcome_bytes32(result_data);
        let mut results = Vec::with_capacity(matched.len());
        for pool in &matched {
            info!(
                pool_id = pool.pool_id,
                market_id = %clean_market_id(&pool.market_id),
                outcome = %outcome,
                "settling pool from submitted outcome"
            );
            match self.settle_pool(pool, outcome).await {
                Ok(settled) => results.push(settled),
                Err(e) if e.kind() == ErrorKind::Database => return Err(e),
                Err(e) => results.push(self.defer(pool, market_hash, e).await),
            }
        }
        Ok(results)
    }

    async fn defer(&self, pool: &PoolRecord, market_hash: B256, err: KeeperError) -> SettleOutcome {
        if err.needs_alert() {
            error!(pool_id = pool.pool_id, kind = %err.kind(), error = %err, "settlement failed, deferred to fallback");
            if let Some(alerts) = &self.alerts {
                let alert = SystemAlert {
                    alert_type: err.kind().to_string(),
                    message: err.to_string(),
                    details: serde_json::json!({
                        "source": "outcome_submitted",
                        "pool_id": pool.pool_id,
                        "market_id": clean_market_id(&pool.market_id),
                        "market_hash": hash_hex(&market_hash),
                    }),
                    created_at: Utc::now(),
                };
                if let Err(e) = alerts.record_alert(&alert).await {
                    error!(pool_id = pool.pool_id, error = %e, "failed to record system alert");
                }
            }
        } else {
            warn!(pool_id = pool.pool_id, kind = %err.kind(), error = %err, "settlement failed, deferred to fallback");
        }
        SettleOutcome::Deferred {
            pool_id: pool.pool_id,
            kind: err.kind().to_string(),
            reason: err.to_string(),
        }
    }

    /// Send `settlePool` through the oracle and record the settlement.
    pub async fn settle_pool(&self, pool: &PoolRecord, outcome: B256) -> Result<SettleOutcome> {
        let pool_id = pool.pool_id;
        if pool.settled {
            return Ok(SettleOutcome::AlreadySettled { pool_id });
        }
        if pool.oracle_type != OracleType::Guided {
            debug!(pool_id = pool_id, "open-oracle pool, not settling");
            return Ok(SettleOutcome::Skipped { pool_id });
        }
        let chain_pool_id = u64::try_from(pool_id)
            .map_err(|_| KeeperError::Validation(format!("negative pool id {}", pool_id)))?;

        match self.chain.settle_pool(chain_pool_id, outcome).await {
            Ok(tx) => {
                let tx_hash = tx.tx_hash_hex();
                let predicted = B256::from_str(&pool.predicted_outcome).ok();
                let creator_side_won = predicted.map(|p| p != outcome);
                self.pools
                    .mark_pool_settled(pool_id, creator_side_won, &format!("{:#x}", outcome), Some(&tx_hash))
                    .await?;
                info!(pool_id = pool_id, tx_hash = %tx_hash, creator_side_won = ?creator_side_won, "pool settled");
                Ok(SettleOutcome::Settled { pool_id, tx_hash })
            }
            Err(KeeperError::TxRevert { reason, tx_hash }) => match RevertClass::classify(&reason) {
                RevertClass::AlreadySettled => {
                    info!(pool_id = pool_id, "pool already settled on chain, syncing");
                    let on_chain = self.chain.pool(chain_pool_id).await?;
                    if on_chain.settled {
                        self.pools
                            .mark_pool_settled(
                                pool_id,
                                Some(on_chain.creator_side_won),
                                &format!("{:#x}", on_chain.result),
                                None,
                            )
                            .await?;
                    }
                    Ok(SettleOutcome::AlreadySettled { pool_id })
                }
                RevertClass::EventNotEnded => {
                    info!(pool_id = pool_id, "event not ended yet, settlement deferred");
                    Ok(SettleOutcome::NotEnded { pool_id })
                }
                RevertClass::OnlyGuidedOracle => {
                    error!(pool_id = pool_id, reason = %reason, "oracle signer is not authorized to settle");
                    Err(KeeperError::InvariantViolation(format!(
                        "settlement of pool {} rejected: {}",
                        pool_id, reason
                    )))
                }
                RevertClass::Other => Err(KeeperError::TxRevert { reason, tx_hash }),
            },
            Err(e) => Err(e),
        }
    }

    /// Settle ended guided pools whose outcome the oracle already holds.
    /// The pass continues past unclassified reverts and then returns the
    /// first one, so the run is logged `failed` and retried with backoff.
    pub async fn settle_due_pools(&self, ctx: &JobContext, now: DateTime<Utc>) -> Result<FallbackSummary> {
        let mut summary = FallbackSummary::default();
        let mut first_revert = None;
        let due: Vec<PoolRecord> = self
            .pools
            .unsettled_pools()
            .await?
            .into_iter()
            .filter(|p| p.oracle_type == OracleType::Guided && p.event_end_time <= now)
            .collect();

        for pool in &due {
            ctx.ensure_active()?;
            summary.checked += 1;

            let mut data = self.chain.oracle_outcome(&pool.market_id).await?;
            let cleaned = clean_market_id(&pool.market_id);
            if data.is_none() && cleaned != pool.market_id {
                data = self.chain.oracle_outcome(cleaned).await?;
            }
            let Some(data) = data else {
                summary.awaiting_outcome += 1;
                continue;
            };

            match self.settle_pool(pool, outcome_bytes32(&data)).await {
                Ok(SettleOutcome::Settled { .. }) => summary.settled += 1,
                Ok(SettleOutcome::AlreadySettled { .. }) => summary.already_settled += 1,
                Ok(SettleOutcome::NotEnded { .. }) => summary.not_ended += 1,
                Ok(SettleOutcome::Skipped { .. }) | Ok(SettleOutcome::Deferred { .. }) => {}
                Err(e) if e.kind() == ErrorKind::TxRevert => {
                    summary.failed += 1;
                    error!(pool_id = pool.pool_id, error = %e, "fallback settlement reverted");
                    first_revert.get_or_insert(e);
                }
                Err(e) if e.is_retriable() => {
                    summary.failed += 1;
                    warn!(pool_id = pool.pool_id, error = %e, "fallback settlement failed");
                }
                Err(e) => return Err(e),
            }
        }

        if summary.checked > 0 {
            info!(
                checked = summary.checked,
                settled = summary.settled,
                awaiting = summary.awaiting_outcome,
                failed = summary.failed,
                "settlement fallback pass finished"
            );
        }
        match first_revert {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_market_id() {
        assert_eq!(clean_market_id("\u{1}\u{2}Bayern vs Union"), "Bayern vs Union");
        assert_eq!(clean_market_id("Bayern vs Union"), "Bayern vs Union");
        assert_eq!(clean_market_id("\n\t"), "");
    }

    #[test]
    fn test_market_matches_cleaned_variant() {
        let h = market_id_hash("Bayern vs Union");
        assert!(market_matches("\u{1}\u{2}Bayern vs Union", h));
        assert!(market_matches("Bayern vs Union", h));
        assert!(!market_matches("Bayern vs Dortmund", h));
    }

    #[test]
    fn test_outcome_bytes32() {
        let short = outcome_bytes32(b"Home");
        assert_eq!(&short[..4], b"Home");
        assert!(short[4..].iter().all(|b| *b == 0));

        let exact = [7u8; 32];
        assert_eq!(outcome_bytes32(&exact), B256::from(exact));

        let long = [1u8; 40];
        assert_eq!(outcome_bytes32(&long), keccak256(&long));
    }

    #[test]
    fn test_revert_classes() {
        assert_eq!(RevertClass::classify("Only guided oracle"), RevertClass::OnlyGuidedOracle);
        assert_eq!(RevertClass::classify("Event not ended yet"), RevertClass::EventNotEnded);
        assert_eq!(RevertClass::classify("Pool already settled"), RevertClass::AlreadySettled);
        assert_eq!(RevertClass::classify("out of gas"), RevertClass::Other);
        assert!(!RevertClass::EventNotEnded.is_retriable());
        assert!(RevertClass::Other.is_retriable());
    }
}
