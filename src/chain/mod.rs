//! Chain gateway: typed contract reads and signed writes.
//!
//! - `abi`: minimal contract ABIs, topic hashes, keccak helpers
//! - `types`: typed views of contract state and write results
//! - `gateway`: `EvmGateway`, the alloy-backed implementation
//!
//! Writes never touch the relational store. Callers persist what a
//! successful `TxOutcome` implies.

pub mod abi;
pub mod gateway;
pub mod types;

use crate::error::{KeeperError, Result};
use crate::outcome::{incomplete_count, MatchResultCodes};
use crate::results::MATCHES_PER_CYCLE;
use crate::store::models::{CycleMatch, SlipPrediction};
use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

pub use gateway::EvmGateway;
pub use types::*;

#[async_trait]
pub trait ChainGateway: Send + Sync {
    // ─── Reads ───────────────────────────────────────────────────────────

    async fn current_cycle_id(&self) -> Result<u64>;

    async fn cycle_status(&self, cycle_id: u64) -> Result<CycleStatus>;

    async fn cycle_matches(&self, cycle_id: u64) -> Result<Vec<OnChainMatch>>;

    async fn slip(&self, slip_id: u64) -> Result<OnChainSlip>;

    async fn pool(&self, pool_id: u64) -> Result<OnChainPool>;

    async fn reputation(&self, user: Address) -> Result<U256>;

    /// The guided oracle's stored result for a market, if one was submitted.
    async fn oracle_outcome(&self, market_id: &str) -> Result<Option<Bytes>>;

    // ─── Writes ──────────────────────────────────────────────────────────

    async fn start_daily_cycle(&self, matches: &[CycleMatch]) -> Result<TxOutcome>;

    /// Implementations must call [`check_resolve_inputs`] before any RPC.
    async fn resolve_cycle(&self, cycle_id: u64, results: &[MatchResultCodes]) -> Result<TxOutcome>;

    async fn evaluate_slip(&self, slip_id: u64) -> Result<TxOutcome>;

    async fn place_slip(&self, predictions: &[SlipPrediction], entry_fee: U256) -> Result<TxOutcome>;

    /// `settlePool(poolId, outcome)` sent through the guided oracle's
    /// `executeCall`.
    async fn settle_pool(&self, pool_id: u64, outcome: B256) -> Result<TxOutcome>;

    async fn create_pool(&self, params: &CreatePoolParams, value: U256) -> Result<TxOutcome>;

    async fn claim(&self, pool_id: u64) -> Result<TxOutcome>;
}

/// The resolve guard: exactly ten matches, none with a `NotSet` field.
pub fn check_resolve_inputs(cycle_id: u64, results: &[MatchResultCodes]) -> Result<()> {
    if results.len() != MATCHES_PER_CYCLE {
        return Err(KeeperError::InvariantViolation(format!(
            "Cannot resolve cycle {}: expected {} results, got {}",
            cycle_id,
            MATCHES_PER_CYCLE,
            results.len()
        )));
    }
    let missing = incomplete_count(results);
    if missing > 0 {
        return Err(KeeperError::IncompleteResults { cycle_id, missing });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{MoneylineCode, OverUnderCode};

    fn complete() -> MatchResultCodes {
        MatchResultCodes {
            moneyline: MoneylineCode::HomeWin,
            over_under: OverUnderCode::Under,
        }
    }

    #[test]
    fn test_guard_accepts_complete() {
        assert!(check_resolve_inputs(1, &[complete(); 10]).is_ok());
    }

    #[test]
    fn test_guard_counts_each_incomplete_match() {
        let mut results = [complete(); 10];
        results[4].moneyline = MoneylineCode::NotSet;
        results[4].over_under = OverUnderCode::NotSet;
        results[7].over_under = OverUnderCode::NotSet;
        let err = check_resolve_inputs(9, &results).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot resolve cycle 9: 2 match(es) have NotSet results"
        );
    }

    #[test]
    fn test_guard_rejects_wrong_length() {
        assert!(matches!(
            check_resolve_inputs(1, &[complete(); 9]),
            Err(KeeperError::InvariantViolation(_))
        ));
    }
}
