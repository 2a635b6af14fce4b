//! Typed views of on-chain state and write results.

use crate::config::GasCeilings;
use crate::error::{KeeperError, Result};
use crate::outcome::{BetType, CycleState, MatchResultCodes, OracleType};
use crate::store::models::{PoolRecord, SlipPrediction, SlipRecord};
use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use super::abi;

/// Deployed contract addresses the gateway talks to.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractAddresses {
    pub oddyssey: Address,
    pub pool: Address,
    pub guided_oracle: Address,
    pub reputation: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStatus {
    pub exists: bool,
    pub state: CycleState,
    /// Unix seconds at which betting closes.
    pub end_time: u64,
    pub prize_pool: U256,
    pub slip_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainMatch {
    pub id: u64,
    pub start_time: u64,
    pub odds_home: u32,
    pub odds_draw: u32,
    pub odds_away: u32,
    pub odds_over: u32,
    pub odds_under: u32,
    pub result: MatchResultCodes,
}

/// A prediction in contract array form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainPrediction {
    pub match_id: u64,
    pub bet_type: u8,
    pub selection: B256,
    pub selected_odd: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainSlip {
    pub slip_id: u64,
    pub player: Address,
    pub cycle_id: u64,
    pub placed_at: u64,
    pub predictions: Vec<OnChainPrediction>,
    pub final_score: U256,
    pub correct_count: u8,
    pub is_evaluated: bool,
}

impl OnChainSlip {
    /// Decode predictions into object form. Unknown selection hashes or bet
    /// type codes are a validation error.
    pub fn decode_predictions(&self) -> Result<Vec<SlipPrediction>> {
        self.predictions
            .iter()
            .map(|p| {
                let selection = abi::selection_from_hash(p.selection).ok_or_else(|| {
                    KeeperError::Validation(format!(
                        "slip {} match {}: unknown selection hash {:#x}",
                        self.slip_id, p.match_id, p.selection
                    ))
                })?;
                let bet_type = BetType::from_u8(p.bet_type)?;
                if selection.bet_type() != bet_type {
                    return Err(KeeperError::Validation(format!(
                        "slip {} match {}: selection {} does not belong to bet type {:?}",
                        self.slip_id,
                        p.match_id,
                        selection.as_str(),
                        bet_type
                    )));
                }
                Ok(SlipPrediction {
                    match_id: to_i64(p.match_id, "match id")?,
                    bet_type,
                    selection,
                    selected_odd: p.selected_odd,
                })
            })
            .collect()
    }

    pub fn to_record(&self, tx_hash: Option<String>) -> Result<SlipRecord> {
        Ok(SlipRecord {
            slip_id: to_i64(self.slip_id, "slip id")?,
            cycle_id: to_i64(self.cycle_id, "cycle id")?,
            player: format!("{:#x}", self.player),
            placed_at: unix_to_datetime(self.placed_at)?,
            predictions: self.decode_predictions()?,
            is_evaluated: false,
            correct_count: None,
            final_score: None,
            tx_hash,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainPool {
    pub pool_id: u64,
    pub creator: Address,
    pub odds: u16,
    pub settled: bool,
    pub creator_side_won: bool,
    pub is_private: bool,
    pub uses_bitr: bool,
    pub oracle_type: OracleType,
    pub predicted_outcome: B256,
    pub result: B256,
    pub market_id: String,
    pub creator_stake: U256,
    pub event_start_time: u64,
    pub event_end_time: u64,
    pub betting_end_time: u64,
}

impl OnChainPool {
    /// Row form. Settlement columns are left for `mark_pool_settled`.
    pub fn to_record(&self, tx_hash: Option<String>) -> Result<PoolRecord> {
        Ok(PoolRecord {
            pool_id: to_i64(self.pool_id, "pool id")?,
            creator: format!("{:#x}", self.creator),
            predicted_outcome: format!("{:#x}", self.predicted_outcome),
            odds: i32::from(self.odds),
            creator_stake: self.creator_stake.to_string(),
            event_start_time: unix_to_datetime(self.event_start_time)?,
            event_end_time: unix_to_datetime(self.event_end_time)?,
            betting_end_time: unix_to_datetime(self.betting_end_time)?,
            oracle_type: self.oracle_type,
            market_id: self.market_id.clone(),
            is_private: self.is_private,
            uses_bitr: self.uses_bitr,
            settled: false,
            creator_side_won: None,
            result: None,
            settlement_tx_hash: None,
            tx_hash,
        })
    }
}

/// Arguments of `createPool`.
#[derive(Debug, Clone)]
pub struct CreatePoolParams {
    pub predicted_outcome: B256,
    pub odds: u16,
    pub creator_stake: U256,
    pub event_start_time: u64,
    pub event_end_time: u64,
    pub league: String,
    pub category: String,
    pub market_id: String,
    pub is_private: bool,
    pub max_bet_per_user: U256,
    pub uses_bitr: bool,
    pub oracle_type: OracleType,
}

/// The signed writes the gateway knows how to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    StartCycle,
    ResolveCycle,
    EvaluateSlip,
    SettlePool,
    PlaceSlip,
    CreatePool,
    Claim,
}

impl WriteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteKind::StartCycle => "start_cycle",
            WriteKind::ResolveCycle => "resolve_cycle",
            WriteKind::EvaluateSlip => "evaluate_slip",
            WriteKind::SettlePool => "settle_pool",
            WriteKind::PlaceSlip => "place_slip",
            WriteKind::CreatePool => "create_pool",
            WriteKind::Claim => "claim",
        }
    }

    /// Gas limit used when estimation reverts.
    pub fn ceiling(&self, ceilings: &GasCeilings) -> u64 {
        match self {
            WriteKind::StartCycle => ceilings.start_cycle,
            WriteKind::ResolveCycle => ceilings.resolve_cycle,
            WriteKind::EvaluateSlip => ceilings.evaluate_slip,
            WriteKind::SettlePool => ceilings.settle_pool,
            WriteKind::PlaceSlip => ceilings.place_slip,
            WriteKind::CreatePool => ceilings.create_pool,
            WriteKind::Claim => ceilings.claim,
        }
    }
}

impl std::fmt::Display for WriteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a write will cost, computed before broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasEstimate {
    pub estimate: u64,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub total_cost_wei: U256,
    /// Estimation reverted and the per-write ceiling was used.
    pub used_ceiling: bool,
}

impl GasEstimate {
    /// `gas_limit = estimate × (100 + buffer_pct) / 100`, or the ceiling when
    /// estimation reverted. Total cost includes the value sent.
    pub fn compute(estimate: Option<u64>, ceiling: u64, buffer_pct: u64, gas_price: u128, value: U256) -> Self {
        let (estimate, gas_limit, used_ceiling) = match estimate {
            Some(e) => (e, e.saturating_mul(100 + buffer_pct) / 100, false),
            None => (ceiling, ceiling, true),
        };
        let total_cost_wei = U256::from(gas_limit) * U256::from(gas_price) + value;
        Self {
            estimate,
            gas_limit,
            gas_price,
            total_cost_wei,
            used_ceiling,
        }
    }
}

/// A mined, successful transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutcome {
    pub tx_hash: B256,
    pub gas_used: u64,
    pub block_number: Option<u64>,
    pub gas: GasEstimate,
}

impl TxOutcome {
    pub fn tx_hash_hex(&self) -> String {
        format!("{:#x}", self.tx_hash)
    }
}

pub fn unix_to_datetime(secs: u64) -> Result<DateTime<Utc>> {
    let secs = i64::try_from(secs)
        .map_err(|_| KeeperError::Validation(format!("timestamp {} out of range", secs)))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| KeeperError::Validation(format!("timestamp {} out of range", secs)))
}

pub fn to_i64(v: u64, what: &str) -> Result<i64> {
    i64::try_from(v).map_err(|_| KeeperError::Validation(format!("{} {} exceeds i64", what, v)))
}

/// Narrow a uint256 id to u64.
pub fn u256_to_u64(v: U256, what: &str) -> Result<u64> {
    u64::try_from(v).map_err(|_| KeeperError::Validation(format!("{} {} exceeds u64", what, v)))
}
