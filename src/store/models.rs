//! Row types for the `oracle.*` and `system.*` schemas.

use crate::outcome::{BetType, OracleType, Selection};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Fixtures ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureOdds {
    pub home: Option<Decimal>,
    pub draw: Option<Decimal>,
    pub away: Option<Decimal>,
    pub over_25: Option<Decimal>,
    pub under_25: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub id: i64,
    pub home_team: String,
    pub away_team: String,
    pub league: String,
    pub kickoff: DateTime<Utc>,
    pub odds: FixtureOdds,
}

/// A row of `oracle.fixture_results` as stored. Outcome columns are plain
/// strings here because this is the boundary the format trigger guards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureResultRecord {
    pub fixture_id: i64,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub outcome_1x2: Option<String>,
    pub outcome_ou25: Option<String>,
    pub outcome_btts: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ─── Oddyssey ────────────────────────────────────────────────────────────────

/// One match of a cycle with the odds snapshot taken when the cycle opened.
/// Odds are contract-scaled (decimal odds × 1000).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleMatch {
    pub fixture_id: i64,
    pub kickoff: DateTime<Utc>,
    pub odds_home: u32,
    pub odds_draw: u32,
    pub odds_away: u32,
    pub odds_over: u32,
    pub odds_under: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddysseyCycle {
    pub cycle_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub matches: Vec<CycleMatch>,
    /// Wei, decimal string.
    pub prize_pool: String,
    pub is_resolved: bool,
    pub resolution_tx_hash: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub evaluation_completed: bool,
}

impl OddysseyCycle {
    pub fn match_ids(&self) -> Vec<i64> {
        self.matches.iter().map(|m| m.fixture_id).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlipPrediction {
    pub match_id: i64,
    pub bet_type: BetType,
    pub selection: Selection,
    pub selected_odd: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlipRecord {
    pub slip_id: i64,
    pub cycle_id: i64,
    pub player: String,
    pub placed_at: DateTime<Utc>,
    pub predictions: Vec<SlipPrediction>,
    pub is_evaluated: bool,
    pub correct_count: Option<i16>,
    /// Decimal string; the contract score is a uint256 product of odds.
    pub final_score: Option<String>,
    pub tx_hash: Option<String>,
}

// ─── Pools ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub pool_id: i64,
    pub creator: String,
    /// 0x-prefixed bytes32.
    pub predicted_outcome: String,
    pub odds: i32,
    /// Wei, decimal string.
    pub creator_stake: String,
    pub event_start_time: DateTime<Utc>,
    pub event_end_time: DateTime<Utc>,
    pub betting_end_time: DateTime<Utc>,
    pub oracle_type: OracleType,
    pub market_id: String,
    pub is_private: bool,
    pub uses_bitr: bool,
    pub settled: bool,
    pub creator_side_won: Option<bool>,
    pub result: Option<String>,
    pub settlement_tx_hash: Option<String>,
    pub tx_hash: Option<String>,
}

impl PoolRecord {
    /// `bettingEndTime ≤ eventStartTime ≤ eventEndTime`.
    pub fn has_valid_schedule(&self) -> bool {
        self.betting_end_time <= self.event_start_time && self.event_start_time <= self.event_end_time
    }
}

/// Event-derived rows carry the log coordinates they came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRef {
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetRecord {
    pub log: LogRef,
    pub pool_id: i64,
    pub bettor: String,
    /// Wei, decimal string.
    pub amount: String,
    pub is_for_outcome: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityRecord {
    pub log: LogRef,
    pub pool_id: i64,
    pub provider: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeClaimRecord {
    pub log: LogRef,
    pub pool_id: i64,
    pub claimant: String,
    pub amount: String,
}

/// Aggregate over a pool's bets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BetTotals {
    pub bet_count: u64,
    /// Wei, decimal string.
    pub total_amount: String,
}

// ─── Coordination ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Completed,
    Failed,
    Timeout,
    ForceReleased,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Started => "started",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::ForceReleased => "force_released",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(ExecutionStatus::Started),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "timeout" => Some(ExecutionStatus::Timeout),
            "force_released" => Some(ExecutionStatus::ForceReleased),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Started)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronLock {
    pub job_name: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub execution_id: Uuid,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub job_name: String,
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub alert_type: String,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
