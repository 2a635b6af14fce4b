//! Relational store capabilities.
//!
//! Each component depends only on the capability it needs:
//! - `LockStore` / `AlertStore`: job coordination and alerting (`system.*`)
//! - `ResultStore`: fixtures and canonical results
//! - `CycleStore`: Oddyssey cycles and slips
//! - `PoolStore`: pools, bets, liquidity, claims, market-id reverse lookup
//! - `CursorStore`: indexer cursors
//!
//! `PgStore` is the production implementation. `MemoryStore` implements the
//! same invariants in memory and backs the test suite.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PgStore;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert a lock row and its `started` execution-log row atomically.
    /// Returns `false` without writing anything when the job is already locked.
    async fn insert_lock(&self, lock: &CronLock) -> Result<bool>;

    /// Delete the lock only if it still belongs to `execution_id`.
    async fn delete_lock(&self, job_name: &str, execution_id: Uuid) -> Result<bool>;

    /// Delete every lock with `expires_at < now` and move their `started`
    /// log rows to `timeout`. Returns the deleted locks.
    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<CronLock>>;

    async fn find_lock(&self, job_name: &str) -> Result<Option<CronLock>>;

    async fn list_locks(&self) -> Result<Vec<CronLock>>;

    /// Unconditionally delete a job's lock, returning it if one existed.
    async fn remove_lock(&self, job_name: &str) -> Result<Option<CronLock>>;

    /// Move an execution to a terminal status, recording completion time,
    /// duration and error.
    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Move every `started` row of a job to `status`. Returns rows changed.
    async fn finish_started_executions(
        &self,
        job_name: &str,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Most recent execution of a job started at or after `since`.
    async fn latest_execution(
        &self,
        job_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ExecutionLogEntry>>;

    async fn recent_executions(&self, limit: i64) -> Result<Vec<ExecutionLogEntry>>;

    /// Delete finished log rows older than `before`.
    async fn prune_execution_log(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn record_alert(&self, alert: &SystemAlert) -> Result<()>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a fixture; identity fields are immutable, so an existing row is
    /// left untouched.
    async fn insert_fixture(&self, fixture: &Fixture) -> Result<bool>;

    async fn fixtures(&self, ids: &[i64]) -> Result<Vec<Fixture>>;

    async fn fixtures_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Fixture>>;

    /// Write a canonical result. Rejects non-canonical strings
    /// (`KeeperError::Validation`) and never clears a set outcome.
    async fn upsert_fixture_result(&self, result: &FixtureResultRecord) -> Result<()>;

    async fn fixture_results(&self, ids: &[i64]) -> Result<Vec<FixtureResultRecord>>;

    /// Fixtures of unresolved cycles that kicked off at least two hours
    /// before `now` and still have no complete result row.
    async fn fixtures_awaiting_results(&self, now: DateTime<Utc>) -> Result<Vec<i64>>;

    /// Retention: delete fixtures (and their results) that kicked off before
    /// `before` and are not referenced by any cycle.
    async fn prune_fixtures(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait CycleStore: Send + Sync {
    /// Insert or refresh a cycle. A resolved cycle's matches are frozen.
    async fn upsert_cycle(&self, cycle: &OddysseyCycle) -> Result<()>;

    async fn cycle(&self, cycle_id: i64) -> Result<Option<OddysseyCycle>>;

    async fn latest_cycle(&self) -> Result<Option<OddysseyCycle>>;

    async fn unresolved_cycles(&self) -> Result<Vec<OddysseyCycle>>;

    /// Resolved cycles whose evaluation has not completed.
    async fn cycles_pending_evaluation(&self) -> Result<Vec<OddysseyCycle>>;

    async fn mark_cycle_resolved(
        &self,
        cycle_id: i64,
        tx_hash: Option<&str>,
        prize_pool: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_evaluation_completed(&self, cycle_id: i64, completed: bool) -> Result<()>;

    /// Insert a slip keyed by `(slip_id, cycle_id)`; `false` if it exists.
    async fn insert_slip(&self, slip: &SlipRecord) -> Result<bool>;

    async fn slip(&self, slip_id: i64) -> Result<Option<SlipRecord>>;

    async fn slips_for_cycle(&self, cycle_id: i64) -> Result<Vec<SlipRecord>>;

    async fn unevaluated_slips(&self, cycle_id: i64) -> Result<Vec<SlipRecord>>;

    async fn mark_slip_evaluated(&self, slip_id: i64, correct_count: i16, final_score: &str) -> Result<()>;

    /// Clear a slip's evaluation so it is picked up again (repair path).
    async fn reset_slip_evaluation(&self, slip_id: i64) -> Result<()>;
}

#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Insert a pool or refresh its non-terminal fields. Settlement columns
    /// are only written by `mark_pool_settled`.
    async fn upsert_pool(&self, pool: &PoolRecord) -> Result<()>;

    async fn pool(&self, pool_id: i64) -> Result<Option<PoolRecord>>;

    async fn unsettled_pools(&self) -> Result<Vec<PoolRecord>>;

    /// Settlement is terminal; a second call is a no-op returning `false`.
    async fn mark_pool_settled(
        &self,
        pool_id: i64,
        creator_side_won: Option<bool>,
        result: &str,
        tx_hash: Option<&str>,
    ) -> Result<bool>;

    /// Reverse lookup for indexed-string event arguments.
    async fn record_market_id(&self, hash: &str, market_id: &str) -> Result<()>;

    async fn lookup_market_id(&self, hash: &str) -> Result<Option<String>>;

    async fn insert_bet(&self, bet: &BetRecord) -> Result<bool>;

    async fn bets_for_pool(&self, pool_id: i64) -> Result<Vec<BetRecord>>;

    async fn bet_totals(&self, pool_id: i64) -> Result<BetTotals>;

    async fn insert_liquidity(&self, lp: &LiquidityRecord) -> Result<bool>;

    async fn insert_prize_claim(&self, claim: &PrizeClaimRecord) -> Result<bool>;
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn cursor(&self, contract: &str, stream: &str) -> Result<Option<u64>>;

    /// Advance monotonically; a lower block never moves the cursor back.
    async fn advance_cursor(&self, contract: &str, stream: &str, block: u64) -> Result<()>;
}

/// Every capability at once, for wiring.
pub trait KeeperStore: LockStore + AlertStore + ResultStore + CycleStore + PoolStore + CursorStore {}

impl<T> KeeperStore for T where T: LockStore + AlertStore + ResultStore + CycleStore + PoolStore + CursorStore {}
