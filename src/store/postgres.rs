//! Postgres implementation of every store capability.
//!
//! Queries are built at runtime with `sqlx::query(..).bind(..)`. Wei amounts
//! live in `NUMERIC(78,0)` columns; they are bound as text with a `::numeric`
//! cast and read back with `::text` so no precision is lost.

use super::*;
use crate::error::KeeperError;
use crate::outcome::validate_result_strings;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const LOCK_COLUMNS: &str = "job_name, locked_by, locked_at, expires_at, execution_id, metadata";

const EXECUTION_COLUMNS: &str = "id::bigint AS id, job_name, execution_id, status, started_at, \
     completed_at, duration_ms, error_message, metadata";

const FIXTURE_COLUMNS: &str = "id, home_team, away_team, league, kickoff, odds_home, odds_draw, \
     odds_away, odds_over_25, odds_under_25";

const RESULT_COLUMNS: &str = "fixture_id, home_score, away_score, outcome_1x2, outcome_ou25, \
     outcome_btts, finished_at";

const CYCLE_COLUMNS: &str = "cycle_id, start_time, end_time, matches, prize_pool::text AS prize_pool, \
     is_resolved, resolution_tx_hash, resolved_at, evaluation_completed";

const SLIP_COLUMNS: &str = "slip_id, cycle_id, player, placed_at, predictions, is_evaluated, \
     correct_count, final_score::text AS final_score, tx_hash";

const POOL_COLUMNS: &str = "pool_id, creator, predicted_outcome, odds, creator_stake::text AS creator_stake, \
     event_start_time, event_end_time, betting_end_time, oracle_type, market_id, is_private, uses_bitr, \
     settled, creator_side_won, result, settlement_tx_hash, tx_hash";

/// Fixture is referenced by some cycle's `matches` JSON array.
const IN_ANY_CYCLE: &str = "EXISTS (SELECT 1 FROM oracle.oddyssey_cycles c \
     WHERE c.matches @> jsonb_build_array(jsonb_build_object('fixture_id', f.id)))";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open a small pool of short-lived connections. `statement_timeout` is
    /// applied to every session at connect time.
    pub async fn connect(url: &str, max_connections: u32, statement_timeout: Duration) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| KeeperError::Config(format!("invalid database url: {}", e)))?
            .options([("statement_timeout", statement_timeout.as_millis().to_string())]);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(60))
            .connect_with(options)
            .await
            .map_err(KeeperError::from_db)?;

        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pg_pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        schema::migrate(&self.pool).await
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(KeeperError::from_db)?;
        Ok(())
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn lock_from_row(row: &PgRow) -> Result<CronLock> {
    Ok(CronLock {
        job_name: row.try_get("job_name")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        expires_at: row.try_get("expires_at")?,
        execution_id: row.try_get("execution_id")?,
        metadata: row.try_get("metadata")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionLogEntry> {
    let status: String = row.try_get("status")?;
    Ok(ExecutionLogEntry {
        id: row.try_get("id")?,
        job_name: row.try_get("job_name")?,
        execution_id: row.try_get("execution_id")?,
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| KeeperError::Validation(format!("unknown execution status {:?}", status)))?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        error_message: row.try_get("error_message")?,
        metadata: row.try_get("metadata")?,
    })
}

fn fixture_from_row(row: &PgRow) -> Result<Fixture> {
    Ok(Fixture {
        id: row.try_get("id")?,
        home_team: row.try_get("home_team")?,
        away_team: row.try_get("away_team")?,
        league: row.try_get("league")?,
        kickoff: row.try_get("kickoff")?,
        odds: FixtureOdds {
            home: row.try_get("odds_home")?,
            draw: row.try_get("odds_draw")?,
            away: row.try_get("odds_away")?,
            over_25: row.try_get("odds_over_25")?,
            under_25: row.try_get("odds_under_25")?,
        },
    })
}

fn result_from_row(row: &PgRow) -> Result<FixtureResultRecord> {
    Ok(FixtureResultRecord {
        fixture_id: row.try_get("fixture_id")?,
        home_score: row.try_get("home_score")?,
        away_score: row.try_get("away_score")?,
        outcome_1x2: row.try_get("outcome_1x2")?,
        outcome_ou25: row.try_get("outcome_ou25")?,
        outcome_btts: row.try_get("outcome_btts")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn cycle_from_row(row: &PgRow) -> Result<OddysseyCycle> {
    let matches: Json<Vec<CycleMatch>> = row.try_get("matches")?;
    Ok(OddysseyCycle {
        cycle_id: row.try_get("cycle_id")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        matches: matches.0,
        prize_pool: row.try_get("prize_pool")?,
        is_resolved: row.try_get("is_resolved")?,
        resolution_tx_hash: row.try_get("resolution_tx_hash")?,
        resolved_at: row.try_get("resolved_at")?,
        evaluation_completed: row.try_get("evaluation_completed")?,
    })
}

fn slip_from_row(row: &PgRow) -> Result<SlipRecord> {
    let predictions: Json<Vec<SlipPrediction>> = row.try_get("predictions")?;
    Ok(SlipRecord {
        slip_id: row.try_get("slip_id")?,
        cycle_id: row.try_get("cycle_id")?,
        player: row.try_get("player")?,
        placed_at: row.try_get("placed_at")?,
        predictions: predictions.0,
        is_evaluated: row.try_get("is_evaluated")?,
        correct_count: row.try_get("correct_count")?,
        final_score: row.try_get("final_score")?,
        tx_hash: row.try_get("tx_hash")?,
    })
}

fn pool_from_row(row: &PgRow) -> Result<PoolRecord> {
    let oracle_type: String = row.try_get("oracle_type")?;
    Ok(PoolRecord {
        pool_id: row.try_get("pool_id")?,
        creator: row.try_get("creator")?,
        predicted_outcome: row.try_get("predicted_outcome")?,
        odds: row.try_get("odds")?,
        creator_stake: row.try_get("creator_stake")?,
        event_start_time: row.try_get("event_start_time")?,
        event_end_time: row.try_get("event_end_time")?,
        betting_end_time: row.try_get("betting_end_time")?,
        oracle_type: oracle_type.parse()?,
        market_id: row.try_get("market_id")?,
        is_private: row.try_get("is_private")?,
        uses_bitr: row.try_get("uses_bitr")?,
        settled: row.try_get("settled")?,
        creator_side_won: row.try_get("creator_side_won")?,
        result: row.try_get("result")?,
        settlement_tx_hash: row.try_get("settlement_tx_hash")?,
        tx_hash: row.try_get("tx_hash")?,
    })
}

fn log_ref_from_row(row: &PgRow) -> Result<LogRef> {
    Ok(LogRef {
        tx_hash: row.try_get("tx_hash")?,
        log_index: row.try_get("log_index")?,
        block_number: row.try_get("block_number")?,
    })
}

// ─── Coordination ────────────────────────────────────────────────────────────

#[async_trait]
impl LockStore for PgStore {
    async fn insert_lock(&self, lock: &CronLock) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(KeeperError::from_db)?;

        let inserted = sqlx::query(
            "INSERT INTO system.cron_locks (job_name, locked_by, locked_at, expires_at, execution_id, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (job_name) DO NOTHING",
        )
        .bind(&lock.job_name)
        .bind(&lock.locked_by)
        .bind(lock.locked_at)
        .bind(lock.expires_at)
        .bind(lock.execution_id)
        .bind(&lock.metadata)
        .execute(&mut *tx)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(KeeperError::from_db)?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO system.cron_execution_log (job_name, execution_id, status, started_at, metadata) \
             VALUES ($1, $2, 'started', $3, $4)",
        )
        .bind(&lock.job_name)
        .bind(lock.execution_id)
        .bind(lock.locked_at)
        .bind(&lock.metadata)
        .execute(&mut *tx)
        .await
        .map_err(KeeperError::from_db)?;

        tx.commit().await.map_err(KeeperError::from_db)?;
        Ok(true)
    }

    async fn delete_lock(&self, job_name: &str, execution_id: Uuid) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM system.cron_locks WHERE job_name = $1 AND execution_id = $2")
            .bind(job_name)
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(KeeperError::from_db)?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<CronLock>> {
        let mut tx = self.pool.begin().await.map_err(KeeperError::from_db)?;

        let rows = sqlx::query(&format!(
            "DELETE FROM system.cron_locks WHERE expires_at < $1 RETURNING {}",
            LOCK_COLUMNS
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(KeeperError::from_db)?;
        let expired = rows.iter().map(lock_from_row).collect::<Result<Vec<_>>>()?;

        if !expired.is_empty() {
            let ids: Vec<Uuid> = expired.iter().map(|l| l.execution_id).collect();
            sqlx::query(
                "UPDATE system.cron_execution_log \
                 SET status = 'timeout', completed_at = $2, \
                     duration_ms = (EXTRACT(EPOCH FROM ($2 - started_at)) * 1000)::bigint, \
                     error_message = 'lock expired' \
                 WHERE execution_id = ANY($1) AND status = 'started'",
            )
            .bind(&ids)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(KeeperError::from_db)?;
        }

        tx.commit().await.map_err(KeeperError::from_db)?;
        Ok(expired)
    }

    async fn find_lock(&self, job_name: &str) -> Result<Option<CronLock>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM system.cron_locks WHERE job_name = $1",
            LOCK_COLUMNS
        ))
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn list_locks(&self) -> Result<Vec<CronLock>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM system.cron_locks ORDER BY job_name",
            LOCK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter().map(lock_from_row).collect()
    }

    async fn remove_lock(&self, job_name: &str) -> Result<Option<CronLock>> {
        let row = sqlx::query(&format!(
            "DELETE FROM system.cron_locks WHERE job_name = $1 RETURNING {}",
            LOCK_COLUMNS
        ))
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE system.cron_execution_log \
             SET status = $2, completed_at = $3, \
                 duration_ms = (EXTRACT(EPOCH FROM ($3 - started_at)) * 1000)::bigint, \
                 error_message = $4 \
             WHERE execution_id = $1 AND status = 'started'",
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(completed_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        Ok(())
    }

    async fn finish_started_executions(
        &self,
        job_name: &str,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<u64> {
        let changed = sqlx::query(
            "UPDATE system.cron_execution_log \
             SET status = $2, completed_at = $3, \
                 duration_ms = (EXTRACT(EPOCH FROM ($3 - started_at)) * 1000)::bigint \
             WHERE job_name = $1 AND status = 'started'",
        )
        .bind(job_name)
        .bind(status.as_str())
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        Ok(changed)
    }

    async fn latest_execution(
        &self,
        job_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ExecutionLogEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM system.cron_execution_log \
             WHERE job_name = $1 AND started_at >= $2 \
             ORDER BY started_at DESC, id DESC LIMIT 1",
            EXECUTION_COLUMNS
        ))
        .bind(job_name)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn recent_executions(&self, limit: i64) -> Result<Vec<ExecutionLogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM system.cron_execution_log ORDER BY started_at DESC, id DESC LIMIT $1",
            EXECUTION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn prune_execution_log(&self, before: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM system.cron_execution_log WHERE started_at < $1 AND status <> 'started'",
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        Ok(deleted)
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn record_alert(&self, alert: &SystemAlert) -> Result<()> {
        sqlx::query(
            "INSERT INTO oracle.system_alerts (alert_type, message, details, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&alert.alert_type)
        .bind(&alert.message)
        .bind(&alert.details)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        Ok(())
    }
}

// ─── Fixtures & results ──────────────────────────────────────────────────────

#[async_trait]
impl ResultStore for PgStore {
    async fn insert_fixture(&self, fixture: &Fixture) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO oracle.fixtures \
             (id, home_team, away_team, league, kickoff, odds_home, odds_draw, odds_away, odds_over_25, odds_under_25) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(fixture.id)
        .bind(&fixture.home_team)
        .bind(&fixture.away_team)
        .bind(&fixture.league)
        .bind(fixture.kickoff)
        .bind(fixture.odds.home)
        .bind(fixture.odds.draw)
        .bind(fixture.odds.away)
        .bind(fixture.odds.over_25)
        .bind(fixture.odds.under_25)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();

        if inserted == 0 {
            // Identity is immutable; odds move only until a cycle picks the fixture.
            sqlx::query(&format!(
                "UPDATE oracle.fixtures f SET odds_home = $2, odds_draw = $3, odds_away = $4, \
                 odds_over_25 = $5, odds_under_25 = $6 \
                 WHERE f.id = $1 AND NOT {}",
                IN_ANY_CYCLE
            ))
            .bind(fixture.id)
            .bind(fixture.odds.home)
            .bind(fixture.odds.draw)
            .bind(fixture.odds.away)
            .bind(fixture.odds.over_25)
            .bind(fixture.odds.under_25)
            .execute(&self.pool)
            .await
            .map_err(KeeperError::from_db)?;
        }
        Ok(inserted > 0)
    }

    async fn fixtures(&self, ids: &[i64]) -> Result<Vec<Fixture>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM oracle.fixtures WHERE id = ANY($1) ORDER BY kickoff, id",
            FIXTURE_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter().map(fixture_from_row).collect()
    }

    async fn fixtures_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Fixture>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM oracle.fixtures WHERE kickoff >= $1 AND kickoff <= $2 ORDER BY kickoff, id",
            FIXTURE_COLUMNS
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter().map(fixture_from_row).collect()
    }

    async fn upsert_fixture_result(&self, result: &FixtureResultRecord) -> Result<()> {
        validate_result_strings(
            result.outcome_1x2.as_deref(),
            result.outcome_ou25.as_deref(),
            result.outcome_btts.as_deref(),
        )?;
        sqlx::query(
            "INSERT INTO oracle.fixture_results \
             (fixture_id, home_score, away_score, outcome_1x2, outcome_ou25, outcome_btts, finished_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (fixture_id) DO UPDATE SET \
                 home_score = COALESCE(EXCLUDED.home_score, oracle.fixture_results.home_score), \
                 away_score = COALESCE(EXCLUDED.away_score, oracle.fixture_results.away_score), \
                 outcome_1x2 = COALESCE(EXCLUDED.outcome_1x2, oracle.fixture_results.outcome_1x2), \
                 outcome_ou25 = COALESCE(EXCLUDED.outcome_ou25, oracle.fixture_results.outcome_ou25), \
                 outcome_btts = COALESCE(EXCLUDED.outcome_btts, oracle.fixture_results.outcome_btts), \
                 finished_at = COALESCE(EXCLUDED.finished_at, oracle.fixture_results.finished_at), \
                 updated_at = NOW()",
        )
        .bind(result.fixture_id)
        .bind(result.home_score)
        .bind(result.away_score)
        .bind(result.outcome_1x2.as_deref())
        .bind(result.outcome_ou25.as_deref())
        .bind(result.outcome_btts.as_deref())
        .bind(result.finished_at)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        Ok(())
    }

    async fn fixture_results(&self, ids: &[i64]) -> Result<Vec<FixtureResultRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM oracle.fixture_results WHERE fixture_id = ANY($1) ORDER BY fixture_id",
            RESULT_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter().map(result_from_row).collect()
    }

    async fn fixtures_awaiting_results(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT f.id FROM oracle.fixtures f \
             LEFT JOIN oracle.fixture_results r ON r.fixture_id = f.id \
             WHERE f.kickoff <= $1::timestamptz - INTERVAL '2 hours' \
               AND (r.fixture_id IS NULL OR r.outcome_1x2 IS NULL OR r.outcome_ou25 IS NULL) \
               AND EXISTS (SELECT 1 FROM oracle.oddyssey_cycles c \
                           WHERE c.is_resolved = FALSE \
                             AND c.matches @> jsonb_build_array(jsonb_build_object('fixture_id', f.id))) \
             ORDER BY f.id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("id").map_err(KeeperError::from))
            .collect()
    }

    async fn prune_fixtures(&self, before: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(&format!(
            "WITH stale AS (SELECT f.id FROM oracle.fixtures f WHERE f.kickoff < $1 AND NOT {}), \
                  dropped AS (DELETE FROM oracle.fixture_results WHERE fixture_id IN (SELECT id FROM stale)) \
             DELETE FROM oracle.fixtures WHERE id IN (SELECT id FROM stale)",
            IN_ANY_CYCLE
        ))
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        Ok(deleted)
    }
}

// ─── Oddyssey ────────────────────────────────────────────────────────────────

#[async_trait]
impl CycleStore for PgStore {
    async fn upsert_cycle(&self, cycle: &OddysseyCycle) -> Result<()> {
        // Resolved rows are frozen: the WHERE clause turns the update into a no-op.
        sqlx::query(
            "INSERT INTO oracle.oddyssey_cycles \
             (cycle_id, start_time, end_time, matches, matches_count, prize_pool) \
             VALUES ($1, $2, $3, $4, $5, $6::numeric) \
             ON CONFLICT (cycle_id) DO UPDATE SET \
                 start_time = EXCLUDED.start_time, \
                 end_time = EXCLUDED.end_time, \
                 matches = EXCLUDED.matches, \
                 matches_count = EXCLUDED.matches_count, \
                 prize_pool = EXCLUDED.prize_pool, \
                 updated_at = NOW() \
             WHERE oracle.oddyssey_cycles.is_resolved = FALSE",
        )
        .bind(cycle.cycle_id)
        .bind(cycle.start_time)
        .bind(cycle.end_time)
        .bind(Json(&cycle.matches))
        .bind(cycle.matches.len() as i32)
        .bind(&cycle.prize_pool)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        Ok(())
    }

    async fn cycle(&self, cycle_id: i64) -> Result<Option<OddysseyCycle>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM oracle.oddyssey_cycles WHERE cycle_id = $1",
            CYCLE_COLUMNS
        ))
        .bind(cycle_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        row.as_ref().map(cycle_from_row).transpose()
    }

    async fn latest_cycle(&self) -> Result<Option<OddysseyCycle>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM oracle.oddyssey_cycles ORDER BY cycle_id DESC LIMIT 1",
            CYCLE_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        row.as_ref().map(cycle_from_row).transpose()
    }

    async fn unresolved_cycles(&self) -> Result<Vec<OddysseyCycle>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM oracle.oddyssey_cycles WHERE is_resolved = FALSE ORDER BY cycle_id",
            CYCLE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter().map(cycle_from_row).collect()
    }

    async fn cycles_pending_evaluation(&self) -> Result<Vec<OddysseyCycle>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM oracle.oddyssey_cycles \
             WHERE is_resolved = TRUE AND evaluation_completed = FALSE ORDER BY cycle_id",
            CYCLE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter().map(cycle_from_row).collect()
    }

    async fn mark_cycle_resolved(
        &self,
        cycle_id: i64,
        tx_hash: Option<&str>,
        prize_pool: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE oracle.oddyssey_cycles SET \
                 is_resolved = TRUE, \
                 resolution_tx_hash = COALESCE($2, resolution_tx_hash), \
                 prize_pool = COALESCE($3::numeric, prize_pool), \
                 resolved_at = COALESCE(resolved_at, $4), \
                 updated_at = NOW() \
             WHERE cycle_id = $1",
        )
        .bind(cycle_id)
        .bind(tx_hash)
        .bind(prize_pool)
        .bind(resolved_at)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        if updated == 0 {
            return Err(KeeperError::NotFound(format!("cycle {}", cycle_id)));
        }
        Ok(())
    }

    async fn set_evaluation_completed(&self, cycle_id: i64, completed: bool) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE oracle.oddyssey_cycles SET evaluation_completed = $2, updated_at = NOW() WHERE cycle_id = $1",
        )
        .bind(cycle_id)
        .bind(completed)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        if updated == 0 {
            return Err(KeeperError::NotFound(format!("cycle {}", cycle_id)));
        }
        Ok(())
    }

    async fn insert_slip(&self, slip: &SlipRecord) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO oracle.oddyssey_slips \
             (slip_id, cycle_id, player, placed_at, predictions, is_evaluated, correct_count, final_score, tx_hash) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8::numeric, $9) \
             ON CONFLICT DO NOTHING",
        )
        .bind(slip.slip_id)
        .bind(slip.cycle_id)
        .bind(&slip.player)
        .bind(slip.placed_at)
        .bind(Json(&slip.predictions))
        .bind(slip.is_evaluated)
        .bind(slip.correct_count)
        .bind(slip.final_score.as_deref())
        .bind(slip.tx_hash.as_deref())
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        Ok(inserted > 0)
    }

    async fn slip(&self, slip_id: i64) -> Result<Option<SlipRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM oracle.oddyssey_slips WHERE slip_id = $1",
            SLIP_COLUMNS
        ))
        .bind(slip_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        row.as_ref().map(slip_from_row).transpose()
    }

    async fn slips_for_cycle(&self, cycle_id: i64) -> Result<Vec<SlipRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM oracle.oddyssey_slips WHERE cycle_id = $1 ORDER BY slip_id",
            SLIP_COLUMNS
        ))
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter().map(slip_from_row).collect()
    }

    async fn unevaluated_slips(&self, cycle_id: i64) -> Result<Vec<SlipRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM oracle.oddyssey_slips \
             WHERE cycle_id = $1 AND is_evaluated = FALSE ORDER BY slip_id",
            SLIP_COLUMNS
        ))
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter().map(slip_from_row).collect()
    }

    async fn mark_slip_evaluated(&self, slip_id: i64, correct_count: i16, final_score: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE oracle.oddyssey_slips SET \
                 is_evaluated = TRUE, correct_count = $2, final_score = $3::numeric, evaluated_at = NOW() \
             WHERE slip_id = $1",
        )
        .bind(slip_id)
        .bind(correct_count)
        .bind(final_score)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        if updated == 0 {
            return Err(KeeperError::NotFound(format!("slip {}", slip_id)));
        }
        Ok(())
    }

    async fn reset_slip_evaluation(&self, slip_id: i64) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE oracle.oddyssey_slips SET \
                 is_evaluated = FALSE, correct_count = NULL, final_score = NULL, evaluated_at = NULL \
             WHERE slip_id = $1",
        )
        .bind(slip_id)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        if updated == 0 {
            return Err(KeeperError::NotFound(format!("slip {}", slip_id)));
        }
        Ok(())
    }
}

// ─── Pools ───────────────────────────────────────────────────────────────────

#[async_trait]
impl PoolStore for PgStore {
    async fn upsert_pool(&self, pool: &PoolRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO oracle.pools \
             (pool_id, creator, predicted_outcome, odds, creator_stake, event_start_time, event_end_time, \
              betting_end_time, oracle_type, market_id, is_private, uses_bitr, tx_hash) \
             VALUES ($1, $2, $3, $4, $5::numeric, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (pool_id) DO UPDATE SET \
                 odds = EXCLUDED.odds, \
                 creator_stake = EXCLUDED.creator_stake, \
                 event_start_time = EXCLUDED.event_start_time, \
                 event_end_time = EXCLUDED.event_end_time, \
                 betting_end_time = EXCLUDED.betting_end_time, \
                 is_private = EXCLUDED.is_private, \
                 uses_bitr = EXCLUDED.uses_bitr",
        )
        .bind(pool.pool_id)
        .bind(&pool.creator)
        .bind(&pool.predicted_outcome)
        .bind(pool.odds)
        .bind(&pool.creator_stake)
        .bind(pool.event_start_time)
        .bind(pool.event_end_time)
        .bind(pool.betting_end_time)
        .bind(pool.oracle_type.as_str())
        .bind(&pool.market_id)
        .bind(pool.is_private)
        .bind(pool.uses_bitr)
        .bind(pool.tx_hash.as_deref())
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        Ok(())
    }

    async fn pool(&self, pool_id: i64) -> Result<Option<PoolRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM oracle.pools WHERE pool_id = $1", POOL_COLUMNS))
            .bind(pool_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(KeeperError::from_db)?;
        row.as_ref().map(pool_from_row).transpose()
    }

    async fn unsettled_pools(&self) -> Result<Vec<PoolRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM oracle.pools WHERE settled = FALSE ORDER BY pool_id",
            POOL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter().map(pool_from_row).collect()
    }

    async fn mark_pool_settled(
        &self,
        pool_id: i64,
        creator_side_won: Option<bool>,
        result: &str,
        tx_hash: Option<&str>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE oracle.pools SET \
                 settled = TRUE, creator_side_won = $2, result = $3, settlement_tx_hash = $4 \
             WHERE pool_id = $1 AND settled = FALSE",
        )
        .bind(pool_id)
        .bind(creator_side_won)
        .bind(result)
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        if updated > 0 {
            return Ok(true);
        }
        match PoolStore::pool(self, pool_id).await? {
            Some(_) => Ok(false),
            None => Err(KeeperError::NotFound(format!("pool {}", pool_id))),
        }
    }

    async fn record_market_id(&self, hash: &str, market_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO oracle.market_id_lookup (hash, market_id) VALUES ($1, $2) ON CONFLICT (hash) DO NOTHING",
        )
        .bind(hash.to_lowercase())
        .bind(market_id)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        Ok(())
    }

    async fn lookup_market_id(&self, hash: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT market_id FROM oracle.market_id_lookup WHERE hash = $1")
            .bind(hash.to_lowercase())
            .fetch_optional(&self.pool)
            .await
            .map_err(KeeperError::from_db)?;
        Ok(match row {
            Some(r) => Some(r.try_get("market_id")?),
            None => None,
        })
    }

    async fn insert_bet(&self, bet: &BetRecord) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO oracle.bets (tx_hash, log_index, block_number, pool_id, bettor, amount, is_for_outcome) \
             VALUES ($1, $2, $3, $4, $5, $6::numeric, $7) \
             ON CONFLICT (tx_hash, log_index) DO NOTHING",
        )
        .bind(&bet.log.tx_hash)
        .bind(bet.log.log_index)
        .bind(bet.log.block_number)
        .bind(bet.pool_id)
        .bind(&bet.bettor)
        .bind(&bet.amount)
        .bind(bet.is_for_outcome)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        Ok(inserted > 0)
    }

    async fn bets_for_pool(&self, pool_id: i64) -> Result<Vec<BetRecord>> {
        let rows = sqlx::query(
            "SELECT tx_hash, log_index, block_number, pool_id, bettor, amount::text AS amount, is_for_outcome \
             FROM oracle.bets WHERE pool_id = $1 ORDER BY block_number, log_index",
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        rows.iter()
            .map(|row| {
                Ok(BetRecord {
                    log: log_ref_from_row(row)?,
                    pool_id: row.try_get("pool_id")?,
                    bettor: row.try_get("bettor")?,
                    amount: row.try_get("amount")?,
                    is_for_outcome: row.try_get("is_for_outcome")?,
                })
            })
            .collect()
    }

    async fn bet_totals(&self, pool_id: i64) -> Result<BetTotals> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS bet_count, COALESCE(SUM(amount), 0)::text AS total_amount \
             FROM oracle.bets WHERE pool_id = $1",
        )
        .bind(pool_id)
        .fetch_one(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        let count: i64 = row.try_get("bet_count")?;
        Ok(BetTotals {
            bet_count: count as u64,
            total_amount: row.try_get("total_amount")?,
        })
    }

    async fn insert_liquidity(&self, lp: &LiquidityRecord) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO oracle.pool_liquidity_providers (tx_hash, log_index, block_number, pool_id, provider, amount) \
             VALUES ($1, $2, $3, $4, $5, $6::numeric) \
             ON CONFLICT (tx_hash, log_index) DO NOTHING",
        )
        .bind(&lp.log.tx_hash)
        .bind(lp.log.log_index)
        .bind(lp.log.block_number)
        .bind(lp.pool_id)
        .bind(&lp.provider)
        .bind(&lp.amount)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        Ok(inserted > 0)
    }

    async fn insert_prize_claim(&self, claim: &PrizeClaimRecord) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO oracle.prize_claims (tx_hash, log_index, block_number, pool_id, claimant, amount) \
             VALUES ($1, $2, $3, $4, $5, $6::numeric) \
             ON CONFLICT (tx_hash, log_index) DO NOTHING",
        )
        .bind(&claim.log.tx_hash)
        .bind(claim.log.log_index)
        .bind(claim.log.block_number)
        .bind(claim.pool_id)
        .bind(&claim.claimant)
        .bind(&claim.amount)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?
        .rows_affected();
        Ok(inserted > 0)
    }
}

// ─── Cursors ─────────────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for PgStore {
    async fn cursor(&self, contract: &str, stream: &str) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT last_block FROM oracle.indexer_cursors WHERE contract = $1 AND stream = $2")
            .bind(contract.to_lowercase())
            .bind(stream)
            .fetch_optional(&self.pool)
            .await
            .map_err(KeeperError::from_db)?;
        Ok(match row {
            Some(r) => Some(r.try_get::<i64, _>("last_block")? as u64),
            None => None,
        })
    }

    async fn advance_cursor(&self, contract: &str, stream: &str, block: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO oracle.indexer_cursors (contract, stream, last_block) VALUES ($1, $2, $3) \
             ON CONFLICT (contract, stream) DO UPDATE SET \
                 last_block = GREATEST(oracle.indexer_cursors.last_block, EXCLUDED.last_block), \
                 updated_at = NOW()",
        )
        .bind(contract.to_lowercase())
        .bind(stream)
        .bind(block as i64)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::from_db)?;
        Ok(())
    }
}
