//! Database schema creation and migrations.
//!
//! Every statement is idempotent so `migrate` runs on each startup.

use crate::error::{KeeperError, Result};
use sqlx::PgPool;
use tracing::info;

const STATEMENTS: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS oracle",
    "CREATE SCHEMA IF NOT EXISTS system",
    // Fixtures: identity fields never change after insert.
    r#"
    CREATE TABLE IF NOT EXISTS oracle.fixtures (
        id BIGINT PRIMARY KEY,
        home_team TEXT NOT NULL,
        away_team TEXT NOT NULL,
        league TEXT NOT NULL,
        kickoff TIMESTAMPTZ NOT NULL,
        odds_home NUMERIC(10,3),
        odds_draw NUMERIC(10,3),
        odds_away NUMERIC(10,3),
        odds_over_25 NUMERIC(10,3),
        odds_under_25 NUMERIC(10,3),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_fixtures_kickoff ON oracle.fixtures(kickoff)",
    r#"
    CREATE TABLE IF NOT EXISTS oracle.fixture_results (
        fixture_id BIGINT PRIMARY KEY,
        home_score INTEGER,
        away_score INTEGER,
        outcome_1x2 TEXT,
        outcome_ou25 TEXT,
        outcome_btts TEXT,
        finished_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // Last line of defence for canonical outcome strings and for never
    // clearing an outcome once set.
    r#"
    CREATE OR REPLACE FUNCTION oracle.validate_fixture_result_format() RETURNS trigger AS $$
    BEGIN
        IF NEW.outcome_1x2 IS NOT NULL AND NEW.outcome_1x2 NOT IN ('Home', 'Draw', 'Away') THEN
            RAISE EXCEPTION 'Invalid outcome_1x2 format: %', NEW.outcome_1x2
                USING ERRCODE = 'check_violation';
        END IF;
        IF NEW.outcome_ou25 IS NOT NULL AND NEW.outcome_ou25 NOT IN ('Over', 'Under') THEN
            RAISE EXCEPTION 'Invalid outcome_ou25 format: %', NEW.outcome_ou25
                USING ERRCODE = 'check_violation';
        END IF;
        IF NEW.outcome_btts IS NOT NULL AND NEW.outcome_btts NOT IN ('Yes', 'No') THEN
            RAISE EXCEPTION 'Invalid outcome_btts format: %', NEW.outcome_btts
                USING ERRCODE = 'check_violation';
        END IF;
        IF TG_OP = 'UPDATE' THEN
            IF (OLD.outcome_1x2 IS NOT NULL AND NEW.outcome_1x2 IS NULL)
                OR (OLD.outcome_ou25 IS NOT NULL AND NEW.outcome_ou25 IS NULL)
                OR (OLD.outcome_btts IS NOT NULL AND NEW.outcome_btts IS NULL) THEN
                RAISE EXCEPTION 'Fixture % outcome cannot be cleared once set', NEW.fixture_id
                    USING ERRCODE = 'check_violation';
            END IF;
        END IF;
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    "DROP TRIGGER IF EXISTS trg_validate_fixture_result_format ON oracle.fixture_results",
    r#"
    CREATE TRIGGER trg_validate_fixture_result_format
        BEFORE INSERT OR UPDATE ON oracle.fixture_results
        FOR EACH ROW EXECUTE FUNCTION oracle.validate_fixture_result_format()
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS oracle.oddyssey_cycles (
        cycle_id BIGINT PRIMARY KEY,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ NOT NULL,
        matches JSONB NOT NULL,
        matches_count INTEGER NOT NULL CHECK (matches_count = 10),
        prize_pool NUMERIC(78,0) NOT NULL DEFAULT 0,
        is_resolved BOOLEAN NOT NULL DEFAULT FALSE,
        resolution_tx_hash TEXT,
        resolved_at TIMESTAMPTZ,
        evaluation_completed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS oracle.oddyssey_slips (
        slip_id BIGINT PRIMARY KEY,
        cycle_id BIGINT NOT NULL REFERENCES oracle.oddyssey_cycles(cycle_id),
        player TEXT NOT NULL,
        placed_at TIMESTAMPTZ NOT NULL,
        predictions JSONB NOT NULL,
        is_evaluated BOOLEAN NOT NULL DEFAULT FALSE,
        correct_count SMALLINT CHECK (correct_count BETWEEN 0 AND 10),
        final_score NUMERIC(78,0),
        tx_hash TEXT,
        evaluated_at TIMESTAMPTZ,
        UNIQUE (slip_id, cycle_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_slips_cycle_eval ON oracle.oddyssey_slips(cycle_id, is_evaluated)",
    r#"
    CREATE TABLE IF NOT EXISTS oracle.pools (
        pool_id BIGINT PRIMARY KEY,
        creator TEXT NOT NULL,
        predicted_outcome TEXT NOT NULL,
        odds INTEGER NOT NULL,
        creator_stake NUMERIC(78,0) NOT NULL,
        event_start_time TIMESTAMPTZ NOT NULL,
        event_end_time TIMESTAMPTZ NOT NULL,
        betting_end_time TIMESTAMPTZ NOT NULL,
        oracle_type TEXT NOT NULL CHECK (oracle_type IN ('guided', 'open')),
        market_id TEXT NOT NULL,
        is_private BOOLEAN NOT NULL DEFAULT FALSE,
        uses_bitr BOOLEAN NOT NULL DEFAULT FALSE,
        settled BOOLEAN NOT NULL DEFAULT FALSE,
        creator_side_won BOOLEAN,
        result TEXT,
        settlement_tx_hash TEXT,
        tx_hash TEXT,
        CHECK (betting_end_time <= event_start_time AND event_start_time <= event_end_time)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pools_unsettled ON oracle.pools(settled, event_end_time)",
    r#"
    CREATE TABLE IF NOT EXISTS oracle.bets (
        tx_hash TEXT NOT NULL,
        log_index BIGINT NOT NULL,
        block_number BIGINT NOT NULL,
        pool_id BIGINT NOT NULL,
        bettor TEXT NOT NULL,
        amount NUMERIC(78,0) NOT NULL,
        is_for_outcome BOOLEAN NOT NULL,
        PRIMARY KEY (tx_hash, log_index)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_bets_pool ON oracle.bets(pool_id)",
    r#"
    CREATE TABLE IF NOT EXISTS oracle.pool_liquidity_providers (
        tx_hash TEXT NOT NULL,
        log_index BIGINT NOT NULL,
        block_number BIGINT NOT NULL,
        pool_id BIGINT NOT NULL,
        provider TEXT NOT NULL,
        amount NUMERIC(78,0) NOT NULL,
        PRIMARY KEY (tx_hash, log_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS oracle.prize_claims (
        tx_hash TEXT NOT NULL,
        log_index BIGINT NOT NULL,
        block_number BIGINT NOT NULL,
        pool_id BIGINT NOT NULL,
        claimant TEXT NOT NULL,
        amount NUMERIC(78,0) NOT NULL,
        PRIMARY KEY (tx_hash, log_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS oracle.market_id_lookup (
        hash TEXT PRIMARY KEY,
        market_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS oracle.indexer_cursors (
        contract TEXT NOT NULL,
        stream TEXT NOT NULL,
        last_block BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (contract, stream)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS oracle.system_alerts (
        id BIGSERIAL PRIMARY KEY,
        alert_type TEXT NOT NULL,
        message TEXT NOT NULL,
        details JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system.cron_locks (
        job_name TEXT PRIMARY KEY,
        locked_at TIMESTAMPTZ NOT NULL,
        locked_by TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        execution_id UUID NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        CHECK (expires_at > locked_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system.cron_execution_log (
        id SERIAL PRIMARY KEY,
        job_name TEXT NOT NULL,
        execution_id UUID NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('started', 'completed', 'failed', 'timeout', 'force_released')),
        started_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        duration_ms BIGINT,
        error_message TEXT,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_cron_execution_log_job_started ON system.cron_execution_log(job_name, started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_cron_execution_log_execution ON system.cron_execution_log(execution_id)",
];

/// Create all schemas, tables, indexes and triggers.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for stmt in STATEMENTS {
        sqlx::raw_sql(stmt)
            .execute(pool)
            .await
            .map_err(|e| KeeperError::Config(format!("migration failed: {}", e)))?;
    }
    info!(statements = STATEMENTS.len(), "database schema up to date");
    Ok(())
}
