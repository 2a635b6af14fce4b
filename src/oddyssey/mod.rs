//! Oddyssey daily-cycle pipeline.
//!
//! ```text
//! NotStarted ──open──► Active ──betting end──► Ended ──resolve──► Resolved ──evaluate──► EvaluationComplete
//! ```
//!
//! Per cycle the order is always open → resolve → evaluate → sync. The chain
//! is authoritative: whenever the database disagrees with the contract about
//! resolution or a slip's evaluation, the database is corrected and the
//! correction logged at `warn`.

use crate::chain::types::unix_to_datetime;
use crate::chain::{check_resolve_inputs, ChainGateway, OnChainMatch, OnChainSlip};
use crate::config::PipelineConfig;
use crate::coordinator::JobContext;
use crate::error::{ErrorKind, KeeperError, Result};
use crate::outcome::{
    incomplete_count, moneyline_code, over_under_code, CycleState, MatchResultCodes, Moneyline, OverUnder,
};
use crate::results::{IngestSummary, ResultIngestor, SelectionRules, MATCHES_PER_CYCLE};
use crate::store::models::{CycleMatch, Fixture, FixtureResultRecord, OddysseyCycle, SlipRecord};
use crate::store::{CycleStore, ResultStore};
use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ─── Outcomes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OpenOutcome {
    Started { cycle_id: i64, tx_hash: String },
    /// A cycle is still taking slips.
    CycleActive { cycle_id: u64 },
    /// Fewer than ten eligible fixtures.
    Deferred { eligible: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Resolved { tx_hash: String },
    AlreadyResolved,
    /// The contract has not reached `Ended` yet.
    NotEnded { state: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationSummary {
    pub cycle_id: i64,
    pub pending: usize,
    pub submitted: usize,
    /// Already evaluated on chain; recorded without a transaction.
    pub synced_from_chain: usize,
    pub failed: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub cycle_id: i64,
    pub checked: usize,
    pub corrected: usize,
    pub reset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultsRunSummary {
    pub fixtures_requested: usize,
    pub results_written: usize,
    pub converged: usize,
    pub resolved: Vec<i64>,
    pub waiting: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlipFix {
    Inserted,
    Corrected,
    Reset,
    Unchanged,
}

/// Health report for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleAudit {
    pub cycle_id: i64,
    pub match_count: usize,
    pub missing_results: Vec<i64>,
    /// Slips whose predictions are not in cycle match order.
    pub ordering_violations: Vec<i64>,
    pub slip_count: usize,
    pub unevaluated_slips: usize,
    pub db_resolved: bool,
    pub chain_state: Option<String>,
    pub resolution_mismatch: bool,
    /// Evaluated slips whose stored correct count disagrees with a recount
    /// against the stored results.
    pub score_mismatches: Vec<i64>,
}

impl CycleAudit {
    pub fn is_healthy(&self) -> bool {
        self.match_count == MATCHES_PER_CYCLE
            && self.ordering_violations.is_empty()
            && self.score_mismatches.is_empty()
            && !self.resolution_mismatch
    }
}

enum SlipEvaluation {
    Submitted,
    SyncedFromChain,
}

// ─── Pure helpers ────────────────────────────────────────────────────────────

/// Decimal odds → contract odds (× 1000, rounded).
pub fn scale_odds(odds: Option<Decimal>, fixture_id: i64, market: &str) -> Result<u32> {
    odds.and_then(|o| (o * Decimal::from(1000)).round().to_u32())
        .ok_or_else(|| KeeperError::Validation(format!("fixture {} has no usable {} odds", fixture_id, market)))
}

/// Snapshot a fixture's odds for the cycle.
pub fn cycle_match(fixture: &Fixture) -> Result<CycleMatch> {
    let odds = &fixture.odds;
    Ok(CycleMatch {
        fixture_id: fixture.id,
        kickoff: fixture.kickoff,
        odds_home: scale_odds(odds.home, fixture.id, "home")?,
        odds_draw: scale_odds(odds.draw, fixture.id, "draw")?,
        odds_away: scale_odds(odds.away, fixture.id, "away")?,
        odds_over: scale_odds(odds.over_25, fixture.id, "over 2.5")?,
        odds_under: scale_odds(odds.under_25, fixture.id, "under 2.5")?,
    })
}

fn match_from_chain(m: &OnChainMatch) -> Result<CycleMatch> {
    Ok(CycleMatch {
        fixture_id: i64::try_from(m.id)
            .map_err(|_| KeeperError::Validation(format!("match id {} exceeds i64", m.id)))?,
        kickoff: unix_to_datetime(m.start_time)?,
        odds_home: m.odds_home,
        odds_draw: m.odds_draw,
        odds_away: m.odds_away,
        odds_over: m.odds_over,
        odds_under: m.odds_under,
    })
}

/// Contract result codes in cycle match order. A match without a result
/// row, or with a non-canonical string, is `NotSet`.
pub fn build_results(cycle: &OddysseyCycle, rows: &[FixtureResultRecord]) -> Vec<MatchResultCodes> {
    let by_id: HashMap<i64, &FixtureResultRecord> = rows.iter().map(|r| (r.fixture_id, r)).collect();
    cycle
        .matches
        .iter()
        .map(|m| {
            let row = by_id.get(&m.fixture_id);
            MatchResultCodes {
                moneyline: moneyline_code(row.and_then(|r| r.outcome_1x2.as_deref())),
                over_under: over_under_code(row.and_then(|r| r.outcome_ou25.as_deref())),
            }
        })
        .collect()
}

/// Indices at which a slip's predictions do not line up with the cycle's
/// matches. A slip with the wrong number of predictions fails at every
/// index past the shorter of the two.
pub fn ordering_violations(cycle: &OddysseyCycle, slip: &SlipRecord) -> Vec<usize> {
    let n = cycle.matches.len().max(slip.predictions.len());
    (0..n)
        .filter(|&i| {
            match (cycle.matches.get(i), slip.predictions.get(i)) {
                (Some(m), Some(p)) => m.fixture_id != p.match_id,
                _ => true,
            }
        })
        .collect()
}

pub fn check_slip_order(cycle: &OddysseyCycle, slip: &SlipRecord) -> Result<()> {
    let bad = ordering_violations(cycle, slip);
    if bad.is_empty() {
        return Ok(());
    }
    Err(KeeperError::InvariantViolation(format!(
        "slip {} predictions do not match cycle {} match order at positions {:?}",
        slip.slip_id, cycle.cycle_id, bad
    )))
}

/// Correct predictions of a slip counted against stored results. `None`
/// while any predicted match lacks a canonical result.
pub fn recount_correct(slip: &SlipRecord, rows: &[FixtureResultRecord]) -> Option<i16> {
    let by_id: HashMap<i64, &FixtureResultRecord> = rows.iter().map(|r| (r.fixture_id, r)).collect();
    let mut correct = 0;
    for p in &slip.predictions {
        let row = by_id.get(&p.match_id)?;
        let moneyline = Moneyline::from_str(row.outcome_1x2.as_deref()?).ok()?;
        let over_under = OverUnder::from_str(row.outcome_ou25.as_deref()?).ok()?;
        if p.selection.is_correct(moneyline, over_under) {
            correct += 1;
        }
    }
    Some(correct)
}

fn evaluation_differs(db: &SlipRecord, chain: &OnChainSlip) -> bool {
    !db.is_evaluated
        || db.correct_count != Some(i16::from(chain.correct_count))
        || db.final_score.as_deref() != Some(chain.final_score.to_string().as_str())
}

fn chain_id(id: i64, what: &str) -> Result<u64> {
    u64::try_from(id).map_err(|_| KeeperError::Validation(format!("negative {} {}", what, id)))
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

pub struct OddysseyPipeline {
    cycles: Arc<dyn CycleStore>,
    results: Arc<dyn ResultStore>,
    chain: Arc<dyn ChainGateway>,
    ingestor: Arc<ResultIngestor>,
    rules: SelectionRules,
    config: PipelineConfig,
}

impl OddysseyPipeline {
    pub fn new(
        cycles: Arc<dyn CycleStore>,
        results: Arc<dyn ResultStore>,
        chain: Arc<dyn ChainGateway>,
        ingestor: Arc<ResultIngestor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            cycles,
            results,
            chain,
            ingestor,
            rules: SelectionRules::default(),
            config,
        }
    }

    pub fn with_rules(mut self, rules: SelectionRules) -> Self {
        self.rules = rules;
        self
    }

    async fn require_cycle(&self, cycle_id: i64) -> Result<OddysseyCycle> {
        self.cycles
            .cycle(cycle_id)
            .await?
            .ok_or_else(|| KeeperError::NotFound(format!("cycle {}", cycle_id)))
    }

    // ─── open ────────────────────────────────────────────────────────────

    /// Start the next daily cycle when the previous one has ended.
    pub async fn open_cycle(&self, ctx: &JobContext, now: DateTime<Utc>) -> Result<OpenOutcome> {
        let current = self.chain.current_cycle_id().await?;
        if current > 0 {
            let status = self.chain.cycle_status(current).await?;
            if status.state < CycleState::Ended {
                debug!(cycle_id = current, state = %status.state, "current cycle still open");
                return Ok(OpenOutcome::CycleActive { cycle_id: current });
            }
        }

        let candidates = self.results.fixtures_between(now, now + self.rules.window).await?;
        let Some(selected) = self.rules.select(&candidates, now) else {
            let eligible = candidates.iter().filter(|f| self.rules.is_eligible(f, now)).count();
            info!(eligible = eligible, needed = MATCHES_PER_CYCLE, "not enough eligible fixtures, deferring cycle");
            return Ok(OpenOutcome::Deferred { eligible });
        };
        let matches = selected.iter().map(cycle_match).collect::<Result<Vec<_>>>()?;

        ctx.ensure_active()?;
        let tx = self.chain.start_daily_cycle(&matches).await?;

        let cycle_id = self.chain.current_cycle_id().await?;
        let status = self.chain.cycle_status(cycle_id).await?;
        let end_time = match status.end_time {
            0 => matches.iter().map(|m| m.kickoff).min().unwrap_or(now),
            t => unix_to_datetime(t)?,
        };
        let cycle = OddysseyCycle {
            cycle_id: cycle_id as i64,
            start_time: now,
            end_time,
            matches,
            prize_pool: status.prize_pool.to_string(),
            is_resolved: false,
            resolution_tx_hash: None,
            resolved_at: None,
            evaluation_completed: false,
        };
        self.cycles.upsert_cycle(&cycle).await?;

        info!(
            cycle_id = cycle_id,
            tx_hash = %tx.tx_hash_hex(),
            end_time = %cycle.end_time,
            "daily cycle started"
        );
        Ok(OpenOutcome::Started {
            cycle_id: cycle.cycle_id,
            tx_hash: tx.tx_hash_hex(),
        })
    }

    /// Record a cycle the contract knows about but the database does not.
    /// Returns `false` if the cycle was already present.
    pub async fn sync_cycle_from_chain(&self, cycle_id: u64) -> Result<bool> {
        let id = cycle_id as i64;
        if self.cycles.cycle(id).await?.is_some() {
            return Ok(false);
        }
        let status = self.chain.cycle_status(cycle_id).await?;
        if !status.exists {
            return Err(KeeperError::NotFound(format!("cycle {} not on chain", cycle_id)));
        }
        let matches = self
            .chain
            .cycle_matches(cycle_id)
            .await?
            .iter()
            .map(match_from_chain)
            .collect::<Result<Vec<_>>>()?;
        let cycle = OddysseyCycle {
            cycle_id: id,
            start_time: Utc::now(),
            end_time: unix_to_datetime(status.end_time)?,
            matches,
            prize_pool: status.prize_pool.to_string(),
            is_resolved: false,
            resolution_tx_hash: None,
            resolved_at: None,
            evaluation_completed: false,
        };
        self.cycles.upsert_cycle(&cycle).await?;
        if status.state == CycleState::Resolved {
            self.cycles
                .mark_cycle_resolved(id, None, Some(&cycle.prize_pool), Utc::now())
                .await?;
        }
        info!(cycle_id = cycle_id, state = %status.state, "cycle recorded from chain");
        Ok(true)
    }

    // ─── placeSlip ───────────────────────────────────────────────────────

    /// Store a slip observed on chain. Idempotent on `(slip_id, cycle_id)`;
    /// returns whether a row was inserted.
    pub async fn ingest_slip(&self, slip_id: u64, tx_hash: Option<String>) -> Result<bool> {
        let on_chain = self.chain.slip(slip_id).await?;
        let record = on_chain.to_record(tx_hash)?;

        let cycle = match self.cycles.cycle(record.cycle_id).await? {
            Some(c) => c,
            None => {
                self.sync_cycle_from_chain(on_chain.cycle_id).await?;
                self.require_cycle(record.cycle_id).await?
            }
        };
        if let Err(e) = check_slip_order(&cycle, &record) {
            error!(slip_id = slip_id, cycle_id = record.cycle_id, error = %e, "slip ordering invariant violated");
            return Err(e);
        }

        let inserted = self.cycles.insert_slip(&record).await?;
        if !inserted {
            debug!(slip_id = slip_id, "slip already recorded");
            return Ok(false);
        }
        if on_chain.is_evaluated {
            self.cycles
                .mark_slip_evaluated(record.slip_id, i16::from(on_chain.correct_count), &on_chain.final_score.to_string())
                .await?;
        }
        info!(slip_id = slip_id, cycle_id = record.cycle_id, player = %record.player, "slip recorded");
        Ok(true)
    }

    // ─── resolve ─────────────────────────────────────────────────────────

    /// Submit the cycle's ten results. Requires every match to have a
    /// canonical 1X2 and O/U result; otherwise `IncompleteResults` and no
    /// write of any kind.
    pub async fn resolve_cycle(&self, ctx: &JobContext, cycle_id: i64) -> Result<ResolveOutcome> {
        let cycle = self.require_cycle(cycle_id).await?;
        if cycle.is_resolved {
            debug!(cycle_id = cycle_id, "cycle already resolved");
            return Ok(ResolveOutcome::AlreadyResolved);
        }

        let rows = self.results.fixture_results(&cycle.match_ids()).await?;
        let codes = build_results(&cycle, &rows);
        let chain_cycle = chain_id(cycle_id, "cycle id")?;
        if let Err(e) = check_resolve_inputs(chain_cycle, &codes) {
            error!(cycle_id = cycle_id, error = %e, "refusing to resolve cycle");
            return Err(e);
        }

        let status = self.chain.cycle_status(chain_cycle).await?;
        if status.state == CycleState::Resolved {
            warn!(cycle_id = cycle_id, "cycle resolved on chain but not in database, correcting");
            self.cycles
                .mark_cycle_resolved(cycle_id, None, Some(&status.prize_pool.to_string()), Utc::now())
                .await?;
            return Ok(ResolveOutcome::AlreadyResolved);
        }
        if status.state < CycleState::Ended {
            info!(cycle_id = cycle_id, state = %status.state, "cycle has not ended, not resolving");
            return Ok(ResolveOutcome::NotEnded {
                state: status.state.to_string(),
            });
        }

        ctx.ensure_active()?;
        let tx = self.chain.resolve_cycle(chain_cycle, &codes).await?;
        let tx_hash = tx.tx_hash_hex();
        self.cycles
            .mark_cycle_resolved(cycle_id, Some(&tx_hash), Some(&status.prize_pool.to_string()), Utc::now())
            .await?;
        info!(cycle_id = cycle_id, tx_hash = %tx_hash, gas_used = tx.gas_used, "cycle resolved");
        Ok(ResolveOutcome::Resolved { tx_hash })
    }

    /// Mark cycles resolved in the database when the chain says so.
    pub async fn converge_cycles(&self) -> Result<usize> {
        let mut corrected = 0;
        for cycle in self.cycles.unresolved_cycles().await? {
            let status = self.chain.cycle_status(chain_id(cycle.cycle_id, "cycle id")?).await?;
            if status.state == CycleState::Resolved {
                warn!(cycle_id = cycle.cycle_id, "cycle resolved on chain but not in database, correcting");
                self.cycles
                    .mark_cycle_resolved(cycle.cycle_id, None, Some(&status.prize_pool.to_string()), Utc::now())
                    .await?;
                corrected += 1;
            }
        }
        Ok(corrected)
    }

    // ─── evaluate ────────────────────────────────────────────────────────

    /// Evaluate every unevaluated slip of a resolved cycle in spaced batches.
    /// Slips the contract already evaluated are recorded without a
    /// transaction, so a second pass sends nothing.
    ///
    /// An invariant violation aborts the pass. A revert is counted and the
    /// pass continues, then the first revert is returned so the run is
    /// logged `failed` and alerted.
    pub async fn evaluate_cycle(&self, ctx: &JobContext, cycle_id: i64) -> Result<EvaluationSummary> {
        let cycle = self.require_cycle(cycle_id).await?;
        if !cycle.is_resolved {
            return Err(KeeperError::InvariantViolation(format!(
                "cycle {} is not resolved, cannot evaluate slips",
                cycle_id
            )));
        }

        let pending = self.cycles.unevaluated_slips(cycle_id).await?;
        let mut summary = EvaluationSummary {
            cycle_id,
            pending: pending.len(),
            ..Default::default()
        };
        let mut first_revert = None;
        let slip_spacing = Duration::from_millis(self.config.slip_spacing_ms);
        let batch_spacing = Duration::from_millis(self.config.batch_spacing_ms);

        for (batch_index, batch) in pending.chunks(self.config.batch_size.max(1)).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(batch_spacing).await;
            }
            for slip in batch {
                ctx.ensure_active()?;
                match self.evaluate_slip(slip).await {
                    Ok(SlipEvaluation::Submitted) => {
                        summary.submitted += 1;
                        tokio::time::sleep(slip_spacing).await;
                    }
                    Ok(SlipEvaluation::SyncedFromChain) => summary.synced_from_chain += 1,
                    Err(e)
                        if matches!(
                            e.kind(),
                            ErrorKind::Timeout | ErrorKind::InsufficientFunds | ErrorKind::InvariantViolation
                        ) =>
                    {
                        return Err(e)
                    }
                    Err(e) if e.kind() == ErrorKind::TxRevert => {
                        summary.failed += 1;
                        error!(cycle_id = cycle_id, slip_id = slip.slip_id, error = %e, "slip evaluation reverted");
                        first_revert.get_or_insert(e);
                    }
                    Err(e) => {
                        summary.failed += 1;
                        warn!(cycle_id = cycle_id, slip_id = slip.slip_id, error = %e, "slip evaluation failed");
                    }
                }
            }
        }

        let remaining = self.cycles.unevaluated_slips(cycle_id).await?.len();
        summary.complete = remaining == 0;
        if summary.complete && !cycle.evaluation_completed {
            self.cycles.set_evaluation_completed(cycle_id, true).await?;
        }
        info!(
            cycle_id = cycle_id,
            pending = summary.pending,
            submitted = summary.submitted,
            synced = summary.synced_from_chain,
            failed = summary.failed,
            complete = summary.complete,
            "cycle evaluation pass finished"
        );
        match first_revert {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn evaluate_slip(&self, slip: &SlipRecord) -> Result<SlipEvaluation> {
        let id = chain_id(slip.slip_id, "slip id")?;
        let before = self.chain.slip(id).await?;
        if before.is_evaluated {
            self.record_chain_evaluation(slip.slip_id, &before).await?;
            return Ok(SlipEvaluation::SyncedFromChain);
        }

        let tx = self.chain.evaluate_slip(id).await?;
        let after = self.chain.slip(id).await?;
        if !after.is_evaluated {
            return Err(KeeperError::InvariantViolation(format!(
                "slip {} still unevaluated after tx {}",
                id,
                tx.tx_hash_hex()
            )));
        }
        self.record_chain_evaluation(slip.slip_id, &after).await?;
        debug!(slip_id = id, tx_hash = %tx.tx_hash_hex(), correct = after.correct_count, "slip evaluated");
        Ok(SlipEvaluation::Submitted)
    }

    async fn record_chain_evaluation(&self, slip_id: i64, chain: &OnChainSlip) -> Result<()> {
        self.cycles
            .mark_slip_evaluated(slip_id, i16::from(chain.correct_count), &chain.final_score.to_string())
            .await
    }

    // ─── sync ────────────────────────────────────────────────────────────

    /// Compare every slip of a cycle with the contract and correct the
    /// database where they differ.
    pub async fn sync_cycle_results(&self, ctx: &JobContext, cycle_id: i64) -> Result<SyncSummary> {
        let mut summary = SyncSummary {
            cycle_id,
            ..Default::default()
        };
        for slip in self.cycles.slips_for_cycle(cycle_id).await? {
            ctx.ensure_active()?;
            let on_chain = self.chain.slip(chain_id(slip.slip_id, "slip id")?).await?;
            summary.checked += 1;
            match self.apply_chain_evaluation(&slip, &on_chain).await? {
                SlipFix::Corrected => summary.corrected += 1,
                SlipFix::Reset => summary.reset += 1,
                _ => {}
            }
        }
        if summary.reset > 0 {
            self.cycles.set_evaluation_completed(cycle_id, false).await?;
        }
        if summary.corrected > 0 || summary.reset > 0 {
            warn!(
                cycle_id = cycle_id,
                corrected = summary.corrected,
                reset = summary.reset,
                "slip evaluations corrected from chain"
            );
        }
        Ok(summary)
    }

    async fn apply_chain_evaluation(&self, slip: &SlipRecord, on_chain: &OnChainSlip) -> Result<SlipFix> {
        if on_chain.is_evaluated {
            if !evaluation_differs(slip, on_chain) {
                return Ok(SlipFix::Unchanged);
            }
            if slip.is_evaluated {
                warn!(
                    slip_id = slip.slip_id,
                    db_correct = ?slip.correct_count,
                    chain_correct = on_chain.correct_count,
                    db_score = ?slip.final_score,
                    chain_score = %on_chain.final_score,
                    "slip evaluation differs from chain, overwriting"
                );
            }
            self.record_chain_evaluation(slip.slip_id, on_chain).await?;
            Ok(SlipFix::Corrected)
        } else if slip.is_evaluated {
            warn!(slip_id = slip.slip_id, "slip marked evaluated but chain disagrees, resetting");
            self.cycles.reset_slip_evaluation(slip.slip_id).await?;
            Ok(SlipFix::Reset)
        } else {
            Ok(SlipFix::Unchanged)
        }
    }

    // ─── event hooks ─────────────────────────────────────────────────────

    pub async fn record_cycle_resolved(&self, cycle_id: u64, prize_pool: U256, tx_hash: &str) -> Result<()> {
        self.sync_cycle_from_chain(cycle_id).await?;
        let cycle = self.require_cycle(cycle_id as i64).await?;
        if cycle.is_resolved {
            return Ok(());
        }
        self.cycles
            .mark_cycle_resolved(cycle.cycle_id, Some(tx_hash), Some(&prize_pool.to_string()), Utc::now())
            .await?;
        info!(cycle_id = cycle_id, tx_hash = %tx_hash, "cycle resolution observed");
        Ok(())
    }

    pub async fn record_slip_evaluated(&self, slip_id: u64) -> Result<()> {
        let id = slip_id as i64;
        if self.cycles.slip(id).await?.is_none() {
            self.ingest_slip(slip_id, None).await?;
        }
        let on_chain = self.chain.slip(slip_id).await?;
        if let Some(slip) = self.cycles.slip(id).await? {
            self.apply_chain_evaluation(&slip, &on_chain).await?;
        }
        Ok(())
    }

    // ─── repair ──────────────────────────────────────────────────────────

    /// Bring one slip in line with the contract, inserting it if missing.
    pub async fn fix_slip(&self, slip_id: i64) -> Result<SlipFix> {
        let id = chain_id(slip_id, "slip id")?;
        let Some(slip) = self.cycles.slip(slip_id).await? else {
            self.ingest_slip(id, None).await?;
            return Ok(SlipFix::Inserted);
        };
        let cycle = self.require_cycle(slip.cycle_id).await?;
        if let Err(e) = check_slip_order(&cycle, &slip) {
            error!(slip_id = slip_id, error = %e, "stored slip violates ordering invariant");
        }
        let on_chain = self.chain.slip(id).await?;
        self.apply_chain_evaluation(&slip, &on_chain).await
    }

    /// Reset any evaluation the chain does not back, then evaluate again.
    pub async fn reevaluate_cycle(&self, ctx: &JobContext, cycle_id: i64) -> Result<(SyncSummary, EvaluationSummary)> {
        let sync = self.sync_cycle_results(ctx, cycle_id).await?;
        let evaluation = self.evaluate_cycle(ctx, cycle_id).await?;
        Ok((sync, evaluation))
    }

    pub async fn audit_cycle(&self, cycle_id: i64) -> Result<CycleAudit> {
        let cycle = self.require_cycle(cycle_id).await?;
        let rows = self.results.fixture_results(&cycle.match_ids()).await?;
        let codes = build_results(&cycle, &rows);
        let missing_results = cycle
            .matches
            .iter()
            .zip(codes.iter())
            .filter(|(_, c)| !c.is_complete())
            .map(|(m, _)| m.fixture_id)
            .collect();

        let slips = self.cycles.slips_for_cycle(cycle_id).await?;
        let ordering_violations = slips
            .iter()
            .filter(|s| !ordering_violations(&cycle, s).is_empty())
            .map(|s| s.slip_id)
            .collect();
        let unevaluated_slips = slips.iter().filter(|s| !s.is_evaluated).count();
        let score_mismatches = slips
            .iter()
            .filter(|s| s.is_evaluated)
            .filter(|s| recount_correct(s, &rows).is_some_and(|n| s.correct_count != Some(n)))
            .map(|s| s.slip_id)
            .collect();

        let chain_state = match self.chain.cycle_status(chain_id(cycle_id, "cycle id")?).await {
            Ok(status) => Some(status.state),
            Err(e) => {
                warn!(cycle_id = cycle_id, error = %e, "could not read cycle status for audit");
                None
            }
        };
        let resolution_mismatch = chain_state.is_some_and(|s| (s == CycleState::Resolved) != cycle.is_resolved);

        Ok(CycleAudit {
            cycle_id,
            match_count: cycle.matches.len(),
            missing_results,
            ordering_violations,
            slip_count: slips.len(),
            unevaluated_slips,
            db_resolved: cycle.is_resolved,
            chain_state: chain_state.map(|s| s.to_string()),
            resolution_mismatch,
            score_mismatches,
        })
    }

    // ─── scheduled entry points ──────────────────────────────────────────

    /// Ingest finished results, converge resolution state with the chain,
    /// then resolve every ended cycle whose results are complete.
    pub async fn run_unified_results(&self, ctx: &JobContext, now: DateTime<Utc>) -> Result<ResultsRunSummary> {
        let ingest: IngestSummary = self.ingestor.ingest_pending(now).await?;
        let mut summary = ResultsRunSummary {
            fixtures_requested: ingest.requested,
            results_written: ingest.written,
            converged: self.converge_cycles().await?,
            ..Default::default()
        };

        for cycle in self.cycles.unresolved_cycles().await? {
            ctx.ensure_active()?;
            if cycle.end_time > now {
                continue;
            }
            let rows = self.results.fixture_results(&cycle.match_ids()).await?;
            let missing = incomplete_count(&build_results(&cycle, &rows));
            if missing > 0 {
                debug!(cycle_id = cycle.cycle_id, missing = missing, "cycle waiting for results");
                summary.waiting.push(cycle.cycle_id);
                continue;
            }
            if let ResolveOutcome::Resolved { .. } = self.resolve_cycle(ctx, cycle.cycle_id).await? {
                summary.resolved.push(cycle.cycle_id);
            }
        }
        Ok(summary)
    }

    /// Evaluate and sync every resolved cycle whose evaluation is incomplete.
    pub async fn run_unified_evaluation(&self, ctx: &JobContext) -> Result<Vec<EvaluationSummary>> {
        let mut out = Vec::new();
        for cycle in self.cycles.cycles_pending_evaluation().await? {
            ctx.ensure_active()?;
            let summary = self.evaluate_cycle(ctx, cycle.cycle_id).await?;
            self.sync_cycle_results(ctx, cycle.cycle_id).await?;
            out.push(summary);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{BetType, MoneylineCode, OverUnderCode, Selection};
    use crate::store::models::SlipPrediction;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn cycle(ids: &[i64]) -> OddysseyCycle {
        let kickoff = Utc.with_ymd_and_hms(2026, 3, 1, 15, 0, 0).unwrap();
        OddysseyCycle {
            cycle_id: 1,
            start_time: kickoff,
            end_time: kickoff,
            matches: ids
                .iter()
                .map(|id| CycleMatch {
                    fixture_id: *id,
                    kickoff,
                    odds_home: 2000,
                    odds_draw: 3000,
                    odds_away: 4000,
                    odds_over: 1800,
                    odds_under: 2000,
                })
                .collect(),
            prize_pool: "0".into(),
            is_resolved: false,
            resolution_tx_hash: None,
            resolved_at: None,
            evaluation_completed: false,
        }
    }

    fn slip(match_ids: &[i64]) -> SlipRecord {
        SlipRecord {
            slip_id: 5,
            cycle_id: 1,
            player: "0x00".into(),
            placed_at: Utc::now(),
            predictions: match_ids
                .iter()
                .map(|id| SlipPrediction {
                    match_id: *id,
                    bet_type: BetType::Moneyline,
                    selection: Selection::Home,
                    selected_odd: 2000,
                })
                .collect(),
            is_evaluated: false,
            correct_count: None,
            final_score: None,
            tx_hash: None,
        }
    }

    #[test]
    fn test_scale_odds() {
        assert_eq!(scale_odds(Some(Decimal::from_str("1.85").unwrap()), 1, "home").unwrap(), 1850);
        assert_eq!(scale_odds(Some(Decimal::from_str("2.0004").unwrap()), 1, "home").unwrap(), 2000);
        assert!(scale_odds(None, 1, "home").is_err());
        assert!(scale_odds(Some(Decimal::from_str("-1").unwrap()), 1, "home").is_err());
    }

    #[test]
    fn test_build_results_orders_by_cycle_and_marks_missing() {
        let c = cycle(&[10, 11]);
        let rows = vec![FixtureResultRecord {
            fixture_id: 11,
            home_score: Some(0),
            away_score: Some(3),
            outcome_1x2: Some("Away".into()),
            outcome_ou25: Some("Over".into()),
            outcome_btts: Some("No".into()),
            finished_at: None,
        }];
        let codes = build_results(&c, &rows);
        assert_eq!(codes[0].moneyline, MoneylineCode::NotSet);
        assert_eq!(codes[1].moneyline, MoneylineCode::AwayWin);
        assert_eq!(codes[1].over_under, OverUnderCode::Over);
    }

    #[test]
    fn test_ordering_violations() {
        let ids: Vec<i64> = (100..110).collect();
        let c = cycle(&ids);
        assert!(ordering_violations(&c, &slip(&ids)).is_empty());

        let mut swapped = ids.clone();
        swapped.swap(2, 3);
        assert_eq!(ordering_violations(&c, &slip(&swapped)), vec![2, 3]);

        assert_eq!(ordering_violations(&c, &slip(&ids[..9])), vec![9]);
        assert!(check_slip_order(&c, &slip(&swapped)).is_err());
    }

    #[test]
    fn test_recount_correct() {
        let row = |fixture_id: i64, one_x_two: &str, ou: &str| FixtureResultRecord {
            fixture_id,
            home_score: None,
            away_score: None,
            outcome_1x2: Some(one_x_two.into()),
            outcome_ou25: Some(ou.into()),
            outcome_btts: None,
            finished_at: None,
        };
        let mut s = slip(&[10, 11, 12]);
        s.predictions[2].bet_type = BetType::OverUnder;
        s.predictions[2].selection = Selection::Under;
        let rows = vec![row(10, "Home", "Over"), row(11, "Draw", "Under"), row(12, "Away", "Under")];
        assert_eq!(recount_correct(&s, &rows), Some(2));
        assert_eq!(recount_correct(&s, &rows[..2]), None);
    }
}
