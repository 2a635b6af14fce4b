//! In-memory store with the same invariants as the Postgres schema.
//!
//! Used by the test suite and by dry runs. Every rule the schema enforces via
//! keys, CHECK constraints or the format trigger is enforced here too.

use super::*;
use crate::error::KeeperError;
use crate::outcome::validate_result_strings;
use alloy::primitives::U256;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

type LogKey = (String, i64);

#[derive(Default)]
struct Inner {
    locks: HashMap<String, CronLock>,
    executions: Vec<ExecutionLogEntry>,
    next_execution_row: i64,
    alerts: Vec<SystemAlert>,
    fixtures: BTreeMap<i64, Fixture>,
    results: BTreeMap<i64, FixtureResultRecord>,
    cycles: BTreeMap<i64, OddysseyCycle>,
    slips: BTreeMap<i64, SlipRecord>,
    pools: BTreeMap<i64, PoolRecord>,
    market_ids: HashMap<String, String>,
    bets: BTreeMap<LogKey, BetRecord>,
    liquidity: BTreeMap<LogKey, LiquidityRecord>,
    claims: BTreeMap<LogKey, PrizeClaimRecord>,
    cursors: HashMap<(String, String), u64>,
}

impl Inner {
    fn fixture_in_unresolved_cycle(&self, fixture_id: i64) -> bool {
        self.cycles
            .values()
            .any(|c| !c.is_resolved && c.matches.iter().any(|m| m.fixture_id == fixture_id))
    }

    fn fixture_in_any_cycle(&self, fixture_id: i64) -> bool {
        self.cycles
            .values()
            .any(|c| c.matches.iter().any(|m| m.fixture_id == fixture_id))
    }

    fn finish(&mut self, execution_id: Uuid, status: ExecutionStatus, at: DateTime<Utc>, error: Option<&str>) -> u64 {
        let mut changed = 0;
        for row in self
            .executions
            .iter_mut()
            .filter(|r| r.execution_id == execution_id && r.status == ExecutionStatus::Started)
        {
            row.status = status;
            row.completed_at = Some(at);
            row.duration_ms = Some((at - row.started_at).num_milliseconds());
            row.error_message = error.map(str::to_string);
            changed += 1;
        }
        changed
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every alert recorded so far, oldest first.
    pub async fn alerts(&self) -> Vec<SystemAlert> {
        self.inner.lock().await.alerts.clone()
    }

    /// Full execution log of one job, oldest first.
    pub async fn executions_for(&self, job_name: &str) -> Vec<ExecutionLogEntry> {
        self.inner
            .lock()
            .await
            .executions
            .iter()
            .filter(|e| e.job_name == job_name)
            .cloned()
            .collect()
    }
}

fn sum_wei<'a>(amounts: impl Iterator<Item = &'a str>) -> Result<String> {
    let mut total = U256::ZERO;
    for a in amounts {
        let v: U256 = a
            .parse()
            .map_err(|e| KeeperError::Validation(format!("bad wei amount {:?}: {}", a, e)))?;
        total = total.saturating_add(v);
    }
    Ok(total.to_string())
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn insert_lock(&self, lock: &CronLock) -> Result<bool> {
        if lock.expires_at <= lock.locked_at {
            return Err(KeeperError::Validation(format!(
                "lock for {} must expire after it is taken",
                lock.job_name
            )));
        }
        let mut inner = self.inner.lock().await;
        if inner.locks.contains_key(&lock.job_name) {
            return Ok(false);
        }
        inner.locks.insert(lock.job_name.clone(), lock.clone());
        inner.next_execution_row += 1;
        let id = inner.next_execution_row;
        inner.executions.push(ExecutionLogEntry {
            id,
            job_name: lock.job_name.clone(),
            execution_id: lock.execution_id,
            status: ExecutionStatus::Started,
            started_at: lock.locked_at,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            metadata: lock.metadata.clone(),
        });
        Ok(true)
    }

    async fn delete_lock(&self, job_name: &str, execution_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.locks.get(job_name) {
            Some(l) if l.execution_id == execution_id => {
                inner.locks.remove(job_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<CronLock>> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<CronLock> = inner
            .locks
            .values()
            .filter(|l| l.expires_at < now)
            .cloned()
            .collect();
        for lock in &expired {
            inner.locks.remove(&lock.job_name);
            inner.finish(lock.execution_id, ExecutionStatus::Timeout, now, Some("lock expired"));
        }
        Ok(expired)
    }

    async fn find_lock(&self, job_name: &str) -> Result<Option<CronLock>> {
        Ok(self.inner.lock().await.locks.get(job_name).cloned())
    }

    async fn list_locks(&self) -> Result<Vec<CronLock>> {
        let mut locks: Vec<CronLock> = self.inner.lock().await.locks.values().cloned().collect();
        locks.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        Ok(locks)
    }

    async fn remove_lock(&self, job_name: &str) -> Result<Option<CronLock>> {
        Ok(self.inner.lock().await.locks.remove(job_name))
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()> {
        self.inner.lock().await.finish(execution_id, status, completed_at, error);
        Ok(())
    }

    async fn finish_started_executions(
        &self,
        job_name: &str,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<Uuid> = inner
            .executions
            .iter()
            .filter(|e| e.job_name == job_name && e.status == ExecutionStatus::Started)
            .map(|e| e.execution_id)
            .collect();
        let mut changed = 0;
        for id in ids {
            changed += inner.finish(id, status, completed_at, None);
        }
        Ok(changed)
    }

    async fn latest_execution(
        &self,
        job_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ExecutionLogEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .executions
            .iter()
            .filter(|e| e.job_name == job_name && e.started_at >= since)
            .max_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn recent_executions(&self, limit: i64) -> Result<Vec<ExecutionLogEntry>> {
        let inner = self.inner.lock().await;
        let mut rows = inner.executions.clone();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn prune_execution_log(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let prior = inner.executions.len();
        inner
            .executions
            .retain(|e| !(e.status.is_terminal() && e.started_at < before));
        Ok((prior - inner.executions.len()) as u64)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn record_alert(&self, alert: &SystemAlert) -> Result<()> {
        self.inner.lock().await.alerts.push(alert.clone());
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn insert_fixture(&self, fixture: &Fixture) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.fixtures.get(&fixture.id) {
            // Odds may still move until the fixture is picked for a cycle.
            if existing.odds != fixture.odds && !inner.fixture_in_any_cycle(fixture.id) {
                let odds = fixture.odds.clone();
                if let Some(f) = inner.fixtures.get_mut(&fixture.id) {
                    f.odds = odds;
                }
            }
            return Ok(false);
        }
        inner.fixtures.insert(fixture.id, fixture.clone());
        Ok(true)
    }

    async fn fixtures(&self, ids: &[i64]) -> Result<Vec<Fixture>> {
        let inner = self.inner.lock().await;
        Ok(ids.iter().filter_map(|id| inner.fixtures.get(id).cloned()).collect())
    }

    async fn fixtures_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Fixture>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Fixture> = inner
            .fixtures
            .values()
            .filter(|f| f.kickoff >= from && f.kickoff <= to)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.kickoff.cmp(&b.kickoff).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn upsert_fixture_result(&self, result: &FixtureResultRecord) -> Result<()> {
        validate_result_strings(
            result.outcome_1x2.as_deref(),
            result.outcome_ou25.as_deref(),
            result.outcome_btts.as_deref(),
        )?;
        let mut inner = self.inner.lock().await;
        match inner.results.get_mut(&result.fixture_id) {
            Some(existing) => {
                // Absent values never clear what is already stored.
                existing.home_score = result.home_score.or(existing.home_score);
                existing.away_score = result.away_score.or(existing.away_score);
                existing.outcome_1x2 = result.outcome_1x2.clone().or(existing.outcome_1x2.take());
                existing.outcome_ou25 = result.outcome_ou25.clone().or(existing.outcome_ou25.take());
                existing.outcome_btts = result.outcome_btts.clone().or(existing.outcome_btts.take());
                existing.finished_at = result.finished_at.or(existing.finished_at);
            }
            None => {
                inner.results.insert(result.fixture_id, result.clone());
            }
        }
        Ok(())
    }

    async fn fixture_results(&self, ids: &[i64]) -> Result<Vec<FixtureResultRecord>> {
        let inner = self.inner.lock().await;
        Ok(ids.iter().filter_map(|id| inner.results.get(id).cloned()).collect())
    }

    async fn fixtures_awaiting_results(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let inner = self.inner.lock().await;
        let cutoff = now - chrono::Duration::hours(2);
        Ok(inner
            .fixtures
            .values()
            .filter(|f| f.kickoff <= cutoff && inner.fixture_in_unresolved_cycle(f.id))
            .filter(|f| match inner.results.get(&f.id) {
                Some(r) => r.outcome_1x2.is_none() || r.outcome_ou25.is_none(),
                None => true,
            })
            .map(|f| f.id)
            .collect())
    }

    async fn prune_fixtures(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let stale: Vec<i64> = inner
            .fixtures
            .values()
            .filter(|f| f.kickoff < before && !inner.fixture_in_any_cycle(f.id))
            .map(|f| f.id)
            .collect();
        for id in &stale {
            inner.fixtures.remove(id);
            inner.results.remove(id);
        }
        Ok(stale.len() as u64)
    }
}

#[async_trait]
impl CycleStore for MemoryStore {
    async fn upsert_cycle(&self, cycle: &OddysseyCycle) -> Result<()> {
        if cycle.matches.len() != crate::results::MATCHES_PER_CYCLE {
            return Err(KeeperError::Validation(format!(
                "cycle {} has {} matches",
                cycle.cycle_id,
                cycle.matches.len()
            )));
        }
        let mut inner = self.inner.lock().await;
        match inner.cycles.get_mut(&cycle.cycle_id) {
            Some(existing) if existing.is_resolved => {}
            Some(existing) => {
                existing.start_time = cycle.start_time;
                existing.end_time = cycle.end_time;
                existing.matches = cycle.matches.clone();
                existing.prize_pool = cycle.prize_pool.clone();
            }
            None => {
                inner.cycles.insert(cycle.cycle_id, cycle.clone());
            }
        }
        Ok(())
    }

    async fn cycle(&self, cycle_id: i64) -> Result<Option<OddysseyCycle>> {
        Ok(self.inner.lock().await.cycles.get(&cycle_id).cloned())
    }

    async fn latest_cycle(&self) -> Result<Option<OddysseyCycle>> {
        Ok(self.inner.lock().await.cycles.values().next_back().cloned())
    }

    async fn unresolved_cycles(&self) -> Result<Vec<OddysseyCycle>> {
        let inner = self.inner.lock().await;
        Ok(inner.cycles.values().filter(|c| !c.is_resolved).cloned().collect())
    }

    async fn cycles_pending_evaluation(&self) -> Result<Vec<OddysseyCycle>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .cycles
            .values()
            .filter(|c| c.is_resolved && !c.evaluation_completed)
            .cloned()
            .collect())
    }

    async fn mark_cycle_resolved(
        &self,
        cycle_id: i64,
        tx_hash: Option<&str>,
        prize_pool: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let cycle = inner
            .cycles
            .get_mut(&cycle_id)
            .ok_or_else(|| KeeperError::NotFound(format!("cycle {}", cycle_id)))?;
        cycle.is_resolved = true;
        if let Some(h) = tx_hash {
            cycle.resolution_tx_hash = Some(h.to_string());
        }
        if let Some(p) = prize_pool {
            cycle.prize_pool = p.to_string();
        }
        cycle.resolved_at.get_or_insert(resolved_at);
        Ok(())
    }

    async fn set_evaluation_completed(&self, cycle_id: i64, completed: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let cycle = inner
            .cycles
            .get_mut(&cycle_id)
            .ok_or_else(|| KeeperError::NotFound(format!("cycle {}", cycle_id)))?;
        cycle.evaluation_completed = completed;
        Ok(())
    }

    async fn insert_slip(&self, slip: &SlipRecord) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.cycles.contains_key(&slip.cycle_id) {
            return Err(KeeperError::NotFound(format!(
                "cycle {} for slip {}",
                slip.cycle_id, slip.slip_id
            )));
        }
        if inner.slips.contains_key(&slip.slip_id) {
            return Ok(false);
        }
        inner.slips.insert(slip.slip_id, slip.clone());
        Ok(true)
    }

    async fn slip(&self, slip_id: i64) -> Result<Option<SlipRecord>> {
        Ok(self.inner.lock().await.slips.get(&slip_id).cloned())
    }

    async fn slips_for_cycle(&self, cycle_id: i64) -> Result<Vec<SlipRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.slips.values().filter(|s| s.cycle_id == cycle_id).cloned().collect())
    }

    async fn unevaluated_slips(&self, cycle_id: i64) -> Result<Vec<SlipRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .slips
            .values()
            .filter(|s| s.cycle_id == cycle_id && !s.is_evaluated)
            .cloned()
            .collect())
    }

    async fn mark_slip_evaluated(&self, slip_id: i64, correct_count: i16, final_score: &str) -> Result<()> {
        if !(0..=10).contains(&correct_count) {
            return Err(KeeperError::Validation(format!(
                "slip {} correct_count {} out of range",
                slip_id, correct_count
            )));
        }
        let mut inner = self.inner.lock().await;
        let slip = inner
            .slips
            .get_mut(&slip_id)
            .ok_or_else(|| KeeperError::NotFound(format!("slip {}", slip_id)))?;
        slip.is_evaluated = true;
        slip.correct_count = Some(correct_count);
        slip.final_score = Some(final_score.to_string());
        Ok(())
    }

    async fn reset_slip_evaluation(&self, slip_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let slip = inner
            .slips
            .get_mut(&slip_id)
            .ok_or_else(|| KeeperError::NotFound(format!("slip {}", slip_id)))?;
        slip.is_evaluated = false;
        slip.correct_count = None;
        slip.final_score = None;
        Ok(())
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn upsert_pool(&self, pool: &PoolRecord) -> Result<()> {
        if !pool.has_valid_schedule() {
            return Err(KeeperError::Validation(format!(
                "pool {} violates bettingEnd <= eventStart <= eventEnd",
                pool.pool_id
            )));
        }
        let mut inner = self.inner.lock().await;
        match inner.pools.get_mut(&pool.pool_id) {
            Some(existing) => {
                existing.odds = pool.odds;
                existing.creator_stake = pool.creator_stake.clone();
                existing.event_start_time = pool.event_start_time;
                existing.event_end_time = pool.event_end_time;
                existing.betting_end_time = pool.betting_end_time;
                existing.is_private = pool.is_private;
                existing.uses_bitr = pool.uses_bitr;
            }
            None => {
                inner.pools.insert(pool.pool_id, pool.clone());
            }
        }
        Ok(())
    }

    async fn pool(&self, pool_id: i64) -> Result<Option<PoolRecord>> {
        Ok(self.inner.lock().await.pools.get(&pool_id).cloned())
    }

    async fn unsettled_pools(&self) -> Result<Vec<PoolRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.pools.values().filter(|p| !p.settled).cloned().collect())
    }

    async fn mark_pool_settled(
        &self,
        pool_id: i64,
        creator_side_won: Option<bool>,
        result: &str,
        tx_hash: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let pool = inner
            .pools
            .get_mut(&pool_id)
            .ok_or_else(|| KeeperError::NotFound(format!("pool {}", pool_id)))?;
        if pool.settled {
            return Ok(false);
        }
        pool.settled = true;
        pool.creator_side_won = creator_side_won;
        pool.result = Some(result.to_string());
        pool.settlement_tx_hash = tx_hash.map(str::to_string);
        Ok(true)
    }

    async fn record_market_id(&self, hash: &str, market_id: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .market_ids
            .entry(hash.to_lowercase())
            .or_insert_with(|| market_id.to_string());
        Ok(())
    }

    async fn lookup_market_id(&self, hash: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().await.market_ids.get(&hash.to_lowercase()).cloned())
    }

    async fn insert_bet(&self, bet: &BetRecord) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let key = (bet.log.tx_hash.clone(), bet.log.log_index);
        if inner.bets.contains_key(&key) {
            return Ok(false);
        }
        inner.bets.insert(key, bet.clone());
        Ok(true)
    }

    async fn bets_for_pool(&self, pool_id: i64) -> Result<Vec<BetRecord>> {
        let inner = self.inner.lock().await;
        let mut bets: Vec<BetRecord> = inner.bets.values().filter(|b| b.pool_id == pool_id).cloned().collect();
        bets.sort_by(|a, b| {
            a.log
                .block_number
                .cmp(&b.log.block_number)
                .then(a.log.log_index.cmp(&b.log.log_index))
        });
        Ok(bets)
    }

    async fn bet_totals(&self, pool_id: i64) -> Result<BetTotals> {
        let inner = self.inner.lock().await;
        let bets: Vec<&BetRecord> = inner.bets.values().filter(|b| b.pool_id == pool_id).collect();
        Ok(BetTotals {
            bet_count: bets.len() as u64,
            total_amount: sum_wei(bets.iter().map(|b| b.amount.as_str()))?,
        })
    }

    async fn insert_liquidity(&self, lp: &LiquidityRecord) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let key = (lp.log.tx_hash.clone(), lp.log.log_index);
        if inner.liquidity.contains_key(&key) {
            return Ok(false);
        }
        inner.liquidity.insert(key, lp.clone());
        Ok(true)
    }

    async fn insert_prize_claim(&self, claim: &PrizeClaimRecord) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let key = (claim.log.tx_hash.clone(), claim.log.log_index);
        if inner.claims.contains_key(&key) {
            return Ok(false);
        }
        inner.claims.insert(key, claim.clone());
        Ok(true)
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn cursor(&self, contract: &str, stream: &str) -> Result<Option<u64>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .cursors
            .get(&(contract.to_lowercase(), stream.to_string()))
            .copied())
    }

    async fn advance_cursor(&self, contract: &str, stream: &str, block: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .cursors
            .entry((contract.to_lowercase(), stream.to_string()))
            .or_insert(block);
        *entry = (*entry).max(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn result_row(fixture_id: i64, outcome_1x2: Option<&str>) -> FixtureResultRecord {
        FixtureResultRecord {
            fixture_id,
            home_score: Some(1),
            away_score: Some(0),
            outcome_1x2: outcome_1x2.map(str::to_string),
            outcome_ou25: Some("Under".to_string()),
            outcome_btts: Some("No".to_string()),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_result_format_is_enforced() {
        let store = MemoryStore::new();
        for bad in ["1", "X", "2", "home", ""] {
            let err = store.upsert_fixture_result(&result_row(1, Some(bad))).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{bad:?} should be rejected");
        }
        assert!(store.fixture_results(&[1]).await.unwrap().is_empty());

        for (id, good) in [(1, "Home"), (2, "Draw"), (3, "Away")] {
            store.upsert_fixture_result(&result_row(id, Some(good))).await.unwrap();
        }
        assert_eq!(store.fixture_results(&[1, 2, 3]).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_outcome_never_cleared() {
        let store = MemoryStore::new();
        store.upsert_fixture_result(&result_row(5, Some("Home"))).await.unwrap();
        store.upsert_fixture_result(&result_row(5, None)).await.unwrap();
        let row = &store.fixture_results(&[5]).await.unwrap()[0];
        assert_eq!(row.outcome_1x2.as_deref(), Some("Home"));

        // Corrections are allowed.
        store.upsert_fixture_result(&result_row(5, Some("Away"))).await.unwrap();
        let row = &store.fixture_results(&[5]).await.unwrap()[0];
        assert_eq!(row.outcome_1x2.as_deref(), Some("Away"));
    }

    #[tokio::test]
    async fn test_cursor_is_monotone() {
        let store = MemoryStore::new();
        assert_eq!(store.cursor("0xABC", "all").await.unwrap(), None);
        store.advance_cursor("0xABC", "all", 120).await.unwrap();
        store.advance_cursor("0xabc", "all", 100).await.unwrap();
        assert_eq!(store.cursor("0xabc", "all").await.unwrap(), Some(120));
    }

    #[tokio::test]
    async fn test_bet_totals_sum_wei() {
        let store = MemoryStore::new();
        for (i, amount) in ["1000000000000000000", "2500000000000000000"].iter().enumerate() {
            let bet = BetRecord {
                log: LogRef {
                    tx_hash: format!("0x{:064x}", i),
                    log_index: 0,
                    block_number: 10 + i as i64,
                },
                pool_id: 3,
                bettor: "0x0000000000000000000000000000000000000001".to_string(),
                amount: amount.to_string(),
                is_for_outcome: true,
            };
            assert!(store.insert_bet(&bet).await.unwrap());
            assert!(!store.insert_bet(&bet).await.unwrap());
        }
        let totals = store.bet_totals(3).await.unwrap();
        assert_eq!(totals.bet_count, 2);
        assert_eq!(totals.total_amount, "3500000000000000000");
    }
}
