//! In-process chain and feed doubles shared by the integration tests.

#![allow(dead_code)]

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use bitredict_keeper::chain::abi::selection_hash;
use bitredict_keeper::chain::{
    check_resolve_inputs, ChainGateway, CreatePoolParams, CycleStatus, GasEstimate, OnChainMatch, OnChainPool,
    OnChainPrediction, OnChainSlip, TxOutcome, WriteKind,
};
use bitredict_keeper::config::Config;
use bitredict_keeper::error::{KeeperError, Result};
use bitredict_keeper::indexer::events::{ChainEvent, EventKind, LogMeta};
use bitredict_keeper::indexer::LogSource;
use bitredict_keeper::outcome::{
    CycleState, MatchResultCodes, MoneylineCode, OracleType, OverUnderCode, Selection,
};
use bitredict_keeper::results::{ExternalResult, FixtureFeed};
use bitredict_keeper::services::Services;
use bitredict_keeper::store::models::{CycleMatch, Fixture, FixtureOdds, OddysseyCycle, SlipPrediction};
use bitredict_keeper::store::{CycleStore, MemoryStore, ResultStore};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub const ODDYSSEY: Address = Address::new([0x11; 20]);
pub const POOLS: Address = Address::new([0x22; 20]);
pub const ORACLE: Address = Address::new([0x33; 20]);

pub const FIXTURE_IDS: [i64; 10] = [100, 101, 102, 103, 104, 105, 106, 107, 108, 109];

struct FakeCycle {
    status: CycleStatus,
    matches: Vec<OnChainMatch>,
    results: Vec<MatchResultCodes>,
}

#[derive(Default)]
struct ChainState {
    head: u64,
    current_cycle: u64,
    cycles: BTreeMap<u64, FakeCycle>,
    slips: BTreeMap<u64, OnChainSlip>,
    pools: BTreeMap<u64, OnChainPool>,
    outcomes: HashMap<String, Bytes>,
    events: Vec<ChainEvent>,
    writes: Vec<WriteKind>,
    settle_revert: Option<String>,
    settle_attempts: usize,
    stall_evaluation: bool,
    tx_counter: u64,
}

impl ChainState {
    fn sent(&mut self, kind: WriteKind) -> TxOutcome {
        self.writes.push(kind);
        self.tx_counter += 1;
        TxOutcome {
            tx_hash: B256::left_padding_from(&self.tx_counter.to_be_bytes()),
            gas_used: 21_000,
            block_number: Some(self.head),
            gas: GasEstimate::compute(Some(21_000), 100_000, 20, 1_000_000_000, U256::ZERO),
        }
    }
}

/// Contract state held in memory. Writes mutate it the way the contracts
/// would and are recorded for assertions.
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<ChainState>,
}

fn is_correct(selection: Selection, result: &MatchResultCodes) -> bool {
    match selection {
        Selection::Home => result.moneyline == MoneylineCode::HomeWin,
        Selection::Draw => result.moneyline == MoneylineCode::Draw,
        Selection::Away => result.moneyline == MoneylineCode::AwayWin,
        Selection::Over => result.over_under == OverUnderCode::Over,
        Selection::Under => result.over_under == OverUnderCode::Under,
    }
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    pub fn add_cycle(&self, cycle_id: u64, state: CycleState, end_time: u64, fixture_ids: &[i64]) {
        let matches = fixture_ids
            .iter()
            .map(|id| OnChainMatch {
                id: *id as u64,
                start_time: end_time,
                odds_home: 2000,
                odds_draw: 3200,
                odds_away: 3800,
                odds_over: 1900,
                odds_under: 1900,
                result: MatchResultCodes {
                    moneyline: MoneylineCode::NotSet,
                    over_under: OverUnderCode::NotSet,
                },
            })
            .collect();
        let mut s = self.lock();
        s.current_cycle = s.current_cycle.max(cycle_id);
        s.cycles.insert(
            cycle_id,
            FakeCycle {
                status: CycleStatus {
                    exists: true,
                    state,
                    end_time,
                    prize_pool: U256::from(5_000u64),
                    slip_count: 0,
                },
                matches,
                results: Vec::new(),
            },
        );
    }

    pub fn set_cycle_state(&self, cycle_id: u64, state: CycleState) {
        if let Some(c) = self.lock().cycles.get_mut(&cycle_id) {
            c.status.state = state;
        }
    }

    pub fn cycle_state(&self, cycle_id: u64) -> Option<CycleState> {
        self.lock().cycles.get(&cycle_id).map(|c| c.status.state)
    }

    /// Place a slip whose predictions follow `selections` over the given
    /// match ids, in that order.
    pub fn add_slip(&self, slip_id: u64, cycle_id: u64, match_ids: &[i64], selections: &[Selection]) {
        let predictions = match_ids
            .iter()
            .zip(selections.iter())
            .map(|(id, sel)| OnChainPrediction {
                match_id: *id as u64,
                bet_type: sel.bet_type().code(),
                selection: selection_hash(*sel),
                selected_odd: 2000,
            })
            .collect();
        let mut s = self.lock();
        if let Some(c) = s.cycles.get_mut(&cycle_id) {
            c.status.slip_count += 1;
        }
        s.slips.insert(
            slip_id,
            OnChainSlip {
                slip_id,
                player: Address::repeat_byte(0xaa),
                cycle_id,
                placed_at: 1_772_000_000,
                predictions,
                final_score: U256::ZERO,
                correct_count: 0,
                is_evaluated: false,
            },
        );
    }

    pub fn chain_slip(&self, slip_id: u64) -> Option<OnChainSlip> {
        self.lock().slips.get(&slip_id).cloned()
    }

    pub fn add_pool(&self, pool: OnChainPool) {
        self.lock().pools.insert(pool.pool_id, pool);
    }

    pub fn chain_pool(&self, pool_id: u64) -> Option<OnChainPool> {
        self.lock().pools.get(&pool_id).cloned()
    }

    pub fn set_oracle_outcome(&self, market_id: &str, data: &[u8]) {
        self.lock()
            .outcomes
            .insert(market_id.to_string(), Bytes::copy_from_slice(data));
    }

    pub fn fail_settlement_with(&self, reason: &str) {
        self.lock().settle_revert = Some(reason.to_string());
    }

    /// Every `settle_pool` call, reverted or not.
    pub fn settle_attempts(&self) -> usize {
        self.lock().settle_attempts
    }

    /// `evaluateSlip` transactions succeed but leave the slip unevaluated.
    pub fn stall_evaluation(&self) {
        self.lock().stall_evaluation = true;
    }

    pub fn set_head(&self, head: u64) {
        self.lock().head = head;
    }

    pub fn emit(&self, contract: Address, block_number: u64, log_index: u64, tx_hash: &str, kind: EventKind) {
        let mut s = self.lock();
        s.head = s.head.max(block_number);
        s.events.push(ChainEvent {
            contract,
            meta: LogMeta {
                block_number,
                log_index,
                tx_hash: tx_hash.to_string(),
            },
            kind,
        });
    }

    pub fn writes(&self) -> Vec<WriteKind> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self, kind: WriteKind) -> usize {
        self.lock().writes.iter().filter(|w| **w == kind).count()
    }
}

#[async_trait]
impl ChainGateway for FakeChain {
    async fn current_cycle_id(&self) -> Result<u64> {
        Ok(self.lock().current_cycle)
    }

    async fn cycle_status(&self, cycle_id: u64) -> Result<CycleStatus> {
        Ok(self
            .lock()
            .cycles
            .get(&cycle_id)
            .map(|c| c.status.clone())
            .unwrap_or(CycleStatus {
                exists: false,
                state: CycleState::NotStarted,
                end_time: 0,
                prize_pool: U256::ZERO,
                slip_count: 0,
            }))
    }

    async fn cycle_matches(&self, cycle_id: u64) -> Result<Vec<OnChainMatch>> {
        self.lock()
            .cycles
            .get(&cycle_id)
            .map(|c| c.matches.clone())
            .ok_or_else(|| KeeperError::NotFound(format!("cycle {}", cycle_id)))
    }

    async fn slip(&self, slip_id: u64) -> Result<OnChainSlip> {
        self.lock()
            .slips
            .get(&slip_id)
            .cloned()
            .ok_or_else(|| KeeperError::NotFound(format!("slip {}", slip_id)))
    }

    async fn pool(&self, pool_id: u64) -> Result<OnChainPool> {
        self.lock()
            .pools
            .get(&pool_id)
            .cloned()
            .ok_or_else(|| KeeperError::NotFound(format!("pool {}", pool_id)))
    }

    async fn reputation(&self, _user: Address) -> Result<U256> {
        Ok(U256::from(100u64))
    }

    async fn oracle_outcome(&self, market_id: &str) -> Result<Option<Bytes>> {
        Ok(self.lock().outcomes.get(market_id).cloned())
    }

    async fn start_daily_cycle(&self, matches: &[CycleMatch]) -> Result<TxOutcome> {
        let end_time = matches
            .iter()
            .map(|m| m.kickoff.timestamp() as u64)
            .min()
            .unwrap_or_default();
        let ids: Vec<i64> = matches.iter().map(|m| m.fixture_id).collect();
        let next = self.lock().current_cycle + 1;
        self.add_cycle(next, CycleState::Active, end_time, &ids);
        Ok(self.lock().sent(WriteKind::StartCycle))
    }

    async fn resolve_cycle(&self, cycle_id: u64, results: &[MatchResultCodes]) -> Result<TxOutcome> {
        check_resolve_inputs(cycle_id, results)?;
        let mut s = self.lock();
        let cycle = s
            .cycles
            .get_mut(&cycle_id)
            .ok_or_else(|| KeeperError::NotFound(format!("cycle {}", cycle_id)))?;
        if cycle.status.state == CycleState::Resolved {
            return Err(KeeperError::TxRevert {
                reason: "Cycle already resolved".into(),
                tx_hash: None,
            });
        }
        cycle.status.state = CycleState::Resolved;
        cycle.results = results.to_vec();
        for (m, r) in cycle.matches.iter_mut().zip(results) {
            m.result = *r;
        }
        Ok(s.sent(WriteKind::ResolveCycle))
    }

    async fn evaluate_slip(&self, slip_id: u64) -> Result<TxOutcome> {
        let mut s = self.lock();
        if s.stall_evaluation {
            return Ok(s.sent(WriteKind::EvaluateSlip));
        }
        let slip = s
            .slips
            .get(&slip_id)
            .cloned()
            .ok_or_else(|| KeeperError::NotFound(format!("slip {}", slip_id)))?;
        let results = s
            .cycles
            .get(&slip.cycle_id)
            .filter(|c| c.status.state == CycleState::Resolved)
            .map(|c| c.results.clone())
            .ok_or_else(|| KeeperError::TxRevert {
                reason: "Cycle not resolved".into(),
                tx_hash: None,
            })?;
        let correct = slip
            .predictions
            .iter()
            .zip(results.iter())
            .filter(|(p, r)| {
                bitredict_keeper::chain::abi::selection_from_hash(p.selection).is_some_and(|sel| is_correct(sel, r))
            })
            .count() as u8;
        if let Some(stored) = s.slips.get_mut(&slip_id) {
            stored.is_evaluated = true;
            stored.correct_count = correct;
            stored.final_score = U256::from(1000u64 * u64::from(correct));
        }
        Ok(s.sent(WriteKind::EvaluateSlip))
    }

    async fn place_slip(&self, _predictions: &[SlipPrediction], _entry_fee: U256) -> Result<TxOutcome> {
        Ok(self.lock().sent(WriteKind::PlaceSlip))
    }

    async fn settle_pool(&self, pool_id: u64, outcome: B256) -> Result<TxOutcome> {
        let mut s = self.lock();
        s.settle_attempts += 1;
        if let Some(reason) = s.settle_revert.clone() {
            return Err(KeeperError::TxRevert { reason, tx_hash: None });
        }
        let pool = s
            .pools
            .get_mut(&pool_id)
            .ok_or_else(|| KeeperError::NotFound(format!("pool {}", pool_id)))?;
        if pool.settled {
            return Err(KeeperError::TxRevert {
                reason: "Pool already settled".into(),
                tx_hash: None,
            });
        }
        pool.settled = true;
        pool.result = outcome;
        pool.creator_side_won = pool.predicted_outcome != outcome;
        Ok(s.sent(WriteKind::SettlePool))
    }

    async fn create_pool(&self, _params: &CreatePoolParams, _value: U256) -> Result<TxOutcome> {
        Ok(self.lock().sent(WriteKind::CreatePool))
    }

    async fn claim(&self, _pool_id: u64) -> Result<TxOutcome> {
        Ok(self.lock().sent(WriteKind::Claim))
    }
}

#[async_trait]
impl LogSource for FakeChain {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.lock().head)
    }

    async fn fetch_events(&self, contract: Address, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>> {
        let mut events: Vec<ChainEvent> = self
            .lock()
            .events
            .iter()
            .filter(|e| e.contract == contract && (from_block..=to_block).contains(&e.meta.block_number))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.meta.block_number, e.meta.log_index));
        Ok(events)
    }
}

/// Final scores keyed by fixture id, reported as finished.
#[derive(Default)]
pub struct FakeFeed {
    scores: Mutex<HashMap<i64, (u32, u32)>>,
}

impl FakeFeed {
    pub fn with_scores(scores: &[(i64, (u32, u32))]) -> Self {
        Self {
            scores: Mutex::new(scores.iter().copied().collect()),
        }
    }
}

#[async_trait]
impl FixtureFeed for FakeFeed {
    async fn finished_results(&self, fixture_ids: &[i64]) -> Result<Vec<ExternalResult>> {
        let scores = self.scores.lock().unwrap();
        Ok(fixture_ids
            .iter()
            .filter_map(|id| {
                scores.get(id).map(|(h, a)| ExternalResult {
                    fixture_id: *id,
                    status: "FT".to_string(),
                    home_score: Some(*h),
                    away_score: Some(*a),
                    finished_at: None,
                })
            })
            .collect())
    }
}

pub struct Harness {
    pub services: Services,
    pub store: Arc<MemoryStore>,
    pub chain: Arc<FakeChain>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.slip_spacing_ms = 0;
    config.pipeline.batch_spacing_ms = 0;
    config.pipeline.batch_size = 2;
    config.indexer.window_blocks = 50;
    config.indexer.start_block = 1;
    config.coordinator.base_delay_ms = 1;
    config.coordinator.dependency_max_wait_secs = 0;
    config
}

pub fn harness(feed: FakeFeed) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(FakeChain::new());
    let services = Services::assemble(
        test_config(),
        store.clone(),
        chain.clone(),
        Arc::new(feed),
        vec![ODDYSSEY, POOLS, ORACLE],
        None,
    );
    Harness { services, store, chain }
}

pub async fn seed_fixtures(store: &MemoryStore, ids: &[i64], kickoff: DateTime<Utc>) {
    for id in ids {
        store
            .insert_fixture(&Fixture {
                id: *id,
                home_team: format!("Home {}", id),
                away_team: format!("Away {}", id),
                league: "Test League".to_string(),
                kickoff,
                odds: FixtureOdds {
                    home: Some(Decimal::new(200, 2)),
                    draw: Some(Decimal::new(320, 2)),
                    away: Some(Decimal::new(380, 2)),
                    over_25: Some(Decimal::new(190, 2)),
                    under_25: Some(Decimal::new(190, 2)),
                },
            })
            .await
            .unwrap();
    }
}

/// Seed the same cycle in the store and on the fake chain.
pub async fn seed_cycle(h: &Harness, cycle_id: i64, ids: &[i64], kickoff: DateTime<Utc>, state: CycleState) {
    seed_fixtures(&h.store, ids, kickoff).await;
    h.chain
        .add_cycle(cycle_id as u64, state, kickoff.timestamp() as u64, ids);
    h.store
        .upsert_cycle(&OddysseyCycle {
            cycle_id,
            start_time: kickoff - chrono::Duration::hours(12),
            end_time: kickoff,
            matches: ids
                .iter()
                .map(|id| CycleMatch {
                    fixture_id: *id,
                    kickoff,
                    odds_home: 2000,
                    odds_draw: 3200,
                    odds_away: 3800,
                    odds_over: 1900,
                    odds_under: 1900,
                })
                .collect(),
            prize_pool: "5000".to_string(),
            is_resolved: false,
            resolution_tx_hash: None,
            resolved_at: None,
            evaluation_completed: false,
        })
        .await
        .unwrap();
}

pub fn guided_pool(pool_id: u64, market_id: &str, predicted: B256, event_end_time: u64) -> OnChainPool {
    OnChainPool {
        pool_id,
        creator: Address::repeat_byte(0xcc),
        odds: 200,
        settled: false,
        creator_side_won: false,
        is_private: false,
        uses_bitr: false,
        oracle_type: OracleType::Guided,
        predicted_outcome: predicted,
        result: B256::ZERO,
        market_id: market_id.to_string(),
        creator_stake: U256::from(1_000_000_000_000_000_000u128),
        event_start_time: event_end_time - 7_200,
        event_end_time,
        betting_end_time: event_end_time - 7_200,
    }
}
