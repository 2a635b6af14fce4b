//! Decoded contract events.

use crate::store::models::LogRef;
use alloy::primitives::{Address, Bytes, B256, U256};

/// Where a log came from. Event-derived rows are keyed by
/// `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMeta {
    pub block_number: u64,
    pub log_index: u64,
    /// 0x-prefixed, lowercase.
    pub tx_hash: String,
}

impl LogMeta {
    pub fn log_ref(&self) -> LogRef {
        LogRef {
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index as i64,
            block_number: self.block_number as i64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    // Oddyssey
    CycleStarted {
        cycle_id: u64,
        end_time: u64,
    },
    SlipPlaced {
        cycle_id: u64,
        player: Address,
        slip_id: u64,
    },
    CycleResolved {
        cycle_id: u64,
        prize_pool: U256,
    },
    SlipEvaluated {
        slip_id: u64,
        player: Address,
        cycle_id: u64,
        correct_count: u8,
        final_score: U256,
    },
    // Pools
    PoolCreated {
        pool_id: u64,
        creator: Address,
        event_start_time: u64,
        event_end_time: u64,
        oracle_type: u8,
        market_id_hash: B256,
    },
    BetPlaced {
        pool_id: u64,
        bettor: Address,
        amount: U256,
        is_for_outcome: bool,
    },
    LiquidityAdded {
        pool_id: u64,
        provider: Address,
        amount: U256,
    },
    PoolSettled {
        pool_id: u64,
        result: B256,
        creator_side_won: bool,
    },
    RewardClaimed {
        pool_id: u64,
        user: Address,
        amount: U256,
    },
    // Guided oracle
    OutcomeSubmitted {
        market_id_hash: B256,
        result_data: Bytes,
        timestamp: u64,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::CycleStarted { .. } => "CycleStarted",
            EventKind::SlipPlaced { .. } => "SlipPlaced",
            EventKind::CycleResolved { .. } => "CycleResolved",
            EventKind::SlipEvaluated { .. } => "SlipEvaluated",
            EventKind::PoolCreated { .. } => "PoolCreated",
            EventKind::BetPlaced { .. } => "BetPlaced",
            EventKind::LiquidityAdded { .. } => "LiquidityAdded",
            EventKind::PoolSettled { .. } => "PoolSettled",
            EventKind::RewardClaimed { .. } => "RewardClaimed",
            EventKind::OutcomeSubmitted { .. } => "OutcomeSubmitted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub contract: Address,
    pub meta: LogMeta,
    pub kind: EventKind,
}

/// Handlers within a window run in block, then log index, order.
pub fn sort_events(events: &mut [ChainEvent]) {
    events.sort_by(|a, b| {
        a.meta
            .block_number
            .cmp(&b.meta.block_number)
            .then(a.meta.log_index.cmp(&b.meta.log_index))
    });
}
