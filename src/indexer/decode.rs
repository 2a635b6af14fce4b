//! Raw log → `ChainEvent`, dispatched on topic0.

use super::events::{ChainEvent, EventKind, LogMeta};
use crate::chain::abi::{IBitredictPool, IGuidedOracle, IOddyssey};
use crate::chain::types::u256_to_u64;
use crate::error::{KeeperError, Result};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use tracing::debug;

fn decode_err(name: &str, e: impl std::fmt::Display) -> KeeperError {
    KeeperError::Validation(format!("undecodable {} log: {}", name, e))
}

/// Decode one log. Unknown topics yield `Ok(None)`; pending logs (no block
/// number, tx hash or log index yet) are rejected.
pub fn decode_log(log: &Log) -> Result<Option<ChainEvent>> {
    let Some(topic0) = log.topic0() else {
        return Ok(None);
    };

    let meta = LogMeta {
        block_number: log
            .block_number
            .ok_or_else(|| KeeperError::Validation("log without block number".into()))?,
        log_index: log
            .log_index
            .ok_or_else(|| KeeperError::Validation("log without log index".into()))?,
        tx_hash: log
            .transaction_hash
            .map(|h| format!("{:#x}", h))
            .ok_or_else(|| KeeperError::Validation("log without tx hash".into()))?,
    };

    let kind = match *topic0 {
        t if t == IOddyssey::CycleStarted::SIGNATURE_HASH => {
            let ev = log
                .log_decode::<IOddyssey::CycleStarted>()
                .map_err(|e| decode_err("CycleStarted", e))?
                .inner
                .data;
            EventKind::CycleStarted {
                cycle_id: u256_to_u64(ev.cycleId, "cycle id")?,
                end_time: u256_to_u64(ev.endTime, "end time")?,
            }
        }
        t if t == IOddyssey::SlipPlaced::SIGNATURE_HASH => {
            let ev = log
                .log_decode::<IOddyssey::SlipPlaced>()
                .map_err(|e| decode_err("SlipPlaced", e))?
                .inner
                .data;
            EventKind::SlipPlaced {
                cycle_id: u256_to_u64(ev.cycleId, "cycle id")?,
                player: ev.player,
                slip_id: u256_to_u64(ev.slipId, "slip id")?,
            }
        }
        t if t == IOddyssey::CycleResolved::SIGNATURE_HASH => {
            let ev = log
                .log_decode::<IOddyssey::CycleResolved>()
                .map_err(|e| decode_err("CycleResolved", e))?
                .inner
                .data;
            EventKind::CycleResolved {
                cycle_id: u256_to_u64(ev.cycleId, "cycle id")?,
                prize_pool: ev.prizePool,
            }
        }
        t if t == IOddyssey::SlipEvaluated::SIGNATURE_HASH => {
            let ev = log
                .log_decode::<IOddyssey::SlipEvaluated>()
                .map_err(|e| decode_err("SlipEvaluated", e))?
                .inner
                .data;
            EventKind::SlipEvaluated {
                slip_id: u256_to_u64(ev.slipId, "slip id")?,
                player: ev.player,
                cycle_id: u256_to_u64(ev.cycleId, "cycle id")?,
                correct_count: ev.correctCount,
                final_score: ev.finalScore,
            }
        }
        t if t == IBitredictPool::PoolCreated::SIGNATURE_HASH => {
            let ev = log
                .log_decode::<IBitredictPool::PoolCreated>()
                .map_err(|e| decode_err("PoolCreated", e))?
                .inner
                .data;
            EventKind::PoolCreated {
                pool_id: u256_to_u64(ev.poolId, "pool id")?,
                creator: ev.creator,
                event_start_time: u256_to_u64(ev.eventStartTime, "event start")?,
                event_end_time: u256_to_u64(ev.eventEndTime, "event end")?,
                oracle_type: ev.oracleType,
                market_id_hash: ev.marketId,
            }
        }
        t if t == IBitredictPool::BetPlaced::SIGNATURE_HASH => {
            let ev = log
                .log_decode::<IBitredictPool::BetPlaced>()
                .map_err(|e| decode_err("BetPlaced", e))?
                .inner
                .data;
            EventKind::BetPlaced {
                pool_id: u256_to_u64(ev.poolId, "pool id")?,
                bettor: ev.bettor,
                amount: ev.amount,
                is_for_outcome: ev.isForOutcome,
            }
        }
        t if t == IBitredictPool::LiquidityAdded::SIGNATURE_HASH => {
            let ev = log
                .log_decode::<IBitredictPool::LiquidityAdded>()
                .map_err(|e| decode_err("LiquidityAdded", e))?
                .inner
                .data;
            EventKind::LiquidityAdded {
                pool_id: u256_to_u64(ev.poolId, "pool id")?,
                provider: ev.provider,
                amount: ev.amount,
            }
        }
        t if t == IBitredictPool::PoolSettled::SIGNATURE_HASH => {
            let ev = log
                .log_decode::<IBitredictPool::PoolSettled>()
                .map_err(|e| decode_err("PoolSettled", e))?
                .inner
                .data;
            EventKind::PoolSettled {
                pool_id: u256_to_u64(ev.poolId, "pool id")?,
                result: ev.result,
                creator_side_won: ev.creatorSideWon,
            }
        }
        t if t == IBitredictPool::RewardClaimed::SIGNATURE_HASH => {
            let ev = log
                .log_decode::<IBitredictPool::RewardClaimed>()
                .map_err(|e| decode_err("RewardClaimed", e))?
                .inner
                .data;
            EventKind::RewardClaimed {
                pool_id: u256_to_u64(ev.poolId, "pool id")?,
                user: ev.user,
                amount: ev.amount,
            }
        }
        t if t == IGuidedOracle::OutcomeSubmitted::SIGNATURE_HASH => {
            let ev = log
                .log_decode::<IGuidedOracle::OutcomeSubmitted>()
                .map_err(|e| decode_err("OutcomeSubmitted", e))?
                .inner
                .data;
            EventKind::OutcomeSubmitted {
                market_id_hash: ev.marketId,
                result_data: ev.resultData,
                timestamp: u256_to_u64(ev.timestamp, "timestamp")?,
            }
        }
        _ => {
            debug!(topic = %topic0, "unrecognised event topic");
            return Ok(None);
        }
    };

    Ok(Some(ChainEvent {
        contract: log.address(),
        meta,
        kind,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::abi::market_id_hash;
    use alloy::primitives::{Address, Bytes, B256, U256};

    fn rpc_log(address: Address, data: alloy::primitives::LogData, block: u64, index: u64) -> Log {
        Log {
            inner: alloy::primitives::Log { address, data },
            block_number: Some(block),
            log_index: Some(index),
            transaction_hash: Some(B256::repeat_byte(0x11)),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_bet_placed() {
        let pool = Address::repeat_byte(0x22);
        let ev = IBitredictPool::BetPlaced {
            poolId: U256::from(7u64),
            bettor: Address::repeat_byte(0x33),
            amount: U256::from(10u64).pow(U256::from(18u64)),
            isForOutcome: true,
        };
        let decoded = decode_log(&rpc_log(pool, ev.encode_log_data(), 120, 3))
            .unwrap()
            .unwrap();
        assert_eq!(decoded.contract, pool);
        assert_eq!(decoded.meta.block_number, 120);
        assert_eq!(decoded.meta.log_index, 3);
        assert_eq!(decoded.meta.tx_hash, format!("0x{}", "11".repeat(32)));
        assert_eq!(
            decoded.kind,
            EventKind::BetPlaced {
                pool_id: 7,
                bettor: Address::repeat_byte(0x33),
                amount: U256::from(10u64).pow(U256::from(18u64)),
                is_for_outcome: true,
            }
        );
    }

    #[test]
    fn test_decode_outcome_submitted_keeps_hash() {
        let hash = market_id_hash("Bayern vs Union");
        let ev = IGuidedOracle::OutcomeSubmitted {
            marketId: hash,
            resultData: Bytes::from_static(b"Home"),
            timestamp: U256::from(1_700_000_000u64),
        };
        let decoded = decode_log(&rpc_log(Address::ZERO, ev.encode_log_data(), 1, 0))
            .unwrap()
            .unwrap();
        match decoded.kind {
            EventKind::OutcomeSubmitted {
                market_id_hash,
                result_data,
                timestamp,
            } => {
                assert_eq!(market_id_hash, hash);
                assert_eq!(result_data.as_ref(), b"Home");
                assert_eq!(timestamp, 1_700_000_000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_topic_is_skipped() {
        let data = alloy::primitives::LogData::new_unchecked(vec![B256::repeat_byte(0x99)], Bytes::new());
        assert!(decode_log(&rpc_log(Address::ZERO, data, 1, 0)).unwrap().is_none());
    }

    #[test]
    fn test_pending_log_rejected() {
        let ev = IOddyssey::CycleStarted {
            cycleId: U256::from(1u64),
            endTime: U256::from(2u64),
        };
        let mut log = rpc_log(Address::ZERO, ev.encode_log_data(), 1, 0);
        log.block_number = None;
        assert!(decode_log(&log).is_err());
    }
}
