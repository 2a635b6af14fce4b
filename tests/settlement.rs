mod common;

use alloy::primitives::{Bytes, B256};
use bitredict_keeper::chain::abi::market_id_hash;
use bitredict_keeper::chain::{OnChainPool, WriteKind};
use bitredict_keeper::coordinator::JobContext;
use bitredict_keeper::error::ErrorKind;
use bitredict_keeper::indexer::events::EventKind;
use bitredict_keeper::indexer::STREAM_ALL;
use bitredict_keeper::scheduler::{Job, Scheduler};
use bitredict_keeper::settlement::{outcome_bytes32, SettleOutcome};
use bitredict_keeper::store::{CursorStore, ExecutionStatus, PoolStore};
use chrono::Utc;
use common::*;
use std::sync::Arc;

const BAYERN: &str = "\u{1}\u{2}Bayern vs Union";

async fn store_pool(h: &Harness, pool: OnChainPool) {
    h.store.upsert_pool(&pool.to_record(None).unwrap()).await.unwrap();
    h.services.settlement.remember_market_id(&pool.market_id).await.unwrap();
    h.chain.add_pool(pool);
}

fn ended() -> u64 {
    (Utc::now().timestamp() - 3_600) as u64
}

fn outcome_event(market_id: &str, data: &'static [u8]) -> EventKind {
    EventKind::OutcomeSubmitted {
        market_id_hash: market_id_hash(market_id),
        result_data: Bytes::from_static(data),
        timestamp: ended(),
    }
}

#[tokio::test]
async fn test_outcome_settles_only_the_matching_pool() {
    let h = harness(FakeFeed::default());
    let home = outcome_bytes32(b"Home");
    h.chain.add_pool(guided_pool(7, BAYERN, home, ended()));
    h.chain.add_pool(guided_pool(8, "Dortmund vs Koln", home, ended()));
    for (block, pool_id, market) in [(1, 7u64, BAYERN), (2, 8u64, "Dortmund vs Koln")] {
        h.chain.emit(
            POOLS,
            block,
            0,
            &format!("0x{:02x}", block),
            EventKind::PoolCreated {
                pool_id,
                creator: alloy::primitives::Address::repeat_byte(0xcc),
                event_start_time: 0,
                event_end_time: 0,
                oracle_type: 0,
                market_id_hash: market_id_hash(market),
            },
        );
    }
    h.chain.emit(
        ORACLE,
        5,
        0,
        "0x05",
        EventKind::OutcomeSubmitted {
            market_id_hash: market_id_hash("Bayern vs Union"),
            result_data: Bytes::from_static(b"Home"),
            timestamp: ended(),
        },
    );

    let summary = h.services.indexer.poll_once().await.unwrap();
    assert_eq!(summary.skipped, 0);

    assert_eq!(h.chain.write_count(WriteKind::SettlePool), 1);
    let settled = h.store.pool(7).await.unwrap().unwrap();
    assert!(settled.settled);
    assert_eq!(settled.creator_side_won, Some(false));
    assert_eq!(settled.result.as_deref(), Some(format!("{:#x}", home).as_str()));
    assert!(settled.settlement_tx_hash.is_some());
    assert!(!h.store.pool(8).await.unwrap().unwrap().settled);

    let cleaned_hash = format!("{:#x}", market_id_hash("Bayern vs Union"));
    assert_eq!(
        h.store.lookup_market_id(&cleaned_hash).await.unwrap().as_deref(),
        Some("Bayern vs Union")
    );
}

#[tokio::test]
async fn test_unknown_market_hash_settles_nothing() {
    let h = harness(FakeFeed::default());
    store_pool(&h, guided_pool(7, BAYERN, B256::ZERO, ended())).await;

    let outcomes = h
        .services
        .settlement
        .handle_outcome(market_id_hash("Celtic vs Rangers"), b"Home")
        .await
        .unwrap();
    assert!(outcomes.is_empty());
    assert!(h.chain.writes().is_empty());
}

#[tokio::test]
async fn test_event_not_ended_defers() {
    let h = harness(FakeFeed::default());
    store_pool(&h, guided_pool(7, BAYERN, B256::ZERO, ended())).await;
    h.chain.fail_settlement_with("execution reverted: Event not ended yet");

    let pool = h.store.pool(7).await.unwrap().unwrap();
    let outcome = h.services.settlement.settle_pool(&pool, outcome_bytes32(b"Away")).await.unwrap();
    assert_eq!(outcome, SettleOutcome::NotEnded { pool_id: 7 });
    assert!(!h.store.pool(7).await.unwrap().unwrap().settled);
}

#[tokio::test]
async fn test_unauthorized_oracle_is_an_invariant_violation() {
    let h = harness(FakeFeed::default());
    store_pool(&h, guided_pool(7, BAYERN, B256::ZERO, ended())).await;
    h.chain.fail_settlement_with("execution reverted: Only guided oracle");

    let pool = h.store.pool(7).await.unwrap().unwrap();
    let err = h
        .services
        .settlement
        .settle_pool(&pool, outcome_bytes32(b"Away"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    assert!(!h.store.pool(7).await.unwrap().unwrap().settled);
}

#[tokio::test]
async fn test_already_settled_on_chain_syncs_database() {
    let h = harness(FakeFeed::default());
    let mut pool = guided_pool(7, BAYERN, outcome_bytes32(b"Home"), ended());
    store_pool(&h, pool.clone()).await;
    pool.settled = true;
    pool.result = outcome_bytes32(b"Draw");
    pool.creator_side_won = true;
    h.chain.add_pool(pool);

    let record = h.store.pool(7).await.unwrap().unwrap();
    let outcome = h.services.settlement.settle_pool(&record, outcome_bytes32(b"Draw")).await.unwrap();
    assert_eq!(outcome, SettleOutcome::AlreadySettled { pool_id: 7 });

    let synced = h.store.pool(7).await.unwrap().unwrap();
    assert!(synced.settled);
    assert_eq!(synced.creator_side_won, Some(true));
    assert_eq!(synced.result.as_deref(), Some(format!("{:#x}", outcome_bytes32(b"Draw")).as_str()));
    assert_eq!(synced.settlement_tx_hash, None);
}

#[tokio::test]
async fn test_fallback_settles_pools_with_stored_outcome() {
    let h = harness(FakeFeed::default());
    store_pool(&h, guided_pool(7, BAYERN, outcome_bytes32(b"Home"), ended())).await;
    store_pool(&h, guided_pool(9, "Lazio vs Roma", outcome_bytes32(b"Home"), ended())).await;
    // Not over yet, never checked.
    let future = (Utc::now().timestamp() + 86_400) as u64;
    store_pool(&h, guided_pool(10, "Ajax vs PSV", outcome_bytes32(b"Home"), future)).await;
    // Stored under the cleaned id only.
    h.chain.set_oracle_outcome("Bayern vs Union", b"Away");

    let summary = h
        .services
        .settlement
        .settle_due_pools(&JobContext::detached("pool_settlement_fallback"), Utc::now())
        .await
        .unwrap();
    assert_eq!(summary.checked, 2);
    assert_eq!(summary.settled, 1);
    assert_eq!(summary.awaiting_outcome, 1);

    let pool = h.store.pool(7).await.unwrap().unwrap();
    assert!(pool.settled);
    assert_eq!(pool.creator_side_won, Some(true));
    assert!(!h.store.pool(9).await.unwrap().unwrap().settled);
    assert!(!h.store.pool(10).await.unwrap().unwrap().settled);
}

#[tokio::test]
async fn test_reverting_settlement_does_not_hold_back_oracle_events() {
    let h = harness(FakeFeed::default());
    store_pool(&h, guided_pool(7, BAYERN, outcome_bytes32(b"Home"), ended())).await;
    h.chain.fail_settlement_with("execution reverted: out of gas");
    h.chain.emit(ORACLE, 5, 0, "0x05", outcome_event("Bayern vs Union", b"Away"));
    h.chain.emit(ORACLE, 9, 0, "0x09", outcome_event("Celtic vs Rangers", b"Home"));

    let first = h.services.indexer.poll_once().await.unwrap();
    assert_eq!(first.handled, 2);
    let second = h.services.indexer.poll_once().await.unwrap();
    assert_eq!(second.windows, 0);

    let cursor = h.store.cursor(&format!("{:#x}", ORACLE), STREAM_ALL).await.unwrap();
    assert_eq!(cursor, Some(9));
    assert_eq!(h.chain.settle_attempts(), 1);
    assert!(!h.store.pool(7).await.unwrap().unwrap().settled);

    let alerts = h.store.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, "tx_revert");
    assert_eq!(alerts[0].details["pool_id"], serde_json::json!(7));
}

#[tokio::test]
async fn test_deferred_outcome_is_reported_per_pool() {
    let h = harness(FakeFeed::default());
    store_pool(&h, guided_pool(7, BAYERN, B256::ZERO, ended())).await;
    h.chain.fail_settlement_with("execution reverted: Only guided oracle");

    let outcomes = h
        .services
        .settlement
        .handle_outcome(market_id_hash("Bayern vs Union"), b"Home")
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        &outcomes[0],
        SettleOutcome::Deferred { pool_id: 7, kind, .. } if kind == "invariant_violation"
    ));

    let alerts = h.store.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, "invariant_violation");
    assert_eq!(alerts[0].details["source"], serde_json::json!("outcome_submitted"));
}

#[tokio::test]
async fn test_fallback_job_fails_and_alerts_on_unclassified_revert() {
    let h = harness(FakeFeed::default());
    store_pool(&h, guided_pool(7, BAYERN, outcome_bytes32(b"Home"), ended())).await;
    h.chain.set_oracle_outcome(BAYERN, b"Away");
    h.chain.fail_settlement_with("execution reverted: out of gas");

    let store = h.store.clone();
    let chain = h.chain.clone();
    let scheduler = Scheduler::new(Arc::new(h.services));
    let err = scheduler.run_job(Job::SettlementFallback).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TxRevert);

    // Retried with backoff, and every run is logged as failed.
    let runs = store.executions_for("pool_settlement_fallback").await;
    assert!(runs.len() > 1);
    assert!(runs.iter().all(|r| r.status == ExecutionStatus::Failed));
    assert_eq!(chain.settle_attempts(), runs.len());

    let alerts = store.alerts().await;
    assert_eq!(alerts.len(), runs.len());
    assert!(alerts.iter().all(|a| a.alert_type == "tx_revert"));
    assert!(!store.pool(7).await.unwrap().unwrap().settled);
}
