mod common;

use alloy::primitives::{Address, B256, U256};
use bitredict_keeper::chain::abi::market_id_hash;
use bitredict_keeper::indexer::events::EventKind;
use bitredict_keeper::indexer::STREAM_ALL;
use bitredict_keeper::outcome::{CycleState, Selection};
use bitredict_keeper::store::{CursorStore, CycleStore, PoolStore};
use chrono::{Duration, Utc};
use common::*;

const POOL_ID: u64 = 3;

fn pool_created(pool_id: u64, market_id: &str) -> EventKind {
    EventKind::PoolCreated {
        pool_id,
        creator: Address::repeat_byte(0xcc),
        event_start_time: 1_900_000_000,
        event_end_time: 1_900_007_200,
        oracle_type: 0,
        market_id_hash: market_id_hash(market_id),
    }
}

fn bet(bettor: u8, wei: u64, is_for_outcome: bool) -> EventKind {
    EventKind::BetPlaced {
        pool_id: POOL_ID,
        bettor: Address::repeat_byte(bettor),
        amount: U256::from(wei),
        is_for_outcome,
    }
}

/// Pool 3 created at block 10, then three bets at blocks 11 and 12.
fn emit_pool_with_bets(h: &Harness) {
    h.chain
        .add_pool(guided_pool(POOL_ID, "Arsenal vs Chelsea", B256::repeat_byte(0x01), 1_900_007_200));
    h.chain
        .emit(POOLS, 10, 0, "0x0a", pool_created(POOL_ID, "Arsenal vs Chelsea"));
    h.chain.emit(POOLS, 11, 0, "0x0b", bet(0xb1, 1_000, true));
    h.chain.emit(POOLS, 12, 0, "0x0c", bet(0xb2, 2_500, false));
    h.chain.emit(POOLS, 12, 1, "0x0c", bet(0xb3, 4_000, true));
}

#[tokio::test]
async fn test_fallback_reconciliation_matches_live_indexing() {
    let live = harness(FakeFeed::default());
    emit_pool_with_bets(&live);
    let summary = live.services.indexer.poll_once().await.unwrap();
    assert_eq!(summary.head, 12);
    assert_eq!(summary.skipped, 0);

    // The indexer only saw the pool being created before it went down.
    let offline = harness(FakeFeed::default());
    offline
        .chain
        .add_pool(guided_pool(POOL_ID, "Arsenal vs Chelsea", B256::repeat_byte(0x01), 1_900_007_200));
    offline
        .chain
        .emit(POOLS, 10, 0, "0x0a", pool_created(POOL_ID, "Arsenal vs Chelsea"));
    offline.services.indexer.poll_once().await.unwrap();
    offline.chain.emit(POOLS, 11, 0, "0x0b", bet(0xb1, 1_000, true));
    offline.chain.emit(POOLS, 12, 0, "0x0c", bet(0xb2, 2_500, false));
    offline.chain.emit(POOLS, 12, 1, "0x0c", bet(0xb3, 4_000, true));
    assert!(offline.store.bets_for_pool(POOL_ID as i64).await.unwrap().is_empty());

    let reconciled = offline.services.indexer.reconcile(1_000).await.unwrap();
    assert_eq!(reconciled.skipped, 0);

    let bets = offline.store.bets_for_pool(POOL_ID as i64).await.unwrap();
    assert_eq!(bets.len(), 3);
    let coords: Vec<(&str, i64, &str)> = bets
        .iter()
        .map(|b| (b.log.tx_hash.as_str(), b.log.log_index, b.amount.as_str()))
        .collect();
    assert_eq!(coords, vec![("0x0b", 0, "1000"), ("0x0c", 0, "2500"), ("0x0c", 1, "4000")]);
    assert_eq!(bets[0].bettor, format!("{:#x}", Address::repeat_byte(0xb1)));

    assert_eq!(bets, live.store.bets_for_pool(POOL_ID as i64).await.unwrap());
    let totals = offline.store.bet_totals(POOL_ID as i64).await.unwrap();
    assert_eq!(totals, live.store.bet_totals(POOL_ID as i64).await.unwrap());
    assert_eq!(totals.bet_count, 3);
    assert_eq!(totals.total_amount, "7500");
}

#[tokio::test]
async fn test_duplicate_delivery_leaves_identical_rows() {
    let h = harness(FakeFeed::default());
    emit_pool_with_bets(&h);
    h.services.indexer.poll_once().await.unwrap();

    let pool_before = serde_json::to_vec(&h.store.pool(POOL_ID as i64).await.unwrap()).unwrap();
    let bets_before = serde_json::to_vec(&h.store.bets_for_pool(POOL_ID as i64).await.unwrap()).unwrap();

    h.services.indexer.reconcile(1_000).await.unwrap();
    h.services.indexer.reconcile(1_000).await.unwrap();

    let pool_after = serde_json::to_vec(&h.store.pool(POOL_ID as i64).await.unwrap()).unwrap();
    let bets_after = serde_json::to_vec(&h.store.bets_for_pool(POOL_ID as i64).await.unwrap()).unwrap();
    assert_eq!(pool_before, pool_after);
    assert_eq!(bets_before, bets_after);
}

#[tokio::test]
async fn test_cursor_advances_past_skipped_events() {
    let h = harness(FakeFeed::default());
    // The slip was never placed on the fake chain, so the handler reports
    // NotFound and the event is skipped.
    h.chain.emit(
        ODDYSSEY,
        5,
        0,
        "0x05",
        EventKind::SlipPlaced {
            cycle_id: 1,
            player: Address::repeat_byte(0xaa),
            slip_id: 99,
        },
    );
    h.chain.set_head(120);

    let summary = h.services.indexer.poll_once().await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.handled, 0);

    let cursor = h
        .store
        .cursor(&format!("{:#x}", ODDYSSEY), STREAM_ALL)
        .await
        .unwrap();
    assert_eq!(cursor, Some(120));

    // Nothing new: the next poll starts past the head and does no work.
    let again = h.services.indexer.poll_once().await.unwrap();
    assert_eq!(again.windows, 0);
}

#[tokio::test]
async fn test_slip_placed_event_records_cycle_and_slip() {
    let h = harness(FakeFeed::default());
    let kickoff = Utc::now() + Duration::hours(6);
    h.chain
        .add_cycle(1, CycleState::Active, kickoff.timestamp() as u64, &FIXTURE_IDS);
    h.chain.add_slip(8, 1, &FIXTURE_IDS, &[Selection::Over; 10]);
    let placed = EventKind::SlipPlaced {
        cycle_id: 1,
        player: Address::repeat_byte(0xaa),
        slip_id: 8,
    };
    // Same log delivered twice.
    h.chain.emit(ODDYSSEY, 3, 0, "0x03", placed.clone());
    h.chain.emit(ODDYSSEY, 3, 0, "0x03", placed);

    let summary = h.services.indexer.poll_once().await.unwrap();
    assert_eq!(summary.handled, 2);

    let cycle = h.store.cycle(1).await.unwrap().unwrap();
    assert_eq!(cycle.match_ids(), FIXTURE_IDS.to_vec());
    let slip = h.store.slip(8).await.unwrap().unwrap();
    assert_eq!(slip.tx_hash.as_deref(), Some("0x03"));
    assert_eq!(slip.predictions.len(), 10);
    assert_eq!(h.store.slips_for_cycle(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_pool_settled_event_marks_pool() {
    let h = harness(FakeFeed::default());
    emit_pool_with_bets(&h);
    h.chain.emit(
        POOLS,
        20,
        0,
        "0x14",
        EventKind::PoolSettled {
            pool_id: POOL_ID,
            result: B256::repeat_byte(0x02),
            creator_side_won: true,
        },
    );
    h.services.indexer.poll_once().await.unwrap();

    let pool = h.store.pool(POOL_ID as i64).await.unwrap().unwrap();
    assert!(pool.settled);
    assert_eq!(pool.creator_side_won, Some(true));
    assert_eq!(pool.settlement_tx_hash.as_deref(), Some("0x14"));
    assert!(h.chain.writes().is_empty());
}

#[tokio::test]
async fn test_invariant_violation_in_handler_raises_alert_and_moves_on() {
    let h = harness(FakeFeed::default());
    let kickoff = Utc::now() + Duration::hours(6);
    h.chain
        .add_cycle(1, CycleState::Active, kickoff.timestamp() as u64, &FIXTURE_IDS);
    let mut swapped = FIXTURE_IDS;
    swapped.swap(4, 5);
    h.chain.add_slip(8, 1, &swapped, &[Selection::Over; 10]);
    h.chain.emit(
        ODDYSSEY,
        4,
        0,
        "0x04",
        EventKind::SlipPlaced {
            cycle_id: 1,
            player: Address::repeat_byte(0xaa),
            slip_id: 8,
        },
    );

    let summary = h.services.indexer.poll_once().await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert!(h.store.slip(8).await.unwrap().is_none());
    let cursor = h
        .store
        .cursor(&format!("{:#x}", ODDYSSEY), STREAM_ALL)
        .await
        .unwrap();
    assert_eq!(cursor, Some(4));

    let alerts = h.store.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, "invariant_violation");
    assert_eq!(alerts[0].details["source"], serde_json::json!("event_indexer"));
    assert_eq!(alerts[0].details["tx_hash"], serde_json::json!("0x04"));
}
