//! Racing units of work against a shared on-disk database.

use chrono::Duration;
use tokio::task::JoinSet;

use propbook::engine::EngineConfig;
use propbook::odds::price_line;
use propbook::storage;
use propbook::types::{EngineError, Side};

use crate::fixtures::{file_store, leg, remove_db, Harness};

#[tokio::test]
async fn test_cash_out_racing_settlement_credits_once() {
    let (store, path) = file_store().await;
    let h = Harness::with_store(store.clone(), EngineConfig::default());
    let prop = h.prop("Coffees", 3.0, 1).await;
    let option = h.option(&prop, 2.5).await;
    h.engine.credit_coins("bob", 1_000).await.unwrap();
    let parlay = h
        .engine
        .place_parlay("bob", 100, &[leg(&option, Side::Under)])
        .await
        .unwrap();
    h.advance(Duration::hours(2));

    let (cash_out, first) = tokio::join!(
        h.engine.cash_out_parlay(&parlay.id, "bob"),
        h.engine.resolve_parlays_for_user("bob"),
    );
    let first = first.unwrap();
    let cashed = match &cash_out {
        Ok(receipt) => receipt.amount_credited,
        Err(EngineError::TransactionConflict(_)) | Err(EngineError::NotFoundOrInactive(_)) => 0,
        Err(other) => panic!("unexpected cash-out error: {other}"),
    };
    assert!(usize::from(cash_out.is_ok()) + first.resolved_count <= 1);

    let second = h.engine.resolve_parlays_for_user("bob").await.unwrap();
    let credited = cashed + first.total_payout + second.total_payout;
    assert!(credited == 153 || credited == 265, "credited {credited}");
    assert_eq!(h.engine.balance("bob").await.unwrap(), 900 + credited);

    let valuation = h.engine.valuate_parlay(&parlay.id).await.unwrap();
    assert!(!matches!(valuation.state, propbook::types::ParlayState::Active));

    remove_db(store, path).await;
}

#[tokio::test]
async fn test_concurrent_tallies_are_all_or_nothing() {
    let (store, path) = file_store().await;
    let h = Harness::with_store(store.clone(), EngineConfig::default());
    let prop = h.prop("Doorbells", 10.0, 10).await;
    h.option(&prop, 9.5).await;
    h.option(&prop, 12.5).await;
    h.advance(Duration::hours(1));

    let mut tasks = JoinSet::new();
    for _ in 0..12 {
        let engine = h.engine.clone();
        let prop_id = prop.id.clone();
        tasks.spawn(async move { engine.add_tally(&prop_id, "bob").await });
    }

    let mut committed = 0u64;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Ok(_) => committed += 1,
            Err(EngineError::TransactionConflict(_)) => {}
            Err(other) => panic!("unexpected tally error: {other}"),
        }
    }

    let estimate = h.engine.live_estimate(&prop.id).await.unwrap();
    assert_eq!(estimate.tally_count, committed);
    assert!(committed > 0);

    // The last reprice to commit saw the final count, so the stored odds
    // already match it.
    let stored = {
        let mut conn = h.engine.store().acquire().await.unwrap();
        storage::fetch_active_options(&mut conn, &prop.id).await.unwrap()
    };
    assert_eq!(stored.len(), 2);
    for option in &stored {
        let expected = price_line(estimate.effective_ev, option.line).unwrap();
        assert_eq!(
            (option.odds_over, option.odds_under),
            (expected.odds_over, expected.odds_under),
            "line {}",
            option.line
        );
    }

    remove_db(store, path).await;
}
