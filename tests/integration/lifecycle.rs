//! Create → price → place → tally → value → cash out / settle.

use chrono::Duration;
use rust_decimal_macros::dec;

use propbook::engine::settlement::winning_payout;
use propbook::odds::LinePrice;
use propbook::types::{ParlayState, Side};

use crate::fixtures::{leg, Harness};

#[tokio::test]
async fn test_full_lifecycle() {
    let h = Harness::new().await;
    let goals = h.prop("Goals scored", 10.0, 10).await;
    let corners = h.prop("Corners taken", 4.0, 10).await;

    let goals_12 = h.option(&goals, 12.5).await;
    let corners_3 = h.option(&corners, 3.5).await;
    assert_eq!((goals_12.odds_over, goals_12.odds_under), (220, -235));
    assert_eq!((corners_3.odds_over, corners_3.odds_under), (-150, 140));

    h.engine.credit_coins("bob", 1_000).await.unwrap();
    h.engine.credit_coins("carol", 500).await.unwrap();

    let bob = h
        .engine
        .place_parlay("bob", 100, &[leg(&goals_12, Side::Under), leg(&corners_3, Side::Over)])
        .await
        .unwrap();
    let carol = h
        .engine
        .place_parlay("carol", 50, &[leg(&goals_12, Side::Over)])
        .await
        .unwrap();
    assert_eq!(h.engine.balance("bob").await.unwrap(), 900);
    assert_eq!(h.engine.balance("carol").await.unwrap(), 450);

    let opening = h.engine.valuate_parlay(&bob.id).await.unwrap();
    assert_eq!(opening.potential_payout, 138);

    // Halfway through, both of bob's legs are ahead.
    h.advance(Duration::hours(5));
    h.tallies(&goals, 8).await;
    h.tallies(&corners, 5).await;

    let live = h.engine.price_new_option(&goals.id, 12.5).await.unwrap();
    assert_eq!(live, LinePrice { odds_over: 105, odds_under: -110 });

    let midway = h.engine.valuate_parlay(&bob.id).await.unwrap();
    assert_eq!(midway.legs[0].odds_locked_in, -235);
    assert_eq!(midway.combined_odds, opening.combined_odds);
    assert_eq!(midway.winning_legs, 2);
    assert_eq!(midway.progress_pct(), 100.0);
    assert_eq!(midway.cash_out_amount, 182);

    // Carol is behind and takes what she can.
    let carol_value = h.engine.valuate_parlay(&carol.id).await.unwrap();
    assert_eq!(carol_value.winning_legs, 0);
    let receipt = h.engine.cash_out_parlay(&carol.id, "carol").await.unwrap();
    assert_eq!(receipt.amount_credited, 70);
    assert_eq!(h.engine.balance("carol").await.unwrap(), 520);

    h.advance(Duration::hours(4));
    h.tallies(&goals, 2).await;

    // After the props end; these do not count.
    h.advance(Duration::hours(2));
    h.tallies(&goals, 5).await;

    let report = h.engine.resolve_all_parlays().await.unwrap();
    let expected = winning_payout(100, &[-235, -150]).unwrap();
    assert_eq!(expected, 238);
    assert_eq!(report.resolved_count, 1);
    assert_eq!(report.won_count, 1);
    assert_eq!(report.total_payout, expected);
    assert!(report.failures.is_empty());
    assert_eq!(h.engine.balance("bob").await.unwrap(), 900 + expected);

    let rerun = h.engine.resolve_all_parlays().await.unwrap();
    assert_eq!(rerun.resolved_count, 0);
    assert_eq!(rerun.total_payout, 0);
    assert_eq!(h.engine.balance("bob").await.unwrap(), 900 + expected);

    let settled = h.engine.valuate_parlay(&bob.id).await.unwrap();
    assert_eq!(settled.state, ParlayState::Won);
    let cashed = h.engine.valuate_parlay(&carol.id).await.unwrap();
    assert_eq!(cashed.state, ParlayState::CashedOut);
}

#[tokio::test]
async fn test_two_leg_parlay_pricing() {
    let h = Harness::new().await;
    let prop = h.prop("Laps", 10.0, 4).await;
    let options = [h.option(&prop, 7.5).await, h.option(&prop, 12.5).await];
    h.engine.credit_coins("bob", 100).await.unwrap();

    // Under 7.5 and over 12.5 both pay +220.
    let parlay = h
        .engine
        .place_parlay("bob", 100, &[leg(&options[0], Side::Under), leg(&options[1], Side::Over)])
        .await
        .unwrap();
    let valuation = h.engine.valuate_parlay(&parlay.id).await.unwrap();
    assert_eq!(valuation.combined_odds, dec!(10.24));
    assert_eq!(valuation.potential_payout, 924);
}

#[tokio::test]
async fn test_removing_only_tally_restores_opening_odds() {
    let h = Harness::new().await;
    let prop = h.prop("Emails", 10.0, 10).await;
    let option = h.option(&prop, 12.5).await;

    h.advance(Duration::hours(3));
    let added = h.engine.add_tally(&prop.id, "bob").await.unwrap();
    let moved = &added.reprice.options[0];
    assert_ne!((moved.odds_over, moved.odds_under), (option.odds_over, option.odds_under));

    let removed = h.engine.remove_tally(added.tally_id, "bob").await.unwrap();
    let restored = &removed.reprice.options[0];
    assert_eq!((restored.odds_over, restored.odds_under), (option.odds_over, option.odds_under));
}

#[tokio::test]
async fn test_parlay_waits_for_every_prop() {
    let h = Harness::new().await;
    let early = h.prop("Early", 3.0, 2).await;
    let late = h.prop("Late", 3.0, 6).await;
    let early_line = h.option(&early, 2.5).await;
    let late_line = h.option(&late, 2.5).await;
    h.engine.credit_coins("bob", 100).await.unwrap();
    let parlay = h
        .engine
        .place_parlay("bob", 10, &[leg(&early_line, Side::Under), leg(&late_line, Side::Under)])
        .await
        .unwrap();

    h.advance(Duration::hours(3));
    let previews = h.engine.preview_settlement("bob").await.unwrap();
    assert!(!previews[0].ready);
    assert!(previews[0].legs[0].ended);
    assert!(previews[0].legs[1].outcome.is_none());

    let report = h.engine.resolve_parlays_for_user("bob").await.unwrap();
    assert_eq!((report.resolved_count, report.pending_count), (0, 1));

    h.advance(Duration::hours(4));
    let report = h.engine.resolve_parlays_for_user("bob").await.unwrap();
    assert_eq!(report.won_count, 1);
    let valuation = h.engine.valuate_parlay(&parlay.id).await.unwrap();
    assert_eq!(valuation.state, ParlayState::Won);
}
