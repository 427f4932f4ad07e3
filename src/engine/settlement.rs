//! Settlement resolver.
//!
//! Resolves a user's active parlays once every prop they reference has
//! ended. Each parlay is settled in its own transaction: re-read, evaluate,
//! credit, close. A failure on one parlay is recorded and the batch moves
//! on to the next.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::valuation::{decimal_odds_product, out_of_range, round_coins};
use super::Engine;
use crate::storage;
use crate::types::{EngineError, EngineResult, ParlayState, PushPolicy, Side};

// ---------------------------------------------------------------------------
// Leg outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LegOutcome {
    Win,
    Loss,
    /// Final count landed exactly on the line and the policy refunds it.
    Push,
}

/// Final outcome of one leg from the tallies counted in its window.
pub fn leg_outcome(side: Side, line: f64, tally_count: u64, policy: PushPolicy) -> LegOutcome {
    let count = tally_count as f64;
    if count == line {
        return match policy {
            PushPolicy::Loss => LegOutcome::Loss,
            PushPolicy::Refund => LegOutcome::Push,
        };
    }
    let won = match side {
        Side::Over => count > line,
        Side::Under => count < line,
    };
    if won {
        LegOutcome::Win
    } else {
        LegOutcome::Loss
    }
}

/// `round(stake * product(decimal odds))` over the legs that won. Pushed
/// legs are left out, so an all-push parlay returns the stake.
pub fn winning_payout(coins_wagered: i64, winning_odds: &[i32]) -> EngineResult<i64> {
    let multiplier = decimal_odds_product(winning_odds)?;
    let payout = Decimal::from(coins_wagered)
        .checked_mul(multiplier)
        .ok_or_else(|| out_of_range("payout", multiplier))?;
    round_coins(payout)
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// Per-user cooldown between on-demand resolution runs.
#[derive(Debug)]
pub struct ResolveThrottle {
    cooldown: Duration,
    last_run: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ResolveThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a run for `user_id` at `now`. False while the cooldown holds.
    /// Expired claims of every user are dropped on the way.
    pub fn try_acquire(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        let mut last_run = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        last_run.retain(|_, last| now - *last < self.cooldown);
        if last_run.contains_key(user_id) {
            return false;
        }
        last_run.insert(user_id.to_string(), now);
        true
    }

    /// Give back the claim taken at `claimed_at`, e.g. after a failed run.
    pub fn release(&self, user_id: &str, claimed_at: DateTime<Utc>) {
        let mut last_run = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        if last_run.get(user_id) == Some(&claimed_at) {
            last_run.remove(user_id);
        }
    }

    /// Users currently inside their cooldown.
    pub fn tracked_users(&self) -> usize {
        self.last_run.lock().map(|m| m.len()).unwrap_or_else(|e| e.into_inner().len())
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SettlementFailure {
    pub user_id: String,
    pub parlay_id: Option<String>,
    pub reason: String,
}

/// Aggregate result of one resolver run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SettlementReport {
    pub resolved_count: usize,
    pub won_count: usize,
    pub lost_count: usize,
    /// Parlays left active because some prop has not ended yet.
    pub pending_count: usize,
    pub total_payout: i64,
    pub failures: Vec<SettlementFailure>,
}

impl SettlementReport {
    pub fn merge(&mut self, other: SettlementReport) {
        self.resolved_count += other.resolved_count;
        self.won_count += other.won_count;
        self.lost_count += other.lost_count;
        self.pending_count += other.pending_count;
        self.total_payout += other.total_payout;
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Pending,
    Settled { state: ParlayState, payout: i64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewLeg {
    pub option_id: String,
    pub prop_id: String,
    pub side: Side,
    pub line: f64,
    pub odds_locked_in: i32,
    pub prop_end_at: DateTime<Utc>,
    pub ended: bool,
    /// Tallies in `[parlay created, prop end]` counted so far.
    pub window_count: u64,
    /// Only set once the leg's prop has ended.
    pub outcome: Option<LegOutcome>,
}

/// What the resolver would do with one parlay right now.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementPreview {
    pub parlay_id: String,
    pub coins_wagered: i64,
    pub created_at: DateTime<Utc>,
    pub ready: bool,
    pub legs: Vec<PreviewLeg>,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

impl Engine {
    /// Resolve every fully expired active parlay of `user_id`.
    pub async fn resolve_parlays_for_user(&self, user_id: &str) -> EngineResult<SettlementReport> {
        let now = self.now();
        let parlay_ids = {
            let mut conn = self.store().acquire().await?;
            storage::active_parlay_ids(&mut conn, user_id).await?
        };

        let mut report = SettlementReport::default();
        for parlay_id in parlay_ids {
            match self.resolve_one(&parlay_id, now).await {
                Ok(Resolution::Pending) => report.pending_count += 1,
                Ok(Resolution::Settled { state, payout }) => {
                    report.resolved_count += 1;
                    report.total_payout += payout;
                    match state {
                        ParlayState::Won => report.won_count += 1,
                        _ => report.lost_count += 1,
                    }
                }
                Err(e) => {
                    warn!(user_id, parlay_id = %parlay_id, error = %e, "Parlay resolution failed");
                    report.failures.push(SettlementFailure {
                        user_id: user_id.to_string(),
                        parlay_id: Some(parlay_id),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if report.resolved_count > 0 || !report.failures.is_empty() {
            info!(
                user_id,
                resolved = report.resolved_count,
                won = report.won_count,
                lost = report.lost_count,
                pending = report.pending_count,
                payout = report.total_payout,
                failures = report.failures.len(),
                "Settlement run complete"
            );
        }
        Ok(report)
    }

    /// Like [`Engine::resolve_parlays_for_user`] but at most once per
    /// cooldown per user. `None` when throttled.
    /// A run that fails does not start the cooldown.
    pub async fn resolve_parlays_throttled(&self, user_id: &str) -> EngineResult<Option<SettlementReport>> {
        let claimed_at = self.now();
        if !self.throttle.try_acquire(user_id, claimed_at) {
            debug!(user_id, "Settlement throttled");
            return Ok(None);
        }
        match self.resolve_parlays_for_user(user_id).await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                self.throttle.release(user_id, claimed_at);
                Err(e)
            }
        }
    }

    /// Sweep every user holding an active parlay.
    pub async fn resolve_all_parlays(&self) -> EngineResult<SettlementReport> {
        let users = {
            let mut conn = self.store().acquire().await?;
            storage::users_with_active_parlays(&mut conn).await?
        };

        let mut report = SettlementReport::default();
        for user_id in users {
            match self.resolve_parlays_for_user(&user_id).await {
                Ok(user_report) => report.merge(user_report),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Settlement sweep failed for user");
                    report.failures.push(SettlementFailure {
                        user_id,
                        parlay_id: None,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Read-only view of how each active parlay of `user_id` stands.
    pub async fn preview_settlement(&self, user_id: &str) -> EngineResult<Vec<SettlementPreview>> {
        let now = self.now();
        let policy = self.config().push_policy;
        let mut conn = self.store().acquire().await?;

        let mut previews = Vec::new();
        for parlay_id in storage::active_parlay_ids(&mut conn, user_id).await? {
            let Some(parlay) = storage::fetch_parlay(&mut conn, &parlay_id).await? else {
                continue;
            };
            let mut legs = Vec::new();
            for view in storage::fetch_leg_views(&mut conn, &parlay_id).await? {
                let window_count =
                    storage::count_tallies_between(&mut conn, &view.prop_id, parlay.created_at, view.prop_end_at)
                        .await?;
                let ended = view.prop_end_at <= now;
                legs.push(PreviewLeg {
                    outcome: ended.then(|| leg_outcome(view.leg.side, view.line, window_count, policy)),
                    option_id: view.leg.option_id,
                    prop_id: view.prop_id,
                    side: view.leg.side,
                    line: view.line,
                    odds_locked_in: view.leg.odds_locked_in,
                    prop_end_at: view.prop_end_at,
                    ended,
                    window_count,
                });
            }
            previews.push(SettlementPreview {
                ready: !legs.is_empty() && legs.iter().all(|l| l.ended),
                parlay_id,
                coins_wagered: parlay.coins_wagered,
                created_at: parlay.created_at,
                legs,
            });
        }
        Ok(previews)
    }

    /// Settle one parlay in its own transaction.
    async fn resolve_one(&self, parlay_id: &str, now: DateTime<Utc>) -> EngineResult<Resolution> {
        let mut tx = self.store().begin().await?;

        let parlay = storage::fetch_parlay(&mut tx, parlay_id)
            .await?
            .ok_or_else(|| EngineError::TransactionConflict(format!("parlay {parlay_id} disappeared")))?;
        if !parlay.is_active() {
            return Err(EngineError::TransactionConflict(format!(
                "parlay {parlay_id} is already {}",
                parlay.state
            )));
        }

        let views = storage::fetch_leg_views(&mut tx, parlay_id).await?;
        if views.is_empty() {
            return Err(EngineError::InvalidInput(format!("parlay {parlay_id} has no legs")));
        }
        if views.iter().any(|v| v.prop_end_at > now) {
            return Ok(Resolution::Pending);
        }

        let policy = self.config().push_policy;
        let mut winning_odds = Vec::with_capacity(views.len());
        let mut lost = false;
        for view in &views {
            let count =
                storage::count_tallies_between(&mut tx, &view.prop_id, parlay.created_at, view.prop_end_at).await?;
            match leg_outcome(view.leg.side, view.line, count, policy) {
                LegOutcome::Win => winning_odds.push(view.leg.odds_locked_in),
                LegOutcome::Push => {}
                LegOutcome::Loss => {
                    debug!(parlay_id, option_id = %view.leg.option_id, count, line = view.line, "Leg lost");
                    lost = true;
                    break;
                }
            }
        }

        let (state, payout) = if lost {
            (ParlayState::Lost, 0)
        } else {
            (ParlayState::Won, winning_payout(parlay.coins_wagered, &winning_odds)?)
        };

        if storage::close_parlay(&mut tx, parlay_id, state, payout, now).await? != 1 {
            return Err(EngineError::TransactionConflict(format!(
                "parlay {parlay_id} was closed concurrently"
            )));
        }
        if payout > 0 {
            storage::credit_coins(&mut tx, &parlay.user_id, payout, now).await?;
        }
        tx.commit().await?;

        info!(
            parlay_id,
            user_id = %parlay.user_id,
            state = %state,
            stake = parlay.coins_wagered,
            payout,
            "Parlay resolved"
        );
        Ok(Resolution::Settled { state, payout })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, ManualClock};
    use crate::storage::Store;
    use crate::types::{Leg, LegSelection, Parlay, Prop, PropOption};
    use std::sync::Arc;

    struct Fixture {
        engine: Engine,
        clock: Arc<ManualClock>,
        prop: Prop,
        option: PropOption,
    }

    async fn fixture_with(config: EngineConfig) -> Fixture {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = Store::in_memory().await.unwrap();
        let engine = Engine::with_clock(store, config, clock.clone());
        let prop = engine
            .create_prop("Coffees ordered", 3.0, start + Duration::hours(2), "alice")
            .await
            .unwrap();
        let option = engine.create_option(&prop.id, 2.5, "alice").await.unwrap();
        engine.credit_coins("bob", 1_000).await.unwrap();
        engine.credit_coins("carol", 1_000).await.unwrap();
        Fixture { engine, clock, prop, option }
    }

    async fn fixture() -> Fixture {
        fixture_with(EngineConfig::default()).await
    }

    async fn bet(f: &Fixture, user: &str, side: Side, coins: i64) -> Parlay {
        f.engine
            .place_parlay(user, coins, &[LegSelection { option_id: f.option.id.clone(), side }])
            .await
            .unwrap()
    }

    #[test]
    fn test_leg_outcome_rules() {
        assert_eq!(leg_outcome(Side::Over, 20.5, 21, PushPolicy::Loss), LegOutcome::Win);
        assert_eq!(leg_outcome(Side::Over, 20.5, 20, PushPolicy::Loss), LegOutcome::Loss);
        assert_eq!(leg_outcome(Side::Under, 20.5, 20, PushPolicy::Loss), LegOutcome::Win);
        assert_eq!(leg_outcome(Side::Over, 3.0, 3, PushPolicy::Loss), LegOutcome::Loss);
        assert_eq!(leg_outcome(Side::Under, 3.0, 3, PushPolicy::Refund), LegOutcome::Push);
    }

    #[test]
    fn test_winning_payout_includes_stake() {
        assert_eq!(winning_payout(100, &[150, -200]).unwrap(), 375);
        assert_eq!(winning_payout(100, &[]).unwrap(), 100);
        assert_eq!(winning_payout(3, &[-235]).unwrap(), 4);
    }

    #[test]
    fn test_winning_payout_overflow_is_an_error() {
        assert!(matches!(winning_payout(1, &[845; 32]), Err(EngineError::InvalidInput(_))));
        assert!(matches!(winning_payout(3, &[845; 19]), Err(EngineError::InvalidInput(_))));
        assert!(winning_payout(2, &[845; 19]).is_ok());
    }

    #[test]
    fn test_throttle_cooldown() {
        let throttle = ResolveThrottle::new(Duration::minutes(5));
        let t0 = Utc::now();
        assert!(throttle.try_acquire("bob", t0));
        assert!(!throttle.try_acquire("bob", t0 + Duration::minutes(4)));
        assert!(throttle.try_acquire("carol", t0 + Duration::minutes(4)));
        assert!(throttle.try_acquire("bob", t0 + Duration::minutes(5)));
    }

    #[test]
    fn test_throttle_release_and_prune() {
        let throttle = ResolveThrottle::new(Duration::minutes(5));
        let t0 = Utc::now();
        assert!(throttle.try_acquire("bob", t0));
        assert!(throttle.try_acquire("carol", t0 + Duration::minutes(1)));
        assert_eq!(throttle.tracked_users(), 2);

        // A stale release leaves a newer claim alone.
        throttle.release("bob", t0 - Duration::minutes(1));
        assert!(!throttle.try_acquire("bob", t0 + Duration::minutes(2)));
        throttle.release("bob", t0);
        assert!(throttle.try_acquire("bob", t0 + Duration::minutes(2)));

        // Carol's claim has expired and is dropped by the next acquire.
        assert!(throttle.try_acquire("dave", t0 + Duration::minutes(6)));
        assert_eq!(throttle.tracked_users(), 2);
        assert!(throttle.try_acquire("carol", t0 + Duration::minutes(6)));
    }

    #[tokio::test]
    async fn test_pending_until_prop_ends() {
        let f = fixture().await;
        bet(&f, "bob", Side::Over, 100).await;
        f.clock.advance(Duration::minutes(90));

        let report = f.engine.resolve_parlays_for_user("bob").await.unwrap();
        assert_eq!(report.resolved_count, 0);
        assert_eq!(report.pending_count, 1);
        assert_eq!(f.engine.balance("bob").await.unwrap(), 900);
    }

    #[tokio::test]
    async fn test_winning_parlay_paid_once() {
        let f = fixture().await;
        let parlay = bet(&f, "bob", Side::Over, 100).await;
        let odds = f.engine.valuate_parlay(&parlay.id).await.unwrap().legs[0].odds_locked_in;

        f.clock.advance(Duration::minutes(30));
        for _ in 0..3 {
            f.engine.add_tally(&f.prop.id, "carol").await.unwrap();
        }
        f.clock.advance(Duration::hours(2));

        let report = f.engine.resolve_parlays_for_user("bob").await.unwrap();
        let expected = winning_payout(100, &[odds]).unwrap();
        assert_eq!(report.resolved_count, 1);
        assert_eq!(report.won_count, 1);
        assert_eq!(report.total_payout, expected);
        assert_eq!(f.engine.balance("bob").await.unwrap(), 900 + expected);

        let again = f.engine.resolve_parlays_for_user("bob").await.unwrap();
        assert_eq!(again.resolved_count, 0);
        assert_eq!(again.total_payout, 0);
        assert_eq!(f.engine.balance("bob").await.unwrap(), 900 + expected);

        let valuation = f.engine.valuate_parlay(&parlay.id).await.unwrap();
        assert_eq!(valuation.state, ParlayState::Won);
    }

    #[tokio::test]
    async fn test_only_tallies_inside_window_count() {
        let f = fixture().await;
        // Two tallies before the parlay exists.
        f.clock.advance(Duration::minutes(5));
        f.engine.add_tally(&f.prop.id, "carol").await.unwrap();
        f.engine.add_tally(&f.prop.id, "carol").await.unwrap();
        f.clock.advance(Duration::minutes(5));
        bet(&f, "bob", Side::Under, 100).await;

        f.clock.advance(Duration::minutes(5));
        f.engine.add_tally(&f.prop.id, "carol").await.unwrap();
        f.clock.advance(Duration::hours(3));
        // After the prop ended.
        f.engine.add_tally(&f.prop.id, "carol").await.unwrap();
        f.engine.add_tally(&f.prop.id, "carol").await.unwrap();

        let previews = f.engine.preview_settlement("bob").await.unwrap();
        assert_eq!(previews.len(), 1);
        assert!(previews[0].ready);
        assert_eq!(previews[0].legs[0].window_count, 1);
        assert_eq!(previews[0].legs[0].outcome, Some(LegOutcome::Win));

        let report = f.engine.resolve_parlays_for_user("bob").await.unwrap();
        assert_eq!(report.won_count, 1);
    }

    #[tokio::test]
    async fn test_losing_parlay_pays_nothing() {
        let f = fixture().await;
        let parlay = bet(&f, "bob", Side::Over, 100).await;
        f.clock.advance(Duration::hours(3));

        let report = f.engine.resolve_parlays_for_user("bob").await.unwrap();
        assert_eq!(report.lost_count, 1);
        assert_eq!(report.total_payout, 0);
        assert_eq!(f.engine.balance("bob").await.unwrap(), 900);

        let valuation = f.engine.valuate_parlay(&parlay.id).await.unwrap();
        assert_eq!(valuation.state, ParlayState::Lost);
    }

    #[tokio::test]
    async fn test_cashed_out_parlay_is_not_resolved() {
        let f = fixture().await;
        let parlay = bet(&f, "bob", Side::Under, 100).await;
        f.engine.cash_out_parlay(&parlay.id, "bob").await.unwrap();
        f.clock.advance(Duration::hours(3));

        let report = f.engine.resolve_parlays_for_user("bob").await.unwrap();
        assert_eq!(report.resolved_count, 0);
        assert!(report.failures.is_empty());

        let raced = f.engine.resolve_one(&parlay.id, f.engine.now()).await;
        assert!(matches!(raced, Err(EngineError::TransactionConflict(_))));
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_siblings() {
        let f = fixture().await;
        bet(&f, "bob", Side::Under, 100).await;

        // A parlay row with no legs.
        let broken = Parlay {
            id: "broken".into(),
            user_id: "bob".into(),
            coins_wagered: 10,
            created_at: f.engine.now(),
            state: ParlayState::Active,
            payout: None,
            resolved_at: None,
        };
        {
            let mut conn = f.engine.store().acquire().await.unwrap();
            storage::insert_parlay(&mut conn, &broken, &[] as &[Leg]).await.unwrap();
        }
        f.clock.advance(Duration::hours(3));

        let report = f.engine.resolve_parlays_for_user("bob").await.unwrap();
        assert_eq!(report.resolved_count, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].parlay_id.as_deref(), Some("broken"));
    }

    #[tokio::test]
    async fn test_push_refund_policy_returns_stake() {
        let config = EngineConfig {
            push_policy: PushPolicy::Refund,
            ..EngineConfig::default()
        };
        let f = fixture_with(config).await;
        let now = f.engine.now();
        let whole = PropOption {
            id: "whole-line".into(),
            prop_id: f.prop.id.clone(),
            line: 2.0,
            odds_over: -100,
            odds_under: -100,
            active: true,
        };
        {
            let mut conn = f.engine.store().acquire().await.unwrap();
            storage::insert_option(&mut conn, &whole, "alice", now).await.unwrap();
        }
        f.engine
            .place_parlay("bob", 100, &[LegSelection { option_id: whole.id.clone(), side: Side::Over }])
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(10));
        f.engine.add_tally(&f.prop.id, "carol").await.unwrap();
        f.engine.add_tally(&f.prop.id, "carol").await.unwrap();
        f.clock.advance(Duration::hours(3));

        let report = f.engine.resolve_parlays_for_user("bob").await.unwrap();
        assert_eq!(report.won_count, 1);
        assert_eq!(report.total_payout, 100);
        assert_eq!(f.engine.balance("bob").await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_failed_run_does_not_start_cooldown() {
        let f = fixture().await;
        f.engine.store().close().await;

        assert!(f.engine.resolve_parlays_throttled("bob").await.is_err());
        assert_eq!(f.engine.throttle.tracked_users(), 0);
        assert!(f.engine.throttle.try_acquire("bob", f.engine.now()));
    }

    #[tokio::test]
    async fn test_sweep_and_throttle() {
        let f = fixture().await;
        bet(&f, "bob", Side::Under, 100).await;
        bet(&f, "carol", Side::Over, 50).await;
        f.clock.advance(Duration::hours(3));

        let throttled = f.engine.resolve_parlays_throttled("bob").await.unwrap();
        assert_eq!(throttled.map(|r| r.resolved_count), Some(1));
        assert!(f.engine.resolve_parlays_throttled("bob").await.unwrap().is_none());

        let sweep = f.engine.resolve_all_parlays().await.unwrap();
        assert_eq!(sweep.resolved_count, 1);
        assert_eq!(sweep.lost_count, 1);
        assert!(f.engine.resolve_all_parlays().await.unwrap().failures.is_empty());
    }
}
