//! Parlay valuation and cash-out.
//!
//! Payout and cash-out prices always come from the odds locked into each
//! leg at placement. Live tally counts only feed the progress display and
//! the probability estimate behind the cash-out price.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::info;

use super::{Engine, EngineConfig};
use crate::odds::{american_to_decimal, american_to_implied_probability};
use crate::storage;
use crate::types::{EngineError, EngineResult, LegView, Parlay, ParlayState, Side};

/// Leg probability bounds for the cash-out estimate.
const MIN_LEG_PROBABILITY: f64 = 0.05;
const MAX_LEG_PROBABILITY: f64 = 0.95;

/// Lines below this are measured against it when scaling distance.
const MIN_DISTANCE_SCALE: f64 = 10.0;

// ---------------------------------------------------------------------------
// Pure pricing
// ---------------------------------------------------------------------------

/// Product of the decimal odds of every leg.
pub fn combined_decimal_odds(locked_odds: &[i32]) -> EngineResult<Decimal> {
    if locked_odds.is_empty() {
        return Err(EngineError::InvalidInput("a parlay needs at least one leg".into()));
    }
    decimal_odds_product(locked_odds)
}

/// Product of decimal odds, 1 for no legs. Fails instead of overflowing.
pub(crate) fn decimal_odds_product(locked_odds: &[i32]) -> EngineResult<Decimal> {
    locked_odds.iter().try_fold(Decimal::ONE, |acc, &odds| {
        acc.checked_mul(american_to_decimal(odds)?)
            .ok_or_else(|| out_of_range("combined odds", acc))
    })
}

pub(crate) fn out_of_range(what: &str, value: impl std::fmt::Display) -> EngineError {
    EngineError::InvalidInput(format!("{what} out of range: {value}"))
}

fn checked_mul(a: Decimal, b: Decimal, what: &str) -> EngineResult<Decimal> {
    a.checked_mul(b).ok_or_else(|| out_of_range(what, a))
}

pub(crate) fn round_coins(amount: Decimal) -> EngineResult<i64> {
    amount
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| out_of_range("coin amount", amount))
}

fn to_decimal(value: f64, what: &str) -> EngineResult<Decimal> {
    Decimal::from_f64(value).ok_or_else(|| EngineError::InvalidInput(format!("{what} is not representable: {value}")))
}

/// Profit on a win, excluding the returned stake.
pub fn potential_payout(coins_wagered: i64, combined_odds: Decimal) -> EngineResult<i64> {
    round_coins(checked_mul(Decimal::from(coins_wagered), combined_odds - Decimal::ONE, "payout")?)
}

/// Live win state. Landing exactly on the line is never winning here.
pub fn leg_is_winning(side: Side, line: f64, tally_count: u64) -> bool {
    let count = tally_count as f64;
    match side {
        Side::Over => count > line,
        Side::Under => count < line,
    }
}

/// Estimated probability that a leg ends up winning, given the live count.
pub fn leg_probability(odds_locked_in: i32, side: Side, line: f64, tally_count: u64) -> EngineResult<f64> {
    if tally_count == 0 {
        return american_to_implied_probability(odds_locked_in);
    }
    let distance = (tally_count as f64 - line).abs();
    let scaled = distance / line.max(MIN_DISTANCE_SCALE);
    let probability = if leg_is_winning(side, line, tally_count) {
        0.8 + scaled * 0.15
    } else {
        0.3 - scaled * 0.25
    };
    Ok(probability.clamp(MIN_LEG_PROBABILITY, MAX_LEG_PROBABILITY))
}

/// Progress bar fill for one leg, 0..=100.
pub fn progress_pct(side: Side, line: f64, tally_count: u64) -> f64 {
    let count = tally_count as f64;
    match side {
        Side::Over => (count / (line + 1.0) * 100.0).min(100.0),
        Side::Under => ((line - count) / line * 100.0).max(0.0),
    }
}

/// `stake + profit * probability * factor`, never below `stake * min_fraction`.
pub fn cash_out_amount(
    coins_wagered: i64,
    combined_odds: Decimal,
    total_probability: f64,
    cash_out_factor: f64,
    min_cash_out_fraction: f64,
) -> EngineResult<i64> {
    let stake = Decimal::from(coins_wagered);
    let profit = checked_mul(stake, combined_odds - Decimal::ONE, "payout")?;
    let probability = to_decimal(total_probability.clamp(0.0, 1.0), "probability")?;
    let factor = to_decimal(cash_out_factor, "cash-out factor")?;
    let floor_fraction = to_decimal(min_cash_out_fraction, "cash-out floor")?;
    let floor = round_coins(checked_mul(stake, floor_fraction, "cash-out floor")?)?;

    let share = checked_mul(checked_mul(profit, probability, "cash-out")?, factor, "cash-out")?;
    let offer = round_coins(stake.checked_add(share).ok_or_else(|| out_of_range("cash-out", share))?)?;
    Ok(offer.max(floor))
}

// ---------------------------------------------------------------------------
// Valuation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LegProgress {
    pub option_id: String,
    pub prop_id: String,
    pub side: Side,
    pub line: f64,
    pub odds_locked_in: i32,
    pub tally_count: u64,
    pub winning: bool,
    pub probability: f64,
    pub progress_pct: f64,
}

/// Live snapshot of a parlay.
#[derive(Debug, Clone, Serialize)]
pub struct ParlayValuation {
    pub parlay_id: String,
    pub user_id: String,
    pub state: ParlayState,
    pub coins_wagered: i64,
    pub combined_odds: Decimal,
    pub potential_payout: i64,
    pub cash_out_amount: i64,
    pub total_probability: f64,
    pub winning_legs: usize,
    pub total_legs: usize,
    pub legs: Vec<LegProgress>,
}

impl ParlayValuation {
    /// Share of legs currently winning, 0..=100.
    pub fn progress_pct(&self) -> f64 {
        if self.total_legs == 0 {
            return 0.0;
        }
        self.winning_legs as f64 / self.total_legs as f64 * 100.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CashOutReceipt {
    pub parlay_id: String,
    pub user_id: String,
    pub amount_credited: i64,
}

/// Value `parlay` from its legs and the live counts visible on `conn`.
pub(crate) async fn value_parlay(
    conn: &mut SqliteConnection,
    parlay: &Parlay,
    config: &EngineConfig,
) -> EngineResult<ParlayValuation> {
    let views: Vec<LegView> = storage::fetch_leg_views(conn, &parlay.id).await?;
    let locked: Vec<i32> = views.iter().map(|v| v.leg.odds_locked_in).collect();
    let combined_odds = combined_decimal_odds(&locked)?;

    let mut legs = Vec::with_capacity(views.len());
    let mut total_probability = 1.0;
    for view in views {
        let tally_count = storage::count_active_tallies(conn, &view.prop_id).await?;
        let side = view.leg.side;
        let probability = leg_probability(view.leg.odds_locked_in, side, view.line, tally_count)?;
        total_probability *= probability;
        legs.push(LegProgress {
            winning: leg_is_winning(side, view.line, tally_count),
            progress_pct: progress_pct(side, view.line, tally_count),
            option_id: view.leg.option_id,
            prop_id: view.prop_id,
            side,
            line: view.line,
            odds_locked_in: view.leg.odds_locked_in,
            tally_count,
            probability,
        });
    }

    Ok(ParlayValuation {
        parlay_id: parlay.id.clone(),
        user_id: parlay.user_id.clone(),
        state: parlay.state,
        coins_wagered: parlay.coins_wagered,
        combined_odds,
        potential_payout: potential_payout(parlay.coins_wagered, combined_odds)?,
        cash_out_amount: cash_out_amount(
            parlay.coins_wagered,
            combined_odds,
            total_probability,
            config.cash_out_factor,
            config.min_cash_out_fraction,
        )?,
        total_probability,
        winning_legs: legs.iter().filter(|l| l.winning).count(),
        total_legs: legs.len(),
        legs,
    })
}

impl Engine {
    pub async fn valuate_parlay(&self, parlay_id: &str) -> EngineResult<ParlayValuation> {
        let mut conn = self.store().acquire().await?;
        let parlay = storage::fetch_parlay(&mut conn, parlay_id)
            .await?
            .ok_or_else(|| EngineError::InvalidInput(format!("parlay not found: {parlay_id}")))?;
        value_parlay(&mut conn, &parlay, self.config()).await
    }

    /// Settle a parlay early at its current cash-out price. Irreversible.
    pub async fn cash_out_parlay(&self, parlay_id: &str, user_id: &str) -> EngineResult<CashOutReceipt> {
        let now = self.now();
        let mut tx = self.store().begin().await?;

        let parlay = storage::fetch_parlay(&mut tx, parlay_id)
            .await?
            .ok_or_else(|| EngineError::InvalidInput(format!("parlay not found: {parlay_id}")))?;
        if parlay.user_id != user_id {
            return Err(EngineError::NotFoundOrInactive(format!(
                "parlay {parlay_id} does not belong to {user_id}"
            )));
        }
        if !parlay.is_active() {
            return Err(EngineError::NotFoundOrInactive(format!(
                "parlay {parlay_id} is already {}",
                parlay.state
            )));
        }

        let valuation = value_parlay(&mut tx, &parlay, self.config()).await?;
        let amount = valuation.cash_out_amount;

        if storage::close_parlay(&mut tx, parlay_id, ParlayState::CashedOut, amount, now).await? != 1 {
            return Err(EngineError::TransactionConflict(format!(
                "parlay {parlay_id} was closed concurrently"
            )));
        }
        storage::credit_coins(&mut tx, user_id, amount, now).await?;
        tx.commit().await?;

        info!(
            parlay_id,
            user_id,
            stake = parlay.coins_wagered,
            amount,
            probability = format!("{:.3}", valuation.total_probability),
            "Parlay cashed out"
        );

        Ok(CashOutReceipt {
            parlay_id: parlay_id.to_string(),
            user_id: user_id.to_string(),
            amount_credited: amount,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
