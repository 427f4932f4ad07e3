//! Coin ledger, prop/option creation and parlay placement.
//!
//! Balances only ever move through single-statement increments or guarded
//! decrements, so concurrent top-ups, stakes and payouts never lose an
//! update.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

use super::repricer::{live_estimate, require_prop, RepriceTrigger};
use super::settlement::winning_payout;
use super::Engine;
use crate::odds::{price_line, validate_line, LinePrice};
use crate::storage;
use crate::types::{
    EngineError, EngineResult, Leg, LegSelection, Parlay, ParlayState, Prop, PropOption,
};

/// What taking a prop down touched.
#[derive(Debug, Clone, Serialize)]
pub struct PropRemoval {
    pub prop_id: String,
    pub options_removed: u64,
    pub parlays_voided: usize,
    pub coins_refunded: i64,
}

fn require_user(user_id: &str) -> EngineResult<()> {
    if user_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("user id is required".into()));
    }
    Ok(())
}

fn require_positive(amount: i64, what: &str) -> EngineResult<()> {
    if amount <= 0 {
        return Err(EngineError::InvalidInput(format!("{what} must be positive, got {amount}")));
    }
    Ok(())
}

impl Engine {
    // -- Props & options ----------------------------------------------------

    pub async fn create_prop(
        &self,
        description: &str,
        ev: f64,
        end_at: DateTime<Utc>,
        created_by: &str,
    ) -> EngineResult<Prop> {
        require_user(created_by)?;
        if description.trim().is_empty() {
            return Err(EngineError::InvalidInput("description is required".into()));
        }
        if !ev.is_finite() || ev <= 0.0 {
            return Err(EngineError::InvalidInput(format!("expected value must be positive, got {ev}")));
        }
        let now = self.now();
        if end_at <= now {
            return Err(EngineError::InvalidInput(format!("end time {end_at} is not in the future")));
        }

        let prop = Prop {
            id: Uuid::new_v4().to_string(),
            description: description.trim().to_string(),
            ev,
            created_at: now,
            end_at,
            created_by: created_by.to_string(),
            active: true,
        };
        let mut conn = self.store().acquire().await?;
        storage::insert_prop(&mut conn, &prop).await?;

        info!(prop_id = %prop.id, ev, end_at = %end_at, created_by, "Prop created");
        Ok(prop)
    }

    /// Odds a new line on `prop_id` would open at, from the prop's live EV.
    pub async fn price_new_option(&self, prop_id: &str, line: f64) -> EngineResult<LinePrice> {
        validate_line(line)?;
        let now = self.now();
        let mut conn = self.store().acquire().await?;
        let prop = require_prop(&mut conn, prop_id).await?;
        let estimate = live_estimate(&mut conn, &prop, RepriceTrigger::Manual, now).await?;
        price_line(estimate.effective_ev, line)
    }

    pub async fn create_option(&self, prop_id: &str, line: f64, created_by: &str) -> EngineResult<PropOption> {
        require_user(created_by)?;
        validate_line(line)?;
        let now = self.now();
        let mut tx = self.store().begin().await?;

        let prop = require_prop(&mut tx, prop_id).await?;
        if prop.has_ended(now) {
            return Err(EngineError::InvalidInput(format!("prop {prop_id} has ended")));
        }
        let estimate = live_estimate(&mut tx, &prop, RepriceTrigger::Manual, now).await?;
        let price = price_line(estimate.effective_ev, line)?;

        let option = PropOption {
            id: Uuid::new_v4().to_string(),
            prop_id: prop.id.clone(),
            line,
            odds_over: price.odds_over,
            odds_under: price.odds_under,
            active: true,
        };
        storage::insert_option(&mut tx, &option, created_by, now).await?;
        tx.commit().await?;

        info!(prop_id, option_id = %option.id, option = %option, "Option created");
        Ok(option)
    }

    /// Take a line off the board. Existing legs keep their locked odds.
    pub async fn remove_option(&self, option_id: &str, user_id: &str) -> EngineResult<()> {
        let now = self.now();
        let mut tx = self.store().begin().await?;
        let option = storage::fetch_option(&mut tx, option_id)
            .await?
            .ok_or_else(|| EngineError::InvalidInput(format!("option not found: {option_id}")))?;
        if !option.active || storage::deactivate_option(&mut tx, option_id, user_id, now).await? != 1 {
            return Err(EngineError::NotFoundOrInactive(format!("option {option_id} is inactive")));
        }
        tx.commit().await?;
        info!(option_id, user_id, "Option removed");
        Ok(())
    }

    /// Take a prop and all of its lines down. Every active parlay with a leg
    /// on it is voided and its stake refunded, in the same transaction.
    pub async fn remove_prop(&self, prop_id: &str, user_id: &str) -> EngineResult<PropRemoval> {
        require_user(user_id)?;
        let now = self.now();
        let mut tx = self.store().begin().await?;

        require_prop(&mut tx, prop_id).await?;
        if storage::deactivate_prop(&mut tx, prop_id, user_id, now).await? != 1 {
            return Err(EngineError::TransactionConflict(format!("prop {prop_id} changed concurrently")));
        }
        let options_removed = storage::deactivate_prop_options(&mut tx, prop_id, user_id, now).await?;

        let parlays = storage::active_parlays_for_prop(&mut tx, prop_id).await?;
        let mut coins_refunded = 0;
        for parlay in &parlays {
            let refund = parlay.coins_wagered;
            if storage::close_parlay(&mut tx, &parlay.id, ParlayState::Void, refund, now).await? != 1 {
                return Err(EngineError::TransactionConflict(format!(
                    "parlay {} was closed concurrently",
                    parlay.id
                )));
            }
            storage::credit_coins(&mut tx, &parlay.user_id, refund, now).await?;
            coins_refunded += refund;
            debug!(parlay_id = %parlay.id, user_id = %parlay.user_id, refund, "Parlay voided");
        }
        tx.commit().await?;

        info!(
            prop_id,
            user_id,
            options_removed,
            parlays_voided = parlays.len(),
            coins_refunded,
            "Prop removed"
        );
        Ok(PropRemoval {
            prop_id: prop_id.to_string(),
            options_removed,
            parlays_voided: parlays.len(),
            coins_refunded,
        })
    }

    // -- Coins ---------------------------------------------------------------

    /// Add coins to a balance, creating it if needed. Returns the new balance.
    pub async fn credit_coins(&self, user_id: &str, amount: i64) -> EngineResult<i64> {
        require_user(user_id)?;
        require_positive(amount, "credit")?;
        let now = self.now();
        let mut tx = self.store().begin().await?;
        storage::credit_coins(&mut tx, user_id, amount, now).await?;
        let balance = storage::fetch_balance(&mut tx, user_id).await?.unwrap_or(amount);
        tx.commit().await?;

        info!(user_id, amount, balance, "Coins credited");
        Ok(balance)
    }

    /// Current balance; users without a balance row hold 0.
    pub async fn balance(&self, user_id: &str) -> EngineResult<i64> {
        let mut conn = self.store().acquire().await?;
        Ok(storage::fetch_balance(&mut conn, user_id).await?.unwrap_or(0))
    }

    /// Fail with `InsufficientFunds` unless `user_id` can cover `amount`.
    pub async fn ensure_funds(&self, user_id: &str, amount: i64) -> EngineResult<()> {
        let available = self.balance(user_id).await?;
        if available < amount {
            return Err(EngineError::InsufficientFunds { needed: amount, available });
        }
        Ok(())
    }

    // -- Parlays -------------------------------------------------------------

    /// Debit the stake and record a parlay whose legs lock in each option's
    /// current odds for the chosen side.
    pub async fn place_parlay(
        &self,
        user_id: &str,
        coins_wagered: i64,
        selections: &[LegSelection],
    ) -> EngineResult<Parlay> {
        require_user(user_id)?;
        require_positive(coins_wagered, "stake")?;
        if selections.is_empty() {
            return Err(EngineError::InvalidInput("a parlay needs at least one leg".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = selections.iter().find(|s| !seen.insert(s.option_id.as_str())) {
            return Err(EngineError::InvalidInput(format!("option {} selected twice", dup.option_id)));
        }

        let now = self.now();
        let parlay = Parlay {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            coins_wagered,
            created_at: now,
            state: ParlayState::Active,
            payout: None,
            resolved_at: None,
        };

        let mut tx = self.store().begin().await?;
        let mut legs = Vec::with_capacity(selections.len());
        for selection in selections {
            let option = storage::fetch_option(&mut tx, &selection.option_id)
                .await?
                .ok_or_else(|| EngineError::InvalidInput(format!("option not found: {}", selection.option_id)))?;
            if !option.active {
                return Err(EngineError::NotFoundOrInactive(format!("option {} is inactive", option.id)));
            }
            let prop = require_prop(&mut tx, &option.prop_id).await?;
            if prop.has_ended(now) {
                return Err(EngineError::InvalidInput(format!("prop {} has ended", prop.id)));
            }
            debug!(option = %option, side = %selection.side, "Leg locked");
            legs.push(Leg {
                parlay_id: parlay.id.clone(),
                option_id: option.id.clone(),
                side: selection.side,
                odds_locked_in: option.odds_for(selection.side),
            });
        }

        let locked: Vec<i32> = legs.iter().map(|l| l.odds_locked_in).collect();
        let max_payout = winning_payout(coins_wagered, &locked)
            .map_err(|e| EngineError::InvalidInput(format!("parlay could never be paid out: {e}")))?;

        if storage::debit_coins(&mut tx, user_id, coins_wagered, now).await? != 1 {
            let available = storage::fetch_balance(&mut tx, user_id).await?.unwrap_or(0);
            return Err(EngineError::InsufficientFunds {
                needed: coins_wagered,
                available,
            });
        }
        storage::insert_parlay(&mut tx, &parlay, &legs).await?;
        tx.commit().await?;

        info!(
            parlay_id = %parlay.id,
            user_id,
            stake = coins_wagered,
            legs = legs.len(),
            max_payout,
            "Parlay placed"
        );
        Ok(parlay)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
