//! Tally-driven repricing.
//!
//! Whenever a prop's tally count changes, its effective EV is re-estimated
//! by blending the creator's EV with a straight-line projection of the
//! current count, weighted by how much of the prop's lifetime has passed.
//! Every active option on the prop is then repriced in the same
//! transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::{Engine, SYSTEM_ACTOR};
use crate::odds::{price_line, LinePrice};
use crate::storage;
use crate::types::{EngineError, EngineResult, Prop};

/// Weight given to the projected count at the very end of a prop's life.
/// The weight grows linearly from 0 at creation.
pub const PROJECTION_WEIGHT: f64 = 0.7;

/// What caused a reprice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepriceTrigger {
    TallyAdded,
    TallyRemoved,
    /// Explicit reprice or a quote for a new line. No tally changed.
    Manual,
}

/// Effective EV from the baseline EV, the live count and time progress.
///
/// Only a tally addition projects from a zero count. After a removal, and
/// for manual reprices and quotes, an empty prop keeps its baseline EV, so
/// re-running a reprice never moves odds that no tally moved.
pub fn effective_ev(original_ev: f64, tally_count: u64, time_progress: f64, trigger: RepriceTrigger) -> f64 {
    let project = time_progress > 0.0 && (trigger == RepriceTrigger::TallyAdded || tally_count > 0);
    if !project {
        return original_ev;
    }
    let projected_final = tally_count as f64 / time_progress;
    let weight = PROJECTION_WEIGHT * time_progress;
    original_ev * (1.0 - weight) + projected_final * weight
}

/// Snapshot of a prop's pricing inputs at one instant.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LiveEstimate {
    pub tally_count: u64,
    pub time_progress: f64,
    pub effective_ev: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepricedOption {
    pub option_id: String,
    pub line: f64,
    pub odds_over: i32,
    pub odds_under: i32,
}

/// Outcome of one prop reprice.
#[derive(Debug, Clone, Serialize)]
pub struct RepriceReport {
    pub prop_id: String,
    pub trigger: RepriceTrigger,
    pub tally_count: u64,
    pub time_progress: f64,
    pub effective_ev: f64,
    pub options: Vec<RepricedOption>,
}

/// Result of adding or removing a tally.
#[derive(Debug, Clone, Serialize)]
pub struct TallyUpdate {
    pub tally_id: i64,
    pub reprice: RepriceReport,
}

/// Read the live count and derive the effective EV for `prop` at `now`.
pub(crate) async fn live_estimate(
    conn: &mut SqliteConnection,
    prop: &Prop,
    trigger: RepriceTrigger,
    now: DateTime<Utc>,
) -> EngineResult<LiveEstimate> {
    let tally_count = storage::count_active_tallies(conn, &prop.id).await?;
    let time_progress = prop.time_progress(now);
    Ok(LiveEstimate {
        tally_count,
        time_progress,
        effective_ev: effective_ev(prop.ev, tally_count, time_progress, trigger),
    })
}

/// Reprice every active option of `prop` on `conn`. The caller owns the
/// transaction; any error leaves it to be rolled back.
pub(crate) async fn reprice_in_tx(
    conn: &mut SqliteConnection,
    prop: &Prop,
    trigger: RepriceTrigger,
    actor: &str,
    now: DateTime<Utc>,
) -> EngineResult<RepriceReport> {
    let estimate = live_estimate(conn, prop, trigger, now).await?;
    let options = storage::fetch_active_options(conn, &prop.id).await?;

    let mut repriced = Vec::with_capacity(options.len());
    for option in options {
        let price: LinePrice = price_line(estimate.effective_ev, option.line)?;
        let touched = storage::update_option_odds(conn, &option.id, price, actor, now).await?;
        if touched != 1 {
            return Err(EngineError::TransactionConflict(format!(
                "option {} changed during reprice",
                option.id
            )));
        }
        debug!(
            option_id = %option.id,
            line = option.line,
            from = format!("{:+}/{:+}", option.odds_over, option.odds_under),
            to = format!("{:+}/{:+}", price.odds_over, price.odds_under),
            "Option repriced"
        );
        repriced.push(RepricedOption {
            option_id: option.id,
            line: option.line,
            odds_over: price.odds_over,
            odds_under: price.odds_under,
        });
    }

    info!(
        prop_id = %prop.id,
        trigger = ?trigger,
        tallies = estimate.tally_count,
        progress = format!("{:.1}%", estimate.time_progress * 100.0),
        base_ev = prop.ev,
        effective_ev = format!("{:.2}", estimate.effective_ev),
        options = repriced.len(),
        "Prop repriced"
    );

    Ok(RepriceReport {
        prop_id: prop.id.clone(),
        trigger,
        tally_count: estimate.tally_count,
        time_progress: estimate.time_progress,
        effective_ev: estimate.effective_ev,
        options: repriced,
    })
}

/// Load a prop that is still on the board.
pub(crate) async fn require_prop(conn: &mut SqliteConnection, prop_id: &str) -> EngineResult<Prop> {
    let prop = storage::fetch_prop(conn, prop_id)
        .await?
        .ok_or_else(|| EngineError::InvalidInput(format!("prop not found: {prop_id}")))?;
    if !prop.active {
        return Err(EngineError::NotFoundOrInactive(format!("prop {prop_id} was removed")));
    }
    Ok(prop)
}

impl Engine {
    /// Recompute the effective EV of a prop and reprice all its active options.
    pub async fn reprice_prop(&self, prop_id: &str) -> EngineResult<RepriceReport> {
        let now = self.now();
        let mut tx = self.store().begin().await?;
        let prop = require_prop(&mut tx, prop_id).await?;
        let report = reprice_in_tx(&mut tx, &prop, RepriceTrigger::Manual, SYSTEM_ACTOR, now).await?;
        tx.commit().await?;
        Ok(report)
    }

    /// Record one occurrence against a prop and reprice it.
    pub async fn add_tally(&self, prop_id: &str, user_id: &str) -> EngineResult<TallyUpdate> {
        if user_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("user id is required".into()));
        }
        let now = self.now();
        let mut tx = self.store().begin().await?;
        let prop = require_prop(&mut tx, prop_id).await?;
        let tally_id = storage::insert_tally(&mut tx, &prop.id, user_id, now).await?;
        let reprice = reprice_in_tx(&mut tx, &prop, RepriceTrigger::TallyAdded, user_id, now).await?;
        tx.commit().await?;

        info!(prop_id, tally_id, user_id, count = reprice.tally_count, "Tally added");
        Ok(TallyUpdate { tally_id, reprice })
    }

    /// Soft-delete a tally and reprice its prop.
    pub async fn remove_tally(&self, tally_id: i64, user_id: &str) -> EngineResult<TallyUpdate> {
        let now = self.now();
        let mut tx = self.store().begin().await?;
        let tally = storage::fetch_tally(&mut tx, tally_id)
            .await?
            .ok_or_else(|| EngineError::InvalidInput(format!("tally not found: {tally_id}")))?;
        if !tally.active {
            return Err(EngineError::NotFoundOrInactive(format!("tally {tally_id} already deleted")));
        }
        if storage::deactivate_tally(&mut tx, tally_id, user_id, now).await? != 1 {
            return Err(EngineError::TransactionConflict(format!("tally {tally_id} changed concurrently")));
        }
        let prop = require_prop(&mut tx, &tally.prop_id).await?;
        let reprice = reprice_in_tx(&mut tx, &prop, RepriceTrigger::TallyRemoved, user_id, now).await?;
        tx.commit().await?;

        info!(prop_id = %prop.id, tally_id, user_id, count = reprice.tally_count, "Tally removed");
        Ok(TallyUpdate { tally_id, reprice })
    }

    /// The prop's effective EV right now.
    pub async fn live_estimate(&self, prop_id: &str) -> EngineResult<LiveEstimate> {
        let now = self.now();
        let mut conn = self.store().acquire().await?;
        let prop = require_prop(&mut conn, prop_id).await?;
        live_estimate(&mut conn, &prop, RepriceTrigger::Manual, now).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
