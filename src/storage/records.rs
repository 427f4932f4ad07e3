//! Row types and their mapping into domain types.
//!
//! Timestamps are stored as Unix milliseconds, odds as INTEGER, flags as
//! 0/1 INTEGER. Everything is validated on the way out.

use chrono::{DateTime, Utc};

use crate::types::{EngineError, EngineResult, Leg, LegView, Parlay, Prop, PropOption, Side, Tally};

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EngineError::Storage(format!("timestamp out of range: {ms}")))
}

fn to_odds(value: i64) -> EngineResult<i32> {
    i32::try_from(value).map_err(|_| EngineError::Storage(format!("odds out of range: {value}")))
}

#[derive(Debug, sqlx::FromRow)]
pub struct PropRow {
    pub id: String,
    pub description: String,
    pub ev: f64,
    pub created_at: i64,
    pub end_at: i64,
    pub created_by: String,
    pub active: bool,
}

impl TryFrom<PropRow> for Prop {
    type Error = EngineError;

    fn try_from(row: PropRow) -> EngineResult<Self> {
        Ok(Prop {
            id: row.id,
            description: row.description,
            ev: row.ev,
            created_at: from_millis(row.created_at)?,
            end_at: from_millis(row.end_at)?,
            created_by: row.created_by,
            active: row.active,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct OptionRow {
    pub id: String,
    pub prop_id: String,
    pub line: f64,
    pub odds_over: i64,
    pub odds_under: i64,
    pub active: bool,
}

impl TryFrom<OptionRow> for PropOption {
    type Error = EngineError;

    fn try_from(row: OptionRow) -> EngineResult<Self> {
        Ok(PropOption {
            id: row.id,
            prop_id: row.prop_id,
            line: row.line,
            odds_over: to_odds(row.odds_over)?,
            odds_under: to_odds(row.odds_under)?,
            active: row.active,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct TallyRow {
    pub id: i64,
    pub prop_id: String,
    pub created_at: i64,
    pub created_by: String,
    pub active: bool,
}

impl TryFrom<TallyRow> for Tally {
    type Error = EngineError;

    fn try_from(row: TallyRow) -> EngineResult<Self> {
        Ok(Tally {
            id: row.id,
            prop_id: row.prop_id,
            created_at: from_millis(row.created_at)?,
            created_by: row.created_by,
            active: row.active,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct ParlayRow {
    pub id: String,
    pub user_id: String,
    pub coins_wagered: i64,
    pub created_at: i64,
    pub state: String,
    pub payout: Option<i64>,
    pub resolved_at: Option<i64>,
}

impl TryFrom<ParlayRow> for Parlay {
    type Error = EngineError;

    fn try_from(row: ParlayRow) -> EngineResult<Self> {
        Ok(Parlay {
            id: row.id,
            user_id: row.user_id,
            coins_wagered: row.coins_wagered,
            created_at: from_millis(row.created_at)?,
            state: row.state.parse()?,
            payout: row.payout,
            resolved_at: row.resolved_at.map(from_millis).transpose()?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct LegViewRow {
    pub parlay_id: String,
    pub option_id: String,
    pub is_over: bool,
    pub odds_locked_in: i64,
    pub prop_id: String,
    pub line: f64,
    pub prop_end_at: i64,
}

impl TryFrom<LegViewRow> for LegView {
    type Error = EngineError;

    fn try_from(row: LegViewRow) -> EngineResult<Self> {
        Ok(LegView {
            leg: Leg {
                parlay_id: row.parlay_id,
                option_id: row.option_id,
                side: Side::from_is_over(row.is_over),
                odds_locked_in: to_odds(row.odds_locked_in)?,
            },
            prop_id: row.prop_id,
            line: row.line,
            prop_end_at: from_millis(row.prop_end_at)?,
        })
    }
}
