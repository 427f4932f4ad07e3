//! Shared types for the PROPBOOK engine.
//!
//! These types form the data model used across all modules.
//! Storage rows are mapped into them at the `storage` boundary so that
//! the odds, engine and api modules never see raw SQL types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::odds::line::format_line;

// ---------------------------------------------------------------------------
// Prop
// ---------------------------------------------------------------------------

/// A wagerable proposition about a future count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prop {
    pub id: String,
    pub description: String,
    /// Creator's belief about the final count. Fixed at creation and used
    /// as the baseline for every reprice.
    pub ev: f64,
    pub created_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub created_by: String,
    /// Cleared when the prop is taken down. Inactive props take no tallies,
    /// options or bets.
    pub active: bool,
}

impl fmt::Display for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (EV {:.1}, ends {})",
            self.description,
            self.ev,
            self.end_at.format("%Y-%m-%d %H:%M UTC"),
        )
    }
}

impl Prop {
    /// Whether the prop is closed for settlement purposes at `now`.
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end_at <= now
    }

    /// Fraction of the prop's lifetime elapsed at `now`, clamped to [0, 1].
    pub fn time_progress(&self, now: DateTime<Utc>) -> f64 {
        let total = (self.end_at - self.created_at).num_milliseconds();
        if total <= 0 {
            return if now >= self.end_at { 1.0 } else { 0.0 };
        }
        let elapsed = (now - self.created_at).num_milliseconds();
        (elapsed as f64 / total as f64).clamp(0.0, 1.0)
    }

    #[cfg(test)]
    pub fn sample(ev: f64) -> Self {
        let created_at = Utc::now();
        Prop {
            id: "prop-001".to_string(),
            description: "Times the dog barks tonight".to_string(),
            ev,
            created_at,
            end_at: created_at + chrono::Duration::hours(10),
            created_by: "alice".to_string(),
            active: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Option (a line)
// ---------------------------------------------------------------------------

/// An over/under line on a prop with its current odds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropOption {
    pub id: String,
    pub prop_id: String,
    /// Always a half-integer (ends in .5).
    pub line: f64,
    pub odds_over: i32,
    pub odds_under: i32,
    pub active: bool,
}

impl PropOption {
    /// Current odds for one side of the line.
    pub fn odds_for(&self, side: Side) -> i32 {
        match side {
            Side::Over => self.odds_over,
            Side::Under => self.odds_under,
        }
    }
}

impl fmt::Display for PropOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (o {:+} / u {:+})",
            format_line(self.line),
            self.odds_over,
            self.odds_under
        )
    }
}

// ---------------------------------------------------------------------------
// Tally
// ---------------------------------------------------------------------------

/// One timestamped unit increment against a prop's count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tally {
    pub id: i64,
    pub prop_id: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which side of a line a leg takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Over,
    Under,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Over => Side::Under,
            Side::Under => Side::Over,
        }
    }

    pub fn is_over(&self) -> bool {
        matches!(self, Side::Over)
    }

    pub fn from_is_over(is_over: bool) -> Self {
        if is_over {
            Side::Over
        } else {
            Side::Under
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Over => write!(f, "OVER"),
            Side::Under => write!(f, "UNDER"),
        }
    }
}

/// Lifecycle of a parlay. Only `Active` parlays can be cashed out or resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParlayState {
    Active,
    Won,
    Lost,
    CashedOut,
    /// Closed because a prop it depends on was removed. The stake is refunded.
    Void,
}

impl ParlayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParlayState::Active => "active",
            ParlayState::Won => "won",
            ParlayState::Lost => "lost",
            ParlayState::CashedOut => "cashed_out",
            ParlayState::Void => "void",
        }
    }
}

impl fmt::Display for ParlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ParlayState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ParlayState::Active),
            "won" => Ok(ParlayState::Won),
            "lost" => Ok(ParlayState::Lost),
            "cashed_out" => Ok(ParlayState::CashedOut),
            "void" => Ok(ParlayState::Void),
            other => Err(EngineError::Storage(format!("unknown parlay state: {other}"))),
        }
    }
}

/// How a leg whose final count lands exactly on its line is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPolicy {
    /// Exact-line legs lose.
    #[default]
    Loss,
    /// Exact-line legs drop out of the parlay at even money.
    Refund,
}

// ---------------------------------------------------------------------------
// Parlay & legs
// ---------------------------------------------------------------------------

/// A combined wager across one or more legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parlay {
    pub id: String,
    pub user_id: String,
    pub coins_wagered: i64,
    pub created_at: DateTime<Utc>,
    pub state: ParlayState,
    /// Coins credited when the parlay left `Active` (win payout or cash-out).
    pub payout: Option<i64>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Parlay {
    pub fn is_active(&self) -> bool {
        self.state == ParlayState::Active
    }
}

impl fmt::Display for Parlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parlay {} by {} ({} coins, {})",
            self.id, self.user_id, self.coins_wagered, self.state
        )
    }
}

/// One option choice inside a parlay. `odds_locked_in` never changes after
/// the parlay is placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub parlay_id: String,
    pub option_id: String,
    pub side: Side,
    pub odds_locked_in: i32,
}

/// A leg joined with the option and prop facts needed to value or settle it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegView {
    pub leg: Leg,
    pub prop_id: String,
    pub line: f64,
    pub prop_end_at: DateTime<Utc>,
}

/// A prospective leg submitted when placing a parlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegSelection {
    pub option_id: String,
    pub side: Side,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors surfaced by engine operations. Each is local to one unit of work.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found or inactive: {0}")]
    NotFoundOrInactive(String),

    #[error("Insufficient funds: need {needed} coins, have {available}")]
    InsufficientFunds { needed: i64, available: i64 },

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// SQLite (extended) result codes for the BUSY and LOCKED families.
const CONFLICT_CODES: &[&str] = &["5", "6", "261", "262", "517"];

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db
                .code()
                .is_some_and(|code| CONFLICT_CODES.contains(&code.as_ref()))
            {
                return EngineError::TransactionConflict(db.message().to_string());
            }
        }
        EngineError::Storage(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
