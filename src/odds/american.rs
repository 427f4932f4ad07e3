//! American odds conversions.
//!
//! American odds are signed integers: `+150` pays 150 on a 100 stake,
//! `-200` needs a 200 stake to win 100. Zero is not a valid price.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::round_half_up;
use crate::types::{EngineError, EngineResult};

/// Fraction shaved off every underdog (positive) price.
pub const HOUSE_EDGE: f64 = 0.06;

/// Quoted odds are always multiples of this.
pub const ODDS_INCREMENT: f64 = 5.0;

/// Implied win probability of an American price.
pub fn american_to_implied_probability(odds: i32) -> EngineResult<f64> {
    if odds == 0 {
        return Err(EngineError::InvalidInput("American odds cannot be 0".into()));
    }
    let odds = f64::from(odds);
    if odds > 0.0 {
        Ok(100.0 / (odds + 100.0))
    } else {
        Ok(odds.abs() / (odds.abs() + 100.0))
    }
}

/// Price a win probability as American odds.
///
/// Favourites (`p >= 0.5`) get negative odds at fair value. Underdogs get
/// positive odds reduced by [`HOUSE_EDGE`]. The result is rounded to the
/// nearest [`ODDS_INCREMENT`].
pub fn probability_to_american_odds(p: f64) -> EngineResult<i32> {
    if !p.is_finite() || p <= 0.0 || p >= 1.0 {
        return Err(EngineError::InvalidInput(format!(
            "probability must be strictly between 0 and 1, got {p}"
        )));
    }

    let raw = if p >= 0.5 {
        round_half_up(-100.0 * p / (1.0 - p))
    } else {
        let fair = round_half_up(100.0 * (1.0 - p) / p);
        round_half_up(fair * (1.0 - HOUSE_EDGE))
    };

    let odds = round_half_up(raw / ODDS_INCREMENT) * ODDS_INCREMENT;
    Ok(odds as i32)
}

/// Decimal (European) multiplier of an American price, stake included.
pub fn american_to_decimal(odds: i32) -> EngineResult<Decimal> {
    if odds == 0 {
        return Err(EngineError::InvalidInput("American odds cannot be 0".into()));
    }
    let value = Decimal::from(odds);
    if odds > 0 {
        Ok(value / dec!(100) + Decimal::ONE)
    } else {
        Ok(dec!(100) / value.abs() + Decimal::ONE)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
