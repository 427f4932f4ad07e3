//! EV-based line pricing.
//!
//! A line's win probability moves linearly away from 50/50 as the line
//! moves away from the prop's expected value, capped at 90/10.

use serde::{Deserialize, Serialize};

use super::american::{american_to_implied_probability, probability_to_american_odds};
use super::round_half_up;
use crate::types::{EngineError, EngineResult, Side};

/// Largest probability shift away from 50/50.
pub const MAX_SHIFT: f64 = 0.4;

/// Probability shift per unit of relative distance `|line - ev| / ev`.
pub const SHIFT_SLOPE: f64 = 0.8;

/// Over/under odds for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinePrice {
    pub odds_over: i32,
    pub odds_under: i32,
}

impl LinePrice {
    pub fn for_side(&self, side: Side) -> i32 {
        match side {
            Side::Over => self.odds_over,
            Side::Under => self.odds_under,
        }
    }
}

/// Reject anything that is not a non-negative half-integer (`0.5`, `1.5`, ...).
pub fn validate_line(line: f64) -> EngineResult<()> {
    if !line.is_finite() || line < 0.0 || (line * 2.0).rem_euclid(2.0) != 1.0 {
        return Err(EngineError::InvalidInput(format!(
            "line must be a non-negative number ending in .5, got {line}"
        )));
    }
    Ok(())
}

fn validate_ev(ev: f64) -> EngineResult<()> {
    if !ev.is_finite() || ev <= 0.0 {
        return Err(EngineError::InvalidInput(format!(
            "expected value must be positive, got {ev}"
        )));
    }
    Ok(())
}

/// Price both sides of `line` for a prop whose expected final count is `ev`.
pub fn price_line(ev: f64, line: f64) -> EngineResult<LinePrice> {
    validate_ev(ev)?;
    if !line.is_finite() {
        return Err(EngineError::InvalidInput(format!("line must be finite, got {line}")));
    }

    let (over_prob, under_prob) = if line == ev {
        (0.5, 0.5)
    } else {
        let distance = line - ev;
        let shift = (distance.abs() / ev * SHIFT_SLOPE).min(MAX_SHIFT);
        if line < ev {
            (0.5 + shift, 0.5 - shift)
        } else {
            (0.5 - shift, 0.5 + shift)
        }
    };

    Ok(LinePrice {
        odds_over: probability_to_american_odds(over_prob)?,
        odds_under: probability_to_american_odds(under_prob)?,
    })
}

/// Recover the line that one side's odds imply, rounded to the nearest 0.5.
///
/// Inverse of [`price_line`] up to rounding. The result may be a whole
/// number; callers creating an option still have to run [`validate_line`].
pub fn line_from_odds(odds: i32, side: Side, ev: f64) -> EngineResult<f64> {
    validate_ev(ev)?;
    let implied = american_to_implied_probability(odds)?;
    let shift = (implied - 0.5).abs();
    let distance = (shift / SHIFT_SLOPE) * ev;
    let favoured = implied > 0.5;

    let line = match (side, favoured) {
        (Side::Over, true) | (Side::Under, false) => ev - distance,
        (Side::Over, false) | (Side::Under, true) => ev + distance,
    };

    Ok(round_half_up(line * 2.0) / 2.0)
}

/// Odds for the opposite side, found by deriving the line from `odds`
/// and repricing it.
pub fn complement_odds(odds: i32, side: Side, ev: f64) -> EngineResult<i32> {
    let line = line_from_odds(odds, side, ev)?;
    Ok(price_line(ev, line)?.for_side(side.opposite()))
}

/// Display form of a line, always one decimal place.
pub fn format_line(line: f64) -> String {
    format!("{line:.1}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_at_ev_is_even() {
        for ev in [0.5, 2.5, 12.5, 99.5] {
            let price = price_line(ev, ev).unwrap();
            assert_eq!(price.odds_over, price.odds_under);
            assert_eq!(price.odds_over, -100);
        }
    }

    #[test]
    fn test_line_above_ev_favours_under() {
        let price = price_line(10.0, 12.5).unwrap();
        assert_eq!(price.odds_over, 220);
        assert_eq!(price.odds_under, -235);
    }

    #[test]
    fn test_line_below_ev_favours_over() {
        let price = price_line(10.0, 7.5).unwrap();
        assert_eq!(price.odds_over, -235);
        assert_eq!(price.odds_under, 220);
    }

    #[test]
    fn test_shift_is_capped() {
        let price = price_line(10.0, 0.5).unwrap();
        assert_eq!(price.odds_over, -900);
        assert_eq!(price.odds_under, 845);

        let far = price_line(10.0, 500.5).unwrap();
        assert_eq!(far.odds_over, 845);
        assert_eq!(far.odds_under, -900);
    }

    #[test]
    fn test_zero_or_negative_ev_rejected() {
        assert!(matches!(price_line(0.0, 2.5), Err(EngineError::InvalidInput(_))));
        assert!(matches!(price_line(-3.0, 2.5), Err(EngineError::InvalidInput(_))));
        assert!(line_from_odds(150, Side::Over, 0.0).is_err());
    }

    #[test]
    fn test_line_from_odds_inverts_pricing() {
        let price = price_line(10.0, 12.5).unwrap();
        assert_eq!(line_from_odds(price.odds_over, Side::Over, 10.0).unwrap(), 12.5);
        assert_eq!(line_from_odds(price.odds_under, Side::Under, 10.0).unwrap(), 12.5);

        let price = price_line(10.0, 7.5).unwrap();
        assert_eq!(line_from_odds(price.odds_over, Side::Over, 10.0).unwrap(), 7.5);
    }

    #[test]
    fn test_complement_odds() {
        assert_eq!(complement_odds(220, Side::Over, 10.0).unwrap(), -235);
        assert_eq!(complement_odds(-235, Side::Under, 10.0).unwrap(), 220);
    }

    #[test]
    fn test_validate_line() {
        assert!(validate_line(0.5).is_ok());
        assert!(validate_line(12.5).is_ok());
        assert!(validate_line(12.0).is_err());
        assert!(validate_line(12.25).is_err());
        assert!(validate_line(-0.5).is_err());
        assert!(validate_line(f64::NAN).is_err());
    }

    #[test]
    fn test_format_line() {
        assert_eq!(format_line(12.5), "12.5");
        assert_eq!(format_line(12.0), "12.0");
    }
}
