//! Odds primitives: American odds conversions and EV-based line pricing.
//!
//! Everything here is pure and synchronous; the engine layers
//! persistence and transactions on top.

pub mod american;
pub mod line;

pub use american::{american_to_decimal, american_to_implied_probability, probability_to_american_odds};
pub use line::{complement_odds, line_from_odds, price_line, validate_line, LinePrice};

/// Round half toward positive infinity (`-232.5` → `-232`, `232.5` → `233`).
/// Every odds conversion rounds through here, not `f64::round`.
pub fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}
