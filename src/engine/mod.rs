//! Core engine: repricing, valuation, settlement and the coin ledger.
//!
//! `Engine` is the facade the surrounding application calls. Each
//! submodule adds its operations as an `impl Engine` block; every
//! operation that writes runs as exactly one store transaction.

pub mod ledger;
pub mod repricer;
pub mod settlement;
pub mod valuation;

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

use crate::storage::Store;
use crate::types::PushPolicy;
use settlement::ResolveThrottle;

/// Actor recorded on rows the engine modifies on its own behalf.
pub const SYSTEM_ACTOR: &str = "engine";

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now". Injected so settlement and repricing are testable.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine tunables. Defaults here, overridden by config.toml at runtime.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Settlement of legs that land exactly on their line.
    pub push_policy: PushPolicy,
    /// Share of probability-weighted profit paid on cash-out (house keeps the rest).
    pub cash_out_factor: f64,
    /// Cash-out never pays less than this fraction of the stake.
    pub min_cash_out_fraction: f64,
    /// Minimum gap between throttled resolution runs for one user.
    pub resolve_cooldown: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            push_policy: PushPolicy::Loss,
            cash_out_factor: 0.85,
            min_cash_out_fraction: 0.10,
            resolve_cooldown: Duration::minutes(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Odds & settlement engine over a [`Store`]. Cheap to clone; clones share
/// the pool and the resolution throttle.
#[derive(Clone)]
pub struct Engine {
    store: Store,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    throttle: Arc<ResolveThrottle>,
}

impl Engine {
    pub fn new(store: Store, config: EngineConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Store, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let throttle = Arc::new(ResolveThrottle::new(config.resolve_cooldown));
        Self {
            store,
            config,
            clock,
            throttle,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
