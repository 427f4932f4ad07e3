//! Shared test harness.
//!
//! An engine over an in-memory store driven by a manual clock, plus a
//! file-backed store for tests that need several connections.

use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use propbook::engine::{Engine, EngineConfig, ManualClock};
use propbook::storage::Store;
use propbook::types::{LegSelection, Prop, PropOption, Side};

pub struct Harness {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub start: DateTime<Utc>,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Store::in_memory().await.unwrap();
        Self::with_store(store, EngineConfig::default())
    }

    pub fn with_store(store: Store, config: EngineConfig) -> Self {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let engine = Engine::with_clock(store, config, clock.clone());
        Self { engine, clock, start }
    }

    /// A prop ending `hours` after the harness start.
    pub async fn prop(&self, description: &str, ev: f64, hours: i64) -> Prop {
        self.engine
            .create_prop(description, ev, self.start + Duration::hours(hours), "alice")
            .await
            .unwrap()
    }

    pub async fn option(&self, prop: &Prop, line: f64) -> PropOption {
        self.engine.create_option(&prop.id, line, "alice").await.unwrap()
    }

    pub async fn tallies(&self, prop: &Prop, count: usize) {
        for _ in 0..count {
            self.engine.add_tally(&prop.id, "scorekeeper").await.unwrap();
        }
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

pub fn leg(option: &PropOption, side: Side) -> LegSelection {
    LegSelection {
        option_id: option.id.clone(),
        side,
    }
}

/// A fresh on-disk database. Remove it with [`remove_db`].
pub async fn file_store() -> (Store, PathBuf) {
    let path = std::env::temp_dir().join(format!("propbook-test-{}.db", Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    let store = Store::connect(&url, 4, std::time::Duration::from_secs(5)).await.unwrap();
    (store, path)
}

pub async fn remove_db(store: Store, path: PathBuf) {
    store.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}
