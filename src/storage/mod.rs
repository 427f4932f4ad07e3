//! Persistence layer.
//!
//! SQLite through `sqlx`. The `Store` owns the pool and hands out
//! transactions; the free functions below run one statement each against
//! whatever connection (pooled or transactional) the engine passes in, so
//! a unit of work decides its own transaction boundary.

pub mod records;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::odds::LinePrice;
use crate::types::{EngineResult, Leg, LegView, Parlay, ParlayState, Prop, PropOption, Tally};
use records::{to_millis, LegViewRow, OptionRow, ParlayRow, PropRow, TallyRow};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS props (
        id          TEXT PRIMARY KEY,
        description TEXT NOT NULL,
        ev          REAL NOT NULL,
        created_at  INTEGER NOT NULL,
        end_at      INTEGER NOT NULL,
        created_by  TEXT NOT NULL,
        active      INTEGER NOT NULL DEFAULT 1,
        modified_at INTEGER,
        modified_by TEXT
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS prop_options (
        id          TEXT PRIMARY KEY,
        prop_id     TEXT NOT NULL REFERENCES props(id),
        line        REAL NOT NULL,
        odds_over   INTEGER NOT NULL,
        odds_under  INTEGER NOT NULL,
        active      INTEGER NOT NULL DEFAULT 1,
        created_at  INTEGER NOT NULL,
        created_by  TEXT NOT NULL,
        modified_at INTEGER NOT NULL,
        modified_by TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_prop_options_prop ON prop_options (prop_id, active)",
    r"
    CREATE TABLE IF NOT EXISTS tallies (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        prop_id     TEXT NOT NULL REFERENCES props(id),
        created_at  INTEGER NOT NULL,
        created_by  TEXT NOT NULL,
        active      INTEGER NOT NULL DEFAULT 1,
        modified_at INTEGER NOT NULL,
        modified_by TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_tallies_prop ON tallies (prop_id, active, created_at)",
    r"
    CREATE TABLE IF NOT EXISTS parlays (
        id            TEXT PRIMARY KEY,
        user_id       TEXT NOT NULL,
        coins_wagered INTEGER NOT NULL,
        created_at    INTEGER NOT NULL,
        active        INTEGER NOT NULL DEFAULT 1,
        state         TEXT NOT NULL DEFAULT 'active',
        payout        INTEGER,
        resolved_at   INTEGER
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_parlays_user ON parlays (user_id, active)",
    r"
    CREATE TABLE IF NOT EXISTS parlay_legs (
        parlay_id      TEXT NOT NULL REFERENCES parlays(id),
        position       INTEGER NOT NULL,
        option_id      TEXT NOT NULL REFERENCES prop_options(id),
        is_over        INTEGER NOT NULL,
        odds_locked_in INTEGER NOT NULL,
        PRIMARY KEY (parlay_id, position)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS user_coins (
        user_id     TEXT PRIMARY KEY,
        coins       INTEGER NOT NULL,
        modified_at INTEGER NOT NULL
    )
    ",
];

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the SQLite database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str, max_connections: u32, busy_timeout: Duration) -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, max_connections, "Store connected");
        Ok(store)
    }

    /// A private in-memory database. One connection that never expires,
    /// since closing it would drop the data.
    pub async fn in_memory() -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the schema. Idempotent.
    pub async fn migrate(&self) -> EngineResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!(statements = SCHEMA.len(), "Schema applied");
        Ok(())
    }

    pub async fn begin(&self) -> EngineResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn acquire(&self) -> EngineResult<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Props
// ---------------------------------------------------------------------------

pub async fn insert_prop(conn: &mut SqliteConnection, prop: &Prop) -> EngineResult<()> {
    sqlx::query(
        r"
        INSERT INTO props (id, description, ev, created_at, end_at, created_by, active)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(&prop.id)
    .bind(&prop.description)
    .bind(prop.ev)
    .bind(to_millis(prop.created_at))
    .bind(to_millis(prop.end_at))
    .bind(&prop.created_by)
    .bind(prop.active)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_prop(conn: &mut SqliteConnection, prop_id: &str) -> EngineResult<Option<Prop>> {
    let row = sqlx::query_as::<_, PropRow>(
        "SELECT id, description, ev, created_at, end_at, created_by, active FROM props WHERE id = ?",
    )
    .bind(prop_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Prop::try_from).transpose()
}

/// Take a prop down. Returns 0 when it was already inactive.
pub async fn deactivate_prop(
    conn: &mut SqliteConnection,
    prop_id: &str,
    modified_by: &str,
    now: DateTime<Utc>,
) -> EngineResult<u64> {
    let result = sqlx::query(
        r"
        UPDATE props
        SET active = 0, modified_at = ?, modified_by = ?
        WHERE id = ? AND active = 1
        ",
    )
    .bind(to_millis(now))
    .bind(modified_by)
    .bind(prop_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

pub async fn insert_option(
    conn: &mut SqliteConnection,
    option: &PropOption,
    created_by: &str,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    sqlx::query(
        r"
        INSERT INTO prop_options
            (id, prop_id, line, odds_over, odds_under, active,
             created_at, created_by, modified_at, modified_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(&option.id)
    .bind(&option.prop_id)
    .bind(option.line)
    .bind(option.odds_over)
    .bind(option.odds_under)
    .bind(option.active)
    .bind(to_millis(now))
    .bind(created_by)
    .bind(to_millis(now))
    .bind(created_by)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch_option(conn: &mut SqliteConnection, option_id: &str) -> EngineResult<Option<PropOption>> {
    let row = sqlx::query_as::<_, OptionRow>(
        "SELECT id, prop_id, line, odds_over, odds_under, active FROM prop_options WHERE id = ?",
    )
    .bind(option_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(PropOption::try_from).transpose()
}

pub async fn fetch_active_options(conn: &mut SqliteConnection, prop_id: &str) -> EngineResult<Vec<PropOption>> {
    let rows = sqlx::query_as::<_, OptionRow>(
        r"
        SELECT id, prop_id, line, odds_over, odds_under, active
        FROM prop_options
        WHERE prop_id = ? AND active = 1
        ORDER BY line ASC
        ",
    )
    .bind(prop_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(PropOption::try_from).collect()
}

/// Returns the number of rows touched (0 if the option went inactive).
pub async fn update_option_odds(
    conn: &mut SqliteConnection,
    option_id: &str,
    price: LinePrice,
    modified_by: &str,
    now: DateTime<Utc>,
) -> EngineResult<u64> {
    let result = sqlx::query(
        r"
        UPDATE prop_options
        SET odds_over = ?, odds_under = ?, modified_at = ?, modified_by = ?
        WHERE id = ? AND active = 1
        ",
    )
    .bind(price.odds_over)
    .bind(price.odds_under)
    .bind(to_millis(now))
    .bind(modified_by)
    .bind(option_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Take a line off the board. Returns 0 when it was already inactive.
pub async fn deactivate_option(
    conn: &mut SqliteConnection,
    option_id: &str,
    modified_by: &str,
    now: DateTime<Utc>,
) -> EngineResult<u64> {
    let result = sqlx::query(
        r"
        UPDATE prop_options
        SET active = 0, modified_at = ?, modified_by = ?
        WHERE id = ? AND active = 1
        ",
    )
    .bind(to_millis(now))
    .bind(modified_by)
    .bind(option_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Deactivate every active option of a prop. Returns how many went down.
pub async fn deactivate_prop_options(
    conn: &mut SqliteConnection,
    prop_id: &str,
    modified_by: &str,
    now: DateTime<Utc>,
) -> EngineResult<u64> {
    let result = sqlx::query(
        r"
        UPDATE prop_options
        SET active = 0, modified_at = ?, modified_by = ?
        WHERE prop_id = ? AND active = 1
        ",
    )
    .bind(to_millis(now))
    .bind(modified_by)
    .bind(prop_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Tallies
// ---------------------------------------------------------------------------

pub async fn insert_tally(
    conn: &mut SqliteConnection,
    prop_id: &str,
    created_by: &str,
    now: DateTime<Utc>,
) -> EngineResult<i64> {
    let result = sqlx::query(
        r"
        INSERT INTO tallies (prop_id, created_at, created_by, active, modified_at, modified_by)
        VALUES (?, ?, ?, 1, ?, ?)
        ",
    )
    .bind(prop_id)
    .bind(to_millis(now))
    .bind(created_by)
    .bind(to_millis(now))
    .bind(created_by)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn fetch_tally(conn: &mut SqliteConnection, tally_id: i64) -> EngineResult<Option<Tally>> {
    let row = sqlx::query_as::<_, TallyRow>(
        "SELECT id, prop_id, created_at, created_by, active FROM tallies WHERE id = ?",
    )
    .bind(tally_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Tally::try_from).transpose()
}

/// Soft-delete. Returns 0 when the tally was already inactive.
pub async fn deactivate_tally(
    conn: &mut SqliteConnection,
    tally_id: i64,
    modified_by: &str,
    now: DateTime<Utc>,
) -> EngineResult<u64> {
    let result = sqlx::query(
        r"
        UPDATE tallies
        SET active = 0, modified_at = ?, modified_by = ?
        WHERE id = ? AND active = 1
        ",
    )
    .bind(to_millis(now))
    .bind(modified_by)
    .bind(tally_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// The prop's live count.
pub async fn count_active_tallies(conn: &mut SqliteConnection, prop_id: &str) -> EngineResult<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tallies WHERE prop_id = ? AND active = 1")
        .bind(prop_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count.max(0) as u64)
}

/// Active tallies with `from <= created_at <= to`.
pub async fn count_tallies_between(
    conn: &mut SqliteConnection,
    prop_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> EngineResult<u64> {
    let count: i64 = sqlx::query_scalar(
        r"
        SELECT COUNT(*) FROM tallies
        WHERE prop_id = ? AND active = 1 AND created_at >= ? AND created_at <= ?
        ",
    )
    .bind(prop_id)
    .bind(to_millis(from))
    .bind(to_millis(to))
    .fetch_one(&mut *conn)
    .await?;
    Ok(count.max(0) as u64)
}

// ---------------------------------------------------------------------------
// Parlays
// ---------------------------------------------------------------------------

pub async fn insert_parlay(conn: &mut SqliteConnection, parlay: &Parlay, legs: &[Leg]) -> EngineResult<()> {
    sqlx::query(
        r"
        INSERT INTO parlays (id, user_id, coins_wagered, created_at, active, state)
        VALUES (?, ?, ?, ?, 1, ?)
        ",
    )
    .bind(&parlay.id)
    .bind(&parlay.user_id)
    .bind(parlay.coins_wagered)
    .bind(to_millis(parlay.created_at))
    .bind(parlay.state.as_str())
    .execute(&mut *conn)
    .await?;

    for (position, leg) in legs.iter().enumerate() {
        sqlx::query(
            r"
            INSERT INTO parlay_legs (parlay_id, position, option_id, is_over, odds_locked_in)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(&leg.parlay_id)
        .bind(position as i64)
        .bind(&leg.option_id)
        .bind(leg.side.is_over())
        .bind(leg.odds_locked_in)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn fetch_parlay(conn: &mut SqliteConnection, parlay_id: &str) -> EngineResult<Option<Parlay>> {
    let row = sqlx::query_as::<_, ParlayRow>(
        r"
        SELECT id, user_id, coins_wagered, created_at, state, payout, resolved_at
        FROM parlays WHERE id = ?
        ",
    )
    .bind(parlay_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Parlay::try_from).transpose()
}

/// Legs in placement order, joined with their option's line and prop end.
pub async fn fetch_leg_views(conn: &mut SqliteConnection, parlay_id: &str) -> EngineResult<Vec<LegView>> {
    let rows = sqlx::query_as::<_, LegViewRow>(
        r"
        SELECT l.parlay_id, l.option_id, l.is_over, l.odds_locked_in,
               o.prop_id, o.line, p.end_at AS prop_end_at
        FROM parlay_legs l
        JOIN prop_options o ON o.id = l.option_id
        JOIN props p ON p.id = o.prop_id
        WHERE l.parlay_id = ?
        ORDER BY l.position ASC
        ",
    )
    .bind(parlay_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(LegView::try_from).collect()
}

pub async fn active_parlay_ids(conn: &mut SqliteConnection, user_id: &str) -> EngineResult<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT id FROM parlays WHERE user_id = ? AND active = 1 ORDER BY created_at ASC",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

/// Active parlays with at least one leg on `prop_id`.
pub async fn active_parlays_for_prop(conn: &mut SqliteConnection, prop_id: &str) -> EngineResult<Vec<Parlay>> {
    let rows = sqlx::query_as::<_, ParlayRow>(
        r"
        SELECT p.id, p.user_id, p.coins_wagered, p.created_at, p.state, p.payout, p.resolved_at
        FROM parlays p
        WHERE p.active = 1 AND EXISTS (
            SELECT 1 FROM parlay_legs l
            JOIN prop_options o ON o.id = l.option_id
            WHERE l.parlay_id = p.id AND o.prop_id = ?
        )
        ORDER BY p.created_at ASC
        ",
    )
    .bind(prop_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(Parlay::try_from).collect()
}

pub async fn users_with_active_parlays(conn: &mut SqliteConnection) -> EngineResult<Vec<String>> {
    let users = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT user_id FROM parlays WHERE active = 1 ORDER BY user_id ASC",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(users)
}

/// Move an active parlay to its final state. Returns 0 if it was no longer
/// active, which callers treat as a lost race.
pub async fn close_parlay(
    conn: &mut SqliteConnection,
    parlay_id: &str,
    state: ParlayState,
    payout: i64,
    now: DateTime<Utc>,
) -> EngineResult<u64> {
    let result = sqlx::query(
        r"
        UPDATE parlays
        SET active = 0, state = ?, payout = ?, resolved_at = ?
        WHERE id = ? AND active = 1
        ",
    )
    .bind(state.as_str())
    .bind(payout)
    .bind(to_millis(now))
    .bind(parlay_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Coins
// ---------------------------------------------------------------------------

/// Atomic increment, creating the balance row if needed.
pub async fn credit_coins(
    conn: &mut SqliteConnection,
    user_id: &str,
    amount: i64,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    sqlx::query(
        r"
        INSERT INTO user_coins (user_id, coins, modified_at)
        VALUES (?, ?, ?)
        ON CONFLICT (user_id) DO UPDATE
        SET coins = coins + excluded.coins, modified_at = excluded.modified_at
        ",
    )
    .bind(user_id)
    .bind(amount)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Atomic decrement that only applies when the balance covers it.
/// Returns 0 when funds were insufficient (or no balance row exists).
pub async fn debit_coins(
    conn: &mut SqliteConnection,
    user_id: &str,
    amount: i64,
    now: DateTime<Utc>,
) -> EngineResult<u64> {
    let result = sqlx::query(
        r"
        UPDATE user_coins
        SET coins = coins - ?, modified_at = ?
        WHERE user_id = ? AND coins >= ?
        ",
    )
    .bind(amount)
    .bind(to_millis(now))
    .bind(user_id)
    .bind(amount)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn fetch_balance(conn: &mut SqliteConnection, user_id: &str) -> EngineResult<Option<i64>> {
    let coins = sqlx::query_scalar::<_, i64>("SELECT coins FROM user_coins WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(coins)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
