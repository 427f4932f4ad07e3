//! PROPBOOK: odds and settlement engine for over/under prop parlays.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the store, serves the HTTP API and runs the periodic settlement
//! sweep with graceful shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use propbook::api;
use propbook::config;
use propbook::engine::settlement::SettlementReport;
use propbook::engine::Engine;
use propbook::storage::Store;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("PROPBOOK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging(&cfg.logging)?;

    info!(
        config = %config_path,
        log_level = %cfg.logging.level,
        log_json = cfg.logging.json_enabled(),
        push_policy = ?cfg.engine.push_policy,
        cash_out_factor = cfg.engine.cash_out_factor,
        resolve_cooldown_secs = cfg.engine.resolve_cooldown_secs,
        "PROPBOOK starting up"
    );

    // -- Store & engine --------------------------------------------------

    let store = Store::connect(
        &cfg.database_url(),
        cfg.database.max_connections,
        Duration::from_millis(cfg.database.busy_timeout_ms),
    )
    .await
    .context("Failed to open database")?;

    let engine = Arc::new(Engine::new(store.clone(), cfg.to_engine_config()));

    if cfg.api.enabled {
        api::spawn_api(engine.clone(), cfg.api.port).await?;
    } else {
        info!("API disabled");
    }

    // -- Settlement sweep ------------------------------------------------

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    if cfg.settlement.sweep_interval_secs == 0 {
        info!("Settlement sweep disabled. Press Ctrl+C to stop.");
        shutdown.await.context("Failed to listen for shutdown signal")?;
    } else {
        let mut interval = tokio::time::interval(Duration::from_secs(cfg.settlement.sweep_interval_secs));
        info!(
            interval_secs = cfg.settlement.sweep_interval_secs,
            "Entering settlement loop. Press Ctrl+C to stop."
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match engine.resolve_all_parlays().await {
                        Ok(report) => log_sweep_report(&report),
                        Err(e) => error!(error = %e, "Settlement sweep failed, continuing to next"),
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received.");
                    break;
                }
            }
        }
    }

    store.close().await;
    info!("PROPBOOK shut down cleanly.");
    Ok(())
}

/// Log a sweep summary when it did anything.
fn log_sweep_report(report: &SettlementReport) {
    if report.resolved_count == 0 && report.failures.is_empty() {
        return;
    }
    info!(
        resolved = report.resolved_count,
        won = report.won_count,
        lost = report.lost_count,
        pending = report.pending_count,
        payout = report.total_payout,
        failures = report.failures.len(),
        "Settlement sweep complete"
    );
    for failure in &report.failures {
        error!(
            user_id = %failure.user_id,
            parlay_id = ?failure.parlay_id,
            reason = %failure.reason,
            "Parlay left unresolved"
        );
    }
}

/// Initialise the `tracing` subscriber from the `[logging]` section.
fn init_logging(cfg: &config::LoggingConfig) -> Result<()> {
    use tracing_subscriber::fmt;

    let env_filter = cfg.env_filter()?;

    if cfg.json_enabled() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
    Ok(())
}
