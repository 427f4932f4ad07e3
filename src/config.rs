//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! The database URL may be overridden by an environment variable named in
//! the config, resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use tracing_subscriber::EnvFilter;

use crate::engine::EngineConfig;
use crate::types::PushPolicy;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineSection,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSection {
    pub push_policy: PushPolicy,
    pub cash_out_factor: f64,
    pub min_cash_out_fraction: f64,
    pub resolve_cooldown_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            push_policy: PushPolicy::Loss,
            cash_out_factor: 0.85,
            min_cash_out_fraction: 0.10,
            resolve_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    /// Env var that, when set, replaces `url`.
    #[serde(default)]
    pub url_env: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SettlementConfig {
    /// Seconds between all-user settlement sweeps. 0 disables the sweep.
    pub sweep_interval_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self { sweep_interval_secs: 60 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives. `RUST_LOG` wins when set.
    pub level: String,
    /// Emit one JSON object per event. `PROPBOOK_LOG_JSON` also turns this on.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "propbook=info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// The filter to install: `RUST_LOG` if it parses, else `level`.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).with_context(|| format!("Invalid logging.level: {}", self.level))
    }

    pub fn json_enabled(&self) -> bool {
        self.json || std::env::var_os("PROPBOOK_LOG_JSON").is_some()
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        anyhow::ensure!(
            engine.cash_out_factor > 0.0 && engine.cash_out_factor <= 1.0,
            "engine.cash_out_factor must be in (0, 1], got {}",
            engine.cash_out_factor
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&engine.min_cash_out_fraction),
            "engine.min_cash_out_fraction must be in [0, 1], got {}",
            engine.min_cash_out_fraction
        );
        anyhow::ensure!(self.database.max_connections > 0, "database.max_connections must be positive");
        EnvFilter::try_new(&self.logging.level)
            .with_context(|| format!("logging.level is not a valid filter: {}", self.logging.level))?;
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// The database URL, preferring `url_env` when that variable is set.
    pub fn database_url(&self) -> String {
        self.database
            .url_env
            .as_deref()
            .and_then(|env| Self::resolve_env(env).ok())
            .unwrap_or_else(|| self.database.url.clone())
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            push_policy: self.engine.push_policy,
            cash_out_factor: self.engine.cash_out_factor,
            min_cash_out_fraction: self.engine.min_cash_out_fraction,
            resolve_cooldown: chrono::Duration::try_seconds(
                i64::try_from(self.engine.resolve_cooldown_secs).unwrap_or(i64::MAX),
            )
            .unwrap_or(chrono::Duration::MAX),
        }
    }
}
