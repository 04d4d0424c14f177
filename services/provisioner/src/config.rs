use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::db::DbConfig;
use crate::spec_builder::SpecPolicy;

/// Which backend holds entitlements and allocation bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Engine settings independent of transport and storage.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on one creation service call.
    pub creation_timeout: Duration,
    pub policy: SpecPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            creation_timeout: Duration::from_secs(30),
            policy: SpecPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub store: StoreBackend,
    pub creation_url: String,
    pub creation_token: Option<String>,
    pub engine: EngineConfig,
    pub database: DbConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("BERTH_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("BERTH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("BERTH_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let store = match std::env::var("BERTH_STORE")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => bail!("unknown BERTH_STORE '{other}' (expected postgres or memory)"),
        };

        let creation_url = std::env::var("BERTH_CREATION_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8081/api/application".to_string());
        let creation_token = std::env::var("BERTH_CREATION_TOKEN").ok();

        let defaults = SpecPolicy::default();
        let engine = EngineConfig {
            creation_timeout: Duration::from_secs(env_or("BERTH_CREATION_TIMEOUT_SECS", 30)),
            policy: SpecPolicy {
                io_weight: env_or("BERTH_IO_WEIGHT", defaults.io_weight),
                trial_days: env_or("BERTH_TRIAL_DAYS", defaults.trial_days),
                standard_days: env_or("BERTH_STANDARD_DAYS", defaults.standard_days),
            },
        };

        if engine.creation_timeout.is_zero() {
            bail!("BERTH_CREATION_TIMEOUT_SECS must be greater than zero");
        }

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            store,
            creation_url,
            creation_token,
            engine,
            database: DbConfig::from_env(),
        })
    }
}
