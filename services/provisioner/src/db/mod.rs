//! Postgres persistence.
//!
//! [`Database`] owns the pool and applies migrations; [`PgStore`] implements
//! the engine's store traits on top of it. Every `PgStore` mutation is one
//! conditional `UPDATE` scoped to a single row, so no statement sequence
//! needs a surrounding transaction.

mod allocations;
mod catalog;
mod entitlements;
mod error;

pub use error::DbError;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::store::StoreError;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// Directory holding the `NNNN_*.sql` migrations.
    pub migrations_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/berth".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            migrations_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        }
    }
}

impl DbConfig {
    /// Reads `DATABASE_URL`, `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS` and
    /// `BERTH_MIGRATIONS_DIR`, keeping defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(n) = parsed_env("DB_MAX_CONNECTIONS") {
            config.max_connections = n;
        }
        if let Some(n) = parsed_env("DB_MIN_CONNECTIONS") {
            config.min_connections = n;
        }
        if let Ok(dir) = std::env::var("BERTH_MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(dir);
        }
        config
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections.min(self.max_connections))
            .acquire_timeout(self.acquire_timeout)
    }
}

fn parsed_env(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    migrations_dir: PathBuf,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = config
            .pool_options()
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self {
            pool,
            migrations_dir: config.migrations_dir.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let migrator = Migrator::new(self.migrations_dir.clone())
            .await
            .map_err(|source| DbError::MigrationDir {
                dir: self.migrations_dir.display().to_string(),
                source,
            })?;

        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        info!(dir = %self.migrations_dir.display(), "Database migrations applied");
        Ok(())
    }

    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

/// Postgres-backed catalog, entitlement and allocation store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Parses a stored prefixed id, naming the column on failure.
fn parse_id<T>(column: &str, raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = berth_id::IdError>,
{
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{column} '{raw}': {e}")))
}
