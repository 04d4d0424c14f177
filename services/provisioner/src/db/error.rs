use thiserror::Error;

/// Pool and migration errors. Query errors surface as `StoreError`.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("cannot load migrations from {dir}: {source}")]
    MigrationDir {
        dir: String,
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}
