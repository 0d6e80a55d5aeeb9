//! `SQLite` connection setup and startup migration.

use std::fs;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::{RelayConfig, RelayError, Result};

use super::migrations;

/// Alias for the shared `SQLite` pool.
pub type Database = sqlx::SqlitePool;

/// Connect to the on-disk database and bring the schema up to date.
///
/// Creates the state directory and database file on first run.
///
/// # Errors
///
/// Returns `RelayError::Db` if the connection or a migration fails.
pub async fn connect(config: &RelayConfig) -> Result<Database> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| RelayError::Db(format!("failed to create db dir: {err}")))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrations::run(&pool).await?;
    Ok(pool)
}

/// Connect to a process-private in-memory database (tests).
///
/// The pool is pinned to a single long-lived connection so the in-memory
/// database survives for the lifetime of the pool.
///
/// # Errors
///
/// Returns `RelayError::Db` if the connection or a migration fails.
pub async fn connect_memory() -> Result<Database> {
    let options = SqliteConnectOptions::new().in_memory(true);

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    migrations::run(&pool).await?;
    Ok(pool)
}
