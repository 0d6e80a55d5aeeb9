//! Versioned schema migration runner.
//!
//! Schema evolution is additive only: tables and columns are added, never
//! rewritten in place. Each step records its version in `schema_version`
//! once applied, and every step is safe to re-run because a crash can land
//! between apply and record.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::Result;

/// What a migration step executes when applied.
enum StepAction {
    /// Idempotent DDL batch (`CREATE ... IF NOT EXISTS` only).
    Ddl(&'static str),
    /// Add columns to an existing table, skipping ones already present.
    AddColumns {
        table: &'static str,
        columns: &'static [(&'static str, &'static str)],
    },
}

/// One ordered step in the schema history.
pub struct MigrationStep {
    /// Monotonically increasing schema version this step produces.
    pub version: i64,
    /// Short human-readable step name, recorded alongside the version.
    pub name: &'static str,
    action: StepAction,
}

/// Ordered schema history; append new steps, never edit existing ones.
pub const STEPS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        name: "create_session_table",
        action: StepAction::Ddl(
            r"
CREATE TABLE IF NOT EXISTS session (
    session_id        TEXT PRIMARY KEY NOT NULL,
    computer_name     TEXT NOT NULL,
    status            TEXT NOT NULL CHECK(status IN ('active','closing','closed')),
    created_at        TEXT NOT NULL,
    last_activity     TEXT NOT NULL,
    closed_at         TEXT,
    native_process_id INTEGER,
    pty_device        TEXT,
    transcript_files  TEXT NOT NULL DEFAULT '[]',
    char_offset       INTEGER NOT NULL DEFAULT 0,
    working_slug      TEXT NOT NULL,
    visibility        TEXT NOT NULL CHECK(visibility IN ('private','shared')),
    user_role         TEXT NOT NULL
);
",
        ),
    },
    MigrationStep {
        version: 2,
        name: "create_outbox_table",
        action: StepAction::Ddl(
            r"
CREATE TABLE IF NOT EXISTS outbox (
    id              TEXT PRIMARY KEY NOT NULL,
    channel         TEXT NOT NULL,
    recipient       TEXT NOT NULL,
    message_id      TEXT NOT NULL,
    body            TEXT NOT NULL,
    attachment      TEXT,
    status          TEXT NOT NULL CHECK(status IN ('pending','delivered','failed')),
    attempt_count   INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT NOT NULL,
    locked_at       TEXT,
    last_error      TEXT,
    created_at      TEXT NOT NULL,
    delivered_at    TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_message ON outbox(message_id);
CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status);
CREATE INDEX IF NOT EXISTS idx_outbox_next_attempt ON outbox(next_attempt_at);
",
        ),
    },
    MigrationStep {
        version: 3,
        name: "create_listener_table",
        action: StepAction::Ddl(
            r"
CREATE TABLE IF NOT EXISTS listener (
    target_session_id TEXT NOT NULL,
    caller_session_id TEXT NOT NULL,
    transport_ref     TEXT NOT NULL,
    registered_at     TEXT NOT NULL,
    PRIMARY KEY (target_session_id, caller_session_id)
);

CREATE INDEX IF NOT EXISTS idx_listener_caller ON listener(caller_session_id);
",
        ),
    },
    MigrationStep {
        version: 4,
        name: "add_session_relay_timestamps",
        action: StepAction::AddColumns {
            table: "session",
            columns: &[
                ("last_tool_use_at", "TEXT"),
                ("last_checkpoint_at", "TEXT"),
                ("last_output_at", "TEXT"),
            ],
        },
    },
];

impl MigrationStep {
    /// Whether this step has already been applied and recorded.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the version lookup fails.
    pub async fn check(&self, pool: &SqlitePool) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM schema_version WHERE version = ?1")
                .bind(self.version)
                .fetch_one(pool)
                .await?;
        Ok(count > 0)
    }

    /// Apply this step. Safe to re-run on a partially applied schema.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if a DDL statement fails.
    pub async fn apply(&self, pool: &SqlitePool) -> Result<()> {
        match self.action {
            StepAction::Ddl(ddl) => {
                sqlx::raw_sql(ddl).execute(pool).await?;
            }
            StepAction::AddColumns { table, columns } => {
                for (column, decl) in columns {
                    if column_exists(pool, table, column).await? {
                        continue;
                    }
                    let ddl = format!("ALTER TABLE {table} ADD COLUMN {column} {decl}");
                    sqlx::raw_sql(&ddl).execute(pool).await?;
                }
            }
        }
        Ok(())
    }
}

/// Run all pending migration steps in order.
///
/// # Errors
///
/// Returns `RelayError::Db` if any step fails; already-applied steps are
/// skipped, so a failed run can simply be retried.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        r"
CREATE TABLE IF NOT EXISTS schema_version (
    version    INTEGER PRIMARY KEY NOT NULL,
    name       TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
",
    )
    .execute(pool)
    .await?;

    for step in STEPS {
        if step.check(pool).await? {
            debug!(version = step.version, name = step.name, "migration already applied");
            continue;
        }

        step.apply(pool).await?;

        sqlx::query("INSERT INTO schema_version (version, name, applied_at) VALUES (?1, ?2, ?3)")
            .bind(step.version)
            .bind(step.name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(pool)
            .await?;

        info!(version = step.version, name = step.name, "applied migration");
    }

    Ok(())
}

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}
