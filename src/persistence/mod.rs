//! Persistence layer modules.

pub mod db;
pub mod listener_repo;
pub mod migrations;
pub mod outbox_repo;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use db::Database;

use chrono::{DateTime, Utc};

use crate::{RelayError, Result};

/// Parse an RFC 3339 timestamp column.
pub(crate) fn parse_ts(field: &str, s: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RelayError::Db(format!("invalid {field}: {e}")))
}

/// Parse an optional RFC 3339 timestamp column.
pub(crate) fn parse_opt_ts(field: &str, s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(|raw| parse_ts(field, raw)).transpose()
}
