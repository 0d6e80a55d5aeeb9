//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum RelayError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// The store reported corruption; the affected subsystem must halt
    /// rather than risk silent data loss.
    StorageCorruption(String),
    /// Rejected session lifecycle transition.
    IllegalTransition {
        /// Status the session currently holds.
        from: String,
        /// Status the caller asked for.
        to: String,
    },
    /// Requested session does not exist.
    SessionNotFound(String),
    /// Write refused because the session lifecycle no longer permits it.
    SessionClosed(String),
    /// Agent process failed to start; fatal for that session.
    ProcessSpawn(String),
    /// Pseudo-terminal I/O failure or timeout, recoverable at the bridge.
    Terminal(String),
    /// Delivery failed but may succeed on a later attempt.
    TransientDelivery(String),
    /// Delivery failed permanently; the entry must not be retried.
    PermanentDelivery(String),
    /// Another worker holds an unexpired lease on the outbox entry.
    LeaseConflict,
    /// Event intake communication failure (best-effort boundary).
    Intake(String),
    /// Chat adapter or channel-management failure.
    Adapter(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for RelayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::StorageCorruption(msg) => write!(f, "storage corruption: {msg}"),
            Self::IllegalTransition { from, to } => {
                write!(f, "illegal transition: {from} -> {to}")
            }
            Self::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            Self::SessionClosed(msg) => write!(f, "session closed: {msg}"),
            Self::ProcessSpawn(msg) => write!(f, "process spawn: {msg}"),
            Self::Terminal(msg) => write!(f, "terminal: {msg}"),
            Self::TransientDelivery(msg) => write!(f, "transient delivery failure: {msg}"),
            Self::PermanentDelivery(msg) => write!(f, "permanent delivery failure: {msg}"),
            Self::LeaseConflict => write!(f, "lease conflict"),
            Self::Intake(msg) => write!(f, "intake: {msg}"),
            Self::Adapter(msg) => write!(f, "adapter: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        // SQLITE_CORRUPT (11) and SQLITE_NOTADB (26), plus their extended
        // forms, must halt the owning subsystem instead of being retried.
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err.code();
            if matches!(code.as_deref(), Some("11" | "26" | "267" | "539")) {
                return Self::StorageCorruption(db_err.to_string());
            }
        }
        Self::Db(err.to_string())
    }
}
