//! Daemon configuration parsing, validation, and credential loading.
//!
//! The configuration object is constructed once in `main` and passed by
//! `Arc` into every component constructor. There is no process-wide
//! mutable configuration singleton.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::{RelayError, Result};

/// Terminal bridge tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct TerminalConfig {
    /// Interval between PTY read polls, in milliseconds. Must stay below
    /// one second for interactivity and above 10 ms to avoid busy-spinning.
    pub poll_interval_ms: u64,
    /// Timeout for a single blocking PTY read, in milliseconds.
    pub read_timeout_ms: u64,
    /// Timeout for a single blocking PTY write, in milliseconds.
    pub write_timeout_ms: u64,
    /// Consecutive transient read failures tolerated before the process
    /// is treated as dead.
    pub read_retry_limit: u32,
    /// Default terminal rows for spawned sessions.
    pub rows: u16,
    /// Default terminal columns for spawned sessions.
    pub cols: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 150,
            read_timeout_ms: 2_000,
            write_timeout_ms: 2_000,
            read_retry_limit: 3,
            rows: 24,
            cols: 80,
        }
    }
}

/// Outbox dispatcher tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct OutboxConfig {
    /// Interval between dispatch loop wakeups when the queue is idle,
    /// in milliseconds.
    pub dispatch_interval_ms: u64,
    /// Seconds after which an unreleased lease is considered expired.
    pub lease_timeout_seconds: u64,
    /// Delivery attempts before an entry is marked failed.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound on the retry backoff delay, in milliseconds.
    pub backoff_cap_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 500,
            lease_timeout_seconds: 60,
            max_attempts: 8,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
        }
    }
}

/// Event intake socket settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct IntakeConfig {
    /// Named pipe / Unix socket identifier.
    pub socket_name: String,
    /// Client-side connect timeout, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            socket_name: "agent-relay".into(),
            connect_timeout_ms: 1_000,
        }
    }
}

/// Staleness sweep tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SweepConfig {
    /// Interval between sweep passes, in seconds.
    pub interval_seconds: u64,
    /// Seconds a session may remain in `closing` before the sweep
    /// force-completes the transition.
    pub closing_timeout_seconds: u64,
    /// Days a delivered outbox entry is retained before purge. Failed
    /// entries and session rows are never purged.
    pub delivered_retention_days: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            closing_timeout_seconds: 30,
            delivered_retention_days: 30,
        }
    }
}

/// Slack adapter settings.
///
/// The bot token is loaded at runtime via OS keychain or environment
/// variable, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SlackAdapterConfig {
    /// Channel used when an outbox entry names no explicit recipient.
    pub default_channel: String,
    /// Bot user token used for posting messages (populated at runtime).
    #[serde(skip)]
    pub bot_token: String,
}

/// Adapter section container; absent adapters are simply not started.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AdapterConfig {
    /// Slack gateway settings (optional).
    pub slack: Option<SlackAdapterConfig>,
}

fn default_computer_name() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
}

/// Daemon configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RelayConfig {
    /// Directory holding the database and transcript files.
    pub state_dir: PathBuf,
    /// Interactive agent binary launched inside each session PTY.
    pub agent_cli: String,
    /// Default arguments for the agent binary.
    #[serde(default)]
    pub agent_cli_args: Vec<String>,
    /// Host identity recorded on sessions created by this daemon.
    #[serde(default = "default_computer_name")]
    pub computer_name: String,
    /// Terminal bridge tuning.
    #[serde(default)]
    pub terminal: TerminalConfig,
    /// Outbox dispatcher tuning.
    #[serde(default)]
    pub outbox: OutboxConfig,
    /// Event intake socket settings.
    #[serde(default)]
    pub intake: IntakeConfig,
    /// Staleness sweep tuning.
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Delivery adapter settings.
    #[serde(default)]
    pub adapters: AdapterConfig,
}

impl RelayConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| RelayError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load adapter credentials from OS keychain with env-var fallback.
    ///
    /// Tries the `agent-relay` keyring service first, then falls back to
    /// the `SLACK_BOT_TOKEN` environment variable. A no-op when the Slack
    /// adapter is not configured.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Config` if the adapter is configured but
    /// neither keychain nor env var provides a token.
    pub async fn load_credentials(&mut self) -> Result<()> {
        if let Some(ref mut slack) = self.adapters.slack {
            slack.bot_token = load_credential("slack_bot_token", "SLACK_BOT_TOKEN").await?;
        }
        Ok(())
    }

    /// Path of the `SQLite` database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("relay.db")
    }

    /// Directory holding per-session transcript files.
    #[must_use]
    pub fn transcripts_dir(&self) -> PathBuf {
        self.state_dir.join("transcripts")
    }

    fn validate(&self) -> Result<()> {
        if self.agent_cli.trim().is_empty() {
            return Err(RelayError::Config("agent_cli must not be empty".into()));
        }

        if !(10..1_000).contains(&self.terminal.poll_interval_ms) {
            return Err(RelayError::Config(
                "terminal.poll_interval_ms must be in [10, 1000)".into(),
            ));
        }

        if self.outbox.max_attempts == 0 {
            return Err(RelayError::Config(
                "outbox.max_attempts must be greater than zero".into(),
            ));
        }

        if self.outbox.backoff_base_ms == 0 {
            return Err(RelayError::Config(
                "outbox.backoff_base_ms must be greater than zero".into(),
            ));
        }

        if self.outbox.backoff_cap_ms < self.outbox.backoff_base_ms {
            return Err(RelayError::Config(
                "outbox.backoff_cap_ms must be >= outbox.backoff_base_ms".into(),
            ));
        }

        if self.outbox.lease_timeout_seconds == 0 {
            return Err(RelayError::Config(
                "outbox.lease_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.intake.socket_name.trim().is_empty() {
            return Err(RelayError::Config(
                "intake.socket_name must not be empty".into(),
            ));
        }

        if self.sweep.closing_timeout_seconds == 0 {
            return Err(RelayError::Config(
                "sweep.closing_timeout_seconds must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // Keyring is synchronous I/O; keep it off the async scheduler.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new("agent-relay", &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| RelayError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        RelayError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
