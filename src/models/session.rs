//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status for an agent session.
///
/// Transitions move forward only: `active -> closing -> closed`. There is
/// no edge back out of `closing` or `closed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session owns a live agent process.
    Active,
    /// Session is draining pending output and notifications before archive.
    Closing,
    /// Session is immutable history; no further process attachment.
    Closed,
}

impl SessionStatus {
    /// Whether this status admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Who may observe a session through the chat surfaces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to the creating user only.
    Private,
    /// Visible to every member of the delivery channel.
    Shared,
}

/// Session domain entity persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier; immutable after creation.
    pub session_id: String,
    /// Host that owns the agent process.
    pub computer_name: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp (any mutation refreshes it).
    pub last_activity: DateTime<Utc>,
    /// Set once when the session reaches `closed`.
    pub closed_at: Option<DateTime<Utc>>,
    /// OS process id of the agent while one is attached.
    pub native_process_id: Option<u32>,
    /// Terminal device path of the attached pseudo-terminal.
    pub pty_device: Option<String>,
    /// Ordered log-file references forming one logical transcript chain.
    pub transcript_files: Vec<String>,
    /// Monotonic cursor into the logical transcript stream.
    pub char_offset: i64,
    /// Isolated workspace checkout associated with the agent process.
    pub working_slug: String,
    /// Observation scope for chat surfaces.
    pub visibility: Visibility,
    /// Role of the user the session acts for.
    pub user_role: String,
    /// Most recent tool-use event reported by the agent.
    pub last_tool_use_at: Option<DateTime<Utc>>,
    /// Most recent checkpoint event reported by the agent.
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    /// Most recent terminal output observed by the bridge.
    pub last_output_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Construct a new active session with a generated identifier.
    #[must_use]
    pub fn new(
        computer_name: String,
        working_slug: String,
        visibility: Visibility,
        user_role: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            computer_name,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
            closed_at: None,
            native_process_id: None,
            pty_device: None,
            transcript_files: Vec::new(),
            char_offset: 0,
            working_slug,
            visibility,
            user_role,
            last_tool_use_at: None,
            last_checkpoint_at: None,
            last_output_at: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (SessionStatus::Active, SessionStatus::Closing)
                | (SessionStatus::Closing, SessionStatus::Closed)
        )
    }
}
