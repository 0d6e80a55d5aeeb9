//! Hook event payloads flowing through the intake socket.

use serde::{Deserialize, Serialize};

/// An event reported by an agent-side hook.
///
/// The wire shape is a tagged union: one `origin` discriminant plus a
/// payload per origin, matched exhaustively at the intake boundary
/// instead of probed by optional keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum HookEvent {
    /// The agent invoked a tool.
    ToolUse {
        /// Session the tool ran in.
        session_id: String,
        /// Tool name as reported by the agent runtime.
        tool_name: String,
    },
    /// The agent recorded a durable checkpoint.
    Checkpoint {
        /// Session the checkpoint belongs to.
        session_id: String,
        /// Optional human-readable checkpoint label.
        label: Option<String>,
    },
    /// The agent produced terminal output worth relaying.
    Output {
        /// Session that produced the output.
        session_id: String,
        /// Optional short preview of the output.
        preview: Option<String>,
    },
    /// Free-form status notice fanned out to subscribers.
    Notice {
        /// Session the notice concerns.
        session_id: String,
        /// Notice text.
        message: String,
    },
}

impl HookEvent {
    /// Session this event concerns.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::ToolUse { session_id, .. }
            | Self::Checkpoint { session_id, .. }
            | Self::Output { session_id, .. }
            | Self::Notice { session_id, .. } => session_id,
        }
    }

    /// Discriminant name as it appears on the wire.
    #[must_use]
    pub fn origin(&self) -> &'static str {
        match self {
            Self::ToolUse { .. } => "tool_use",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Output { .. } => "output",
            Self::Notice { .. } => "notice",
        }
    }
}
