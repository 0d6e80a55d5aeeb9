//! Wire protocol for the intake socket.
//!
//! Line-delimited JSON with a JSON-RPC shape: requests carry an `id`,
//! notifications do not, responses echo the request `id` with either a
//! `result` value or an `{code, message}` error object.
//!
//! The handshake is `initialize` (response echoes the protocol version
//! and capabilities) followed by the `initialized` notification; events
//! then travel as `event/forward` requests whose params are the tagged
//! event union (`origin` discriminant) or the bare notice shorthand.

use serde::{Deserialize, Serialize};

use crate::models::HookEvent;
use crate::{RelayError, Result};

/// Version echoed by the `initialize` response.
pub const PROTOCOL_VERSION: &str = "1";

/// Handshake request method.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Handshake-complete notification method.
pub const METHOD_INITIALIZED: &str = "initialized";
/// Event forwarding request method.
pub const METHOD_EVENT_FORWARD: &str = "event/forward";

/// Error codes carried by [`IntakeErrorObject`].
pub mod error_code {
    /// Request line was not valid JSON.
    pub const PARSE: i32 = -32700;
    /// Method is not part of the protocol.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Params missing or of the wrong shape.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Handler failed for an unclassified reason.
    pub const INTERNAL: i32 = -32000;
    /// Event referenced a session the store does not know.
    pub const SESSION_NOT_FOUND: i32 = -32001;
}

/// One inbound protocol message. `id: None` marks a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeRequest {
    /// Correlation id; absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Method name.
    pub method: String,
    /// Method-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl IntakeRequest {
    /// Build the `initialize` handshake request.
    #[must_use]
    pub fn initialize(id: u64) -> Self {
        Self {
            id: Some(id),
            method: METHOD_INITIALIZE.to_owned(),
            params: Some(serde_json::json!({ "protocol_version": PROTOCOL_VERSION })),
        }
    }

    /// Build the `initialized` notification.
    #[must_use]
    pub fn initialized() -> Self {
        Self {
            id: None,
            method: METHOD_INITIALIZED.to_owned(),
            params: None,
        }
    }

    /// Build an `event/forward` request carrying the tagged event.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Intake` if the event cannot be serialized.
    pub fn forward(id: u64, event: &HookEvent) -> Result<Self> {
        let params = serde_json::to_value(event)
            .map_err(|err| RelayError::Intake(format!("unserializable event: {err}")))?;
        Ok(Self {
            id: Some(id),
            method: METHOD_EVENT_FORWARD.to_owned(),
            params: Some(params),
        })
    }
}

/// One outbound protocol message, answering a request by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeResponse {
    /// Correlation id of the request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error object on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IntakeErrorObject>,
}

impl IntakeResponse {
    /// Successful response with a result payload.
    #[must_use]
    pub fn success(id: Option<u64>, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response with an error object.
    #[must_use]
    pub fn failure(id: Option<u64>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(IntakeErrorObject {
                code,
                message: message.into(),
            }),
        }
    }
}

/// `{code, message}` error object carried by failed responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeErrorObject {
    /// One of the [`error_code`] constants.
    pub code: i32,
    /// Human-readable failure description.
    pub message: String,
}

/// Params accepted by `event/forward`.
///
/// Either the full tagged event union or the `{session_id, message}`
/// shorthand for a notice; both deserialize into typed shapes, so the
/// handler matches exhaustively instead of probing optional keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForwardParams {
    /// Fully tagged event (`origin` discriminant plus payload).
    Event(HookEvent),
    /// Bare notice shorthand.
    Notice {
        /// Session the notice belongs to.
        session_id: String,
        /// Notice text.
        message: String,
    },
}

impl ForwardParams {
    /// Normalize the wire shape into the event union.
    #[must_use]
    pub fn into_event(self) -> HookEvent {
        match self {
            Self::Event(event) => event,
            Self::Notice {
                session_id,
                message,
            } => HookEvent::Notice {
                session_id,
                message,
            },
        }
    }
}
