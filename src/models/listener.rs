//! Listener subscription model for cross-session event interest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A durable interest registration letting one session receive events
/// published by another.
///
/// Keyed by the `(target_session_id, caller_session_id)` pair; registering
/// an existing pair is a no-op. Subscriptions are persisted so a daemon
/// restart does not erase an active interest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenerSubscription {
    /// Session whose events the caller wants to observe.
    pub target_session_id: String,
    /// Session that registered the interest.
    pub caller_session_id: String,
    /// How to reach the caller (transport-specific address).
    pub transport_ref: String,
    /// Registration timestamp.
    pub registered_at: DateTime<Utc>,
}

impl ListenerSubscription {
    /// Construct a new subscription registered now.
    #[must_use]
    pub fn new(target_session_id: String, caller_session_id: String, transport_ref: String) -> Self {
        Self {
            target_session_id,
            caller_session_id,
            transport_ref,
            registered_at: Utc::now(),
        }
    }
}
