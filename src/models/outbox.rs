//! Outbox entry model for durable outbound notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status for an outbox entry.
///
/// `Delivered` and `Failed` are terminal: once reached, the entry is never
/// mutated again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Awaiting delivery (possibly between retry attempts).
    Pending,
    /// Confirmed delivered by the adapter.
    Delivered,
    /// Retries exhausted or failure classified permanent.
    Failed,
}

impl OutboxStatus {
    /// Whether this status admits no further mutation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// Opaque notification content handed to the delivery adapter.
///
/// Delivery is at-least-once; adapters and consumers treat `message_id`
/// as the dedup key that makes the observed effect exactly-once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationPayload {
    /// Dedup key, stable across redelivery of the same entry.
    pub message_id: String,
    /// Message body text.
    pub body: String,
    /// Optional attachment reference (file path or upload handle).
    pub attachment: Option<String>,
}

impl NotificationPayload {
    /// Construct a payload with a generated dedup key.
    #[must_use]
    pub fn new(body: String) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            body,
            attachment: None,
        }
    }
}

/// A unit of outbound notification owned by the dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Unique record identifier (UUID v4 prefixed `out:`).
    pub id: String,
    /// Delivery adapter identity (e.g. `slack`).
    pub channel: String,
    /// Recipient address within the adapter's namespace.
    pub recipient: String,
    /// Notification content.
    pub payload: NotificationPayload,
    /// Current delivery status.
    pub status: OutboxStatus,
    /// Delivery attempts made so far; increments once per attempt,
    /// never on a lease that failed to acquire.
    pub attempt_count: u32,
    /// Earliest time the next delivery attempt may run.
    pub next_attempt_at: DateTime<Utc>,
    /// Lease marker; a non-expired lock hides the entry from pickup.
    pub locked_at: Option<DateTime<Utc>>,
    /// Most recent delivery failure, for operator diagnostics.
    pub last_error: Option<String>,
    /// Creation timestamp; per-recipient attempt order follows it.
    pub created_at: DateTime<Utc>,
    /// Set once when the entry reaches `delivered`.
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Construct a pending entry eligible for immediate dispatch.
    #[must_use]
    pub fn new(channel: String, recipient: String, payload: NotificationPayload) -> Self {
        let now = Utc::now();
        Self {
            id: format!("out:{}", Uuid::new_v4()),
            channel,
            recipient,
            payload,
            status: OutboxStatus::Pending,
            attempt_count: 0,
            next_attempt_at: now,
            locked_at: None,
            last_error: None,
            created_at: now,
            delivered_at: None,
        }
    }
}
