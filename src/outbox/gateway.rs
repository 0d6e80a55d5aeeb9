//! Adapter gateway abstraction for outbound surfaces.
//!
//! The dispatch loop only ever talks to this trait; concrete adapters
//! (Slack today) classify their failures so the loop can decide between
//! retry and terminal failure without knowing the surface.

use async_trait::async_trait;

use crate::models::OutboxEntry;
use crate::{RelayError, Result};

/// Outbound surface used by the dispatch loop and session lifecycle.
///
/// `deliver` must be idempotent with respect to `payload.message_id`:
/// the loop guarantees at-least-once invocation, so a crash between a
/// successful send and the delivered mark replays the entry.
#[async_trait]
pub trait AdapterGateway: Send + Sync {
    /// Deliver one outbox entry to its recipient.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::TransientDelivery` for failures worth
    /// retrying (rate limits, network) and
    /// `RelayError::PermanentDelivery` for failures that will never
    /// succeed (bad recipient, revoked credentials). Anything else is
    /// treated as transient by the caller.
    async fn deliver(&self, entry: &OutboxEntry) -> Result<()>;

    /// Create a conversation channel for a session, returning its id.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Adapter` if the surface rejects the request.
    async fn create_channel(&self, name: &str) -> Result<String>;

    /// Post a plain message outside the durable outbox path.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Adapter` if the surface rejects the request.
    async fn send_message(&self, channel: &str, text: &str) -> Result<()>;

    /// Update a channel's title to reflect session state.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Adapter` if the surface rejects the request.
    async fn update_title(&self, channel: &str, title: &str) -> Result<()>;

    /// Archive a channel once its session is closed.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Adapter` if the surface rejects the request.
    async fn delete_channel(&self, channel: &str) -> Result<()>;
}

/// Gateway used when no delivery adapter is configured.
///
/// Every operation fails with `RelayError::Adapter`. The dispatch loop is
/// not started in this mode, so enqueued entries stay pending until an
/// adapter is configured and the daemon restarts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGateway;

#[async_trait]
impl AdapterGateway for NullGateway {
    async fn deliver(&self, _entry: &OutboxEntry) -> Result<()> {
        Err(RelayError::Adapter("no delivery adapter configured".into()))
    }

    async fn create_channel(&self, _name: &str) -> Result<String> {
        Err(RelayError::Adapter("no delivery adapter configured".into()))
    }

    async fn send_message(&self, _channel: &str, _text: &str) -> Result<()> {
        Err(RelayError::Adapter("no delivery adapter configured".into()))
    }

    async fn update_title(&self, _channel: &str, _title: &str) -> Result<()> {
        Err(RelayError::Adapter("no delivery adapter configured".into()))
    }

    async fn delete_channel(&self, _channel: &str) -> Result<()> {
        Err(RelayError::Adapter("no delivery adapter configured".into()))
    }
}
