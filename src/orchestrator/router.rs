//! Inbound event routing.
//!
//! One handler behind the intake socket: validates the session, stamps
//! the bookkeeping timestamp for the event's origin, fans the event out
//! to listeners, and enqueues a durable notification when the event
//! carries one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::intake::EventSink;
use crate::listener::ListenerRegistry;
use crate::models::{HookEvent, NotificationPayload, OutboxEntry};
use crate::persistence::outbox_repo::OutboxRepo;
use crate::persistence::session_repo::{SessionPatch, SessionRepo};
use crate::{RelayConfig, RelayError, Result};

/// Routes validated intake events into the store, listeners, and outbox.
#[derive(Clone)]
pub struct EventRouter {
    config: Arc<RelayConfig>,
    sessions: SessionRepo,
    outbox: OutboxRepo,
    registry: ListenerRegistry,
}

impl EventRouter {
    /// Build a router over its collaborators.
    #[must_use]
    pub fn new(
        config: Arc<RelayConfig>,
        sessions: SessionRepo,
        outbox: OutboxRepo,
        registry: ListenerRegistry,
    ) -> Self {
        Self {
            config,
            sessions,
            outbox,
            registry,
        }
    }
}

#[async_trait]
impl EventSink for EventRouter {
    async fn handle_event(&self, event: HookEvent) -> Result<serde_json::Value> {
        let session_id = event.session_id().to_owned();

        let patch = patch_for(&event);
        match self.sessions.update_fields(&session_id, &patch).await {
            Ok(_) => {}
            Err(RelayError::SessionClosed(_)) => {
                // Hooks race session close legitimately; drop the straggler.
                debug!(session_id, origin = event.origin(), "event for closed session dropped");
                return Ok(serde_json::json!({
                    "applied": false,
                    "reason": "session closed",
                }));
            }
            Err(err) => return Err(err),
        }

        let attempts = self.registry.publish(&session_id, &event).await?;
        let delivered = attempts.iter().filter(|a| a.delivered()).count();
        debug!(
            session_id,
            origin = event.origin(),
            listeners = attempts.len(),
            delivered,
            "event routed"
        );

        if let HookEvent::Notice { message, .. } = &event {
            enqueue_channel_notice(&self.outbox, &self.config, &session_id, message).await;
        }

        Ok(serde_json::json!({
            "applied": true,
            "origin": event.origin(),
            "listeners": attempts.len(),
        }))
    }
}

/// Bookkeeping timestamps implied by each event origin.
fn patch_for(event: &HookEvent) -> SessionPatch {
    let now = Utc::now();
    match event {
        HookEvent::ToolUse { .. } => SessionPatch {
            last_tool_use_at: Some(now),
            ..SessionPatch::default()
        },
        HookEvent::Checkpoint { .. } => SessionPatch {
            last_checkpoint_at: Some(now),
            ..SessionPatch::default()
        },
        HookEvent::Output { .. } => SessionPatch {
            last_output_at: Some(now),
            ..SessionPatch::default()
        },
        // Notices only bump last_activity, which every patch does.
        HookEvent::Notice { .. } => SessionPatch::default(),
    }
}

/// Enqueue a durable notice for the configured adapter channel. Without
/// a configured adapter this is a logged no-op, never an error.
pub(crate) async fn enqueue_channel_notice(
    outbox: &OutboxRepo,
    config: &RelayConfig,
    session_id: &str,
    body: &str,
) {
    let Some(slack) = config.adapters.slack.as_ref() else {
        debug!(session_id, "no adapter configured, notice not enqueued");
        return;
    };

    let entry = OutboxEntry::new(
        "slack".to_owned(),
        slack.default_channel.clone(),
        NotificationPayload::new(body.to_owned()),
    );
    match outbox.enqueue(&entry).await {
        Ok(stored) => debug!(session_id, entry_id = %stored.id, "notice enqueued"),
        Err(err) => warn!(session_id, %err, "failed to enqueue notice"),
    }
}
