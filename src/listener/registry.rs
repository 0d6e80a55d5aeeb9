//! Persistent subscription index with best-effort fan-out.
//!
//! Subscriptions live in the store, never in memory, so a daemon restart
//! cannot erase a registered interest. Fan-out is best-effort per
//! subscriber: a failed send is reported in the returned attempts and
//! logged, but never unregisters the subscription — one bad delivery must
//! not cost a live subscriber its future events.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::models::{HookEvent, ListenerSubscription};
use crate::persistence::listener_repo::ListenerRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::Result;

/// Transport used to reach a subscriber session.
#[async_trait]
pub trait ListenerTransport: Send + Sync {
    /// Send one event to the subscriber behind `transport_ref`.
    ///
    /// # Errors
    ///
    /// Returns any `RelayError` when the subscriber cannot be reached;
    /// the registry absorbs the failure and keeps the subscription.
    async fn send_event(&self, transport_ref: &str, event: &HookEvent) -> Result<()>;
}

/// Outcome of one fan-out send to one subscriber.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    /// Subscriber the event was sent to.
    pub caller_session_id: String,
    /// Transport reference used for the send.
    pub transport_ref: String,
    /// Failure message when the send did not succeed.
    pub error: Option<String>,
}

impl DeliveryAttempt {
    /// Whether the send succeeded.
    #[must_use]
    pub fn delivered(&self) -> bool {
        self.error.is_none()
    }
}

/// Registry mapping target sessions to their subscribers.
#[derive(Clone)]
pub struct ListenerRegistry {
    sessions: SessionRepo,
    listeners: ListenerRepo,
    transport: Arc<dyn ListenerTransport>,
}

impl ListenerRegistry {
    /// Create a registry over the given stores and transport.
    #[must_use]
    pub fn new(
        sessions: SessionRepo,
        listeners: ListenerRepo,
        transport: Arc<dyn ListenerTransport>,
    ) -> Self {
        Self {
            sessions,
            listeners,
            transport,
        }
    }

    /// Register interest of `caller_session_id` in events of
    /// `target_session_id`. Idempotent for an existing pair.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::SessionNotFound` if the target session does
    /// not exist and `RelayError::Db` if the store fails.
    pub async fn subscribe(
        &self,
        target_session_id: &str,
        caller_session_id: &str,
        transport_ref: &str,
    ) -> Result<()> {
        self.sessions.get(target_session_id).await?;

        let subscription = ListenerSubscription::new(
            target_session_id.to_owned(),
            caller_session_id.to_owned(),
            transport_ref.to_owned(),
        );
        self.listeners.subscribe(&subscription).await?;
        info!(
            target = target_session_id,
            caller = caller_session_id,
            "listener registered"
        );
        Ok(())
    }

    /// Remove one subscription pair. Removing an absent pair is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the store fails.
    pub async fn unsubscribe(
        &self,
        target_session_id: &str,
        caller_session_id: &str,
    ) -> Result<()> {
        self.listeners
            .unsubscribe(target_session_id, caller_session_id)
            .await
    }

    /// Drop every subscription held by a caller, returning how many were
    /// removed. Invoked when the caller session closes.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the store fails.
    pub async fn unsubscribe_all(&self, caller_session_id: &str) -> Result<u64> {
        let removed = self.listeners.unsubscribe_all(caller_session_id).await?;
        if removed > 0 {
            debug!(caller = caller_session_id, removed, "listener interests dropped");
        }
        Ok(removed)
    }

    /// Fan an event out to every current subscriber of the target.
    ///
    /// Each subscriber gets one best-effort send; failures are captured
    /// in the returned attempts and logged, never acted on further.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the subscriber set cannot be read.
    pub async fn publish(
        &self,
        target_session_id: &str,
        event: &HookEvent,
    ) -> Result<Vec<DeliveryAttempt>> {
        let subscribers = self.listeners.list_for_target(target_session_id).await?;
        let mut attempts = Vec::with_capacity(subscribers.len());

        for subscription in subscribers {
            let error = match self
                .transport
                .send_event(&subscription.transport_ref, event)
                .await
            {
                Ok(()) => None,
                Err(err) => {
                    warn!(
                        target = target_session_id,
                        caller = %subscription.caller_session_id,
                        %err,
                        "listener fan-out send failed"
                    );
                    Some(err.to_string())
                }
            };
            attempts.push(DeliveryAttempt {
                caller_session_id: subscription.caller_session_id,
                transport_ref: subscription.transport_ref,
                error,
            });
        }

        Ok(attempts)
    }
}
