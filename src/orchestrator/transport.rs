//! Listener transport backed by live terminals and the adapter gateway.
//!
//! A subscription's `transport_ref` selects the mechanism:
//! `terminal:<session_id>` writes the event into that session's terminal
//! input as one JSON line; `channel:<id>` posts a text rendering through
//! the adapter gateway. Anything else is rejected.

use std::sync::Arc;

use async_trait::async_trait;

use crate::listener::ListenerTransport;
use crate::models::HookEvent;
use crate::outbox::AdapterGateway;
use crate::terminal::TerminalBridge;
use crate::{RelayError, Result};

/// Default transport wired by the daemon.
#[derive(Clone)]
pub struct RelayTransport {
    bridge: TerminalBridge,
    gateway: Arc<dyn AdapterGateway>,
}

impl RelayTransport {
    /// Build a transport over the bridge and gateway.
    #[must_use]
    pub fn new(bridge: TerminalBridge, gateway: Arc<dyn AdapterGateway>) -> Self {
        Self { bridge, gateway }
    }
}

#[async_trait]
impl ListenerTransport for RelayTransport {
    async fn send_event(&self, transport_ref: &str, event: &HookEvent) -> Result<()> {
        if let Some(session_id) = transport_ref.strip_prefix("terminal:") {
            let mut line = serde_json::to_string(event)
                .map_err(|err| RelayError::Adapter(format!("unserializable event: {err}")))?;
            line.push('\n');
            self.bridge.send_keys(session_id, &line).await
        } else if let Some(channel) = transport_ref.strip_prefix("channel:") {
            self.gateway
                .send_message(channel, &render_event(event))
                .await
        } else {
            Err(RelayError::Adapter(format!(
                "unknown transport reference '{transport_ref}'"
            )))
        }
    }
}

fn render_event(event: &HookEvent) -> String {
    match event {
        HookEvent::ToolUse {
            session_id,
            tool_name,
        } => format!("[{session_id}] tool use: {tool_name}"),
        HookEvent::Checkpoint { session_id, label } => match label {
            Some(label) => format!("[{session_id}] checkpoint: {label}"),
            None => format!("[{session_id}] checkpoint"),
        },
        HookEvent::Output {
            session_id,
            preview,
        } => match preview {
            Some(preview) => format!("[{session_id}] output: {preview}"),
            None => format!("[{session_id}] produced output"),
        },
        HookEvent::Notice {
            session_id,
            message,
        } => format!("[{session_id}] {message}"),
    }
}
