//! Intake socket server.
//!
//! Listens on a named pipe (Windows) or Unix domain socket via the
//! `interprocess` crate, speaks the line-delimited protocol from
//! [`super::protocol`], and hands validated events to an [`EventSink`].
//! One task per connection; a connection failure only ends that
//! connection, never the server.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::IntakeConfig;
use crate::models::HookEvent;
use crate::{RelayError, Result};

use super::codec::IntakeCodec;
use super::protocol::{
    error_code, ForwardParams, IntakeRequest, IntakeResponse, METHOD_EVENT_FORWARD,
    METHOD_INITIALIZE, METHOD_INITIALIZED, PROTOCOL_VERSION,
};

/// Consumer of validated intake events.
///
/// The daemon's event router implements this; tests substitute fakes.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Apply one inbound event and return the result payload for the
    /// intake response.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::SessionNotFound` for events referencing an
    /// unknown session; any other variant is reported to the client as an
    /// internal error.
    async fn handle_event(&self, event: HookEvent) -> Result<serde_json::Value>;
}

/// Spawn the intake server task.
///
/// # Errors
///
/// Returns `RelayError::Intake` if the socket listener cannot be created.
pub fn spawn_intake_server(
    sink: Arc<dyn EventSink>,
    config: &IntakeConfig,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = config.socket_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| RelayError::Intake(format!("invalid socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| RelayError::Intake(format!("failed to create intake listener: {err}")))?;

    info!(socket = %name, "intake server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("intake_server", socket = %name);
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("intake server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let sink = Arc::clone(&sink);
                                tokio::spawn(handle_connection(stream, sink));
                            }
                            Err(err) => {
                                warn!(%err, "intake accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Serve one client connection until EOF or a write failure.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    sink: Arc<dyn EventSink>,
) {
    let span = info_span!("intake_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut lines = FramedRead::new(reader, IntakeCodec::new());

        while let Some(next_line) = lines.next().await {
            let line = match next_line {
                Ok(line) => line,
                Err(err) => {
                    warn!(%err, "intake read error");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<IntakeRequest>(trimmed) {
                Ok(request) => dispatch(request, &sink).await,
                Err(err) => Some(IntakeResponse::failure(
                    None,
                    error_code::PARSE,
                    format!("invalid json: {err}"),
                )),
            };

            let Some(response) = response else {
                continue; // notification, nothing to answer
            };

            let mut line_out = serde_json::to_string(&response)
                .unwrap_or_else(|_| r#"{"error":{"code":-32000,"message":"serialization failed"}}"#.to_owned());
            line_out.push('\n');

            if let Err(err) = writer.write_all(line_out.as_bytes()).await {
                warn!(%err, "failed to write intake response");
                break;
            }
        }

        debug!("intake connection closed");
    }
    .instrument(span)
    .await;
}

/// Route one protocol message. Returns `None` for notifications.
async fn dispatch(request: IntakeRequest, sink: &Arc<dyn EventSink>) -> Option<IntakeResponse> {
    match request.method.as_str() {
        METHOD_INITIALIZE => Some(IntakeResponse::success(
            request.id,
            serde_json::json!({
                "protocol_version": PROTOCOL_VERSION,
                "capabilities": { "events": true, "sessions": true },
            }),
        )),
        METHOD_INITIALIZED => {
            debug!("intake client initialized");
            None
        }
        METHOD_EVENT_FORWARD => Some(handle_forward(request, sink).await),
        other => {
            if request.id.is_none() {
                debug!(method = other, "ignoring unknown intake notification");
                return None;
            }
            Some(IntakeResponse::failure(
                request.id,
                error_code::METHOD_NOT_FOUND,
                format!("unknown method: {other}"),
            ))
        }
    }
}

async fn handle_forward(request: IntakeRequest, sink: &Arc<dyn EventSink>) -> IntakeResponse {
    let id = request.id;
    let Some(raw_params) = request.params else {
        return IntakeResponse::failure(id, error_code::INVALID_PARAMS, "missing params");
    };

    let params: ForwardParams = match serde_json::from_value(raw_params) {
        Ok(params) => params,
        Err(err) => {
            return IntakeResponse::failure(
                id,
                error_code::INVALID_PARAMS,
                format!("invalid event payload: {err}"),
            );
        }
    };

    let event = params.into_event();
    match sink.handle_event(event).await {
        Ok(result) => IntakeResponse::success(id, result),
        Err(err @ RelayError::SessionNotFound(_)) => {
            IntakeResponse::failure(id, error_code::SESSION_NOT_FOUND, err.to_string())
        }
        Err(err) => IntakeResponse::failure(id, error_code::INTERNAL, err.to_string()),
    }
}
