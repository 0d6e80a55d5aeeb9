//! Best-effort client for the intake socket.
//!
//! Used by the hook forwarder: one connection per event, handshake then a
//! single `event/forward`. Every failure comes back as an error the
//! caller logs and discards; nothing here retries, and the whole exchange
//! is bounded by the configured timeout.

use std::time::Duration;

use futures_util::StreamExt;
use interprocess::local_socket::{
    tokio::{prelude::*, RecvHalf, Stream},
    GenericNamespaced,
};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;

use crate::config::IntakeConfig;
use crate::models::HookEvent;
use crate::{RelayError, Result};

use super::codec::IntakeCodec;
use super::protocol::{IntakeRequest, IntakeResponse};

/// Forward one event through the intake socket, handshake included.
///
/// # Errors
///
/// Returns `RelayError::Intake` on connect, handshake, or send failure,
/// or when the exchange exceeds `connect_timeout_ms`. Callers sit on the
/// best-effort side of the boundary and drop the error after logging.
pub async fn forward_event(config: &IntakeConfig, event: &HookEvent) -> Result<()> {
    let budget = Duration::from_millis(config.connect_timeout_ms.max(1));
    match tokio::time::timeout(budget, exchange(config, event)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Intake(format!(
            "intake exchange timed out after {}ms",
            config.connect_timeout_ms
        ))),
    }
}

async fn exchange(config: &IntakeConfig, event: &HookEvent) -> Result<()> {
    let name = config
        .socket_name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| {
            RelayError::Intake(format!(
                "invalid socket name '{}': {err}",
                config.socket_name
            ))
        })?;
    let stream = Stream::connect(name)
        .await
        .map_err(|err| RelayError::Intake(format!("intake connect failed: {err}")))?;

    let (reader, mut writer) = stream.split();
    let mut lines = FramedRead::new(reader, IntakeCodec::new());

    send(&mut writer, &IntakeRequest::initialize(1)).await?;
    let reply = read_reply(&mut lines).await?;
    if let Some(err) = reply.error {
        return Err(RelayError::Intake(format!(
            "initialize rejected ({}): {}",
            err.code, err.message
        )));
    }

    send(&mut writer, &IntakeRequest::initialized()).await?;

    send(&mut writer, &IntakeRequest::forward(2, event)?).await?;
    let reply = read_reply(&mut lines).await?;
    match reply.error {
        None => Ok(()),
        Some(err) => Err(RelayError::Intake(format!(
            "event rejected ({}): {}",
            err.code, err.message
        ))),
    }
}

async fn send<W>(writer: &mut W, request: &IntakeRequest) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut line = serde_json::to_string(request)
        .map_err(|err| RelayError::Intake(format!("unserializable request: {err}")))?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|err| RelayError::Intake(format!("intake write failed: {err}")))?;
    Ok(())
}

async fn read_reply(lines: &mut FramedRead<RecvHalf, IntakeCodec>) -> Result<IntakeResponse> {
    let Some(next_line) = lines.next().await else {
        return Err(RelayError::Intake(
            "connection closed before response".to_owned(),
        ));
    };
    let line = next_line?;
    serde_json::from_str(&line)
        .map_err(|err| RelayError::Intake(format!("invalid response: {err}")))
}
