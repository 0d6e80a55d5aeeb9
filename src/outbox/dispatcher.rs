//! Background dispatch loop draining the outbox.
//!
//! Each pass picks the oldest due pending entry, claims its lease with a
//! single conditional update, and hands it to the adapter gateway.
//! Transient failures reschedule with capped exponential backoff;
//! permanent failures and exhausted retries park the entry as `failed`.
//! A crashed worker leaves its lease behind; once `lease_timeout` passes
//! the entry becomes eligible again, so delivery is at-least-once with
//! `payload.message_id` as the adapter-side dedup key.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;
use crate::models::OutboxEntry;
use crate::persistence::outbox_repo::OutboxRepo;
use crate::{RelayError, Result};

use super::gateway::AdapterGateway;

/// What a single dispatch pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No entry was due.
    Idle,
    /// A due entry existed but another worker claimed it first.
    Contended,
    /// Entry handed to the adapter and marked delivered.
    Delivered {
        /// Delivered entry id.
        id: String,
    },
    /// Transient failure, entry pushed to a later attempt.
    Rescheduled {
        /// Rescheduled entry id.
        id: String,
        /// When the entry becomes eligible again.
        next_attempt_at: DateTime<Utc>,
    },
    /// Entry parked as failed, no further retries.
    Failed {
        /// Failed entry id.
        id: String,
    },
}

/// Start the dispatch loop. Cancellation stops it between passes;
/// an in-flight lease is recovered by expiry on the next run.
pub fn spawn_outbox_dispatcher(
    outbox: OutboxRepo,
    gateway: Arc<dyn AdapterGateway>,
    config: OutboxConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(StdDuration::from_millis(config.dispatch_interval_ms.max(1)));
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("outbox dispatcher shutting down");
                    break;
                }
                _ = interval.tick() => {}
            }

            if !drain_due(&outbox, gateway.as_ref(), &config).await {
                break;
            }
        }
    })
}

/// Dispatch until the queue has nothing due. Returns `false` when the
/// loop must halt (storage corruption).
async fn drain_due(outbox: &OutboxRepo, gateway: &dyn AdapterGateway, config: &OutboxConfig) -> bool {
    loop {
        match dispatch_once(outbox, gateway, config).await {
            Ok(DispatchOutcome::Idle) => return true,
            Ok(_) => {}
            Err(RelayError::StorageCorruption(msg)) => {
                error!(%msg, "storage corruption detected, halting outbox dispatcher");
                return false;
            }
            Err(err) => {
                warn!(%err, "outbox dispatch pass failed");
                return true;
            }
        }
    }
}

/// Run exactly one dispatch pass: pick, claim, deliver, record.
///
/// Hidden from the public surface: the dispatch loop is the only
/// production caller, the step shape exists for tests.
///
/// # Errors
///
/// Returns `RelayError::Db` or `RelayError::StorageCorruption` when the
/// store fails; gateway failures are absorbed into the returned outcome.
#[doc(hidden)]
pub async fn dispatch_once(
    outbox: &OutboxRepo,
    gateway: &dyn AdapterGateway,
    config: &OutboxConfig,
) -> Result<DispatchOutcome> {
    let now = Utc::now();
    let cutoff = lease_cutoff(config, now);

    let Some(candidate) = outbox.next_eligible(now, cutoff).await? else {
        return Ok(DispatchOutcome::Idle);
    };

    let entry = match outbox.claim(&candidate.id, now, cutoff).await {
        Ok(entry) => entry,
        Err(RelayError::LeaseConflict) => {
            debug!(id = %candidate.id, "entry claimed by another worker");
            return Ok(DispatchOutcome::Contended);
        }
        Err(err) => return Err(err),
    };

    deliver_claimed(outbox, gateway, config, entry).await
}

async fn deliver_claimed(
    outbox: &OutboxRepo,
    gateway: &dyn AdapterGateway,
    config: &OutboxConfig,
    entry: OutboxEntry,
) -> Result<DispatchOutcome> {
    let failure = match gateway.deliver(&entry).await {
        Ok(()) => {
            outbox.mark_delivered(&entry.id).await?;
            info!(
                id = %entry.id,
                channel = %entry.channel,
                attempt = entry.attempt_count,
                "outbox entry delivered"
            );
            return Ok(DispatchOutcome::Delivered { id: entry.id });
        }
        Err(RelayError::PermanentDelivery(msg)) => {
            outbox.mark_failed(&entry.id, &msg).await?;
            error!(id = %entry.id, %msg, "permanent delivery failure, entry parked as failed");
            return Ok(DispatchOutcome::Failed { id: entry.id });
        }
        Err(RelayError::TransientDelivery(msg)) => msg,
        // Unclassified adapter errors stay retryable.
        Err(other) => other.to_string(),
    };

    if entry.attempt_count >= config.max_attempts {
        outbox.mark_failed(&entry.id, &failure).await?;
        error!(
            id = %entry.id,
            attempts = entry.attempt_count,
            last_error = %failure,
            "delivery attempts exhausted, entry parked as failed"
        );
        return Ok(DispatchOutcome::Failed { id: entry.id });
    }

    let delay = backoff_delay(config, entry.attempt_count);
    let next_attempt_at = Utc::now() + delay;
    outbox.reschedule(&entry.id, next_attempt_at, &failure).await?;
    warn!(
        id = %entry.id,
        attempt = entry.attempt_count,
        retry_in_ms = delay.num_milliseconds(),
        last_error = %failure,
        "transient delivery failure, retry scheduled"
    );
    Ok(DispatchOutcome::Rescheduled {
        id: entry.id,
        next_attempt_at,
    })
}

/// Retry delay after the given attempt number: `base * 2^(n-1)`, capped.
#[must_use]
pub fn backoff_delay(config: &OutboxConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let factor = 2u64.saturating_pow(exponent);
    let ms = config
        .backoff_base_ms
        .saturating_mul(factor)
        .min(config.backoff_cap_ms);
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::from(u32::MAX)))
}

fn lease_cutoff(config: &OutboxConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = i64::try_from(config.lease_timeout_seconds).unwrap_or(i64::from(u32::MAX));
    now - Duration::seconds(secs)
}
