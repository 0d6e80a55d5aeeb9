//! Periodic staleness sweep.
//!
//! One task covering three chores: archive active sessions whose process
//! died without a death signal, force-complete sessions stuck in
//! `closing` past the bounded timeout, and purge delivered outbox rows
//! past retention. Failed outbox rows and session rows are never purged.

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SweepConfig;
use crate::models::SessionStatus;
use crate::persistence::outbox_repo::OutboxRepo;
use crate::persistence::session_repo::SessionRepo;

use super::lifecycle::{process_alive, SessionLifecycle};

/// Start the sweep task on its configured interval.
pub fn spawn_sweep_task(
    lifecycle: SessionLifecycle,
    sessions: SessionRepo,
    outbox: OutboxRepo,
    config: SweepConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            config.interval_seconds.max(1),
        ));
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("staleness sweep shutting down");
                    break;
                }
                _ = interval.tick() => {}
            }
            run_sweep(&lifecycle, &sessions, &outbox, &config).await;
        }
    })
}

/// One full sweep pass. Failures are logged per chore and never abort
/// the remaining chores.
pub async fn run_sweep(
    lifecycle: &SessionLifecycle,
    sessions: &SessionRepo,
    outbox: &OutboxRepo,
    config: &SweepConfig,
) {
    sweep_dead_processes(lifecycle, sessions).await;
    sweep_stuck_closing(lifecycle, sessions, config).await;
    purge_delivered(outbox, config).await;
}

/// Close active sessions whose recorded process is gone and whose
/// terminal is no longer live (the death channel missed them).
async fn sweep_dead_processes(lifecycle: &SessionLifecycle, sessions: &SessionRepo) {
    let active = match sessions.list_by_status(SessionStatus::Active).await {
        Ok(list) => list,
        Err(err) => {
            warn!(%err, "sweep could not list active sessions");
            return;
        }
    };

    for session in active {
        let Some(pid) = session.native_process_id else {
            continue;
        };
        if lifecycle.bridge().exists(&session.session_id).await || process_alive(pid) {
            continue;
        }
        warn!(session_id = %session.session_id, pid, "agent process died silently, closing session");
        if let Err(err) = lifecycle.force_close(&session.session_id).await {
            warn!(session_id = %session.session_id, %err, "failed to close dead session");
        }
    }
}

/// Force-complete sessions stuck in `closing` past the bounded timeout.
async fn sweep_stuck_closing(
    lifecycle: &SessionLifecycle,
    sessions: &SessionRepo,
    config: &SweepConfig,
) {
    let secs = i64::try_from(config.closing_timeout_seconds).unwrap_or(i64::from(u32::MAX));
    let cutoff = Utc::now() - Duration::seconds(secs);

    let stuck = match sessions.list_stuck_closing(cutoff).await {
        Ok(list) => list,
        Err(err) => {
            warn!(%err, "sweep could not list closing sessions");
            return;
        }
    };

    for session in stuck {
        warn!(session_id = %session.session_id, "session stuck in closing, force completing");
        if let Err(err) = lifecycle.force_close(&session.session_id).await {
            warn!(session_id = %session.session_id, %err, "force close failed");
        }
    }
}

/// Purge delivered outbox rows older than the retention window.
async fn purge_delivered(outbox: &OutboxRepo, config: &SweepConfig) {
    let days = i64::from(config.delivered_retention_days);
    let before = Utc::now() - Duration::days(days);

    match outbox.purge_delivered(before).await {
        Ok(0) => {}
        Ok(purged) => info!(purged, "delivered outbox entries purged"),
        Err(err) => warn!(%err, "outbox purge failed"),
    }
}
