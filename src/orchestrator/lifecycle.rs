//! Session lifecycle orchestration.
//!
//! Owns the open/close paths, the death consumer that archives sessions
//! whose process exited on its own, and the startup recovery pass that
//! reconciles store state with reality after a daemon restart. Outbox
//! entries already enqueued for a session are never cancelled here; they
//! drain independently of lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::listener::ListenerRegistry;
use crate::models::{HookEvent, Session, SessionStatus, Visibility};
use crate::persistence::outbox_repo::OutboxRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::terminal::{ProcessHandle, SessionDeath, TerminalBridge};
use crate::{RelayConfig, RelayError, Result};

use super::router::enqueue_channel_notice;

/// Inputs for opening a session.
#[derive(Debug, Clone)]
pub struct OpenSessionParams {
    /// Workspace slug recorded on the session.
    pub working_slug: String,
    /// Directory the agent process starts in.
    pub workspace: PathBuf,
    /// Who may observe the session.
    pub visibility: Visibility,
    /// Role of the human behind the session.
    pub user_role: String,
}

/// Coordinator for session open/close and process-death handling.
#[derive(Clone)]
pub struct SessionLifecycle {
    config: Arc<RelayConfig>,
    sessions: SessionRepo,
    outbox: OutboxRepo,
    registry: ListenerRegistry,
    bridge: TerminalBridge,
}

impl SessionLifecycle {
    /// Build the coordinator over its collaborators.
    #[must_use]
    pub fn new(
        config: Arc<RelayConfig>,
        sessions: SessionRepo,
        outbox: OutboxRepo,
        registry: ListenerRegistry,
        bridge: TerminalBridge,
    ) -> Self {
        Self {
            config,
            sessions,
            outbox,
            registry,
            bridge,
        }
    }

    /// Terminal bridge backing this coordinator.
    #[must_use]
    pub fn bridge(&self) -> &TerminalBridge {
        &self.bridge
    }

    /// Create a session record and spawn its agent process.
    ///
    /// A spawn failure archives the just-created record and surfaces as
    /// an immediate creation failure.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ProcessSpawn` when the agent process cannot
    /// be started and `RelayError::Db` when the store fails.
    pub async fn open_session(
        &self,
        params: OpenSessionParams,
    ) -> Result<(Session, ProcessHandle)> {
        let session = Session::new(
            self.config.computer_name.clone(),
            params.working_slug,
            params.visibility,
            params.user_role,
        );
        let created = self.sessions.create(&session).await?;

        let handle = match self
            .bridge
            .spawn(
                &created.session_id,
                &params.workspace,
                self.config.terminal.rows,
                self.config.terminal.cols,
            )
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!(session_id = %created.session_id, %err, "spawn failed, archiving session");
                self.archive_quietly(&created.session_id).await;
                return Err(err);
            }
        };

        let stored = self.sessions.get(&created.session_id).await?;
        info!(session_id = %stored.session_id, pid = handle.pid, "session opened");
        Ok((stored, handle))
    }

    /// Close a session through the normal `active → closing → closed`
    /// path: drain terminal output, stop the process, drop the session's
    /// listener interests, archive the record.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::IllegalTransition` if the session is not
    /// active and `RelayError::Db` when the store fails.
    pub async fn close_session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .transition(session_id, SessionStatus::Closing)
            .await?;

        if self.bridge.exists(session_id).await {
            match self.bridge.capture(session_id).await {
                Ok(drained) if !drained.text.is_empty() => {
                    debug!(
                        session_id,
                        len = drained.text.len(),
                        char_offset = drained.char_offset,
                        "final output drained"
                    );
                }
                Ok(_) => {}
                Err(err) => debug!(session_id, %err, "final capture skipped"),
            }
            if let Err(err) = self.bridge.kill(session_id).await {
                // the process may have exited between the checks
                debug!(session_id, %err, "terminal kill during close");
            }
        }

        if let Err(err) = self.registry.unsubscribe_all(session_id).await {
            warn!(session_id, %err, "failed to drop listener interests");
        }

        let closed = self
            .sessions
            .transition(session_id, SessionStatus::Closed)
            .await?;
        info!(session_id, "session closed");
        Ok(closed)
    }

    /// Close a session from whatever live state it is in. Used by the
    /// sweep for stuck sessions and by startup recovery.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` when the store fails; an already closed
    /// session is returned as is.
    pub async fn force_close(&self, session_id: &str) -> Result<Session> {
        let session = self.sessions.get(session_id).await?;
        match session.status {
            SessionStatus::Closed => Ok(session),
            SessionStatus::Active => self.close_session(session_id).await,
            SessionStatus::Closing => {
                if self.bridge.exists(session_id).await {
                    if let Err(err) = self.bridge.kill(session_id).await {
                        debug!(session_id, %err, "terminal kill during force close");
                    }
                }
                if let Err(err) = self.registry.unsubscribe_all(session_id).await {
                    warn!(session_id, %err, "failed to drop listener interests");
                }
                let closed = self
                    .sessions
                    .transition(session_id, SessionStatus::Closed)
                    .await?;
                info!(session_id, "closing session force completed");
                Ok(closed)
            }
        }
    }

    /// Archive a session whose process exited on its own.
    ///
    /// Tolerates every race with a concurrent close: a session already
    /// closed is left untouched, one mid-close is completed.
    pub async fn handle_death(&self, death: &SessionDeath) {
        let session = match self.sessions.get(&death.session_id).await {
            Ok(session) => session,
            Err(err) => {
                warn!(session_id = %death.session_id, %err, "process death for unknown session");
                return;
            }
        };

        match session.status {
            SessionStatus::Closed => {
                debug!(session_id = %death.session_id, "process exit for closed session");
                return;
            }
            SessionStatus::Active => {
                if let Err(err) = self
                    .sessions
                    .transition(&death.session_id, SessionStatus::Closing)
                    .await
                {
                    warn!(session_id = %death.session_id, %err, "death transition to closing failed");
                }
            }
            SessionStatus::Closing => {}
        }

        if let Err(err) = self.registry.unsubscribe_all(&death.session_id).await {
            warn!(session_id = %death.session_id, %err, "failed to drop listener interests");
        }
        if let Err(err) = self
            .sessions
            .transition(&death.session_id, SessionStatus::Closed)
            .await
        {
            warn!(session_id = %death.session_id, %err, "death transition to closed failed");
            return;
        }
        info!(session_id = %death.session_id, exit_code = ?death.exit_code, "session archived after process exit");

        let message = death.exit_code.map_or_else(
            || format!("agent process for session {} exited", death.session_id),
            |code| {
                format!(
                    "agent process for session {} exited with code {code}",
                    death.session_id
                )
            },
        );

        let event = HookEvent::Notice {
            session_id: death.session_id.clone(),
            message: message.clone(),
        };
        match self.registry.publish(&death.session_id, &event).await {
            Ok(attempts) if attempts.is_empty() => {}
            Ok(attempts) => {
                debug!(
                    session_id = %death.session_id,
                    subscribers = attempts.len(),
                    "process exit fanned out"
                );
            }
            Err(err) => warn!(session_id = %death.session_id, %err, "process exit fan-out failed"),
        }

        enqueue_channel_notice(&self.outbox, &self.config, &death.session_id, &message).await;
    }

    /// Reconcile sessions left `active`/`closing` by a previous daemon
    /// run: probe the recorded process, terminate survivors we can no
    /// longer reach through a terminal, and archive every leftover row.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Db` if the leftover sessions cannot be
    /// listed; per-session failures are logged and skipped.
    pub async fn startup_recovery(&self) -> Result<()> {
        let live = self.sessions.list_live().await?;
        if live.is_empty() {
            return Ok(());
        }
        info!(count = live.len(), "reconciling sessions from previous run");

        for session in live {
            if let Some(pid) = session.native_process_id {
                if process_alive(pid) {
                    warn!(session_id = %session.session_id, pid, "terminating orphaned agent process");
                    terminate_process(pid);
                }
            }
            if let Err(err) = self.force_close(&session.session_id).await {
                warn!(session_id = %session.session_id, %err, "failed to archive leftover session");
            }
        }
        Ok(())
    }

    /// Best-effort archive of a session that never got a process.
    async fn archive_quietly(&self, session_id: &str) {
        for next in [SessionStatus::Closing, SessionStatus::Closed] {
            if let Err(err) = self.sessions.transition(session_id, next).await {
                match err {
                    RelayError::IllegalTransition { .. } => {}
                    other => {
                        warn!(session_id, %other, "failed to archive session");
                        return;
                    }
                }
            }
        }
    }
}

/// Consume `SessionDeath` notifications until cancelled.
pub fn spawn_death_consumer(
    lifecycle: SessionLifecycle,
    mut rx: mpsc::Receiver<SessionDeath>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let death = tokio::select! {
                () = cancel.cancelled() => {
                    info!("session death consumer shutting down");
                    break;
                }
                maybe_death = rx.recv() => {
                    if let Some(death) = maybe_death { death } else {
                        info!("session death channel closed");
                        break;
                    }
                }
            };
            lifecycle.handle_death(&death).await;
        }
    })
}

/// Probe whether a process id is alive. `EPERM` counts as alive: the
/// process exists, we just cannot signal it.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate_process(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, %err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn terminate_process(_pid: u32) {}
