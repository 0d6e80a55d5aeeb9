//! Terminal bridge owning agent processes and transcript streams.
//!
//! One read-loop task per session drains the terminal output channel,
//! appends bytes to the session transcript, advances the persisted cursor
//! by exactly the byte count appended, and stages the same bytes for the
//! next capture call — the stream is never re-emitted nor skipped.
//! Process EOF becomes a `SessionDeath` notification for the orchestrator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::session::SessionStatus;
use crate::persistence::session_repo::SessionRepo;
use crate::{RelayConfig, RelayError, Result};

use super::pty::PtyProcess;

/// Notification that a session's agent process exited on its own.
#[derive(Debug, Clone)]
pub struct SessionDeath {
    /// Session whose process exited.
    pub session_id: String,
    /// Exit code, when the process could be reaped in time.
    pub exit_code: Option<u32>,
}

/// Process linkage returned by a successful spawn.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    /// Session the process is attached to.
    pub session_id: String,
    /// OS process id of the agent.
    pub pid: u32,
    /// Terminal device path, when it could be derived.
    pub pty_device: Option<String>,
}

/// Output drained by a capture call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedText {
    /// Text produced since the previous capture.
    pub text: String,
    /// Transcript cursor position after this text.
    pub char_offset: i64,
}

/// Staged bytes and cursor, always updated together under one lock.
struct OutputState {
    pending: Vec<u8>,
    char_offset: i64,
}

struct LiveTerminal {
    pty: Arc<PtyProcess>,
    output: Arc<Mutex<OutputState>>,
    cancel: CancellationToken,
}

/// A session's entry in the live map.
///
/// `Starting` reserves the slot for an in-flight spawn so a rival spawn
/// cannot attach a second process to the same session.
enum TerminalSlot {
    Starting,
    Live(LiveTerminal),
}

type LiveMap = Arc<RwLock<HashMap<String, TerminalSlot>>>;

/// Registry of live terminals and the read loops feeding them.
#[derive(Clone)]
pub struct TerminalBridge {
    config: Arc<RelayConfig>,
    sessions: SessionRepo,
    live: LiveMap,
    death_tx: mpsc::Sender<SessionDeath>,
}

impl TerminalBridge {
    /// Create a bridge backed by the given session repository.
    #[must_use]
    pub fn new(
        config: Arc<RelayConfig>,
        sessions: SessionRepo,
        death_tx: mpsc::Sender<SessionDeath>,
    ) -> Self {
        Self {
            config,
            sessions,
            live: Arc::new(RwLock::new(HashMap::new())),
            death_tx,
        }
    }

    /// Spawn the agent process for a session inside a fresh terminal.
    ///
    /// Records the process linkage on the session row and starts the
    /// read loop feeding transcript and capture state.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ProcessSpawn` if the session is not active,
    /// already has a live terminal, or the process fails to start.
    pub async fn spawn(
        &self,
        session_id: &str,
        workspace: &Path,
        rows: u16,
        cols: u16,
    ) -> Result<ProcessHandle> {
        let session = self.sessions.get(session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(RelayError::ProcessSpawn(format!(
                "session {session_id} is not active"
            )));
        }

        // Check-and-reserve under one write lock: a rival spawn racing
        // past a separate read-side check could attach a second process.
        {
            let mut live = self.live.write().await;
            if live.contains_key(session_id) {
                return Err(RelayError::ProcessSpawn(format!(
                    "session {session_id} already has a live terminal"
                )));
            }
            live.insert(session_id.to_owned(), TerminalSlot::Starting);
        }

        match self.spawn_reserved(session_id, workspace, rows, cols).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                let mut live = self.live.write().await;
                if matches!(live.get(session_id), Some(TerminalSlot::Starting)) {
                    live.remove(session_id);
                }
                Err(err)
            }
        }
    }

    /// Spawn with the session's slot already reserved as `Starting`.
    async fn spawn_reserved(
        &self,
        session_id: &str,
        workspace: &Path,
        rows: u16,
        cols: u16,
    ) -> Result<ProcessHandle> {
        let transcripts_dir = self.config.transcripts_dir();
        tokio::fs::create_dir_all(&transcripts_dir)
            .await
            .map_err(|e| RelayError::Io(format!("failed to create transcripts dir: {e}")))?;
        let transcript_name = format!("{session_id}-{}.log", Utc::now().format("%Y%m%dT%H%M%S"));
        let transcript_path = transcripts_dir.join(&transcript_name);

        let (pty, output_rx) = PtyProcess::spawn(
            &self.config.agent_cli,
            &self.config.agent_cli_args,
            workspace,
            rows,
            cols,
            self.config.terminal.read_retry_limit,
        )?;
        let pty = Arc::new(pty);

        let Some(pid) = pty.pid() else {
            if let Err(err) = pty.kill() {
                warn!(session_id, %err, "failed to kill process without pid");
            }
            return Err(RelayError::ProcessSpawn(format!(
                "spawned process for {session_id} reported no pid"
            )));
        };

        let stored = match self
            .sessions
            .attach_process(session_id, pid, pty.pty_device(), &transcript_name)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                if let Err(kill_err) = pty.kill() {
                    warn!(session_id, %kill_err, "failed to kill orphaned process");
                }
                return Err(err);
            }
        };

        let output = Arc::new(Mutex::new(OutputState {
            pending: Vec::new(),
            char_offset: stored.char_offset,
        }));
        let cancel = CancellationToken::new();

        {
            let mut live = self.live.write().await;
            match live.get_mut(session_id) {
                Some(slot) if matches!(slot, TerminalSlot::Starting) => {
                    *slot = TerminalSlot::Live(LiveTerminal {
                        pty: Arc::clone(&pty),
                        output: Arc::clone(&output),
                        cancel: cancel.clone(),
                    });
                }
                _ => {
                    // Reservation vanished: shutdown raced the spawn.
                    drop(live);
                    if let Err(err) = pty.kill() {
                        warn!(session_id, %err, "failed to kill process after lost reservation");
                    }
                    return Err(RelayError::ProcessSpawn(format!(
                        "terminal slot for {session_id} released while starting"
                    )));
                }
            }
        }

        let read_loop = ReadLoop {
            session_id: session_id.to_owned(),
            sessions: self.sessions.clone(),
            live: Arc::clone(&self.live),
            output,
            pty: Arc::clone(&pty),
            transcript_path,
            poll_interval: Duration::from_millis(self.config.terminal.poll_interval_ms),
            reap_timeout: self.reap_timeout(),
            cancel,
            death_tx: self.death_tx.clone(),
        };
        tokio::spawn(read_loop.run(output_rx));

        info!(session_id, pid, "agent terminal spawned");
        Ok(ProcessHandle {
            session_id: session_id.to_owned(),
            pid,
            pty_device: pty.pty_device().map(ToOwned::to_owned),
        })
    }

    /// Write text to a session's terminal input.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Terminal` if the session has no live terminal
    /// or the write fails or times out.
    pub async fn send_keys(&self, session_id: &str, text: &str) -> Result<()> {
        let pty = {
            let live = self.live.read().await;
            let Some(TerminalSlot::Live(term)) = live.get(session_id) else {
                return Err(no_live_terminal(session_id));
            };
            Arc::clone(&term.pty)
        };

        let timeout = Duration::from_millis(self.config.terminal.write_timeout_ms);
        pty.write_keys(text.as_bytes(), timeout).await?;
        self.sessions.touch_activity(session_id).await?;
        Ok(())
    }

    /// Drain output produced since the previous capture.
    ///
    /// The returned cursor matches the persisted `char_offset` for the
    /// drained bytes; repeated captures never re-emit nor skip output.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Terminal` if the session has no live terminal.
    pub async fn capture(&self, session_id: &str) -> Result<ProducedText> {
        let live = self.live.read().await;
        let Some(TerminalSlot::Live(term)) = live.get(session_id) else {
            return Err(no_live_terminal(session_id));
        };

        let mut state = term
            .output
            .lock()
            .map_err(|_| RelayError::Terminal("output state lock poisoned".into()))?;
        let bytes = std::mem::take(&mut state.pending);
        let char_offset = state.char_offset;
        drop(state);

        Ok(ProducedText {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            char_offset,
        })
    }

    /// Whether the session has a live terminal with a running process.
    pub async fn exists(&self, session_id: &str) -> bool {
        matches!(
            self.live.read().await.get(session_id),
            Some(TerminalSlot::Live(term)) if term.pty.is_alive()
        )
    }

    /// Stop the read loop and terminate a session's agent process.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Terminal` if the session has no live terminal
    /// or the process refuses the kill signal while still alive.
    pub async fn kill(&self, session_id: &str) -> Result<()> {
        let term = {
            let mut live = self.live.write().await;
            match live.remove(session_id) {
                Some(TerminalSlot::Live(term)) => term,
                Some(TerminalSlot::Starting) => {
                    // The in-flight spawn still owns the slot.
                    live.insert(session_id.to_owned(), TerminalSlot::Starting);
                    return Err(no_live_terminal(session_id));
                }
                None => return Err(no_live_terminal(session_id)),
            }
        };
        term.cancel.cancel();

        if term.pty.is_alive() {
            if let Err(err) = term.pty.kill() {
                if term.pty.is_alive() {
                    return Err(err);
                }
                debug!(session_id, %err, "kill raced with process exit");
            }
        }

        if let Err(err) = term.pty.reap(self.reap_timeout()).await {
            warn!(session_id, %err, "agent process not reaped in time");
        }
        Ok(())
    }

    /// Terminate every live terminal (daemon shutdown).
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, TerminalSlot)> =
            self.live.write().await.drain().collect();

        for (session_id, slot) in drained {
            let TerminalSlot::Live(term) = slot else {
                // An in-flight spawn kills its own process once it finds
                // the reservation gone.
                continue;
            };
            term.cancel.cancel();
            if term.pty.is_alive() {
                if let Err(err) = term.pty.kill() {
                    warn!(session_id, %err, "failed to kill agent process at shutdown");
                }
            }
            if let Err(err) = term.pty.reap(self.reap_timeout()).await {
                warn!(session_id, %err, "agent process not reaped at shutdown");
            }
        }
    }

    fn reap_timeout(&self) -> Duration {
        Duration::from_millis(self.config.terminal.read_timeout_ms)
    }
}

fn no_live_terminal(session_id: &str) -> RelayError {
    RelayError::Terminal(format!("no live terminal for session {session_id}"))
}

/// Per-session task draining terminal output into transcript and capture
/// state.
struct ReadLoop {
    session_id: String,
    sessions: SessionRepo,
    live: LiveMap,
    output: Arc<Mutex<OutputState>>,
    pty: Arc<PtyProcess>,
    transcript_path: PathBuf,
    poll_interval: Duration,
    reap_timeout: Duration,
    cancel: CancellationToken,
    death_tx: mpsc::Sender<SessionDeath>,
}

impl ReadLoop {
    async fn run(self, mut rx: mpsc::Receiver<Vec<u8>>) {
        let mut transcript = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.transcript_path)
            .await
        {
            Ok(file) => Some(file),
            Err(err) => {
                error!(session_id = %self.session_id, %err, "failed to open transcript file");
                None
            }
        };

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    // Drain chunks that already arrived, then stop without
                    // reporting death: the canceller owns the lifecycle.
                    while let Ok(bytes) = rx.try_recv() {
                        self.append_chunk(&mut transcript, bytes).await;
                    }
                    debug!(session_id = %self.session_id, "terminal read loop cancelled");
                    return;
                }
                polled = tokio::time::timeout(self.poll_interval, rx.recv()) => match polled {
                    Err(_) => {} // idle poll tick
                    Ok(Some(bytes)) => self.append_chunk(&mut transcript, bytes).await,
                    Ok(None) => {
                        self.report_death().await;
                        return;
                    }
                }
            }
        }
    }

    async fn append_chunk(&self, transcript: &mut Option<tokio::fs::File>, bytes: Vec<u8>) {
        if let Some(file) = transcript.as_mut() {
            if let Err(err) = file.write_all(&bytes).await {
                warn!(session_id = %self.session_id, %err, "transcript append failed");
            } else if let Err(err) = file.flush().await {
                warn!(session_id = %self.session_id, %err, "transcript flush failed");
            }
        }

        let new_offset = {
            let Ok(mut state) = self.output.lock() else {
                error!(session_id = %self.session_id, "output state lock poisoned");
                return;
            };
            let appended = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
            state.char_offset = state.char_offset.saturating_add(appended);
            state.pending.extend_from_slice(&bytes);
            state.char_offset
        };

        match self
            .sessions
            .advance_char_offset(&self.session_id, new_offset)
            .await
        {
            Ok(()) => {}
            Err(RelayError::SessionClosed(_)) => {
                debug!(session_id = %self.session_id, "output arrived after close");
            }
            Err(err) => {
                warn!(session_id = %self.session_id, %err, "failed to advance transcript cursor");
            }
        }
    }

    async fn report_death(&self) {
        let exit_code = match self.pty.reap(self.reap_timeout).await {
            Ok(code) => code,
            Err(err) => {
                warn!(session_id = %self.session_id, %err, "failed to reap agent process");
                None
            }
        };
        info!(session_id = %self.session_id, ?exit_code, "agent process exited");

        self.live.write().await.remove(&self.session_id);

        let death = SessionDeath {
            session_id: self.session_id.clone(),
            exit_code,
        };
        if self.death_tx.send(death).await.is_err() {
            warn!(session_id = %self.session_id, "death channel closed, dropping exit notification");
        }
    }
}
