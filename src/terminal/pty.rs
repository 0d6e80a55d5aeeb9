//! Pseudo-terminal ownership for agent processes.
//!
//! Each agent session gets one OS process bound to a pseudo-terminal. A
//! dedicated reader thread streams master-side output into a channel; the
//! async side only ever waits on that channel, so a wedged terminal can
//! never stall the scheduler. Writes and reaps go through `spawn_blocking`
//! with explicit timeouts.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{RelayError, Result};

/// Queue depth between the blocking reader thread and the bridge task.
const OUTPUT_QUEUE_LEN: usize = 64;

/// Pause before retrying a transient read error.
const READ_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// A spawned agent process and its pseudo-terminal.
pub struct PtyProcess {
    // The master must outlive the child or the terminal closes under it.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    pty_device: Option<String>,
}

impl PtyProcess {
    /// Spawn `program` inside a fresh pseudo-terminal of the given size.
    ///
    /// Returns the process handle and the channel carrying raw output
    /// chunks. The channel closes when the process reaches EOF or the
    /// reader exhausts its transient-error retries.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ProcessSpawn` if the terminal cannot be opened
    /// or the process fails to start.
    pub fn spawn(
        program: &str,
        args: &[String],
        workspace: &Path,
        rows: u16,
        cols: u16,
        read_retry_limit: u32,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RelayError::ProcessSpawn(format!("failed to open pty: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RelayError::ProcessSpawn(format!("failed to take pty writer: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.cwd(workspace);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RelayError::ProcessSpawn(format!("failed to spawn {program}: {e}")))?;
        // Close our copy of the slave end so EOF reaches the reader when
        // the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RelayError::ProcessSpawn(format!("failed to clone pty reader: {e}")))?;

        let pid = child.process_id();
        let killer = child.clone_killer();
        let pty_device = pid.and_then(slave_device);

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_LEN);
        spawn_reader_thread(reader, tx, read_retry_limit)?;

        Ok((
            Self {
                _master: Mutex::new(pair.master),
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                killer: Mutex::new(killer),
                pid,
                pty_device,
            },
            rx,
        ))
    }

    /// OS process id of the agent, when the platform reports one.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminal device path of the slave end, when it can be derived.
    #[must_use]
    pub fn pty_device(&self) -> Option<&str> {
        self.pty_device.as_deref()
    }

    /// Whether the agent process is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        let Ok(mut child) = self.child.lock() else {
            return false;
        };
        matches!(child.try_wait(), Ok(None))
    }

    /// Write bytes to the terminal input, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Terminal` if the write fails or does not
    /// complete within the timeout.
    pub async fn write_keys(&self, data: &[u8], timeout: Duration) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();

        let join = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = writer
                .lock()
                .map_err(|_| RelayError::Terminal("pty writer lock poisoned".into()))?;
            writer
                .write_all(&data)
                .map_err(|e| RelayError::Terminal(format!("pty write: {e}")))?;
            writer
                .flush()
                .map_err(|e| RelayError::Terminal(format!("pty flush: {e}")))
        });

        match tokio::time::timeout(timeout, join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(RelayError::Terminal(format!(
                "pty write task failed: {join_err}"
            ))),
            Err(_) => Err(RelayError::Terminal("pty write timed out".into())),
        }
    }

    /// Signal the agent process to terminate.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Terminal` if the signal cannot be delivered;
    /// this races benignly with the process exiting on its own.
    pub fn kill(&self) -> Result<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| RelayError::Terminal("pty killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| RelayError::Terminal(format!("pty kill: {e}")))
    }

    /// Reap the exited process, bounded by `timeout`.
    ///
    /// Returns the exit code when the platform reports one.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Terminal` if the wait fails or does not
    /// complete within the timeout (the process may still be running).
    pub async fn reap(&self, timeout: Duration) -> Result<Option<u32>> {
        let child = Arc::clone(&self.child);

        let join = tokio::task::spawn_blocking(move || -> Result<u32> {
            let mut child = child
                .lock()
                .map_err(|_| RelayError::Terminal("pty child lock poisoned".into()))?;
            let status = child
                .wait()
                .map_err(|e| RelayError::Terminal(format!("pty wait: {e}")))?;
            Ok(status.exit_code())
        });

        match tokio::time::timeout(timeout, join).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(join_err)) => Err(RelayError::Terminal(format!(
                "pty wait task failed: {join_err}"
            ))),
            Err(_) => Err(RelayError::Terminal("pty wait timed out".into())),
        }
    }
}

/// Start the dedicated blocking reader thread for a terminal.
///
/// Transient errors are retried up to `retry_limit` consecutive times;
/// EOF, a persistent error, or a dropped receiver ends the thread. The
/// channel closing is the death signal observed by the bridge.
fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
    retry_limit: u32,
) -> Result<()> {
    std::thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || {
            let mut buf = [0u8; 4096];
            let mut transient_errors: u32 = 0;

            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!("pty reader reached eof");
                        break;
                    }
                    Ok(n) => {
                        transient_errors = 0;
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                        transient_errors += 1;
                        if transient_errors > retry_limit {
                            warn!(%e, "pty read retries exhausted, treating as process death");
                            break;
                        }
                        std::thread::sleep(READ_RETRY_PAUSE);
                    }
                    Err(e) => {
                        // EIO here is the normal way a closed pty reports exit.
                        debug!(%e, "pty read ended");
                        break;
                    }
                }
            }
        })
        .map_err(|e| RelayError::ProcessSpawn(format!("failed to start pty reader: {e}")))?;
    Ok(())
}

/// Resolve the slave device path from the child's controlling terminal.
#[cfg(target_os = "linux")]
fn slave_device(pid: u32) -> Option<String> {
    std::fs::read_link(format!("/proc/{pid}/fd/0"))
        .ok()
        .map(|path| path.to_string_lossy().into_owned())
}

#[cfg(not(target_os = "linux"))]
fn slave_device(_pid: u32) -> Option<String> {
    None
}
