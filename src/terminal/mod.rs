//! Terminal bridge modules.

pub mod bridge;
pub mod pty;

pub use bridge::{ProcessHandle, ProducedText, SessionDeath, TerminalBridge};
pub use pty::PtyProcess;
