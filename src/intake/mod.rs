//! Socket-based event intake: NDJSON codec, wire protocol, server, client.
//!
//! This channel is best-effort by contract: the hook-side client swallows
//! every failure after logging it, and nothing on the durable paths
//! (sessions, outbox) ever depends on an intake message arriving.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod server;

pub use server::{spawn_intake_server, EventSink};
