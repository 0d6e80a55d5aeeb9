//! Restart-safe publish/subscribe between sessions.

pub mod registry;

pub use registry::{DeliveryAttempt, ListenerRegistry, ListenerTransport};
