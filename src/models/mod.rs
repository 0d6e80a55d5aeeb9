//! Data models for sessions, outbox entries, listeners, and hook events.

pub mod event;
pub mod listener;
pub mod outbox;
pub mod session;

pub use event::HookEvent;
pub use listener::ListenerSubscription;
pub use outbox::{NotificationPayload, OutboxEntry, OutboxStatus};
pub use session::{Session, SessionStatus, Visibility};
