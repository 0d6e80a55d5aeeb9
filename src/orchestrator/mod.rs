//! Daemon orchestration: session lifecycle, event routing, staleness sweep.

pub mod lifecycle;
pub mod router;
pub mod sweep;
pub mod transport;

pub use lifecycle::{spawn_death_consumer, OpenSessionParams, SessionLifecycle};
pub use router::EventRouter;
pub use sweep::spawn_sweep_task;
pub use transport::RelayTransport;
