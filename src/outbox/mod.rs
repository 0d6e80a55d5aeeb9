//! Durable outbound delivery: gateway abstraction and dispatch loop.

pub mod dispatcher;
pub mod gateway;

pub use dispatcher::{spawn_outbox_dispatcher, DispatchOutcome};

#[doc(hidden)]
pub use dispatcher::dispatch_once;
pub use gateway::{AdapterGateway, NullGateway};
