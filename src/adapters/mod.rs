//! Concrete adapter gateways behind [`crate::outbox::AdapterGateway`].

pub mod slack;

pub use slack::SlackGateway;
