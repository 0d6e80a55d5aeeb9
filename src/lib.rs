#![forbid(unsafe_code)]

pub mod adapters;
pub mod config;
pub mod errors;
pub mod intake;
pub mod listener;
pub mod models;
pub mod orchestrator;
pub mod outbox;
pub mod persistence;
pub mod terminal;

pub use config::RelayConfig;
pub use errors::{RelayError, Result};
