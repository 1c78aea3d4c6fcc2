//! Agent worker: queue-driven agent task processing.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod queue;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use error::{Error, Result};
