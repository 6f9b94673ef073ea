//! Launchpad allocation and mint-fulfillment pipeline
//!
//! Hands out scarce launch items to concurrent buyers exactly once, gates
//! them by time-boxed phases, and mints them on chain through a single-flight
//! worker with nonce-safe submission, idempotent commits and bounded retries.
//! State lives in PostgreSQL, locks and confirmation status in Redis.

pub mod adapters;
pub mod config;
pub mod core;
pub mod database;
pub mod domain;
pub mod infrastructure;
pub mod metrics;
pub mod services;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use crate::core::{ErrorKind, PipelineError, PipelineResult};
pub use infrastructure::ServiceContainer;
pub use services::{Launchpad, MintQueueProcessor};
