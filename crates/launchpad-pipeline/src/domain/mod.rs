//! Domain layer - business rules independent of storage and transport

pub mod message;
pub mod phase;

pub use message::{MintRequest, WorkMessage};
pub use phase::{evaluate, ActivePhase, PhaseEvaluator};
