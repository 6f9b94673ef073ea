//! Infrastructure layer
//!
//! Service orchestration and process lifetime

pub mod service_container;

pub use service_container::{Backends, InMemoryContainer, PostgresContainer, ServiceContainer};
