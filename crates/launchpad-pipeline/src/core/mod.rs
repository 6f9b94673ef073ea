//! Core domain abstractions and types
//!
//! Foundational types, ports and error definitions of the allocation and
//! mint-fulfillment pipeline. Nothing in here depends on a concrete backend.

pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use error::{
    AllocationError, EligibilityError, ErrorKind, NetworkError, PipelineError, PipelineResult,
    StorageError, ValidationError,
};
pub use traits::{
    CachePort, ChainClient, Clock, ItemStore, LaunchStore, LockStore, ManualClock,
    MetadataUploader, MintAuthorizer, PreparedMint, ReceivedMessage, SystemClock,
    WhitelistLookup, WorkQueue,
};
pub use types::*;
