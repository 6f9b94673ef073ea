//! Adapters - concrete implementations of the core ports

pub mod builder;
pub mod chain;
pub mod memory;
pub mod uploader;

pub use builder::CalldataAuthorizer;
pub use chain::{MockChain, RpcChainClient};
pub use memory::{MemoryCache, MemoryQueue, MemoryStore, MemoryUploader};
pub use uploader::HttpUploader;
