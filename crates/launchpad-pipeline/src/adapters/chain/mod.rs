//! Chain client implementations

pub mod abi;
pub mod mock;
pub mod rpc;

pub use mock::{MockChain, SendFailure};
pub use rpc::RpcChainClient;
