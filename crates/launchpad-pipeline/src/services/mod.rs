//! Application services of the allocation and mint pipeline

pub mod allocator;
pub mod confirmation;
pub mod launchpad;
pub mod lock;
pub mod mint_queue;
pub mod nonce;

pub use allocator::{Allocator, PremintOutcome, Reservation, SaleTerms};
pub use confirmation::{ConfirmationService, EventTopics, ExpectedOperation};
pub use launchpad::{Launchpad, ReservedMint};
pub use lock::{DistributedLock, LockToken};
pub use mint_queue::{
    processed_key, MessageOutcome, MintQueueDeps, MintQueueProcessor, MintQueueSettings, Tick,
};
pub use nonce::NonceManager;
