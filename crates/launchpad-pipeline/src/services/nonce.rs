//! Nonce tracking for backend signing identities
//!
//! Only used while the global mint lock is held, so a single process assigns
//! nonces at a time. Other workers may submit between two leases of this
//! one, so the cache is marked stale whenever the lock is taken. The cached
//! value is a lower bound made of committed submissions; after an error the
//! chain's pending count decides whether the failed nonce was consumed.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::{ChainClient, PipelineResult};

#[derive(Debug, Clone, Copy, Default)]
struct NonceState {
    next: u64,
    needs_resync: bool,
}

pub struct NonceManager<C: ChainClient> {
    chain: Arc<C>,
    state: Mutex<HashMap<String, NonceState>>,
}

impl<C: ChainClient> NonceManager<C> {
    pub fn new(chain: Arc<C>) -> Self {
        Self {
            chain,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Next nonce to use for `address`
    pub async fn reserve(&self, address: &str) -> PipelineResult<u64> {
        let key = address.to_ascii_lowercase();
        let mut state = self.state.lock().await;

        let cached = state.get(&key).copied();
        let next = match cached {
            Some(entry) if !entry.needs_resync => entry.next,
            _ => {
                // Another process may have advanced the account since we last looked
                let on_chain = self.chain.get_transaction_count(&key).await?;
                let floor = cached.map(|entry| entry.next).unwrap_or(0);
                let next = on_chain.max(floor);
                debug!(address = %key, on_chain, floor, next, "Resynced nonce from chain");
                next
            }
        };

        state.insert(
            key,
            NonceState {
                next,
                needs_resync: false,
            },
        );
        Ok(next)
    }

    /// The transaction using `nonce` was accepted by the node
    pub async fn commit(&self, address: &str, nonce: u64) {
        let key = address.to_ascii_lowercase();
        let mut state = self.state.lock().await;
        let entry = state.entry(key).or_default();
        entry.next = entry.next.max(nonce + 1);
    }

    /// Submission with `nonce` failed or timed out. The node may still have
    /// accepted it, so the next reservation re-queries the chain and moves
    /// past `nonce` whenever the pending count already includes it.
    pub async fn fail(&self, address: &str, nonce: u64) {
        let key = address.to_ascii_lowercase();
        let mut state = self.state.lock().await;
        let entry = state.entry(key.clone()).or_default();
        // Everything below the failed nonce was committed
        entry.next = nonce;
        entry.needs_resync = true;
        warn!(address = %key, nonce, "Nonce marked for resync after failed submission");
    }

    /// Re-read every address from the chain on its next reservation,
    /// keeping the committed floors. Called on each new lease of the lock.
    pub async fn mark_stale(&self) {
        for entry in self.state.lock().await.values_mut() {
            entry.needs_resync = true;
        }
    }

    /// Forget everything known about `address`
    pub async fn invalidate(&self, address: &str) {
        self.state.lock().await.remove(&address.to_ascii_lowercase());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::chain::mock::MockChain;

    const MINTER: &str = "0x00000000000000000000000000000000000000aa";

    #[tokio::test]
    async fn test_sequential_reservations() {
        let chain = Arc::new(MockChain::new());
        chain.set_nonce(MINTER, 7);
        let nonces = NonceManager::new(chain.clone());

        let first = nonces.reserve(MINTER).await.unwrap();
        assert_eq!(first, 7);
        nonces.commit(MINTER, first).await;

        assert_eq!(nonces.reserve(MINTER).await.unwrap(), 8);
        assert_eq!(chain.call_count("get_transaction_count"), 1);
    }

    #[tokio::test]
    async fn test_failure_forces_resync() {
        let chain = Arc::new(MockChain::new());
        chain.set_nonce(MINTER, 3);
        let nonces = NonceManager::new(chain.clone());

        let nonce = nonces.reserve(MINTER).await.unwrap();
        nonces.fail(MINTER, nonce).await;

        // Rejected before reaching the pool: the nonce is still free
        assert_eq!(nonces.reserve(MINTER).await.unwrap(), 3);
        assert_eq!(chain.call_count("get_transaction_count"), 2);

        // Accepted despite a client-side timeout: follow the chain past it
        nonces.fail(MINTER, 3).await;
        chain.set_nonce(MINTER, 4);
        assert_eq!(nonces.reserve(MINTER).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_stale_cache_follows_other_submitters() {
        let chain = Arc::new(MockChain::new());
        let nonces = NonceManager::new(chain.clone());

        let first = nonces.reserve(MINTER).await.unwrap();
        nonces.commit(MINTER, first).await;
        assert_eq!(nonces.reserve(MINTER).await.unwrap(), 1);

        // Another worker used nonces 1 and 2 while we did not hold the lock
        chain.set_nonce(MINTER, 3);
        nonces.mark_stale().await;
        assert_eq!(nonces.reserve(MINTER).await.unwrap(), 3);

        // The committed floor still wins over a lagging node
        nonces.commit(MINTER, 3).await;
        chain.set_nonce(MINTER, 2);
        nonces.mark_stale().await;
        assert_eq!(nonces.reserve(MINTER).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_committed_nonces_are_never_reused() {
        let chain = Arc::new(MockChain::new());
        chain.set_nonce(MINTER, 5);
        let nonces = NonceManager::new(chain.clone());

        let first = nonces.reserve(MINTER).await.unwrap();
        nonces.commit(MINTER, first).await;
        let second = nonces.reserve(MINTER).await.unwrap();
        nonces.fail(MINTER, second).await;

        // A lagging node reports a stale pending count
        chain.set_nonce(MINTER, 5);
        assert_eq!(nonces.reserve(MINTER).await.unwrap(), 6);
    }
}
