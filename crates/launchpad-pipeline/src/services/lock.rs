//! Global lease lock built on cache primitives

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{LockStore, PipelineResult};

/// Proof of lease ownership; only its holder can refresh or release it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    value: String,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Lease on a single key shared by every worker process
pub struct DistributedLock<L: LockStore> {
    store: Arc<L>,
    key: String,
    ttl: Duration,
}

impl<L: LockStore> DistributedLock<L> {
    pub fn new(store: Arc<L>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the lease for `owner`; `None` when another owner holds it
    pub async fn acquire(&self, owner: &str) -> PipelineResult<Option<LockToken>> {
        let value = format!("{}:{}", owner, Uuid::new_v4());
        let acquired = self
            .store
            .set_if_not_exists(&self.key, &value, self.ttl)
            .await?;

        if acquired {
            debug!(key = %self.key, owner, "Lock acquired");
            Ok(Some(LockToken {
                key: self.key.clone(),
                value,
            }))
        } else {
            Ok(None)
        }
    }

    /// Extend the lease; false means it expired and may belong to someone else
    pub async fn refresh(&self, token: &LockToken) -> PipelineResult<bool> {
        let refreshed = self
            .store
            .compare_and_expire(&token.key, &token.value, self.ttl)
            .await?;
        if !refreshed {
            warn!(key = %token.key, "Lock lease lost before refresh");
        }
        Ok(refreshed)
    }

    /// Release the lease if still owned
    pub async fn release(&self, token: LockToken) -> PipelineResult<bool> {
        let released = self
            .store
            .compare_and_delete(&token.key, &token.value)
            .await?;
        if released {
            debug!(key = %token.key, "Lock released");
        } else {
            warn!(key = %token.key, "Lock already expired at release");
        }
        Ok(released)
    }
}
