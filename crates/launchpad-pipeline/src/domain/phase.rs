//! Phase, eligibility and pricing evaluation

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::core::{
    EligibilityError, Launch, LaunchStore, PhaseKind, PipelineResult, PurchaseLimit,
};

/// The phase in force for a launch at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct ActivePhase {
    pub kind: PhaseKind,
    pub price: Decimal,
    pub max_per_wallet: u32,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl ActivePhase {
    pub fn limit(&self) -> Option<PurchaseLimit> {
        if self.max_per_wallet == 0 {
            return None;
        }
        Some(PurchaseLimit {
            phase: self.kind,
            window_start: self.starts_at,
            window_end: self.ends_at,
            max_per_wallet: self.max_per_wallet,
        })
    }
}

/// Pick the phase whose window contains `now`.
///
/// Phases are checked WHITELIST, then FCFS_WHITELIST, then PUBLIC; phases of
/// the same kind keep their declaration order. The first match wins even when
/// overlapping windows also contain `now`.
pub fn evaluate(launch: &Launch, now: DateTime<Utc>) -> Result<ActivePhase, EligibilityError> {
    let mut ordered: Vec<_> = launch.phases.iter().collect();
    ordered.sort_by_key(|phase| phase.kind.priority());

    ordered
        .into_iter()
        .find(|phase| phase.contains(now))
        .map(|phase| ActivePhase {
            kind: phase.kind,
            price: phase.price,
            max_per_wallet: phase.max_per_wallet,
            starts_at: phase.starts_at,
            ends_at: phase.ends_at,
        })
        .ok_or(EligibilityError::NoActivePhase { launch_id: launch.id })
}

/// Eligibility gate backed by the whitelist and purchase history
pub struct PhaseEvaluator<S: LaunchStore> {
    store: Arc<S>,
}

impl<S: LaunchStore> PhaseEvaluator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Active phase for `address`, rejecting non-whitelisted buyers in gated phases
    pub async fn evaluate_for(
        &self,
        launch: &Launch,
        address: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<ActivePhase> {
        let phase = evaluate(launch, now)?;

        if phase.kind.is_gated()
            && !self.store.is_eligible(launch.id, phase.kind, address).await?
        {
            return Err(EligibilityError::NotEligibleForPhase {
                phase: phase.kind.to_string(),
                address: address.to_string(),
            }
            .into());
        }

        Ok(phase)
    }

    /// Fail with `WalletLimitReached` once the buyer used up the phase allowance
    pub async fn check_limit(
        &self,
        launch_id: Uuid,
        phase: &ActivePhase,
        buyer_id: Uuid,
        buyer_address: &str,
    ) -> PipelineResult<()> {
        if phase.max_per_wallet == 0 {
            return Ok(());
        }

        let purchased = self
            .store
            .count_purchases(launch_id, phase.starts_at, phase.ends_at, buyer_id, buyer_address)
            .await?;

        debug!(
            launch_id = %launch_id,
            buyer_id = %buyer_id,
            purchased,
            limit = phase.max_per_wallet,
            "Checked wallet limit"
        );

        if purchased >= phase.max_per_wallet {
            return Err(EligibilityError::WalletLimitReached {
                phase: phase.kind.to_string(),
                limit: phase.max_per_wallet,
                purchased,
            }
            .into());
        }

        Ok(())
    }
}
