//! Entitlement accounting.
//!
//! A reservation moves `activated_count` up by one before placement starts.
//! It is then either committed (server created) or released (any later
//! failure). Both are one-shot per token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use berth_id::{PlanId, ReservationId, UserId};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::model::Entitlement;
use crate::store::{ActivateOutcome, EntitlementStore, StoreError};

/// Proof of one reserved activation.
///
/// Clones share settlement state, so releasing any clone settles them all.
#[derive(Debug, Clone)]
pub struct ReservationToken {
    id: ReservationId,
    user_id: UserId,
    plan_name: String,
    settled: Arc<AtomicBool>,
}

impl ReservationToken {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn plan_name(&self) -> &str {
        &self.plan_name
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Marks the token settled. Returns false if it already was.
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    fn unsettle(&self) {
        self.settled.store(false, Ordering::Release);
    }
}

/// Activation metadata recorded on commit.
#[derive(Debug, Clone, Copy)]
pub struct ActivationMetadata {
    pub plan_id: PlanId,
    pub activated_on: DateTime<Utc>,
}

pub struct EntitlementLedger {
    store: Arc<dyn EntitlementStore>,
}

impl EntitlementLedger {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    pub async fn entitlement(
        &self,
        user: UserId,
        plan_name: &str,
    ) -> ProvisionResult<Option<Entitlement>> {
        Ok(self.store.entitlement(user, plan_name).await?)
    }

    /// Reserves one activation of `plan_name` for `user`.
    #[instrument(skip(self, user), fields(user_id = %user))]
    pub async fn reserve(&self, user: UserId, plan_name: &str) -> ProvisionResult<ReservationToken> {
        match self.store.try_activate(user, plan_name).await? {
            ActivateOutcome::Activated {
                activated,
                purchased,
            } => {
                let token = ReservationToken {
                    id: ReservationId::new(),
                    user_id: user,
                    plan_name: plan_name.to_string(),
                    settled: Arc::new(AtomicBool::new(false)),
                };
                info!(
                    reservation_id = %token.id,
                    activated,
                    purchased,
                    "Reserved plan activation"
                );
                Ok(token)
            }
            ActivateOutcome::NotOwned => Err(ProvisionError::PlanNotOwned {
                plan_name: plan_name.to_string(),
            }),
            ActivateOutcome::Exhausted { purchased } => Err(ProvisionError::QuotaExceeded {
                plan_name: plan_name.to_string(),
                purchased,
            }),
        }
    }

    /// Gives the activation back. A second release of the same token is a no-op.
    #[instrument(skip(self, token), fields(reservation_id = %token.id))]
    pub async fn release(&self, token: &ReservationToken) -> ProvisionResult<()> {
        if !token.settle() {
            return Ok(());
        }

        match self.store.deactivate(token.user_id, &token.plan_name).await {
            Ok(true) => {
                info!(plan_name = %token.plan_name, "Released plan activation");
                Ok(())
            }
            Ok(false) => {
                warn!(
                    plan_name = %token.plan_name,
                    "Activation count already at zero on release"
                );
                Ok(())
            }
            Err(e) => {
                // Leave the token open so the caller can retry.
                token.unsettle();
                Err(e.into())
            }
        }
    }

    /// Finalizes the reservation once the server exists.
    #[instrument(skip(self, token, metadata), fields(reservation_id = %token.id))]
    pub async fn commit(
        &self,
        token: &ReservationToken,
        metadata: ActivationMetadata,
    ) -> ProvisionResult<()> {
        if !token.settle() {
            return Err(StoreError::Conflict(format!(
                "reservation {} already settled",
                token.id
            ))
            .into());
        }

        self.store
            .record_activation(
                token.user_id,
                &token.plan_name,
                metadata.plan_id,
                metadata.activated_on,
            )
            .await?;

        info!(plan_name = %token.plan_name, "Committed plan activation");
        Ok(())
    }
}
