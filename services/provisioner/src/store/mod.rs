//! Storage seams for the provisioning engine.
//!
//! The engine never holds a lock across an await. Every mutation below is a
//! single-entity conditional update: the backend either applies it atomically
//! or reports that the precondition no longer holds.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use berth_id::{AllocationId, EggId, InstanceId, LocationId, NodeId, PlanId, ReservationId, UserId};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Allocation, Egg, Entitlement, Location, Node, Plan};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outcome of a conditional activation increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateOutcome {
    Activated { activated: i32, purchased: i32 },
    NotOwned,
    Exhausted { purchased: i32 },
}

/// Read-only catalog: plans, eggs, locations and nodes.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn plan_by_name(&self, name: &str) -> StoreResult<Option<Plan>>;

    async fn egg(&self, id: EggId) -> StoreResult<Option<Egg>>;

    async fn eggs(&self) -> StoreResult<Vec<Egg>>;

    async fn location(&self, id: LocationId) -> StoreResult<Option<Location>>;

    async fn locations(&self) -> StoreResult<Vec<Location>>;

    async fn public_nodes(&self, location: LocationId) -> StoreResult<Vec<Node>>;

    /// Allocations held (claimed or bound) on any node of the location.
    async fn bound_count(&self, location: LocationId) -> StoreResult<i64>;

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Per-user, per-plan activation counters.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn entitlement(&self, user: UserId, plan_name: &str) -> StoreResult<Option<Entitlement>>;

    /// Increments `activated_count` iff it is below `purchased_count`.
    async fn try_activate(&self, user: UserId, plan_name: &str) -> StoreResult<ActivateOutcome>;

    /// Decrements `activated_count` iff it is above zero. Returns whether it moved.
    async fn deactivate(&self, user: UserId, plan_name: &str) -> StoreResult<bool>;

    /// Stamps activation metadata after a server was created.
    async fn record_activation(
        &self,
        user: UserId,
        plan_name: &str,
        plan_id: PlanId,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Allocation bindings.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    async fn allocation(&self, id: AllocationId) -> StoreResult<Option<Allocation>>;

    async fn free_allocations(&self, node: NodeId) -> StoreResult<Vec<Allocation>>;

    /// Binds `claim` iff the allocation is currently free.
    async fn try_claim(&self, allocation: AllocationId, claim: ReservationId) -> StoreResult<bool>;

    /// Frees the allocation iff it is still held by `claim`.
    async fn release_claim(
        &self,
        allocation: AllocationId,
        claim: ReservationId,
    ) -> StoreResult<bool>;

    /// Swaps the `claim` placeholder for the created instance.
    async fn finalize(
        &self,
        allocation: AllocationId,
        claim: ReservationId,
        instance: InstanceId,
    ) -> StoreResult<bool>;
}

/// The three store handles the engine runs against.
#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn CatalogStore>,
    pub entitlements: Arc<dyn EntitlementStore>,
    pub allocations: Arc<dyn AllocationStore>,
}

impl Stores {
    /// Uses one backend for all three roles.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: CatalogStore + EntitlementStore + AllocationStore + 'static,
    {
        Self {
            catalog: store.clone(),
            entitlements: store.clone(),
            allocations: store,
        }
    }
}
