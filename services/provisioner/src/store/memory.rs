//! In-memory store for development and tests.
//!
//! Each table sits behind its own mutex and every trait method takes exactly
//! one lock for the duration of a synchronous read-modify-write, which gives
//! the same per-entity atomicity the Postgres store gets from conditional
//! updates.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use berth_id::{AllocationId, EggId, InstanceId, LocationId, NodeId, PlanId, ReservationId, UserId};
use chrono::{DateTime, Utc};

use super::{
    ActivateOutcome, AllocationStore, CatalogStore, EntitlementStore, StoreError, StoreResult,
};
use crate::model::{Allocation, AllocationHolder, Egg, Entitlement, Location, Node, Plan};

type EntitlementKey = (UserId, String);

#[derive(Default)]
pub struct MemoryStore {
    plans: Mutex<HashMap<String, Plan>>,
    eggs: Mutex<HashMap<EggId, Egg>>,
    locations: Mutex<HashMap<LocationId, Location>>,
    nodes: Mutex<HashMap<NodeId, Node>>,
    allocations: Mutex<HashMap<AllocationId, Allocation>>,
    entitlements: Mutex<HashMap<EntitlementKey, Entitlement>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_plan(&self, plan: Plan) {
        guard(&self.plans).insert(plan.name.clone(), plan);
    }

    pub fn insert_egg(&self, egg: Egg) {
        guard(&self.eggs).insert(egg.id, egg);
    }

    pub fn insert_location(&self, location: Location) {
        guard(&self.locations).insert(location.id, location);
    }

    pub fn insert_node(&self, node: Node) {
        guard(&self.nodes).insert(node.id, node);
    }

    pub fn insert_allocation(&self, allocation: Allocation) {
        guard(&self.allocations).insert(allocation.id, allocation);
    }

    /// Records a purchase. Stands in for the external billing flow.
    pub fn set_purchased(&self, user: UserId, plan_name: &str, purchased: i32) {
        guard(&self.entitlements)
            .entry((user, plan_name.to_string()))
            .and_modify(|e| e.purchased_count = purchased)
            .or_insert_with(|| Entitlement::new(user, plan_name, purchased));
    }

    /// Binds an allocation directly, bypassing the claim protocol.
    pub fn bind_allocation(&self, allocation: AllocationId, instance: InstanceId) -> StoreResult<()> {
        let mut allocations = guard(&self.allocations);
        let row = allocations
            .get_mut(&allocation)
            .ok_or_else(|| StoreError::NotFound(allocation.to_string()))?;
        row.holder = Some(AllocationHolder::Instance(instance));
        Ok(())
    }

    pub fn allocations_on(&self, node: NodeId) -> Vec<Allocation> {
        let mut rows: Vec<_> = guard(&self.allocations)
            .values()
            .filter(|a| a.node_id == node)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.id);
        rows
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn plan_by_name(&self, name: &str) -> StoreResult<Option<Plan>> {
        Ok(guard(&self.plans).get(name).cloned())
    }

    async fn egg(&self, id: EggId) -> StoreResult<Option<Egg>> {
        Ok(guard(&self.eggs).get(&id).cloned())
    }

    async fn eggs(&self) -> StoreResult<Vec<Egg>> {
        let mut eggs: Vec<_> = guard(&self.eggs).values().cloned().collect();
        eggs.sort_by_key(|e| e.id);
        Ok(eggs)
    }

    async fn location(&self, id: LocationId) -> StoreResult<Option<Location>> {
        Ok(guard(&self.locations).get(&id).cloned())
    }

    async fn locations(&self) -> StoreResult<Vec<Location>> {
        let mut locations: Vec<_> = guard(&self.locations).values().cloned().collect();
        locations.sort_by_key(|l| l.id);
        Ok(locations)
    }

    async fn public_nodes(&self, location: LocationId) -> StoreResult<Vec<Node>> {
        let mut nodes: Vec<_> = guard(&self.nodes)
            .values()
            .filter(|n| n.location_id == location && n.public)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn bound_count(&self, location: LocationId) -> StoreResult<i64> {
        let in_location: Vec<NodeId> = guard(&self.nodes)
            .values()
            .filter(|n| n.location_id == location)
            .map(|n| n.id)
            .collect();

        let count = guard(&self.allocations)
            .values()
            .filter(|a| !a.is_free() && in_location.contains(&a.node_id))
            .count();
        Ok(count as i64)
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn entitlement(&self, user: UserId, plan_name: &str) -> StoreResult<Option<Entitlement>> {
        Ok(guard(&self.entitlements)
            .get(&(user, plan_name.to_string()))
            .cloned())
    }

    async fn try_activate(&self, user: UserId, plan_name: &str) -> StoreResult<ActivateOutcome> {
        let mut entitlements = guard(&self.entitlements);
        let Some(row) = entitlements.get_mut(&(user, plan_name.to_string())) else {
            return Ok(ActivateOutcome::NotOwned);
        };

        if row.activated_count >= row.purchased_count {
            return Ok(ActivateOutcome::Exhausted {
                purchased: row.purchased_count,
            });
        }

        row.activated_count += 1;
        Ok(ActivateOutcome::Activated {
            activated: row.activated_count,
            purchased: row.purchased_count,
        })
    }

    async fn deactivate(&self, user: UserId, plan_name: &str) -> StoreResult<bool> {
        let mut entitlements = guard(&self.entitlements);
        match entitlements.get_mut(&(user, plan_name.to_string())) {
            Some(row) if row.activated_count > 0 => {
                row.activated_count -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_activation(
        &self,
        user: UserId,
        plan_name: &str,
        plan_id: PlanId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut entitlements = guard(&self.entitlements);
        let row = entitlements
            .get_mut(&(user, plan_name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("entitlement {user}/{plan_name}")))?;
        row.plan_id = Some(plan_id);
        row.first_activated_on.get_or_insert(at);
        row.last_activated_on = Some(at);
        Ok(())
    }
}

#[async_trait]
impl AllocationStore for MemoryStore {
    async fn allocation(&self, id: AllocationId) -> StoreResult<Option<Allocation>> {
        Ok(guard(&self.allocations).get(&id).cloned())
    }

    async fn free_allocations(&self, node: NodeId) -> StoreResult<Vec<Allocation>> {
        let mut free: Vec<_> = guard(&self.allocations)
            .values()
            .filter(|a| a.node_id == node && a.is_free())
            .cloned()
            .collect();
        free.sort_by_key(|a| a.id);
        Ok(free)
    }

    async fn try_claim(&self, allocation: AllocationId, claim: ReservationId) -> StoreResult<bool> {
        let mut allocations = guard(&self.allocations);
        match allocations.get_mut(&allocation) {
            Some(row) if row.is_free() => {
                row.holder = Some(AllocationHolder::Claim(claim));
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(allocation.to_string())),
        }
    }

    async fn release_claim(
        &self,
        allocation: AllocationId,
        claim: ReservationId,
    ) -> StoreResult<bool> {
        let mut allocations = guard(&self.allocations);
        match allocations.get_mut(&allocation) {
            Some(row) if row.holder == Some(AllocationHolder::Claim(claim)) => {
                row.holder = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(
        &self,
        allocation: AllocationId,
        claim: ReservationId,
        instance: InstanceId,
    ) -> StoreResult<bool> {
        let mut allocations = guard(&self.allocations);
        match allocations.get_mut(&allocation) {
            Some(row) if row.holder == Some(AllocationHolder::Claim(claim)) => {
                row.holder = Some(AllocationHolder::Instance(instance));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
