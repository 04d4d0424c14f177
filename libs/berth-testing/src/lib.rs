//! Test fixtures for the berth provisioner.
//!
//! - [`Scenario`] seeds a [`MemoryStore`] with catalog rows and purchases
//! - [`RecordingCreation`], [`RejectingCreation`] and [`HangingCreation`]
//!   stand in for the panel's creation service
//! - [`ScriptedRandom`] replays fixed placement choices
//! - [`FlakyStore`] fails releases for a while, like a store that drops out

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use berth_id::{AllocationId, EggId, InstanceId, LocationId, NodeId, PlanId, ReservationId, UserId};
use berth_provisioner::config::EngineConfig;
use berth_provisioner::creation::{CreationError, CreationService, InstanceHandle};
use berth_provisioner::model::{
    Allocation, Egg, EggVariable, Entitlement, Location, Node, Plan, ProvisionedSpec,
    ProvisioningRequest,
};
use berth_provisioner::random::RandomSource;
use berth_provisioner::store::{
    ActivateOutcome, AllocationStore, EntitlementStore, MemoryStore, StoreError, StoreResult,
    Stores,
};
use berth_provisioner::Orchestrator;
use chrono::{DateTime, Utc};

// =============================================================================
// Scenario
// =============================================================================

/// Catalog and purchase state for one test, backed by a fresh [`MemoryStore`].
pub struct Scenario {
    pub store: Arc<MemoryStore>,
    next_port: u16,
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

impl Scenario {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            next_port: 25565,
        }
    }

    pub fn stores(&self) -> Stores {
        Stores::shared(self.store.clone())
    }

    pub fn plan(&self, name: &str, trial: bool) -> Plan {
        let plan = Plan {
            id: PlanId::new(),
            name: name.to_string(),
            cpu: 100,
            memory: 2048,
            disk: 10240,
            servers: 1,
            allocations: 1,
            databases: 1,
            backups: 2,
            trial,
        };
        self.store.insert_plan(plan.clone());
        plan
    }

    /// A deployable egg with the given images.
    pub fn egg(&self, images: &[&str]) -> Egg {
        let egg = Egg {
            id: EggId::new(),
            name: "Paper".to_string(),
            description: "High performance Minecraft server. server_ready".to_string(),
            startup: "java -Xms128M -jar {{SERVER_JARFILE}}".to_string(),
            docker_images: images.iter().map(|s| s.to_string()).collect(),
            variables: vec![
                EggVariable {
                    name: "Server Jar File".to_string(),
                    env_variable: "SERVER_JARFILE".to_string(),
                    default_value: Some("server.jar".to_string()),
                },
                EggVariable {
                    name: "Build Number".to_string(),
                    env_variable: "BUILD_NUMBER".to_string(),
                    default_value: None,
                },
            ],
        };
        self.store.insert_egg(egg.clone());
        egg
    }

    pub fn location(&self, short: &str, max_servers: i32, required_plans: &[&str]) -> Location {
        let location = Location {
            id: LocationId::new(),
            short: short.to_string(),
            required_plans: required_plans.iter().map(|s| s.to_string()).collect(),
            max_servers,
        };
        self.store.insert_location(location.clone());
        location
    }

    pub fn node(&self, location: LocationId, public: bool) -> Node {
        let node = Node {
            id: NodeId::new(),
            location_id: location,
            name: format!("node-{}", NodeId::new()),
            public,
        };
        self.store.insert_node(node.clone());
        node
    }

    /// Adds `count` free allocations on `node`.
    pub fn allocations(&mut self, node: NodeId, count: usize) -> Vec<AllocationId> {
        (0..count)
            .map(|_| {
                let allocation = Allocation {
                    id: AllocationId::new(),
                    node_id: node,
                    ip: "203.0.113.10".to_string(),
                    port: self.next_port,
                    holder: None,
                };
                self.next_port += 1;
                let id = allocation.id;
                self.store.insert_allocation(allocation);
                id
            })
            .collect()
    }

    /// A user who bought `count` instances of `plan_name`.
    pub fn buyer(&self, plan_name: &str, count: i32) -> UserId {
        let user = UserId::new();
        self.store.set_purchased(user, plan_name, count);
        user
    }

    pub fn orchestrator(&self, creation: Arc<dyn CreationService>) -> Orchestrator {
        Orchestrator::new(self.stores(), creation, EngineConfig::default())
    }

    pub fn orchestrator_with(
        &self,
        creation: Arc<dyn CreationService>,
        config: EngineConfig,
        rng: Arc<dyn RandomSource>,
    ) -> Orchestrator {
        Orchestrator::with_random(self.stores(), creation, config, rng)
    }

    /// Runs the orchestrator against `stores` instead of the plain memory store.
    pub fn orchestrator_over(
        &self,
        stores: Stores,
        creation: Arc<dyn CreationService>,
    ) -> Orchestrator {
        Orchestrator::new(stores, creation, EngineConfig::default())
    }
}

pub fn request(
    user: UserId,
    plan: &Plan,
    egg: &Egg,
    location: &Location,
    name: &str,
) -> ProvisioningRequest {
    ProvisioningRequest {
        name: name.to_string(),
        egg_id: egg.id,
        location_id: location.id,
        plan_name: plan.name.clone(),
        user_id: user,
    }
}

/// Engine settings with a short creation timeout.
pub fn fast_timeout_config(timeout: Duration) -> EngineConfig {
    EngineConfig {
        creation_timeout: timeout,
        ..EngineConfig::default()
    }
}

// =============================================================================
// Creation service doubles
// =============================================================================

/// Accepts every spec and keeps a copy of it.
#[derive(Default)]
pub struct RecordingCreation {
    specs: Mutex<Vec<ProvisionedSpec>>,
}

impl RecordingCreation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn specs(&self) -> Vec<ProvisionedSpec> {
        self.specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CreationService for RecordingCreation {
    async fn create(&self, spec: &ProvisionedSpec) -> Result<InstanceHandle, CreationError> {
        self.specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());
        Ok(InstanceHandle {
            instance_id: InstanceId::new(),
        })
    }
}

/// Rejects every spec with the given HTTP status.
pub struct RejectingCreation {
    pub status: u16,
    calls: AtomicUsize,
}

impl RejectingCreation {
    pub fn new(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CreationService for RejectingCreation {
    async fn create(&self, _spec: &ProvisionedSpec) -> Result<InstanceHandle, CreationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CreationError::Rejected {
            status: self.status,
            body: "node is not accepting servers".to_string(),
        })
    }
}

/// Never answers.
pub struct HangingCreation;

#[async_trait]
impl CreationService for HangingCreation {
    async fn create(&self, _spec: &ProvisionedSpec) -> Result<InstanceHandle, CreationError> {
        std::future::pending().await
    }
}

// =============================================================================
// Randomness
// =============================================================================

/// Replays scripted indices (clamped to the range asked for), then picks 0.
#[derive(Default)]
pub struct ScriptedRandom {
    picks: Mutex<VecDeque<usize>>,
}

impl ScriptedRandom {
    pub fn new(picks: impl IntoIterator<Item = usize>) -> Arc<Self> {
        Arc::new(Self {
            picks: Mutex::new(picks.into_iter().collect()),
        })
    }
}

impl RandomSource for ScriptedRandom {
    fn pick_index(&self, len: usize) -> usize {
        let next = self
            .picks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(0);
        next.min(len - 1)
    }
}

// =============================================================================
// Store faults
// =============================================================================

/// Wraps a [`MemoryStore`] and fails the first few entitlement and
/// allocation releases with a pool timeout. Everything else passes through.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    deactivate_failures: AtomicUsize,
    release_failures: AtomicUsize,
    deactivate_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(
        inner: Arc<MemoryStore>,
        deactivate_failures: usize,
        release_failures: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            deactivate_failures: AtomicUsize::new(deactivate_failures),
            release_failures: AtomicUsize::new(release_failures),
            deactivate_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        })
    }

    /// Catalog from the wrapped store, releases through this one.
    pub fn stores(self: &Arc<Self>) -> Stores {
        Stores {
            catalog: self.inner.clone(),
            entitlements: self.clone(),
            allocations: self.clone(),
        }
    }

    pub fn deactivate_calls(&self) -> usize {
        self.deactivate_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }
}

/// Consumes one scheduled failure, if any are left.
fn take_failure(remaining: &AtomicUsize) -> StoreResult<()> {
    let failing = remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    } else {
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for FlakyStore {
    async fn entitlement(&self, user: UserId, plan_name: &str) -> StoreResult<Option<Entitlement>> {
        self.inner.entitlement(user, plan_name).await
    }

    async fn try_activate(&self, user: UserId, plan_name: &str) -> StoreResult<ActivateOutcome> {
        self.inner.try_activate(user, plan_name).await
    }

    async fn deactivate(&self, user: UserId, plan_name: &str) -> StoreResult<bool> {
        self.deactivate_calls.fetch_add(1, Ordering::SeqCst);
        take_failure(&self.deactivate_failures)?;
        self.inner.deactivate(user, plan_name).await
    }

    async fn record_activation(
        &self,
        user: UserId,
        plan_name: &str,
        plan_id: PlanId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner.record_activation(user, plan_name, plan_id, at).await
    }
}

#[async_trait]
impl AllocationStore for FlakyStore {
    async fn allocation(&self, id: AllocationId) -> StoreResult<Option<Allocation>> {
        self.inner.allocation(id).await
    }

    async fn free_allocations(&self, node: NodeId) -> StoreResult<Vec<Allocation>> {
        self.inner.free_allocations(node).await
    }

    async fn try_claim(&self, allocation: AllocationId, claim: ReservationId) -> StoreResult<bool> {
        self.inner.try_claim(allocation, claim).await
    }

    async fn release_claim(
        &self,
        allocation: AllocationId,
        claim: ReservationId,
    ) -> StoreResult<bool> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        take_failure(&self.release_failures)?;
        self.inner.release_claim(allocation, claim).await
    }

    async fn finalize(
        &self,
        allocation: AllocationId,
        claim: ReservationId,
        instance: InstanceId,
    ) -> StoreResult<bool> {
        self.inner.finalize(allocation, claim, instance).await
    }
}
