//! Domain records read and produced by the provisioning engine.
//!
//! Plans, locations, nodes and eggs are catalog data owned by the panel
//! administrator; the engine only reads them. Entitlements and allocation
//! bindings are the two pieces of state the engine mutates.

use std::collections::BTreeMap;

use berth_id::{AllocationId, EggId, InstanceId, LocationId, NodeId, PlanId, ReservationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Catalog
// =============================================================================

/// A priced tier: resource quotas plus feature limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    /// Unique catalog key; entitlements refer to plans by name.
    pub name: String,
    /// CPU limit in percent of one core.
    pub cpu: i64,
    /// Memory limit in MiB.
    pub memory: i64,
    /// Disk limit in MiB.
    pub disk: i64,
    pub servers: i32,
    pub allocations: i32,
    pub databases: i32,
    pub backups: i32,
    /// Trial plans get the short expiry window.
    pub trial: bool,
}

impl Plan {
    /// Limits shown to a user choosing where to deploy.
    pub fn limits(&self) -> PlanLimits {
        PlanLimits {
            cpu: self.cpu,
            memory: self.memory,
            disk: self.disk,
            servers: self.servers,
            allocations: self.allocations,
            databases: self.databases,
            backups: self.backups,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub cpu: i64,
    pub memory: i64,
    pub disk: i64,
    pub servers: i32,
    pub allocations: i32,
    pub databases: i32,
    pub backups: i32,
}

/// A grouping of nodes with shared eligibility rules and a capacity ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub short: String,
    /// Plan names allowed to deploy here. Empty means any plan.
    #[serde(default)]
    pub required_plans: Vec<String>,
    /// Maximum number of bound servers across all of the location's nodes.
    pub max_servers: i32,
}

impl Location {
    /// Whether a server on `plan_name` may be placed here.
    pub fn admits_plan(&self, plan_name: &str) -> bool {
        self.required_plans.is_empty() || self.required_plans.iter().any(|p| p == plan_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub location_id: LocationId,
    pub name: String,
    /// Only public nodes take part in automatic placement.
    pub public: bool,
}

/// Who currently holds an allocation.
///
/// A claim is the provisional placeholder written while a request is still
/// in flight; it becomes an instance binding once the panel accepts the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationHolder {
    Claim(ReservationId),
    Instance(InstanceId),
}

impl AllocationHolder {
    /// Parses the stored form, which is just the holder's prefixed id.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Ok(claim) = ReservationId::parse(raw) {
            return Some(Self::Claim(claim));
        }
        InstanceId::parse(raw).ok().map(Self::Instance)
    }
}

impl std::fmt::Display for AllocationHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claim(id) => write!(f, "{id}"),
            Self::Instance(id) => write!(f, "{id}"),
        }
    }
}

/// A bindable (ip, port) pair on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: AllocationId,
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
    pub holder: Option<AllocationHolder>,
}

impl Allocation {
    pub fn is_free(&self) -> bool {
        self.holder.is_none()
    }
}

/// A provisioning template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Egg {
    pub id: EggId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Startup command template, passed through unchanged.
    pub startup: String,
    /// Candidate container images.
    pub docker_images: Vec<String>,
    #[serde(default)]
    pub variables: Vec<EggVariable>,
}

/// Marker an administrator puts in an egg description to offer it for self-service deploys.
const DEPLOYABLE_MARKER: &str = "server_ready";

impl Egg {
    /// Whether the egg is offered in the deploy options listing.
    pub fn is_deployable(&self) -> bool {
        self.description.to_lowercase().contains(DEPLOYABLE_MARKER)
    }

    /// Default environment: every variable's env name mapped to its default.
    pub fn default_environment(&self) -> BTreeMap<String, String> {
        self.variables
            .iter()
            .map(|v| {
                (
                    v.env_variable.clone(),
                    v.default_value.clone().unwrap_or_default(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EggVariable {
    pub name: String,
    pub env_variable: String,
    #[serde(default)]
    pub default_value: Option<String>,
}

// =============================================================================
// Entitlements
// =============================================================================

/// Purchased vs activated servers for one (user, plan name) pair.
///
/// `purchased_count` is written by the purchase flow; the engine only moves
/// `activated_count`, and keeps it within `0..=purchased_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub user_id: UserId,
    pub plan_name: String,
    pub purchased_count: i32,
    pub activated_count: i32,
    pub plan_id: Option<PlanId>,
    pub first_activated_on: Option<DateTime<Utc>>,
    pub last_activated_on: Option<DateTime<Utc>>,
}

impl Entitlement {
    pub fn new(user_id: UserId, plan_name: impl Into<String>, purchased_count: i32) -> Self {
        Self {
            user_id,
            plan_name: plan_name.into(),
            purchased_count,
            activated_count: 0,
            plan_id: None,
            first_activated_on: None,
            last_activated_on: None,
        }
    }

    pub fn remaining(&self) -> i32 {
        (self.purchased_count - self.activated_count).max(0)
    }
}

// =============================================================================
// Requests and results
// =============================================================================

/// The single input to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub name: String,
    pub egg_id: EggId,
    pub location_id: LocationId,
    pub plan_name: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu: i64,
    pub memory: i64,
    pub disk: i64,
    pub swap: i64,
    pub io: i64,
    pub oom_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLimits {
    pub databases: i32,
    pub allocations: i32,
    pub backups: i32,
}

/// Activation window recorded against the plan a server was deployed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanActivation {
    pub activated_on: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Fully resolved server specification handed to the creation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedSpec {
    pub name: String,
    pub owner_id: UserId,
    pub egg_id: EggId,
    pub node_id: NodeId,
    pub allocation_id: AllocationId,
    pub limits: ResourceLimits,
    pub feature_limits: FeatureLimits,
    pub image: String,
    pub startup: String,
    pub environment: BTreeMap<String, String>,
    pub skip_scripts: bool,
    pub activated_on: DateTime<Utc>,
    /// Advisory; expiry is enforced elsewhere.
    pub expires_at: DateTime<Utc>,
    pub plan: BTreeMap<String, PlanActivation>,
}

/// What the caller gets back on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedServerHandle {
    pub instance_id: InstanceId,
    pub name: String,
}
