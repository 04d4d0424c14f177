//! Provisioning error kinds.
//!
//! Every variant is recoverable per request and carries enough context to
//! render the message shown to the user.

use berth_id::{EggId, LocationId, NodeId};
use thiserror::Error;

use crate::creation::CreationError;
use crate::store::StoreError;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid {field}: {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    #[error("plan '{plan_name}' not found")]
    PlanNotFound { plan_name: String },

    #[error("egg {egg_id} not found")]
    EggNotFound { egg_id: EggId },

    #[error("you don't own the {plan_name} plan, please purchase it first")]
    PlanNotOwned { plan_name: String },

    #[error("you have reached the maximum activations for the {plan_name} plan ({purchased} allowed)")]
    QuotaExceeded { plan_name: String, purchased: i32 },

    #[error("location {location_id} does not accept the {plan_name} plan")]
    LocationIneligible {
        location_id: LocationId,
        plan_name: String,
    },

    #[error("location {location_id} has reached its maximum server capacity ({max_servers})")]
    LocationAtCapacity {
        location_id: LocationId,
        max_servers: i32,
    },

    #[error("no public node available in location {location_id}")]
    NoEligibleNode { location_id: LocationId },

    #[error("no available allocations on node {node_id}")]
    NoFreeAllocation { node_id: NodeId },

    #[error("no valid docker image found for egg {egg_id}")]
    NoDockerImage { egg_id: EggId },

    #[error("server creation failed: {0}")]
    CreationServiceFailure(#[source] CreationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProvisionError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::PlanNotFound { .. } => "plan_not_found",
            Self::EggNotFound { .. } => "egg_not_found",
            Self::PlanNotOwned { .. } => "plan_not_owned",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::LocationIneligible { .. } => "location_ineligible",
            Self::LocationAtCapacity { .. } => "location_at_capacity",
            Self::NoEligibleNode { .. } => "no_eligible_node",
            Self::NoFreeAllocation { .. } => "no_free_allocation",
            Self::NoDockerImage { .. } => "no_docker_image",
            Self::CreationServiceFailure(_) => "creation_service_failure",
            Self::Store(_) => "store_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether a fresh request might succeed without any state changing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CreationServiceFailure(_) | Self::Store(_))
    }
}
