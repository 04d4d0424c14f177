//! Location eligibility and node selection.
//!
//! A location is eligible for a plan when it has at least one public node,
//! admits the plan, and holds fewer bound servers than its ceiling.

use std::sync::Arc;

use berth_id::LocationId;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::{ProvisionError, ProvisionResult};
use crate::model::{Location, Node};
use crate::random::{choose, RandomSource};
use crate::store::CatalogStore;

/// A location as presented in deploy options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationSummary {
    pub id: LocationId,
    pub short: String,
    pub public_nodes: usize,
    pub servers: i64,
    pub max_servers: i32,
}

pub struct LocationCapacityIndex {
    catalog: Arc<dyn CatalogStore>,
    rng: Arc<dyn RandomSource>,
}

impl LocationCapacityIndex {
    pub fn new(catalog: Arc<dyn CatalogStore>, rng: Arc<dyn RandomSource>) -> Self {
        Self { catalog, rng }
    }

    /// Every location that would currently accept `plan_name`. Read-only.
    pub async fn eligible_locations(&self, plan_name: &str) -> ProvisionResult<Vec<LocationSummary>> {
        let mut eligible = Vec::new();
        for location in self.catalog.locations().await? {
            if !location.admits_plan(plan_name) {
                continue;
            }
            let nodes = self.catalog.public_nodes(location.id).await?;
            if nodes.is_empty() {
                continue;
            }
            let servers = self.catalog.bound_count(location.id).await?;
            if servers >= i64::from(location.max_servers) {
                continue;
            }
            eligible.push(LocationSummary {
                id: location.id,
                short: location.short,
                public_nodes: nodes.len(),
                servers,
                max_servers: location.max_servers,
            });
        }
        Ok(eligible)
    }

    /// Re-checks all eligibility rules for the location a request named.
    #[instrument(skip(self, location_id), fields(location_id = %location_id))]
    pub async fn validate_location(
        &self,
        location_id: LocationId,
        plan_name: &str,
    ) -> ProvisionResult<Location> {
        let location = self.catalog.location(location_id).await?.ok_or_else(|| {
            ProvisionError::invalid("location_id", format!("location {location_id} does not exist"))
        })?;

        let ineligible = || ProvisionError::LocationIneligible {
            location_id,
            plan_name: plan_name.to_string(),
        };

        if !location.admits_plan(plan_name) {
            return Err(ineligible());
        }
        if self.catalog.public_nodes(location_id).await?.is_empty() {
            return Err(ineligible());
        }

        let servers = self.catalog.bound_count(location_id).await?;
        if servers >= i64::from(location.max_servers) {
            return Err(ProvisionError::LocationAtCapacity {
                location_id,
                max_servers: location.max_servers,
            });
        }

        debug!(servers, max_servers = location.max_servers, "Location accepted");
        Ok(location)
    }

    /// Verifies the location is not over its ceiling once the caller's own
    /// claim is counted.
    pub async fn check_claimed_capacity(&self, location: &Location) -> ProvisionResult<()> {
        let servers = self.catalog.bound_count(location.id).await?;
        if servers > i64::from(location.max_servers) {
            return Err(ProvisionError::LocationAtCapacity {
                location_id: location.id,
                max_servers: location.max_servers,
            });
        }
        Ok(())
    }

    /// Uniform pick among the location's public nodes.
    pub async fn select_random_public_node(&self, location: &Location) -> ProvisionResult<Node> {
        let nodes = self.catalog.public_nodes(location.id).await?;
        choose(self.rng.as_ref(), &nodes)
            .cloned()
            .ok_or(ProvisionError::NoEligibleNode {
                location_id: location.id,
            })
    }
}
