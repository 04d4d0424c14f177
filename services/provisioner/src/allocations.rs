//! Allocation claims.
//!
//! Claiming is optimistic: read the node's free allocations, pick one at
//! random, and try a conditional bind. A lost race drops that candidate and
//! tries another, so a claimant gives up only after every allocation it saw
//! as free has gone to someone else.

use std::sync::Arc;

use berth_id::{AllocationId, InstanceId, ReservationId};
use tracing::{debug, info, instrument, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::model::{Allocation, AllocationHolder, Node};
use crate::random::RandomSource;
use crate::store::AllocationStore;

/// An allocation provisionally held by one request.
#[derive(Debug, Clone)]
pub struct AllocationClaim {
    pub allocation: Allocation,
    pub claim_id: ReservationId,
}

impl AllocationClaim {
    pub fn allocation_id(&self) -> AllocationId {
        self.allocation.id
    }
}

pub struct NodeAllocationPicker {
    store: Arc<dyn AllocationStore>,
    rng: Arc<dyn RandomSource>,
}

impl NodeAllocationPicker {
    pub fn new(store: Arc<dyn AllocationStore>, rng: Arc<dyn RandomSource>) -> Self {
        Self { store, rng }
    }

    /// Claims one free allocation on `node` under `claim_id`.
    #[instrument(skip(self, node, claim_id), fields(node_id = %node.id, claim_id = %claim_id))]
    pub async fn claim_free_allocation(
        &self,
        node: &Node,
        claim_id: ReservationId,
    ) -> ProvisionResult<AllocationClaim> {
        let mut candidates = self.store.free_allocations(node.id).await?;
        let mut conflicts = 0usize;

        while !candidates.is_empty() {
            let idx = self.rng.pick_index(candidates.len());
            let mut candidate = candidates.swap_remove(idx);

            if self.store.try_claim(candidate.id, claim_id).await? {
                candidate.holder = Some(AllocationHolder::Claim(claim_id));
                info!(
                    allocation_id = %candidate.id,
                    ip = %candidate.ip,
                    port = candidate.port,
                    conflicts,
                    "Claimed allocation"
                );
                return Ok(AllocationClaim {
                    allocation: candidate,
                    claim_id,
                });
            }

            conflicts += 1;
            debug!(allocation_id = %candidate.id, "Allocation taken by another claimant");
        }

        warn!(conflicts, "No free allocation left on node");
        Err(ProvisionError::NoFreeAllocation { node_id: node.id })
    }

    /// Drops a provisional claim. Safe to call more than once.
    pub async fn release_allocation(&self, claim: &AllocationClaim) -> ProvisionResult<()> {
        let released = self
            .store
            .release_claim(claim.allocation_id(), claim.claim_id)
            .await?;
        if released {
            info!(allocation_id = %claim.allocation_id(), "Released allocation claim");
        }
        Ok(())
    }

    /// Binds the claimed allocation to the created instance.
    pub async fn finalize(&self, claim: &AllocationClaim, instance: InstanceId) -> ProvisionResult<bool> {
        Ok(self
            .store
            .finalize(claim.allocation_id(), claim.claim_id, instance)
            .await?)
    }
}
