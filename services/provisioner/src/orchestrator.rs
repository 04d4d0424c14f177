//! Provisioning state machine.
//!
//! ```text
//! Validating -> ReservingEntitlement -> SelectingLocation -> SelectingNode
//!   -> ClaimingAllocation -> SelectingLocation (recount) -> BuildingSpec
//!   -> DelegatingCreation -> Committed
//!
//! any failure after ReservingEntitlement succeeded -> RollingBack -> Failed
//! ```
//!
//! Claims are taken before the creation call and each one has a matching
//! release. Every attempt runs on its own task, so a caller that goes away
//! mid-request cannot interrupt rollback.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use berth_id::{EggId, RequestId, UserId};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

use crate::allocations::{AllocationClaim, NodeAllocationPicker};
use crate::config::EngineConfig;
use crate::creation::{CreationError, CreationService};
use crate::error::{ProvisionError, ProvisionResult};
use crate::ledger::{ActivationMetadata, EntitlementLedger, ReservationToken};
use crate::locations::{LocationCapacityIndex, LocationSummary};
use crate::model::{Egg, Plan, PlanLimits, ProvisionedServerHandle, ProvisioningRequest};
use crate::random::{RandomSource, ThreadRandom};
use crate::spec_builder::{BuildInput, ProvisioningSpecBuilder};
use crate::store::{CatalogStore, Stores};

const MIN_NAME_CHARS: usize = 3;
const MAX_NAME_CHARS: usize = 191;
const ROLLBACK_BACKOFF_START: Duration = Duration::from_millis(50);
const ROLLBACK_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Validating,
    ReservingEntitlement,
    SelectingLocation,
    SelectingNode,
    ClaimingAllocation,
    BuildingSpec,
    DelegatingCreation,
    Committed,
    RollingBack,
    Failed,
}

/// Outcome of one attempt plus the states it passed through.
#[derive(Debug)]
pub struct AttemptReport {
    pub result: ProvisionResult<ProvisionedServerHandle>,
    pub states: Vec<ProvisionState>,
}

impl AttemptReport {
    pub fn final_state(&self) -> Option<ProvisionState> {
        self.states.last().copied()
    }
}

/// Claims held by an in-flight attempt.
struct Attempt {
    states: Vec<ProvisionState>,
    reservation: Option<ReservationToken>,
    claim: Option<AllocationClaim>,
}

impl Attempt {
    fn new() -> Self {
        Self {
            states: Vec::with_capacity(8),
            reservation: None,
            claim: None,
        }
    }

    fn enter(&mut self, state: ProvisionState) {
        debug!(state = ?state, "Provisioning state");
        self.states.push(state);
    }

    fn holds_claims(&self) -> bool {
        self.reservation.is_some() || self.claim.is_some()
    }

    fn current(&self) -> Option<ProvisionState> {
        self.states.last().copied()
    }
}

/// What a user may deploy on one of their plans.
#[derive(Debug, Clone, Serialize)]
pub struct DeployOptions {
    pub plan_name: String,
    pub limits: PlanLimits,
    pub remaining: i32,
    pub locations: Vec<LocationSummary>,
    pub eggs: Vec<EggSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EggSummary {
    pub id: EggId,
    pub name: String,
    pub description: String,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Arc<dyn CatalogStore>,
    ledger: EntitlementLedger,
    index: LocationCapacityIndex,
    picker: NodeAllocationPicker,
    builder: ProvisioningSpecBuilder,
    creation: Arc<dyn CreationService>,
    creation_timeout: Duration,
}

impl Orchestrator {
    pub fn new(stores: Stores, creation: Arc<dyn CreationService>, config: EngineConfig) -> Self {
        Self::with_random(stores, creation, config, Arc::new(ThreadRandom))
    }

    /// Like [`Orchestrator::new`] with an explicit source for placement randomness.
    pub fn with_random(
        stores: Stores,
        creation: Arc<dyn CreationService>,
        config: EngineConfig,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        let inner = Inner {
            catalog: stores.catalog.clone(),
            ledger: EntitlementLedger::new(stores.entitlements),
            index: LocationCapacityIndex::new(stores.catalog, rng.clone()),
            picker: NodeAllocationPicker::new(stores.allocations, rng.clone()),
            builder: ProvisioningSpecBuilder::new(rng, config.policy),
            creation,
            creation_timeout: config.creation_timeout,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn ledger(&self) -> &EntitlementLedger {
        &self.inner.ledger
    }

    pub fn index(&self) -> &LocationCapacityIndex {
        &self.inner.index
    }

    pub async fn health_check(&self) -> ProvisionResult<()> {
        Ok(self.inner.catalog.health_check().await?)
    }

    /// Provisions one server or fails with every claim given back.
    pub async fn provision(
        &self,
        request: ProvisioningRequest,
    ) -> ProvisionResult<ProvisionedServerHandle> {
        self.provision_with_report(request).await.result
    }

    pub async fn provision_with_report(&self, request: ProvisioningRequest) -> AttemptReport {
        let this = self.clone();
        let task = tokio::spawn(async move { this.run(request).await }.instrument(Span::current()));

        match task.await {
            Ok(report) => report,
            Err(e) => AttemptReport {
                result: Err(ProvisionError::Internal(format!(
                    "provisioning task aborted: {e}"
                ))),
                states: vec![ProvisionState::Failed],
            },
        }
    }

    #[instrument(
        skip(self, request),
        fields(
            request_id = %RequestId::new(),
            user_id = %request.user_id,
            plan_name = %request.plan_name,
        )
    )]
    async fn run(&self, request: ProvisioningRequest) -> AttemptReport {
        let mut attempt = Attempt::new();
        let result = self.advance(&request, &mut attempt).await;

        if let Err(e) = &result {
            let failed_in = attempt.current();
            if attempt.holds_claims() {
                self.roll_back(&mut attempt).await;
            }
            attempt.enter(ProvisionState::Failed);
            warn!(
                code = e.code(),
                error = %e,
                failed_in = ?failed_in,
                "Provisioning request failed"
            );
        }

        AttemptReport {
            result,
            states: attempt.states,
        }
    }

    async fn advance(
        &self,
        request: &ProvisioningRequest,
        attempt: &mut Attempt,
    ) -> ProvisionResult<ProvisionedServerHandle> {
        let inner = &self.inner;

        attempt.enter(ProvisionState::Validating);
        let (plan, egg) = self.validate(request).await?;

        attempt.enter(ProvisionState::ReservingEntitlement);
        let token = inner
            .ledger
            .reserve(request.user_id, &request.plan_name)
            .await?;
        attempt.reservation = Some(token.clone());

        attempt.enter(ProvisionState::SelectingLocation);
        let location = inner
            .index
            .validate_location(request.location_id, &request.plan_name)
            .await?;

        attempt.enter(ProvisionState::SelectingNode);
        let node = inner.index.select_random_public_node(&location).await?;

        attempt.enter(ProvisionState::ClaimingAllocation);
        let claim = inner.picker.claim_free_allocation(&node, token.id()).await?;
        attempt.claim = Some(claim.clone());

        // Concurrent requests may all have passed the capacity check; the
        // count including our own claim settles it.
        attempt.enter(ProvisionState::SelectingLocation);
        inner.index.check_claimed_capacity(&location).await?;

        attempt.enter(ProvisionState::BuildingSpec);
        let activated_on = Utc::now();
        let spec = inner.builder.build(BuildInput {
            plan: &plan,
            egg: &egg,
            node: &node,
            allocation: &claim.allocation,
            name: request.name.trim(),
            owner: request.user_id,
            activated_on,
        })?;

        attempt.enter(ProvisionState::DelegatingCreation);
        let handle = match tokio::time::timeout(
            inner.creation_timeout,
            inner.creation.create(&spec),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(ProvisionError::CreationServiceFailure(e)),
            Err(_) => {
                return Err(ProvisionError::CreationServiceFailure(
                    CreationError::Timeout {
                        secs: inner.creation_timeout.as_secs(),
                    },
                ))
            }
        };

        // The server exists from here on; nothing below may roll back.
        attempt.reservation = None;
        attempt.claim = None;

        match inner.picker.finalize(&claim, handle.instance_id).await {
            Ok(true) => {}
            Ok(false) => warn!(
                allocation_id = %claim.allocation_id(),
                "Allocation claim vanished before it could be bound"
            ),
            Err(e) => error!(
                allocation_id = %claim.allocation_id(),
                error = %e,
                "Failed to bind allocation to instance"
            ),
        }

        let metadata = ActivationMetadata {
            plan_id: plan.id,
            activated_on,
        };
        if let Err(e) = inner.ledger.commit(&token, metadata).await {
            error!(error = %e, "Failed to record plan activation");
        }

        attempt.enter(ProvisionState::Committed);
        info!(
            instance_id = %handle.instance_id,
            node_id = %node.id,
            allocation_id = %claim.allocation_id(),
            image = %spec.image,
            expires_at = %spec.expires_at,
            "Server provisioned"
        );

        Ok(ProvisionedServerHandle {
            instance_id: handle.instance_id,
            name: spec.name,
        })
    }

    /// Input shape and referenced entities. Nothing is reserved yet.
    async fn validate(&self, request: &ProvisioningRequest) -> ProvisionResult<(Plan, Egg)> {
        let name_chars = request.name.trim().chars().count();
        if name_chars < MIN_NAME_CHARS {
            return Err(ProvisionError::invalid(
                "name",
                format!("must be at least {MIN_NAME_CHARS} characters"),
            ));
        }
        if name_chars > MAX_NAME_CHARS {
            return Err(ProvisionError::invalid(
                "name",
                format!("must be at most {MAX_NAME_CHARS} characters"),
            ));
        }

        if request.plan_name.trim().is_empty() {
            return Err(ProvisionError::invalid("plan_name", "cannot be empty"));
        }

        let catalog = &self.inner.catalog;
        let plan = catalog
            .plan_by_name(&request.plan_name)
            .await?
            .ok_or_else(|| ProvisionError::PlanNotFound {
                plan_name: request.plan_name.clone(),
            })?;

        let egg = catalog
            .egg(request.egg_id)
            .await?
            .ok_or(ProvisionError::EggNotFound {
                egg_id: request.egg_id,
            })?;

        if catalog.location(request.location_id).await?.is_none() {
            return Err(ProvisionError::invalid(
                "location_id",
                format!("location {} does not exist", request.location_id),
            ));
        }

        Ok((plan, egg))
    }

    /// Gives back every claim the attempt holds. Each release is retried
    /// until the store accepts it; a claim is never abandoned.
    async fn roll_back(&self, attempt: &mut Attempt) {
        attempt.enter(ProvisionState::RollingBack);

        if let Some(claim) = attempt.claim.take() {
            retry_until_released("allocation claim", || {
                self.inner.picker.release_allocation(&claim)
            })
            .await;
        }

        if let Some(token) = attempt.reservation.take() {
            retry_until_released("plan activation", || self.inner.ledger.release(&token)).await;
        }
    }

    /// Plan limits, eligible locations and deployable eggs for one of the
    /// user's plans. Read-only.
    #[instrument(skip(self, user), fields(user_id = %user))]
    pub async fn deploy_options(&self, user: UserId, plan_name: &str) -> ProvisionResult<DeployOptions> {
        let entitlement = self
            .inner
            .ledger
            .entitlement(user, plan_name)
            .await?
            .ok_or_else(|| ProvisionError::PlanNotOwned {
                plan_name: plan_name.to_string(),
            })?;

        let plan = self
            .inner
            .catalog
            .plan_by_name(plan_name)
            .await?
            .ok_or_else(|| ProvisionError::PlanNotFound {
                plan_name: plan_name.to_string(),
            })?;

        let locations = self.inner.index.eligible_locations(plan_name).await?;
        let eggs = self
            .inner
            .catalog
            .eggs()
            .await?
            .into_iter()
            .filter(Egg::is_deployable)
            .map(|egg| EggSummary {
                id: egg.id,
                name: egg.name,
                description: egg.description,
            })
            .collect();

        Ok(DeployOptions {
            plan_name: plan.name.clone(),
            limits: plan.limits(),
            remaining: entitlement.remaining(),
            locations,
            eggs,
        })
    }
}

/// Runs `release` until it succeeds, backing off exponentially up to
/// [`ROLLBACK_BACKOFF_MAX`] between failures.
async fn retry_until_released<F, Fut>(what: &str, mut release: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProvisionResult<()>>,
{
    let mut backoff = ROLLBACK_BACKOFF_START;
    let mut failures = 0u32;

    loop {
        match release().await {
            Ok(()) => {
                if failures > 0 {
                    info!(what, failures, "Rollback release succeeded after retries");
                }
                return;
            }
            Err(e) => {
                failures += 1;
                error!(
                    what,
                    failures,
                    retry_in_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Rollback release failed"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(ROLLBACK_BACKOFF_MAX);
            }
        }
    }
}
