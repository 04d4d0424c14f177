//! End-to-end provisioning scenarios against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_id::{AllocationId, InstanceId, NodeId, ReservationId, UserId};
use berth_provisioner::creation::CreationError;
use berth_provisioner::model::{Allocation, AllocationHolder};
use berth_provisioner::orchestrator::ProvisionState;
use berth_provisioner::store::{
    AllocationStore, CatalogStore, EntitlementStore, MemoryStore, StoreResult, Stores,
};
use berth_provisioner::ProvisionError;
use berth_testing::{
    fast_timeout_config, request, FlakyStore, HangingCreation, RecordingCreation,
    RejectingCreation, Scenario, ScriptedRandom,
};

async fn activated(scenario: &Scenario, user: UserId, plan_name: &str) -> i32 {
    scenario
        .store
        .entitlement(user, plan_name)
        .await
        .unwrap()
        .map(|e| e.activated_count)
        .unwrap_or(0)
}

#[tokio::test]
async fn test_provision_builds_spec_and_commits() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["ghcr.io/yolks:java_17"]);
    let location = s.location("eu-west", 5, &[]);
    let node = s.node(location.id, true);
    let allocs = s.allocations(node.id, 2);
    let user = s.buyer("Pro", 2);

    let creation = RecordingCreation::new();
    let orchestrator = s.orchestrator(creation.clone());

    let report = orchestrator
        .provision_with_report(request(user, &plan, &egg, &location, "  survival  "))
        .await;
    let handle = report.result.as_ref().unwrap();
    assert_eq!(handle.name, "survival");
    assert_eq!(report.final_state(), Some(ProvisionState::Committed));

    let specs = creation.specs();
    assert_eq!(specs.len(), 1);
    let spec = &specs[0];
    assert_eq!(spec.name, "survival");
    assert_eq!(spec.owner_id, user);
    assert_eq!(spec.node_id, node.id);
    assert!(allocs.contains(&spec.allocation_id));
    assert_eq!(spec.image, "ghcr.io/yolks:java_17");
    assert_eq!(spec.limits.memory, 2048);
    assert_eq!(spec.limits.swap, 0);
    assert_eq!(spec.limits.io, 500);
    assert!(spec.limits.oom_disabled);
    assert!(!spec.skip_scripts);
    assert_eq!(spec.feature_limits.backups, 2);
    assert_eq!(spec.expires_at - spec.activated_on, chrono::Duration::days(30));
    assert_eq!(spec.plan["Pro"].expires_at, spec.expires_at);
    assert_eq!(spec.environment["SERVER_JARFILE"], "server.jar");
    assert_eq!(spec.environment["BUILD_NUMBER"], "");

    let ent = s.store.entitlement(user, "Pro").await.unwrap().unwrap();
    assert_eq!(ent.activated_count, 1);
    assert_eq!(ent.plan_id, Some(plan.id));
    assert_eq!(ent.first_activated_on, Some(spec.activated_on));

    let bound = s.store.allocation(spec.allocation_id).await.unwrap().unwrap();
    assert_eq!(
        bound.holder,
        Some(AllocationHolder::Instance(handle.instance_id))
    );
}

#[tokio::test]
async fn test_trial_plan_gets_short_expiry() {
    let mut s = Scenario::new();
    let plan = s.plan("Free Tier", true);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("us", 5, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 1);
    let user = s.buyer("Free Tier", 1);

    let creation = RecordingCreation::new();
    s.orchestrator(creation.clone())
        .provision(request(user, &plan, &egg, &location, "lobby"))
        .await
        .unwrap();

    let spec = &creation.specs()[0];
    assert_eq!(spec.expires_at - spec.activated_on, chrono::Duration::days(7));
}

#[tokio::test]
async fn test_capacity_boundary() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 3, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 5);
    let user = s.buyer("Pro", 4);
    let orchestrator = s.orchestrator(RecordingCreation::new());

    for n in 0..3 {
        orchestrator
            .provision(request(user, &plan, &egg, &location, &format!("server-{n}")))
            .await
            .unwrap();
    }

    let err = orchestrator
        .provision(request(user, &plan, &egg, &location, "server-4"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::LocationAtCapacity { max_servers: 3, .. }
    ));
    assert_eq!(activated(&s, user, "Pro").await, 3);
    assert_eq!(s.store.bound_count(location.id).await.unwrap(), 3);
}

#[tokio::test]
async fn test_location_restricted_to_other_plans() {
    let mut s = Scenario::new();
    let free = s.plan("Free", true);
    let pro = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("premium", 10, &["Pro"]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 2);
    let free_user = s.buyer("Free", 1);
    let pro_user = s.buyer("Pro", 1);
    let orchestrator = s.orchestrator(RecordingCreation::new());

    let report = orchestrator
        .provision_with_report(request(free_user, &free, &egg, &location, "cheap"))
        .await;
    assert!(matches!(
        report.result,
        Err(ProvisionError::LocationIneligible { .. })
    ));
    assert!(report.states.contains(&ProvisionState::RollingBack));
    assert_eq!(activated(&s, free_user, "Free").await, 0);

    orchestrator
        .provision(request(pro_user, &pro, &egg, &location, "fancy"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_location_without_public_nodes_is_ineligible() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("internal", 10, &[]);
    let node = s.node(location.id, false);
    s.allocations(node.id, 2);
    let user = s.buyer("Pro", 1);

    let err = s
        .orchestrator(RecordingCreation::new())
        .provision(request(user, &plan, &egg, &location, "hidden"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::LocationIneligible { .. }));
    assert_eq!(activated(&s, user, "Pro").await, 0);
}

#[tokio::test]
async fn test_quota_and_ownership() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 10, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 4);
    let user = s.buyer("Pro", 1);
    let creation = RecordingCreation::new();
    let orchestrator = s.orchestrator(creation.clone());

    orchestrator
        .provision(request(user, &plan, &egg, &location, "first"))
        .await
        .unwrap();

    let err = orchestrator
        .provision(request(user, &plan, &egg, &location, "second"))
        .await
        .unwrap_err();
    match &err {
        ProvisionError::QuotaExceeded {
            plan_name,
            purchased,
        } => {
            assert_eq!(plan_name, "Pro");
            assert_eq!(*purchased, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let stranger = UserId::new();
    let report = orchestrator
        .provision_with_report(request(stranger, &plan, &egg, &location, "nope"))
        .await;
    assert!(matches!(
        report.result,
        Err(ProvisionError::PlanNotOwned { .. })
    ));
    assert!(!report.states.contains(&ProvisionState::RollingBack));

    assert_eq!(creation.specs().len(), 1);
    assert_eq!(s.store.free_allocations(node.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_unknown_location_fails_before_reserving() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 10, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 1);
    let user = s.buyer("Pro", 1);

    let mut req = request(user, &plan, &egg, &location, "lost");
    req.location_id = berth_id::LocationId::new();

    let report = s
        .orchestrator(RecordingCreation::new())
        .provision_with_report(req)
        .await;
    match report.result {
        Err(ProvisionError::InvalidInput { field, .. }) => assert_eq!(field, "location_id"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(
        report.states,
        vec![ProvisionState::Validating, ProvisionState::Failed]
    );
}

#[tokio::test]
async fn test_rejected_creation_rolls_everything_back() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 10, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 2);
    let user = s.buyer("Pro", 1);

    let creation = RejectingCreation::new(503);
    let report = s
        .orchestrator(creation.clone())
        .provision_with_report(request(user, &plan, &egg, &location, "doomed"))
        .await;

    assert!(matches!(
        report.result,
        Err(ProvisionError::CreationServiceFailure(CreationError::Rejected {
            status: 503,
            ..
        }))
    ));
    assert_eq!(
        &report.states[report.states.len() - 3..],
        &[
            ProvisionState::DelegatingCreation,
            ProvisionState::RollingBack,
            ProvisionState::Failed
        ]
    );
    assert_eq!(creation.calls(), 1);
    assert_eq!(activated(&s, user, "Pro").await, 0);
    assert_eq!(s.store.free_allocations(node.id).await.unwrap().len(), 2);
    assert_eq!(s.store.bound_count(location.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_rollback_outlasts_store_outage() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 10, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 1);
    let user = s.buyer("Pro", 1);

    let flaky = FlakyStore::new(s.store.clone(), 4, 3);
    let orchestrator = s.orchestrator_over(flaky.stores(), RejectingCreation::new(503));

    let err = orchestrator
        .provision(request(user, &plan, &egg, &location, "unlucky"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::CreationServiceFailure(_)));
    assert_eq!(flaky.release_calls(), 4);
    assert_eq!(flaky.deactivate_calls(), 5);
    assert_eq!(activated(&s, user, "Pro").await, 0);
    assert_eq!(s.store.free_allocations(node.id).await.unwrap().len(), 1);

    // The slot is usable again.
    let handle = s
        .orchestrator(RecordingCreation::new())
        .provision(request(user, &plan, &egg, &location, "lucky"))
        .await
        .unwrap();
    assert_eq!(handle.name, "lucky");
}

/// Lets a competing request claim a second allocation on the same node right
/// after ours lands.
struct RivalClaims {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl AllocationStore for RivalClaims {
    async fn allocation(&self, id: AllocationId) -> StoreResult<Option<Allocation>> {
        self.inner.allocation(id).await
    }

    async fn free_allocations(&self, node: NodeId) -> StoreResult<Vec<Allocation>> {
        self.inner.free_allocations(node).await
    }

    async fn try_claim(&self, allocation: AllocationId, claim: ReservationId) -> StoreResult<bool> {
        let claimed = self.inner.try_claim(allocation, claim).await?;
        if let Some(ours) = self.inner.allocation(allocation).await? {
            let free = self.inner.free_allocations(ours.node_id).await?;
            if let Some(other) = free.first() {
                self.inner.try_claim(other.id, ReservationId::new()).await?;
            }
        }
        Ok(claimed)
    }

    async fn release_claim(
        &self,
        allocation: AllocationId,
        claim: ReservationId,
    ) -> StoreResult<bool> {
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

#[tokio::test]
async fn test_capacity_recount_after_claim_fails_in_location_step() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 1, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 2);
    let user = s.buyer("Pro", 1);

    let stores = Stores {
        allocations: Arc::new(RivalClaims {
            inner: s.store.clone(),
        }),
        ..s.stores()
    };
    let report = s
        .orchestrator_over(stores, RecordingCreation::new())
        .provision_with_report(request(user, &plan, &egg, &location, "crowded"))
        .await;

    assert!(matches!(
        report.result,
        Err(ProvisionError::LocationAtCapacity { max_servers: 1, .. })
    ));
    assert_eq!(
        &report.states[report.states.len() - 4..],
        &[
            ProvisionState::ClaimingAllocation,
            ProvisionState::SelectingLocation,
            ProvisionState::RollingBack,
            ProvisionState::Failed
        ]
    );
    assert_eq!(activated(&s, user, "Pro").await, 0);
    // Only the rival's claim is left.
    assert_eq!(s.store.bound_count(location.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_creation_timeout_rolls_back() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 10, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 1);
    let user = s.buyer("Pro", 1);

    let orchestrator = s.orchestrator_with(
        std::sync::Arc::new(HangingCreation),
        fast_timeout_config(Duration::from_millis(100)),
        ScriptedRandom::new([]),
    );

    let err = orchestrator
        .provision(request(user, &plan, &egg, &location, "slowpoke"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::CreationServiceFailure(CreationError::Timeout { .. })
    ));
    assert_eq!(activated(&s, user, "Pro").await, 0);
    assert_eq!(s.store.free_allocations(node.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_egg_without_image_rolls_back() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&[]);
    let location = s.location("eu", 10, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 1);
    let user = s.buyer("Pro", 1);

    let creation = RecordingCreation::new();
    let report = s
        .orchestrator(creation.clone())
        .provision_with_report(request(user, &plan, &egg, &location, "imageless"))
        .await;

    assert!(matches!(
        report.result,
        Err(ProvisionError::NoDockerImage { .. })
    ));
    assert!(report.states.contains(&ProvisionState::BuildingSpec));
    assert!(creation.specs().is_empty());
    assert_eq!(activated(&s, user, "Pro").await, 0);
    assert_eq!(s.store.free_allocations(node.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_scripted_placement_picks_node_and_image() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:java8", "img:java17"]);
    let location = s.location("eu", 10, &[]);
    let a = s.node(location.id, true);
    let b = s.node(location.id, true);
    s.allocations(a.id, 1);
    s.allocations(b.id, 1);
    let user = s.buyer("Pro", 1);

    let mut nodes = [a.id, b.id];
    nodes.sort();

    // node index, allocation index, image index
    let creation = RecordingCreation::new();
    s.orchestrator_with(
        creation.clone(),
        Default::default(),
        ScriptedRandom::new([1, 0, 1]),
    )
    .provision(request(user, &plan, &egg, &location, "pinned"))
    .await
    .unwrap();

    let spec = &creation.specs()[0];
    assert_eq!(spec.node_id, nodes[1]);
    assert_eq!(spec.image, "img:java17");
}
