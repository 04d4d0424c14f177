//! Concurrent provisioning: quota, allocation exclusivity and capacity hold
//! under contention.

use std::collections::HashSet;

use berth_provisioner::store::{CatalogStore, EntitlementStore};
use berth_provisioner::ProvisionError;
use berth_testing::{request, RecordingCreation, Scenario};
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quota_is_never_exceeded() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 100, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 30);
    let user = s.buyer("Pro", 3);
    let orchestrator = s.orchestrator(RecordingCreation::new());

    let mut tasks = JoinSet::new();
    for n in 0..20 {
        let orchestrator = orchestrator.clone();
        let req = request(user, &plan, &egg, &location, &format!("srv-{n}"));
        tasks.spawn(async move { orchestrator.provision(req).await });
    }

    let mut ok = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => ok += 1,
            Err(ProvisionError::QuotaExceeded { purchased: 3, .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(ok, 3);
    let ent = s.store.entitlement(user, "Pro").await.unwrap().unwrap();
    assert_eq!(ent.activated_count, 3);
    assert_eq!(s.store.bound_count(location.id).await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allocations_are_never_shared() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 100, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 4);
    let users: Vec<_> = (0..10).map(|_| s.buyer("Pro", 1)).collect();

    let creation = RecordingCreation::new();
    let orchestrator = s.orchestrator(creation.clone());

    let mut tasks = JoinSet::new();
    for (n, user) in users.iter().enumerate() {
        let orchestrator = orchestrator.clone();
        let req = request(*user, &plan, &egg, &location, &format!("srv-{n}"));
        tasks.spawn(async move { orchestrator.provision(req).await });
    }

    let mut ok = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => ok += 1,
            Err(ProvisionError::NoFreeAllocation { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 4);

    let specs = creation.specs();
    let distinct: HashSet<_> = specs.iter().map(|spec| spec.allocation_id).collect();
    assert_eq!(distinct.len(), specs.len());

    let mut activations = 0;
    for user in &users {
        let ent = s.store.entitlement(*user, "Pro").await.unwrap().unwrap();
        activations += ent.activated_count;
    }
    assert_eq!(activations, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_location_capacity_holds_under_contention() {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 3, &[]);
    let first = s.node(location.id, true);
    let second = s.node(location.id, true);
    s.allocations(first.id, 6);
    s.allocations(second.id, 6);
    let users: Vec<_> = (0..12).map(|_| s.buyer("Pro", 1)).collect();
    let orchestrator = s.orchestrator(RecordingCreation::new());

    let mut tasks = JoinSet::new();
    for (n, user) in users.iter().enumerate() {
        let orchestrator = orchestrator.clone();
        let req = request(*user, &plan, &egg, &location, &format!("srv-{n}"));
        tasks.spawn(async move { orchestrator.provision(req).await });
    }

    let mut ok = 0i64;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => ok += 1,
            Err(ProvisionError::LocationAtCapacity { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    let bound = s.store.bound_count(location.id).await.unwrap();
    assert!(bound <= 3, "location over capacity: {bound}");
    assert_eq!(bound, ok);

    let mut activations = 0i64;
    for user in &users {
        let ent = s.store.entitlement(*user, "Pro").await.unwrap().unwrap();
        activations += i64::from(ent.activated_count);
    }
    assert_eq!(activations, ok);
}
