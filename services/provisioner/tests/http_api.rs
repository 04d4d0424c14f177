//! HTTP surface tests, driven through the router without a listener.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use berth_id::UserId;
use berth_provisioner::{api, state::AppState};
use berth_testing::{RecordingCreation, Scenario};
use serde_json::{json, Value};
use tower::ServiceExt;

struct Fixture {
    router: Router,
    user: UserId,
    body: Value,
}

fn fixture(purchased: i32) -> Fixture {
    let mut s = Scenario::new();
    let plan = s.plan("Pro", false);
    let egg = s.egg(&["img:latest"]);
    let location = s.location("eu", 10, &[]);
    let node = s.node(location.id, true);
    s.allocations(node.id, 3);
    let user = s.buyer("Pro", purchased);

    let orchestrator = s.orchestrator(RecordingCreation::new());
    let router = api::create_router(AppState::new(orchestrator));

    let body = json!({
        "name": "survival",
        "egg_id": egg.id,
        "location_id": location.id,
        "plan_name": plan.name,
        "user_id": user,
    });
    Fixture { router, user, body }
}

fn post_server(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/servers")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-request-id", "req-test-1")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_create_server_returns_created() {
    let f = fixture(1);

    let response = f.router.oneshot(post_server(&f.body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = json_body(response).await;
    assert_eq!(body["name"], "survival");
    assert_eq!(
        body["message"],
        "Your server survival has been created and is being installed."
    );
    assert!(body["instance_id"].as_str().unwrap().starts_with("inst_"));
}

#[tokio::test]
async fn test_quota_exceeded_is_problem_json() {
    let f = fixture(1);

    let first = f.router.clone().oneshot(post_server(&f.body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = f.router.oneshot(post_server(&f.body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(
        second.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );

    let problem = json_body(second).await;
    assert_eq!(problem["code"], "quota_exceeded");
    assert_eq!(problem["request_id"], "req-test-1");
    assert!(problem["detail"].as_str().unwrap().contains("Pro"));
}

#[tokio::test]
async fn test_short_name_is_bad_request() {
    let mut f = fixture(1);
    f.body["name"] = json!("ab");

    let response = f.router.oneshot(post_server(&f.body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let problem = json_body(response).await;
    assert_eq!(problem["code"], "invalid_input");
    assert_eq!(problem["details"][0]["field"], "name");
}

#[tokio::test]
async fn test_deploy_options() {
    let f = fixture(2);

    let response = f
        .router
        .clone()
        .oneshot(get(&format!("/v1/users/{}/deploy-options?plan=Pro", f.user)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["plan_name"], "Pro");
    assert_eq!(body["remaining"], 2);
    assert_eq!(body["limits"]["memory"], 2048);
    assert_eq!(body["locations"].as_array().unwrap().len(), 1);
    assert_eq!(body["eggs"].as_array().unwrap().len(), 1);

    let stranger = UserId::new();
    let response = f
        .router
        .clone()
        .oneshot(get(&format!("/v1/users/{stranger}/deploy-options?plan=Pro")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = f
        .router
        .oneshot(get("/v1/users/not-a-user/deploy-options?plan=Pro"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_endpoints() {
    let f = fixture(1);

    let response = f.router.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = f.router.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["store"]["reachable"], true);
}
