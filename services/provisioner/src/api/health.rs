//! Liveness and readiness probes.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub checked_at: String,
    /// Only reported by readiness.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreHealth>,
}

#[derive(Debug, Serialize)]
pub struct StoreHealth {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Health {
    fn new(status: &'static str, store: Option<StoreHealth>) -> Self {
        Self {
            status,
            service: "provisioner",
            version: env!("CARGO_PKG_VERSION"),
            checked_at: Utc::now().to_rfc3339(),
            store,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

async fn healthz() -> Json<Health> {
    Json(Health::new("ok", None))
}

/// 503 while the backing store does not answer.
async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<Health>) {
    match state.orchestrator().health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(Health::new(
                "ok",
                Some(StoreHealth {
                    reachable: true,
                    error: None,
                }),
            )),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Health::new(
                "degraded",
                Some(StoreHealth {
                    reachable: false,
                    error: Some(e.to_string()),
                }),
            )),
        ),
    }
}
