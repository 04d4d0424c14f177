//! Server provisioning endpoints.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use berth_id::{EggId, InstanceId, LocationId, UserId};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::request_id;
use crate::api::error::ApiError;
use crate::model::ProvisioningRequest;
use crate::orchestrator::DeployOptions;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", post(create_server))
}

pub fn user_routes() -> Router<AppState> {
    Router::new().route("/deploy-options", get(deploy_options))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub egg_id: EggId,
    pub location_id: LocationId,
    pub plan_name: String,
    pub user_id: UserId,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct CreateServerResponse {
    pub instance_id: InstanceId,
    pub name: String,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct DeployOptionsQuery {
    pub plan: String,
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateServerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = request_id(&headers);
    let span = tracing::info_span!("create_server", request_id = %request_id);

    let request = ProvisioningRequest {
        name: req.name,
        egg_id: req.egg_id,
        location_id: req.location_id,
        plan_name: req.plan_name,
        user_id: req.user_id,
    };

    let handle = state
        .orchestrator()
        .provision(request)
        .instrument(span)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    let message = format!(
        "Your server {} has been created and is being installed.",
        handle.name
    );
    Ok((
        StatusCode::CREATED,
        Json(CreateServerResponse {
            instance_id: handle.instance_id,
            name: handle.name,
            title: "Server created".to_string(),
            message,
        }),
    ))
}

async fn deploy_options(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(query): Query<DeployOptionsQuery>,
) -> Result<Json<DeployOptions>, ApiError> {
    let request_id = request_id(&headers);

    let user_id: UserId = user_id.parse().map_err(|e| {
        ApiError::bad_request("invalid_user_id", format!("invalid user id: {e}"))
            .with_request_id(request_id.clone())
    })?;

    let options = state
        .orchestrator()
        .deploy_options(user_id, &query.plan)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    Ok(Json(options))
}
