//! API v1 routes.

mod servers;

use axum::http::HeaderMap;
use axum::Router;
use berth_id::RequestId;

use crate::api::REQUEST_ID_HEADER;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/servers", servers::routes())
        // Deploy options are scoped to the purchasing user: /v1/users/{user_id}/deploy-options
        .nest("/users/{user_id}", servers::user_routes())
}

/// The caller's request id, or a fresh one.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| RequestId::new().to_string())
}
