//! Provider health handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use relaycast_core::providers::{check_all, ProviderCheck};
use relaycast_core::routing::ProviderHealth;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::auth::{require_scope, AppState, AuthContext};
use crate::error::{error_response, ApiResult};

#[derive(Debug, Serialize)]
pub struct ProvidersHealthResponse {
    /// Router view built from recent send outcomes
    pub tracked: Vec<ProviderHealth>,
    /// Live health check of every registered provider
    pub checks: Vec<ProviderCheck>,
}

pub async fn providers_health(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<ProvidersHealthResponse>> {
    require_scope(&auth, "routing:read")?;

    let checks = check_all(state.router.registry()).await;
    Ok(Json(ProvidersHealthResponse {
        tracked: state.router.health().snapshot(),
        checks,
    }))
}

/// Return a provider to Active, e.g. after an outage is confirmed over
pub async fn reset_provider_health(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    require_scope(&auth, "routing:write")?;

    if state.router.registry().get(&name).is_none() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("Provider {} not registered", name),
        ));
    }
    state.router.health().reset(&name);
    info!(provider = %name, "Provider health reset");
    Ok(StatusCode::NO_CONTENT)
}
