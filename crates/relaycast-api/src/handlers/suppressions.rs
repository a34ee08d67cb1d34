//! Suppression list handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use relaycast_common::types::SuppressionType;
use relaycast_storage::models::Suppression;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{require_scope, require_tenant_access, AppState, AuthContext};
use crate::error::{api_error, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ListSuppressionsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct AddSuppressionRequest {
    pub address: String,
    #[serde(default = "default_type")]
    pub suppression_type: SuppressionType,
    pub reason: Option<String>,
}

fn default_type() -> SuppressionType {
    SuppressionType::Manual
}

pub async fn list_suppressions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ListSuppressionsQuery>,
) -> ApiResult<Json<Vec<Suppression>>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "suppressions:read")?;

    let entries = state
        .suppressions
        .list(tenant_id, query.limit.clamp(1, 1000), query.offset.max(0))
        .await
        .map_err(api_error)?;
    Ok(Json(entries))
}

/// Suppress an address; repeating the call updates type and reason
pub async fn add_suppression(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<AddSuppressionRequest>,
) -> ApiResult<(StatusCode, Json<Suppression>)> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "suppressions:write")?;

    let entry = state
        .suppressions
        .add(tenant_id, &input.address, input.suppression_type, input.reason)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn remove_suppression(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((tenant_id, address)): Path<(Uuid, String)>,
) -> ApiResult<StatusCode> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "suppressions:write")?;

    state
        .suppressions
        .remove(tenant_id, &address)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}
