//! Campaign delivery handlers

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use relaycast_core::messages::DeliveryReport;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::{require_scope, require_tenant_access, AppState, AuthContext};
use crate::error::{api_error, ApiResult};

#[derive(Debug, Serialize)]
pub struct RetryFailedResponse {
    pub campaign_id: Uuid,
    pub requeued: u64,
}

/// Per-status counts, rates and cost for a campaign
pub async fn delivery_report(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<DeliveryReport>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:read")?;

    let report = state
        .messages
        .delivery_report(tenant_id, campaign_id)
        .await
        .map_err(api_error)?;
    Ok(Json(report))
}

/// Requeue every failed message of a campaign that has retries left
pub async fn retry_failed(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<RetryFailedResponse>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:write")?;

    let requeued = state
        .messages
        .retry_failed_for_campaign(tenant_id, campaign_id)
        .await
        .map_err(api_error)?;

    info!(campaign_id = %campaign_id, requeued, "Requeued failed campaign messages");
    Ok(Json(RetryFailedResponse {
        campaign_id,
        requeued,
    }))
}
