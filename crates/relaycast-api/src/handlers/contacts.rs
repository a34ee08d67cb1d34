//! Contact frequency cap handlers

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use relaycast_common::config::FrequencyConfig;
use relaycast_core::ratelimit::{evaluate_frequency, FrequencyDecision};
use relaycast_storage::models::FrequencyControl;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{require_scope, require_tenant_access, AppState, AuthContext};
use crate::error::{api_error, ApiResult};

#[derive(Debug, Serialize)]
pub struct FrequencyResponse {
    #[serde(flatten)]
    pub control: FrequencyControl,
    pub decision: FrequencyDecision,
}

#[derive(Debug, Deserialize)]
pub struct SetCapsRequest {
    pub max_per_day: i32,
    pub max_per_week: i32,
    pub max_per_month: i32,
}

fn respond(control: FrequencyControl) -> Json<FrequencyResponse> {
    let decision = evaluate_frequency(&control, chrono::Utc::now());
    Json(FrequencyResponse { control, decision })
}

/// Counters and caps for a contact, rolled over to the current period
pub async fn get_frequency(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((tenant_id, contact_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<FrequencyResponse>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:read")?;

    let control = state
        .frequency
        .status(tenant_id, contact_id)
        .await
        .map_err(api_error)?;
    Ok(respond(control))
}

pub async fn set_frequency_caps(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((tenant_id, contact_id)): Path<(Uuid, Uuid)>,
    Json(input): Json<SetCapsRequest>,
) -> ApiResult<Json<FrequencyResponse>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:write")?;

    let caps = FrequencyConfig {
        max_per_day: input.max_per_day,
        max_per_week: input.max_per_week,
        max_per_month: input.max_per_month,
    };
    let control = state
        .frequency
        .set_caps(tenant_id, contact_id, caps)
        .await
        .map_err(api_error)?;
    Ok(respond(control))
}
