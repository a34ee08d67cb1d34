//! API rate limit administration

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use relaycast_common::types::{TenantId, UserId};
use relaycast_core::ratelimit::{RateLimitKey, RateLimitStatus};
use relaycast_storage::models::{
    ApiRateLimit, CreateApiRateLimit, RateLimitLog, RateLimitLogFilter, UpdateApiRateLimit,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::{require_scope, AppState, AuthContext};
use crate::error::{api_error, ApiResult};
use crate::ratelimit::client_ip;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub user_id: Option<UserId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

/// Body of a check-and-record request
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub endpoint: String,
    pub user_id: Option<UserId>,
    pub tenant_id: Option<TenantId>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub endpoint: String,
}

pub async fn list_rate_limits(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<ApiRateLimit>>> {
    require_scope(&auth, "admin")?;
    let limits = state
        .rate_limiter
        .list(page.limit.clamp(1, 500), page.offset.max(0))
        .await
        .map_err(api_error)?;
    Ok(Json(limits))
}

pub async fn create_rate_limit(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<CreateApiRateLimit>,
) -> ApiResult<(StatusCode, Json<ApiRateLimit>)> {
    require_scope(&auth, "admin")?;
    let limit = state.rate_limiter.create(input).await.map_err(api_error)?;
    info!(
        id = %limit.id,
        pattern = %limit.endpoint_pattern,
        max_requests = limit.max_requests,
        window_secs = limit.time_window_secs,
        "API rate limit created"
    );
    Ok((StatusCode::CREATED, Json(limit)))
}

pub async fn get_rate_limit(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiRateLimit>> {
    require_scope(&auth, "admin")?;
    let limit = state.rate_limiter.get(id).await.map_err(api_error)?;
    Ok(Json(limit))
}

pub async fn update_rate_limit(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateApiRateLimit>,
) -> ApiResult<Json<ApiRateLimit>> {
    require_scope(&auth, "admin")?;
    let limit = state
        .rate_limiter
        .update(id, input)
        .await
        .map_err(api_error)?;
    Ok(Json(limit))
}

pub async fn delete_rate_limit(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_scope(&auth, "admin")?;
    state.rate_limiter.delete(id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start a fresh window for one limit
pub async fn reset_rate_limit(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_scope(&auth, "admin")?;
    state.rate_limiter.reset(id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Recorded violations, newest first
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<RateLimitLog>>> {
    require_scope(&auth, "admin")?;
    let filter = RateLimitLogFilter {
        user_id: query.user_id,
        from: query.from,
        to: query.to,
    };
    let logs = state
        .rate_limiter
        .violations(&filter, query.limit.map(|l| l.clamp(1, 1000)), query.offset.max(0))
        .await
        .map_err(api_error)?;
    Ok(Json(logs))
}

/// Consume one request for an arbitrary caller, as a gateway would
pub async fn check_rate_limit(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    Json(input): Json<CheckRequest>,
) -> ApiResult<Json<RateLimitStatus>> {
    require_scope(&auth, "admin")?;
    let key = RateLimitKey {
        user_id: input.user_id,
        tenant_id: input.tenant_id,
        endpoint: input.endpoint,
        ip_address: input.ip_address.or_else(|| client_ip(&headers)),
    };
    let status = state
        .rate_limiter
        .check_and_record(&key)
        .await
        .map_err(api_error)?;
    Ok(Json(status))
}

/// The caller's own quota for an endpoint, without consuming it
pub async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<RateLimitStatus>> {
    let key = RateLimitKey {
        user_id: auth.user_id,
        tenant_id: Some(auth.tenant_id),
        endpoint: query.endpoint,
        ip_address: None,
    };
    let status = state.rate_limiter.check(&key).await.map_err(api_error)?;
    Ok(Json(status))
}
