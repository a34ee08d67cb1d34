//! Delivery statistics handlers

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use relaycast_common::types::ChannelType;
use relaycast_core::stats::{ChannelStats, OverallStats, StatsPeriod};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::{require_scope, AppState, AuthContext};
use crate::error::{api_error, ApiResult};

/// Period bounds; the last 30 days when omitted
#[derive(Debug, Default, Deserialize)]
pub struct PeriodQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub async fn channel_stats(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(channel): Path<ChannelType>,
    Query(query): Query<PeriodQuery>,
) -> ApiResult<Json<ChannelStats>> {
    require_scope(&auth, "stats:read")?;
    let period = StatsPeriod::resolve(query.from, query.to);
    let stats = state
        .stats
        .channel(channel, &period)
        .await
        .map_err(api_error)?;
    Ok(Json(stats))
}

pub async fn overall_stats(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<PeriodQuery>,
) -> ApiResult<Json<OverallStats>> {
    require_scope(&auth, "stats:read")?;
    let stats = state
        .stats
        .overall(StatsPeriod::resolve(query.from, query.to))
        .await
        .map_err(api_error)?;
    Ok(Json(stats))
}
