//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use relaycast_common::types::ProviderHealthState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AppState;

/// Basic health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Detailed health response with component checks
#[derive(Debug, Serialize, Deserialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub providers: ProviderSummary,
}

/// Individual component health status
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// healthy/unhealthy
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Provider counts by tracked health state
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub registered: usize,
    pub active: usize,
    pub degraded: usize,
    pub failed: usize,
}

/// Basic health check
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// Liveness check (is the process running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness check (is the service ready to accept requests)
pub async fn readiness(State(state): State<Arc<AppState>>) -> Result<StatusCode, StatusCode> {
    state
        .db_pool
        .health_check()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(StatusCode::OK)
}

fn provider_summary(state: &AppState) -> ProviderSummary {
    let registry = state.router.registry();
    let health = state.router.health();
    let mut summary = ProviderSummary {
        registered: registry.list().len(),
        ..Default::default()
    };
    for name in registry.list() {
        match health.state(name) {
            ProviderHealthState::Active => summary.active += 1,
            ProviderHealthState::Degraded => summary.degraded += 1,
            ProviderHealthState::Failed => summary.failed += 1,
        }
    }
    summary
}

/// Detailed health check with all dependencies
pub async fn health_detailed(State(state): State<Arc<AppState>>) -> Json<DetailedHealthResponse> {
    let start = std::time::Instant::now();
    let db_check = state.db_pool.health_check().await;
    let db_latency = start.elapsed().as_millis() as u64;

    let db_status = match db_check {
        Ok(_) => ComponentHealth {
            status: "healthy".to_string(),
            latency_ms: Some(db_latency),
            error: None,
        },
        Err(e) => ComponentHealth {
            status: "unhealthy".to_string(),
            latency_ms: None,
            error: Some(e.to_string()),
        },
    };

    let providers = provider_summary(&state);

    // Every provider failed means nothing can be delivered
    let overall_status = if db_status.status != "healthy" {
        "unhealthy"
    } else if providers.registered > 0 && providers.failed == providers.registered {
        "degraded"
    } else {
        "healthy"
    };

    Json(DetailedHealthResponse {
        status: overall_status.to_string(),
        checks: HealthChecks {
            database: db_status,
            providers,
        },
    })
}
