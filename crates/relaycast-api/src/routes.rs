//! API routes

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, AppState};
use crate::handlers::{
    api_keys, campaigns, contacts, health, messages, metrics, providers, rate_limits, routing_configs,
    stats, suppressions, webhooks,
};
use crate::ratelimit::rate_limit_middleware;

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness))
        .route("/detailed", get(health::health_detailed))
        .with_state(state.clone());

    // Provider callbacks authenticate by signature, not API key
    let webhook_routes = Router::new()
        .route("/providers/:provider/status", post(webhooks::provider_status))
        .with_state(state.clone());

    let message_routes = Router::new()
        .route("/", get(messages::list_messages))
        .route("/", post(messages::enqueue_message))
        .route("/bulk", post(messages::enqueue_bulk))
        .route("/:id", get(messages::get_message))
        .route("/:id/attempts", get(messages::list_attempts))
        .route("/:id/retry", post(messages::retry_message))
        .route("/:id/cancel", post(messages::cancel_message))
        .route("/:id/send-now", post(messages::send_now));

    let campaign_routes = Router::new()
        .route("/:campaign_id/report", get(campaigns::delivery_report))
        .route("/:campaign_id/retry-failed", post(campaigns::retry_failed));

    let suppression_routes = Router::new()
        .route("/", get(suppressions::list_suppressions))
        .route("/", post(suppressions::add_suppression))
        .route("/:address", delete(suppressions::remove_suppression));

    let contact_routes = Router::new()
        .route("/:contact_id/frequency", get(contacts::get_frequency))
        .route("/:contact_id/frequency", put(contacts::set_frequency_caps));

    let api_key_routes = Router::new().route("/", post(api_keys::create_api_key));

    let routing_config_routes = Router::new()
        .route("/", get(routing_configs::list_routing_configs))
        .route("/", post(routing_configs::create_routing_config))
        .route("/channel/:channel", get(routing_configs::get_channel_config))
        .route("/:id", get(routing_configs::get_routing_config))
        .route("/:id", put(routing_configs::update_routing_config))
        .route("/:id", delete(routing_configs::delete_routing_config));

    let rate_limit_routes = Router::new()
        .route("/", get(rate_limits::list_rate_limits))
        .route("/", post(rate_limits::create_rate_limit))
        .route("/logs", get(rate_limits::list_logs))
        .route("/check", post(rate_limits::check_rate_limit))
        .route("/status", get(rate_limits::rate_limit_status))
        .route("/:id", get(rate_limits::get_rate_limit))
        .route("/:id", put(rate_limits::update_rate_limit))
        .route("/:id", delete(rate_limits::delete_rate_limit))
        .route("/:id/reset", post(rate_limits::reset_rate_limit));

    let provider_routes = Router::new()
        .route("/health", get(providers::providers_health))
        .route("/:name/health/reset", post(providers::reset_provider_health));

    let stats_routes = Router::new()
        .route("/channels/:channel", get(stats::channel_stats))
        .route("/overall", get(stats::overall_stats));

    // Layers run bottom-up: authenticate, then rate limit
    let api_v1 = Router::new()
        .nest("/tenants/:tenant_id/messages", message_routes)
        .nest("/tenants/:tenant_id/campaigns", campaign_routes)
        .nest("/tenants/:tenant_id/suppressions", suppression_routes)
        .nest("/tenants/:tenant_id/contacts", contact_routes)
        .nest("/tenants/:tenant_id/api-keys", api_key_routes)
        .nest("/routing-configs", routing_config_routes)
        .nest("/rate-limits", rate_limit_routes)
        .nest("/providers", provider_routes)
        .nest("/stats", stats_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics::metrics))
        .with_state(state);

    Router::new()
        .nest("/health", health_routes)
        .nest("/webhooks", webhook_routes)
        .nest("/api/v1", api_v1)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}
