//! Channel routing configuration handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use relaycast_common::types::ChannelType;
use relaycast_core::ProviderRegistry;
use relaycast_storage::models::{CreateRoutingConfig, RoutingConfig, UpdateRoutingConfig};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::{require_scope, AppState, AuthContext};
use crate::error::{db_error, error_response, ApiError, ApiResult};

fn validation(message: impl Into<String>) -> ApiError {
    error_response(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message)
}

fn check_provider(
    registry: &ProviderRegistry,
    name: &str,
    channel: ChannelType,
) -> Result<(), String> {
    match registry.get(name) {
        None => Err(format!("Unknown provider '{}'", name)),
        Some(p) if p.channel() != channel => Err(format!(
            "Provider '{}' delivers {} not {}",
            name,
            p.channel(),
            channel
        )),
        Some(_) => Ok(()),
    }
}

fn check_delays(initial: i32, max: i32) -> Result<(), String> {
    if initial <= 0 || max <= 0 {
        return Err("Retry delays must be positive".into());
    }
    if initial > max {
        return Err("initial_retry_delay_secs must not exceed max_retry_delay_secs".into());
    }
    Ok(())
}

/// Reject configs that name unknown providers or carry impossible settings
pub fn validate_create(
    input: &CreateRoutingConfig,
    registry: &ProviderRegistry,
) -> Result<(), String> {
    if input.primary_provider.trim().is_empty() {
        return Err("primary_provider is required".into());
    }
    check_provider(registry, &input.primary_provider, input.channel)?;
    for fallback in &input.fallback_providers {
        check_provider(registry, fallback, input.channel)?;
    }
    if input.max_retries < 0 {
        return Err("max_retries must not be negative".into());
    }
    check_delays(input.initial_retry_delay_secs, input.max_retry_delay_secs)?;
    if input.cost_threshold.is_some_and(|c| c < 0.0) {
        return Err("cost_threshold must not be negative".into());
    }
    Ok(())
}

/// Validate an update against the config it modifies
pub fn validate_update(
    existing: &RoutingConfig,
    input: &UpdateRoutingConfig,
    registry: &ProviderRegistry,
) -> Result<(), String> {
    let channel = existing
        .channel_enum()
        .ok_or_else(|| format!("Stored config has unknown channel '{}'", existing.channel))?;

    if let Some(primary) = &input.primary_provider {
        check_provider(registry, primary, channel)?;
    }
    for fallback in input.fallback_providers.iter().flatten() {
        check_provider(registry, fallback, channel)?;
    }
    if input.max_retries.is_some_and(|r| r < 0) {
        return Err("max_retries must not be negative".into());
    }
    check_delays(
        input
            .initial_retry_delay_secs
            .unwrap_or(existing.initial_retry_delay_secs),
        input.max_retry_delay_secs.unwrap_or(existing.max_retry_delay_secs),
    )?;
    if input.cost_threshold.is_some_and(|c| c < 0.0) {
        return Err("cost_threshold must not be negative".into());
    }
    Ok(())
}

fn not_found(id: Uuid) -> ApiError {
    error_response(
        StatusCode::NOT_FOUND,
        "NOT_FOUND",
        format!("Routing config {} not found", id),
    )
}

pub async fn list_routing_configs(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<RoutingConfig>>> {
    require_scope(&auth, "routing:read")?;
    let configs = state.routing_configs.list().await.map_err(db_error)?;
    Ok(Json(configs))
}

pub async fn create_routing_config(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<CreateRoutingConfig>,
) -> ApiResult<(StatusCode, Json<RoutingConfig>)> {
    require_scope(&auth, "routing:write")?;
    validate_create(&input, state.router.registry()).map_err(validation)?;

    let config = state
        .routing_configs
        .create(input)
        .await
        .map_err(db_error)?;

    info!(
        id = %config.id,
        channel = %config.channel,
        primary = %config.primary_provider,
        "Routing config created"
    );
    Ok((StatusCode::CREATED, Json(config)))
}

pub async fn get_routing_config(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RoutingConfig>> {
    require_scope(&auth, "routing:read")?;
    state
        .routing_configs
        .get(id)
        .await
        .map_err(db_error)?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

/// The config currently governing a channel
pub async fn get_channel_config(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(channel): Path<ChannelType>,
) -> ApiResult<Json<RoutingConfig>> {
    require_scope(&auth, "routing:read")?;
    state
        .routing_configs
        .active_for_channel(channel)
        .await
        .map_err(db_error)?
        .map(Json)
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("No active routing config for {}", channel),
            )
        })
}

pub async fn update_routing_config(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateRoutingConfig>,
) -> ApiResult<Json<RoutingConfig>> {
    require_scope(&auth, "routing:write")?;

    let existing = state
        .routing_configs
        .get(id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found(id))?;
    validate_update(&existing, &input, state.router.registry()).map_err(validation)?;

    let updated = state
        .routing_configs
        .update(id, input)
        .await
        .map_err(db_error)?
        .ok_or_else(|| not_found(id))?;

    info!(id = %id, "Routing config updated");
    Ok(Json(updated))
}

pub async fn delete_routing_config(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_scope(&auth, "routing:write")?;

    if !state.routing_configs.delete(id).await.map_err(db_error)? {
        return Err(not_found(id));
    }
    info!(id = %id, "Routing config deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use relaycast_common::types::{RetryStrategy, RoutingStrategy};
    use relaycast_core::providers::MockProvider;

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProvider::new("twilio", ChannelType::Sms)));
        registry.register(Arc::new(MockProvider::new("plivo", ChannelType::Sms)));
        registry.register(Arc::new(MockProvider::new("sendgrid", ChannelType::Email)));
        registry
    }

    fn create(primary: &str, fallbacks: &[&str]) -> CreateRoutingConfig {
        CreateRoutingConfig {
            channel: ChannelType::Sms,
            primary_provider: primary.into(),
            fallback_providers: fallbacks.iter().map(|s| s.to_string()).collect(),
            routing_strategy: RoutingStrategy::Fallback,
            enable_fallback: true,
            max_retries: 3,
            retry_strategy: RetryStrategy::Exponential,
            initial_retry_delay_secs: 60,
            max_retry_delay_secs: 3600,
            cost_threshold: None,
            is_active: true,
            priority: 0,
            additional_settings: None,
        }
    }

    fn stored() -> RoutingConfig {
        RoutingConfig {
            id: Uuid::nil(),
            channel: "sms".into(),
            primary_provider: "twilio".into(),
            fallback_providers: serde_json::json!(["plivo"]),
            routing_strategy: "fallback".into(),
            enable_fallback: true,
            max_retries: 3,
            retry_strategy: "exponential".into(),
            initial_retry_delay_secs: 60,
            max_retry_delay_secs: 3600,
            cost_threshold: None,
            is_active: true,
            priority: 0,
            additional_settings: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn accepts_known_providers_on_the_channel() {
        assert_eq!(validate_create(&create("twilio", &["plivo"]), &registry()), Ok(()));
    }

    #[test]
    fn rejects_unknown_or_cross_channel_providers() {
        let err = validate_create(&create("nexmo", &[]), &registry()).unwrap_err();
        assert!(err.contains("Unknown provider 'nexmo'"));

        let err = validate_create(&create("twilio", &["sendgrid"]), &registry()).unwrap_err();
        assert!(err.contains("delivers email not sms"));
    }

    #[test]
    fn rejects_inverted_delays() {
        let mut input = create("twilio", &[]);
        input.initial_retry_delay_secs = 7200;
        assert!(validate_create(&input, &registry()).is_err());
    }

    #[test]
    fn update_checks_delays_against_stored_values() {
        let update = UpdateRoutingConfig {
            initial_retry_delay_secs: Some(4000),
            ..Default::default()
        };
        assert!(validate_update(&stored(), &update, &registry()).is_err());

        let update = UpdateRoutingConfig {
            fallback_providers: Some(vec!["plivo".into()]),
            max_retries: Some(5),
            ..Default::default()
        };
        assert_eq!(validate_update(&stored(), &update, &registry()), Ok(()));
    }
}
