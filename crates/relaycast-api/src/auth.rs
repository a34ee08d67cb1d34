//! Authentication module

use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use relaycast_common::config::Config;
use relaycast_common::types::{TenantId, UserId};
use relaycast_core::ratelimit::{DbProviderQuota, FrequencyGuard};
use relaycast_core::routing::{
    DbAttemptRecorder, DbPolicySource, HealthThresholds, MessageRouter, ProviderHealthTracker,
};
use relaycast_core::{
    ApiRateLimiter, DeliveryMetrics, DeliveryReconciler, DeliveryWorker, MessageService,
    ProviderRegistry, StatsService, SuppressionList,
};
use relaycast_storage::repository::api_keys::ApiKey;
use relaycast_storage::repository::{
    ApiRateLimitRepository, CallbackRepository, DeliveryAttemptRepository,
    FrequencyControlRepository, MessageRepository, ProviderRateLimitRepository,
    RateLimitLogRepository, RoutingConfigRepository, SuppressionRepository,
};
use relaycast_storage::{ApiKeyRepository, ApiKeyRepositoryTrait, DatabasePool};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{api_error, error_response, ApiError, ApiResult};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DatabasePool,
    pub messages: MessageService,
    pub worker: Arc<DeliveryWorker>,
    pub router: Arc<MessageRouter>,
    pub routing_configs: RoutingConfigRepository,
    pub rate_limiter: ApiRateLimiter,
    pub suppressions: SuppressionList,
    pub frequency: FrequencyGuard,
    pub reconciler: DeliveryReconciler,
    pub stats: StatsService,
    pub metrics: DeliveryMetrics,
    /// Shared secret for provider callbacks; unsigned callbacks are accepted when unset
    pub webhook_secret: Option<String>,
}

impl AppState {
    /// Wire the database-backed services around one pool
    pub fn build(
        db_pool: DatabasePool,
        config: &Config,
        registry: ProviderRegistry,
        metrics: DeliveryMetrics,
    ) -> Self {
        let pool = db_pool.pool().clone();
        let message_repo = MessageRepository::new(pool.clone());
        let attempt_repo = DeliveryAttemptRepository::new(pool.clone());
        let routing_configs = RoutingConfigRepository::new(pool.clone());

        let health = Arc::new(ProviderHealthTracker::new(HealthThresholds::from(
            &config.health,
        )));
        let router = Arc::new(
            MessageRouter::new(
                Arc::new(registry),
                health,
                Arc::new(DbPolicySource::new(routing_configs.clone())),
                Arc::new(DbProviderQuota::new(
                    ProviderRateLimitRepository::new(pool.clone()),
                    config.provider_limits.clone(),
                )),
                Arc::new(DbAttemptRecorder::new(attempt_repo.clone())),
            )
            .with_metrics(metrics.clone()),
        );

        let suppressions = SuppressionList::new(SuppressionRepository::new(pool.clone()));
        let frequency = FrequencyGuard::new(
            FrequencyControlRepository::new(pool.clone()),
            config.frequency,
        );

        let worker = Arc::new(
            DeliveryWorker::new(
                message_repo.clone(),
                router.clone(),
                suppressions.clone(),
                frequency.clone(),
                config.delivery.clone(),
            )
            .with_metrics(metrics.clone()),
        );

        Self {
            messages: MessageService::new(
                message_repo.clone(),
                attempt_repo.clone(),
                config.delivery.default_max_retries,
            ),
            worker,
            router,
            routing_configs,
            rate_limiter: ApiRateLimiter::new(
                ApiRateLimitRepository::new(pool.clone()),
                RateLimitLogRepository::new(pool.clone()),
            ),
            suppressions: suppressions.clone(),
            frequency,
            reconciler: DeliveryReconciler::new(
                message_repo,
                CallbackRepository::new(pool),
                suppressions,
            ),
            stats: StatsService::new(attempt_repo),
            metrics,
            webhook_secret: config.api.webhook_secret.clone(),
            db_pool,
        }
    }
}

/// Authenticated context extracted from API key
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The tenant ID this API key belongs to
    pub tenant_id: TenantId,
    /// The user ID this API key belongs to (if any)
    pub user_id: Option<UserId>,
    /// Scopes granted to this API key
    pub scopes: Vec<String>,
    /// API key ID for audit logging
    pub api_key_id: Uuid,
}

impl AuthContext {
    /// Check if the authenticated context has a specific scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == "*" || s == scope)
    }

    /// Check if the request is authorized for the given tenant
    pub fn is_authorized_for_tenant(&self, tenant_id: TenantId) -> bool {
        self.tenant_id == tenant_id
    }
}

/// Extract API key from request
pub fn extract_api_key(req: &Request) -> Option<&str> {
    if let Some(auth) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token);
            }
        }
    }

    if let Some(key) = req.headers().get("x-api-key") {
        if let Ok(key_str) = key.to_str() {
            return Some(key_str);
        }
    }

    None
}

const KEY_PREFIX: &str = "rc_";

/// A freshly generated key; `plaintext` is shown to the caller once
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub plaintext: String,
    pub prefix: String,
    pub hash: String,
}

/// Generate a random API key and its Argon2 hash
pub fn generate_api_key() -> Result<GeneratedKey, argon2::password_hash::Error> {
    let mut secret = [0u8; 24];
    OsRng.fill_bytes(&mut secret);
    let plaintext = format!("{}{}", KEY_PREFIX, hex::encode(secret));

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)?
        .to_string();

    Ok(GeneratedKey {
        prefix: plaintext[..8].to_string(),
        plaintext,
        hash,
    })
}

/// Extract the prefix from an API key (first 8 characters)
fn extract_key_prefix(api_key: &str) -> Option<&str> {
    api_key.get(..8)
}

/// Hash an API key for comparison
fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify an API key against a stored hash.
///
/// Supports Argon2 hashes (`$argon2...`) and legacy SHA-256 hex hashes.
fn verify_api_key(api_key: &str, stored_hash: &str) -> bool {
    if stored_hash.starts_with("$argon2") {
        return PasswordHash::new(stored_hash)
            .ok()
            .and_then(|parsed_hash| {
                Argon2::default()
                    .verify_password(api_key.as_bytes(), &parsed_hash)
                    .ok()
            })
            .is_some();
    }

    hash_api_key(api_key) == stored_hash
}

fn unauthorized(message: &str) -> ApiError {
    error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
}

/// Validate an API key against the database
async fn validate_api_key(db_pool: &DatabasePool, api_key: &str) -> ApiResult<ApiKey> {
    let prefix = extract_key_prefix(api_key).ok_or_else(|| {
        warn!("API key too short");
        unauthorized("Invalid API key")
    })?;

    let repo = ApiKeyRepository::new(db_pool.clone());

    let candidates = repo.find_by_prefix(prefix).await.map_err(api_error)?;

    if candidates.is_empty() {
        warn!(prefix = %prefix, "No API key found with prefix");
        return Err(unauthorized("Invalid API key"));
    }

    for candidate in candidates {
        if verify_api_key(api_key, &candidate.key_hash) {
            if candidate.is_expired() {
                warn!(api_key_id = %candidate.id, "API key has expired");
                return Err(unauthorized("API key has expired"));
            }

            // Fire and forget; auth does not depend on it
            let repo_clone = ApiKeyRepository::new(db_pool.clone());
            let key_id = candidate.id;
            tokio::spawn(async move {
                if let Err(e) = repo_clone.update_last_used(key_id).await {
                    error!(error = %e, "Failed to update API key last_used_at");
                }
            });

            debug!(
                api_key_id = %candidate.id,
                tenant_id = %candidate.tenant_id,
                "API key authenticated"
            );
            return Ok(candidate);
        }
    }

    warn!(prefix = %prefix, "API key hash mismatch");
    Err(unauthorized("Invalid API key"))
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> ApiResult<Response> {
    let api_key = extract_api_key(&request).ok_or_else(|| {
        warn!(path = %request.uri().path(), "Missing API key");
        unauthorized("Missing API key")
    })?;

    let validated_key = validate_api_key(&state.db_pool, api_key).await?;

    let auth_context = AuthContext {
        tenant_id: validated_key.tenant_id,
        user_id: validated_key.user_id,
        scopes: validated_key.scopes_vec(),
        api_key_id: validated_key.id,
    };

    request.extensions_mut().insert(auth_context);

    Ok(next.run(request).await)
}

/// Reject requests for a tenant other than the key's own
pub fn require_tenant_access(auth_context: &AuthContext, tenant_id: TenantId) -> ApiResult<()> {
    if !auth_context.is_authorized_for_tenant(tenant_id) {
        warn!(
            key_tenant = %auth_context.tenant_id,
            requested_tenant = %tenant_id,
            "Tenant access denied"
        );
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "Access denied to this tenant",
        ));
    }
    Ok(())
}

/// Reject keys lacking `scope`
pub fn require_scope(auth_context: &AuthContext, scope: &str) -> ApiResult<()> {
    if !auth_context.has_scope(scope) {
        warn!(
            api_key_id = %auth_context.api_key_id,
            scope = %scope,
            "Scope access denied"
        );
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            format!("API key lacks the '{}' scope", scope),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(scopes: &[&str]) -> AuthContext {
        AuthContext {
            tenant_id: Uuid::nil(),
            user_id: None,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            api_key_id: Uuid::nil(),
        }
    }

    #[test]
    fn verifies_legacy_sha256_hash() {
        let api_key = "rc_test_legacy_key";
        let legacy_hash = hash_api_key(api_key);

        assert!(verify_api_key(api_key, &legacy_hash));
        assert!(!verify_api_key("wrong_key", &legacy_hash));
    }

    #[test]
    fn verifies_argon2_hash() {
        let api_key = "rc_test_argon2_key";
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(api_key.as_bytes(), &salt)
            .expect("argon2 hash generation should succeed")
            .to_string();

        assert!(verify_api_key(api_key, &hash));
        assert!(!verify_api_key("wrong_key", &hash));
    }

    #[test]
    fn rejections_carry_a_json_body() {
        let (status, axum::Json(body)) = unauthorized("Missing API key");
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error, "UNAUTHORIZED");
        assert_eq!(body.message, "Missing API key");
    }

    #[test]
    fn generated_keys_verify_against_their_hash() {
        let key = generate_api_key().unwrap();
        assert!(key.plaintext.starts_with(KEY_PREFIX));
        assert_eq!(key.plaintext.len(), KEY_PREFIX.len() + 48);
        assert_eq!(extract_key_prefix(&key.plaintext), Some(key.prefix.as_str()));
        assert!(key.hash.starts_with("$argon2"));
        assert!(verify_api_key(&key.plaintext, &key.hash));

        let other = generate_api_key().unwrap();
        assert_ne!(key.plaintext, other.plaintext);
        assert!(!verify_api_key(&other.plaintext, &key.hash));
    }

    #[test]
    fn short_keys_have_no_prefix() {
        assert_eq!(extract_key_prefix("rc_live"), None);
        assert_eq!(extract_key_prefix("rc_live_abc"), Some("rc_live_"));
    }

    #[test]
    fn wildcard_scope_grants_everything() {
        assert!(context(&["*"]).has_scope("routing:write"));
        assert!(context(&["messages:write"]).has_scope("messages:write"));
        assert!(!context(&["messages:write"]).has_scope("admin"));
        assert!(require_scope(&context(&["stats:read"]), "admin").is_err());
    }

    #[test]
    fn tenant_access_is_scoped_to_the_key() {
        let ctx = context(&["*"]);
        assert!(require_tenant_access(&ctx, Uuid::nil()).is_ok());
        let (status, _) = require_tenant_access(&ctx, Uuid::new_v4()).unwrap_err();
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
