//! API key provisioning

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use relaycast_storage::repository::api_keys::{ApiKey, NewApiKey};
use relaycast_storage::{ApiKeyRepository, ApiKeyRepositoryTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{generate_api_key, require_scope, require_tenant_access, AppState, AuthContext};
use crate::error::{api_error, error_response, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The stored key plus its plaintext, which is never returned again
#[derive(Debug, Serialize)]
pub struct CreatedApiKey {
    #[serde(flatten)]
    pub key: ApiKey,
    pub api_key: String,
}

fn validate(input: &CreateApiKeyRequest) -> ApiResult<()> {
    if input.name.trim().is_empty() {
        return Err(error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "VALIDATION_ERROR",
            "name must not be empty",
        ));
    }
    if input.scopes.is_empty() || input.scopes.iter().any(|s| s.trim().is_empty()) {
        return Err(error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "VALIDATION_ERROR",
            "scopes must be a non-empty list of scope names",
        ));
    }
    if input.expires_at.is_some_and(|at| at <= Utc::now()) {
        return Err(error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "VALIDATION_ERROR",
            "expires_at must be in the future",
        ));
    }
    Ok(())
}

/// Issue a key for the caller's tenant
pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<CreateApiKeyRequest>,
) -> ApiResult<(StatusCode, Json<CreatedApiKey>)> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "admin")?;
    validate(&input)?;

    let generated = generate_api_key().map_err(|e| {
        error!(error = %e, "Failed to hash new API key");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Failed to generate API key",
        )
    })?;

    let key = ApiKeyRepository::new(state.db_pool.clone())
        .create(NewApiKey {
            tenant_id,
            user_id: auth.user_id,
            name: input.name.trim().to_string(),
            key_hash: generated.hash,
            key_prefix: generated.prefix,
            scopes: input.scopes,
            expires_at: input.expires_at,
        })
        .await
        .map_err(api_error)?;

    info!(
        api_key_id = %key.id,
        tenant_id = %tenant_id,
        issued_by = %auth.api_key_id,
        "API key created"
    );
    Ok((
        StatusCode::CREATED,
        Json(CreatedApiKey {
            key,
            api_key: generated.plaintext,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(name: &str, scopes: &[&str]) -> CreateApiKeyRequest {
        CreateApiKeyRequest {
            name: name.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            expires_at: None,
        }
    }

    #[test]
    fn requires_a_name_and_scopes() {
        assert!(validate(&request("ci", &["messages:write"])).is_ok());
        assert!(validate(&request("  ", &["messages:write"])).is_err());
        assert!(validate(&request("ci", &[])).is_err());
        assert!(validate(&request("ci", &["messages:write", ""])).is_err());
    }

    #[test]
    fn expiry_must_be_ahead() {
        let mut input = request("ci", &["*"]);
        input.expires_at = Some(Utc::now() - Duration::minutes(1));
        let (status, Json(body)) = validate(&input).unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.message, "expires_at must be in the future");

        input.expires_at = Some(Utc::now() + Duration::days(30));
        assert!(validate(&input).is_ok());
    }
}
