//! API key repository

use crate::db::DatabasePool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaycast_common::types::{TenantId, UserId};
use relaycast_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// API Key ID type
pub type ApiKeyId = Uuid;

/// API Key model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub name: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: serde_json::Value,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Check if the API key has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Check if the API key has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Get scopes as a vector
    pub fn scopes_vec(&self) -> Vec<String> {
        serde_json::from_value(self.scopes.clone()).unwrap_or_default()
    }
}

/// Key material for a new API key; hashing happens before it reaches storage
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// API key repository trait
#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Find unexpired keys sharing a prefix (for initial lookup)
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>>;

    /// Store a new key
    async fn create(&self, key: NewApiKey) -> Result<ApiKey>;

    /// Update last_used_at timestamp
    async fn update_last_used(&self, id: ApiKeyId) -> Result<()>;
}

/// Database API key repository
pub struct DbApiKeyRepository {
    pool: DatabasePool,
}

impl DbApiKeyRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyRepository for DbApiKeyRepository {
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>> {
        sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT * FROM api_keys
            WHERE key_prefix = $1
              AND (expires_at IS NULL OR expires_at > NOW())
            LIMIT 10
            "#,
        )
        .bind(prefix)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn create(&self, key: NewApiKey) -> Result<ApiKey> {
        sqlx::query_as::<_, ApiKey>(
            r#"
            INSERT INTO api_keys (
                id, tenant_id, user_id, name, key_hash, key_prefix, scopes, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.tenant_id)
        .bind(key.user_id)
        .bind(&key.name)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(serde_json::json!(key.scopes))
        .bind(key.expires_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn update_last_used(&self, id: ApiKeyId) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(expires_at: Option<DateTime<Utc>>) -> ApiKey {
        ApiKey {
            id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            user_id: None,
            name: "ci".to_string(),
            key_hash: String::new(),
            key_prefix: "rc_live_".to_string(),
            scopes: serde_json::json!(["messages:write", "routing:read"]),
            expires_at,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        assert!(!key(None).is_expired_at(now));
        assert!(!key(Some(now + Duration::hours(1))).is_expired_at(now));
        assert!(key(Some(now)).is_expired_at(now));
    }

    #[test]
    fn test_scopes_vec() {
        assert_eq!(
            key(None).scopes_vec(),
            vec!["messages:write".to_string(), "routing:read".to_string()]
        );
    }
}
