//! Suppression list repository

use relaycast_common::types::TenantId;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CreateSuppression, Suppression};

/// Suppression list repository
#[derive(Clone)]
pub struct SuppressionRepository {
    pool: PgPool,
}

impl SuppressionRepository {
    /// Create a new suppression repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add an address; an existing entry takes the newer type and reason
    pub async fn upsert(&self, input: CreateSuppression) -> Result<Suppression, sqlx::Error> {
        sqlx::query_as::<_, Suppression>(
            r#"
            INSERT INTO suppressions (id, tenant_id, address, suppression_type, reason)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, address) DO UPDATE SET
                suppression_type = EXCLUDED.suppression_type,
                reason = COALESCE(EXCLUDED.reason, suppressions.reason)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.tenant_id)
        .bind(&input.address)
        .bind(input.suppression_type.to_string())
        .bind(&input.reason)
        .fetch_one(&self.pool)
        .await
    }

    /// Check if an address is suppressed
    pub async fn exists(&self, tenant_id: TenantId, address: &str) -> Result<bool, sqlx::Error> {
        let result: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM suppressions WHERE tenant_id = $1 AND address = $2)",
        )
        .bind(tenant_id)
        .bind(address)
        .fetch_one(&self.pool)
        .await?;

        Ok(result.0)
    }

    /// Which of `addresses` are suppressed
    pub async fn find_existing(
        &self,
        tenant_id: TenantId,
        addresses: &[String],
    ) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT address FROM suppressions WHERE tenant_id = $1 AND address = ANY($2)",
        )
        .bind(tenant_id)
        .bind(addresses)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(a,)| a).collect())
    }

    /// List suppressions for a tenant, newest first
    pub async fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Suppression>, sqlx::Error> {
        sqlx::query_as::<_, Suppression>(
            r#"
            SELECT * FROM suppressions
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    /// Remove an address
    pub async fn delete(&self, tenant_id: TenantId, address: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM suppressions WHERE tenant_id = $1 AND address = $2")
            .bind(tenant_id)
            .bind(address)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
