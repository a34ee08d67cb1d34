//! API rate limit and violation log repositories

use chrono::{DateTime, Utc};
use relaycast_common::types::{TenantId, UserId};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    ApiRateLimit, CreateApiRateLimit, NewRateLimitLog, RateLimitLog, RateLimitLogFilter,
    UpdateApiRateLimit,
};

/// API rate limit repository
#[derive(Clone)]
pub struct ApiRateLimitRepository {
    pool: PgPool,
}

impl ApiRateLimitRepository {
    /// Create a new API rate limit repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a rate limit with an empty window
    pub async fn create(&self, input: CreateApiRateLimit) -> Result<ApiRateLimit, sqlx::Error> {
        sqlx::query_as::<_, ApiRateLimit>(
            r#"
            INSERT INTO api_rate_limits (
                id, user_id, tenant_id, endpoint_pattern, max_requests, time_window_secs, priority
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.user_id)
        .bind(input.tenant_id)
        .bind(&input.endpoint_pattern)
        .bind(input.max_requests)
        .bind(input.time_window_secs)
        .bind(input.priority)
        .fetch_one(&self.pool)
        .await
    }

    /// Get a rate limit by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<ApiRateLimit>, sqlx::Error> {
        sqlx::query_as::<_, ApiRateLimit>("SELECT * FROM api_rate_limits WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// List rate limits, highest priority first
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ApiRateLimit>, sqlx::Error> {
        sqlx::query_as::<_, ApiRateLimit>(
            r#"
            SELECT * FROM api_rate_limits
            ORDER BY priority DESC, created_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    /// Active limits scoped to the user, the tenant, or neither (global).
    ///
    /// Endpoint patterns are matched by the caller.
    pub async fn list_candidates(
        &self,
        user_id: Option<UserId>,
        tenant_id: Option<TenantId>,
    ) -> Result<Vec<ApiRateLimit>, sqlx::Error> {
        sqlx::query_as::<_, ApiRateLimit>(
            r#"
            SELECT * FROM api_rate_limits
            WHERE is_active = TRUE
              AND (
                    ($1::uuid IS NOT NULL AND user_id = $1)
                 OR ($2::uuid IS NOT NULL AND tenant_id = $2)
                 OR (user_id IS NULL AND tenant_id IS NULL)
              )
            ORDER BY priority DESC
            "#,
        )
        .bind(user_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Update a rate limit; unset fields keep their value
    pub async fn update(
        &self,
        id: Uuid,
        input: UpdateApiRateLimit,
    ) -> Result<Option<ApiRateLimit>, sqlx::Error> {
        sqlx::query_as::<_, ApiRateLimit>(
            r#"
            UPDATE api_rate_limits SET
                endpoint_pattern = COALESCE($2, endpoint_pattern),
                max_requests = COALESCE($3, max_requests),
                time_window_secs = COALESCE($4, time_window_secs),
                is_active = COALESCE($5, is_active),
                priority = COALESCE($6, priority),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.endpoint_pattern)
        .bind(input.max_requests)
        .bind(input.time_window_secs)
        .bind(input.is_active)
        .bind(input.priority)
        .fetch_optional(&self.pool)
        .await
    }

    /// Delete a rate limit
    pub async fn delete(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM api_rate_limits WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Lock the row, let `apply` advance its window counters, and persist them.
    ///
    /// The row stays locked for the whole read-modify-write, so concurrent
    /// callers are serialized per limit.
    pub async fn consume_with<F, T>(
        &self,
        id: Uuid,
        apply: F,
    ) -> Result<Option<(ApiRateLimit, T)>, sqlx::Error>
    where
        F: FnOnce(&mut ApiRateLimit) -> T,
    {
        let mut tx = self.pool.begin().await?;

        let Some(mut limit) = sqlx::query_as::<_, ApiRateLimit>(
            "SELECT * FROM api_rate_limits WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        let outcome = apply(&mut limit);

        let updated = sqlx::query_as::<_, ApiRateLimit>(
            r#"
            UPDATE api_rate_limits SET
                current_request_count = $2,
                window_start = $3,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(limit.current_request_count)
        .bind(limit.window_start)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some((updated, outcome)))
    }

    /// Clear the counter and start a fresh window
    pub async fn reset(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE api_rate_limits SET
                current_request_count = 0,
                window_start = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Rate limit violation log repository
#[derive(Clone)]
pub struct RateLimitLogRepository {
    pool: PgPool,
}

impl RateLimitLogRepository {
    /// Create a new rate limit log repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a violation
    pub async fn create(&self, input: NewRateLimitLog) -> Result<RateLimitLog, sqlx::Error> {
        sqlx::query_as::<_, RateLimitLog>(
            r#"
            INSERT INTO rate_limit_logs (
                id, user_id, tenant_id, endpoint, ip_address, rule, request_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(input.tenant_id)
        .bind(&input.endpoint)
        .bind(&input.ip_address)
        .bind(&input.rule)
        .bind(input.request_count)
        .fetch_one(&self.pool)
        .await
    }

    /// List violations, newest first
    pub async fn list(
        &self,
        filter: &RateLimitLogFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RateLimitLog>, sqlx::Error> {
        sqlx::query_as::<_, RateLimitLog>(
            r#"
            SELECT * FROM rate_limit_logs
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::timestamptz IS NULL OR logged_at >= $2)
              AND ($3::timestamptz IS NULL OR logged_at <= $3)
            ORDER BY logged_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    /// Delete violations logged before a cutoff
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM rate_limit_logs WHERE logged_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
