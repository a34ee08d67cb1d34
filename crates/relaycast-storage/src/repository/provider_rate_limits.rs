//! Provider rate limit repository

use relaycast_common::config::WindowLimit;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::ProviderRateLimit;

/// Provider rate limit repository
#[derive(Clone)]
pub struct ProviderRateLimitRepository {
    pool: PgPool,
}

impl ProviderRateLimitRepository {
    /// Create a new provider rate limit repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch the limit for a provider, creating it with `defaults` on first use
    pub async fn get_or_create(
        &self,
        provider_name: &str,
        provider_type: &str,
        defaults: WindowLimit,
    ) -> Result<ProviderRateLimit, sqlx::Error> {
        sqlx::query_as::<_, ProviderRateLimit>(
            r#"
            INSERT INTO provider_rate_limits (
                id, provider_name, provider_type, max_requests, time_window_secs
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (provider_name, provider_type) DO UPDATE SET
                provider_name = EXCLUDED.provider_name
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(provider_name)
        .bind(provider_type)
        .bind(defaults.max_requests)
        .bind(defaults.window_secs)
        .fetch_one(&self.pool)
        .await
    }

    /// List all provider limits
    pub async fn list(&self) -> Result<Vec<ProviderRateLimit>, sqlx::Error> {
        sqlx::query_as::<_, ProviderRateLimit>(
            "SELECT * FROM provider_rate_limits ORDER BY provider_type ASC, provider_name ASC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Change the window size of a provider limit
    pub async fn set_limit(
        &self,
        id: Uuid,
        limit: WindowLimit,
        is_active: bool,
    ) -> Result<Option<ProviderRateLimit>, sqlx::Error> {
        sqlx::query_as::<_, ProviderRateLimit>(
            r#"
            UPDATE provider_rate_limits SET
                max_requests = $2,
                time_window_secs = $3,
                is_active = $4,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(limit.max_requests)
        .bind(limit.window_secs)
        .bind(is_active)
        .fetch_optional(&self.pool)
        .await
    }

    /// Lock the row, let `apply` advance its window counters, and persist them
    pub async fn consume_with<F, T>(
        &self,
        id: Uuid,
        apply: F,
    ) -> Result<Option<(ProviderRateLimit, T)>, sqlx::Error>
    where
        F: FnOnce(&mut ProviderRateLimit) -> T,
    {
        let mut tx = self.pool.begin().await?;

        let Some(mut limit) = sqlx::query_as::<_, ProviderRateLimit>(
            "SELECT * FROM provider_rate_limits WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        let outcome = apply(&mut limit);

        let updated = sqlx::query_as::<_, ProviderRateLimit>(
            r#"
            UPDATE provider_rate_limits SET
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
}
