//! Channel routing configuration repository

use relaycast_common::types::ChannelType;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CreateRoutingConfig, RoutingConfig, UpdateRoutingConfig};

/// Routing configuration repository
#[derive(Clone)]
pub struct RoutingConfigRepository {
    pool: PgPool,
}

impl RoutingConfigRepository {
    /// Create a new routing config repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a routing config
    pub async fn create(&self, input: CreateRoutingConfig) -> Result<RoutingConfig, sqlx::Error> {
        let settings = input
            .additional_settings
            .unwrap_or_else(|| serde_json::json!({}));

        sqlx::query_as::<_, RoutingConfig>(
            r#"
            INSERT INTO channel_routing_configs (
                id, channel, primary_provider, fallback_providers, routing_strategy,
                enable_fallback, max_retries, retry_strategy, initial_retry_delay_secs,
                max_retry_delay_secs, cost_threshold, is_active, priority, additional_settings
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.channel.to_string())
        .bind(&input.primary_provider)
        .bind(serde_json::json!(input.fallback_providers))
        .bind(input.routing_strategy.to_string())
        .bind(input.enable_fallback)
        .bind(input.max_retries)
        .bind(input.retry_strategy.to_string())
        .bind(input.initial_retry_delay_secs)
        .bind(input.max_retry_delay_secs)
        .bind(input.cost_threshold)
        .bind(input.is_active)
        .bind(input.priority)
        .bind(&settings)
        .fetch_one(&self.pool)
        .await
    }

    /// Get a routing config by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<RoutingConfig>, sqlx::Error> {
        sqlx::query_as::<_, RoutingConfig>("SELECT * FROM channel_routing_configs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// List all routing configs, highest priority first within each channel
    pub async fn list(&self) -> Result<Vec<RoutingConfig>, sqlx::Error> {
        sqlx::query_as::<_, RoutingConfig>(
            "SELECT * FROM channel_routing_configs ORDER BY channel ASC, priority DESC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// The config that governs a channel: the highest priority active one
    pub async fn active_for_channel(
        &self,
        channel: ChannelType,
    ) -> Result<Option<RoutingConfig>, sqlx::Error> {
        sqlx::query_as::<_, RoutingConfig>(
            r#"
            SELECT * FROM channel_routing_configs
            WHERE channel = $1 AND is_active = TRUE
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            "#,
        )
        .bind(channel.to_string())
        .fetch_optional(&self.pool)
        .await
    }

    /// Update a routing config; unset fields keep their value
    pub async fn update(
        &self,
        id: Uuid,
        input: UpdateRoutingConfig,
    ) -> Result<Option<RoutingConfig>, sqlx::Error> {
        sqlx::query_as::<_, RoutingConfig>(
            r#"
            UPDATE channel_routing_configs SET
                primary_provider = COALESCE($2, primary_provider),
                fallback_providers = COALESCE($3, fallback_providers),
                routing_strategy = COALESCE($4, routing_strategy),
                enable_fallback = COALESCE($5, enable_fallback),
                max_retries = COALESCE($6, max_retries),
                retry_strategy = COALESCE($7, retry_strategy),
                initial_retry_delay_secs = COALESCE($8, initial_retry_delay_secs),
                max_retry_delay_secs = COALESCE($9, max_retry_delay_secs),
                cost_threshold = COALESCE($10, cost_threshold),
                is_active = COALESCE($11, is_active),
                priority = COALESCE($12, priority),
                additional_settings = COALESCE($13, additional_settings),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.primary_provider)
        .bind(input.fallback_providers.map(|f| serde_json::json!(f)))
        .bind(input.routing_strategy.map(|s| s.to_string()))
        .bind(input.enable_fallback)
        .bind(input.max_retries)
        .bind(input.retry_strategy.map(|s| s.to_string()))
        .bind(input.initial_retry_delay_secs)
        .bind(input.max_retry_delay_secs)
        .bind(input.cost_threshold)
        .bind(input.is_active)
        .bind(input.priority)
        .bind(&input.additional_settings)
        .fetch_optional(&self.pool)
        .await
    }

    /// Delete a routing config
    pub async fn delete(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM channel_routing_configs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
