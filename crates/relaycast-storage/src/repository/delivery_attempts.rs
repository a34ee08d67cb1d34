//! Delivery attempt repository

use chrono::{DateTime, Utc};
use relaycast_common::types::{ChannelType, MessageId};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AttemptAggregate, DeliveryAttempt, NewDeliveryAttempt};

/// Delivery attempt repository
#[derive(Clone)]
pub struct DeliveryAttemptRepository {
    pool: PgPool,
}

impl DeliveryAttemptRepository {
    /// Create a new delivery attempt repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record an attempt
    pub async fn create(&self, input: &NewDeliveryAttempt) -> Result<DeliveryAttempt, sqlx::Error> {
        sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            INSERT INTO delivery_attempts (
                id, message_id, attempt_number, channel, provider_name, success,
                external_id, error_message, error_code, cost_amount, response_time_ms,
                fallback_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.message_id)
        .bind(input.attempt_number)
        .bind(input.channel.to_string())
        .bind(&input.provider_name)
        .bind(input.success)
        .bind(&input.external_id)
        .bind(&input.error_message)
        .bind(&input.error_code)
        .bind(input.cost_amount)
        .bind(input.response_time_ms)
        .bind(input.fallback_reason.map(|r| r.to_string()))
        .fetch_one(&self.pool)
        .await
    }

    /// Attempts for a message in the order they were made
    pub async fn list_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<DeliveryAttempt>, sqlx::Error> {
        sqlx::query_as::<_, DeliveryAttempt>(
            "SELECT * FROM delivery_attempts WHERE message_id = $1 ORDER BY attempted_at ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Per-channel counters for attempts made within `[from, to)`.
    ///
    /// Passing a channel restricts the result to that channel.
    pub async fn aggregate(
        &self,
        channel: Option<ChannelType>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AttemptAggregate>, sqlx::Error> {
        sqlx::query_as::<_, AttemptAggregate>(
            r#"
            SELECT
                channel,
                COUNT(*) as total,
                COUNT(*) FILTER (WHERE success) as successful,
                COUNT(*) FILTER (WHERE NOT success) as failed,
                COALESCE(AVG(response_time_ms), 0)::float8 as avg_response_time_ms,
                COALESCE(SUM(cost_amount) FILTER (WHERE success), 0)::float8 as total_cost,
                COUNT(*) FILTER (WHERE fallback_reason IS NOT NULL) as fallback_count
            FROM delivery_attempts
            WHERE attempted_at >= $1 AND attempted_at < $2
              AND ($3::text IS NULL OR channel = $3)
            GROUP BY channel
            ORDER BY channel ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(channel.map(|c| c.to_string()))
        .fetch_all(&self.pool)
        .await
    }
}
