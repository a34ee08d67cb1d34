//! Processed provider callback ledger

use relaycast_common::types::MessageId;
use sqlx::PgPool;

/// Records which provider callback events have already been applied
#[derive(Clone)]
pub struct CallbackRepository {
    pool: PgPool,
}

impl CallbackRepository {
    /// Create a new callback repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim an event. Returns `false` if it was already claimed.
    pub async fn claim(&self, provider_name: &str, event_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_callbacks (provider_name, event_id, outcome)
            VALUES ($1, $2, 'pending')
            ON CONFLICT (provider_name, event_id) DO NOTHING
            "#,
        )
        .bind(provider_name)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Store how a claimed event was resolved
    pub async fn complete(
        &self,
        provider_name: &str,
        event_id: &str,
        message_id: Option<MessageId>,
        outcome: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE processed_callbacks SET
                message_id = $3,
                outcome = $4
            WHERE provider_name = $1 AND event_id = $2
            "#,
        )
        .bind(provider_name)
        .bind(event_id)
        .bind(message_id)
        .bind(outcome)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Release a claim whose processing failed so the provider's redelivery
    /// is applied
    pub async fn release(&self, provider_name: &str, event_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM processed_callbacks WHERE provider_name = $1 AND event_id = $2")
            .bind(provider_name)
            .bind(event_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
