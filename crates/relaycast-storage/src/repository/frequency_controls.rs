//! Contact frequency control repository

use relaycast_common::config::FrequencyConfig;
use relaycast_common::types::{ContactId, TenantId};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::FrequencyControl;

/// Contact frequency control repository
#[derive(Clone)]
pub struct FrequencyControlRepository {
    pool: PgPool,
}

impl FrequencyControlRepository {
    /// Create a new frequency control repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the control row for a contact
    pub async fn get(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Option<FrequencyControl>, sqlx::Error> {
        sqlx::query_as::<_, FrequencyControl>(
            "SELECT * FROM frequency_controls WHERE tenant_id = $1 AND contact_id = $2",
        )
        .bind(tenant_id)
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Fetch the control row for a contact, creating it with default caps
    pub async fn get_or_create(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
        defaults: FrequencyConfig,
    ) -> Result<FrequencyControl, sqlx::Error> {
        sqlx::query_as::<_, FrequencyControl>(
            r#"
            INSERT INTO frequency_controls (
                id, tenant_id, contact_id, max_per_day, max_per_week, max_per_month
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, contact_id) DO UPDATE SET
                tenant_id = EXCLUDED.tenant_id
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(contact_id)
        .bind(defaults.max_per_day)
        .bind(defaults.max_per_week)
        .bind(defaults.max_per_month)
        .fetch_one(&self.pool)
        .await
    }

    /// Lock a contact's row, let `apply` roll over and bump its counters, and
    /// persist them
    pub async fn update_with<F, T>(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
        defaults: FrequencyConfig,
        apply: F,
    ) -> Result<(FrequencyControl, T), sqlx::Error>
    where
        F: FnOnce(&mut FrequencyControl) -> T,
    {
        let created = self.get_or_create(tenant_id, contact_id, defaults).await?;
        let mut tx = self.pool.begin().await?;

        let mut control = sqlx::query_as::<_, FrequencyControl>(
            "SELECT * FROM frequency_controls WHERE id = $1 FOR UPDATE",
        )
        .bind(created.id)
        .fetch_one(&mut *tx)
        .await?;

        let outcome = apply(&mut control);

        let updated = sqlx::query_as::<_, FrequencyControl>(
            r#"
            UPDATE frequency_controls SET
                daily_count = $2,
                weekly_count = $3,
                monthly_count = $4,
                last_message_sent_at = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(control.id)
        .bind(control.daily_count)
        .bind(control.weekly_count)
        .bind(control.monthly_count)
        .bind(control.last_message_sent_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((updated, outcome))
    }

    /// Override the caps for one contact
    pub async fn set_caps(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
        caps: FrequencyConfig,
    ) -> Result<FrequencyControl, sqlx::Error> {
        sqlx::query_as::<_, FrequencyControl>(
            r#"
            INSERT INTO frequency_controls (
                id, tenant_id, contact_id, max_per_day, max_per_week, max_per_month
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, contact_id) DO UPDATE SET
                max_per_day = EXCLUDED.max_per_day,
                max_per_week = EXCLUDED.max_per_week,
                max_per_month = EXCLUDED.max_per_month,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(contact_id)
        .bind(caps.max_per_day)
        .bind(caps.max_per_week)
        .bind(caps.max_per_month)
        .fetch_one(&self.pool)
        .await
    }

    /// Zero every contact's daily counter
    pub async fn reset_daily(&self) -> Result<u64, sqlx::Error> {
        self.reset_column("daily_count").await
    }

    /// Zero every contact's weekly counter
    pub async fn reset_weekly(&self) -> Result<u64, sqlx::Error> {
        self.reset_column("weekly_count").await
    }

    /// Zero every contact's monthly counter
    pub async fn reset_monthly(&self) -> Result<u64, sqlx::Error> {
        self.reset_column("monthly_count").await
    }

    async fn reset_column(&self, column: &'static str) -> Result<u64, sqlx::Error> {
        // column is one of three fixed identifiers, never user input
        let sql = format!(
            "UPDATE frequency_controls SET {column} = 0, updated_at = NOW() WHERE {column} <> 0"
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
