//! Outbound message repository

use chrono::{DateTime, Utc};
use relaycast_common::types::{CampaignId, MessageId, MessageStatus, TenantId};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{CreateMessage, Message, MessageFilter, MessageStatusCounts};

/// Terminal statuses a manual retry may requeue
pub fn retryable_statuses() -> Vec<&'static str> {
    MessageStatus::ALL
        .iter()
        .filter(|s| s.is_retryable_terminal())
        .map(MessageStatus::as_str)
        .collect()
}

/// Outbound message repository
#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    /// Create a new message repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the database pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a queued message
    pub async fn create(&self, input: CreateMessage) -> Result<Message, sqlx::Error> {
        let id = Uuid::now_v7();

        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (
                id, tenant_id, campaign_id, contact_id, user_id, channel, recipient,
                subject, body, html_body, media_urls, status, scheduled_at, max_retries
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'queued', $12, $13)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.tenant_id)
        .bind(input.campaign_id)
        .bind(input.contact_id)
        .bind(input.user_id)
        .bind(input.channel.to_string())
        .bind(&input.recipient)
        .bind(&input.subject)
        .bind(&input.body)
        .bind(&input.html_body)
        .bind(serde_json::json!(input.media_urls))
        .bind(input.scheduled_at)
        .bind(input.max_retries)
        .fetch_one(&self.pool)
        .await
    }

    /// Insert many queued messages in one transaction
    pub async fn create_batch(
        &self,
        messages: Vec<CreateMessage>,
    ) -> Result<Vec<Message>, sqlx::Error> {
        let mut created = Vec::with_capacity(messages.len());
        let mut tx = self.pool.begin().await?;

        for input in messages {
            let message = sqlx::query_as::<_, Message>(
                r#"
                INSERT INTO messages (
                    id, tenant_id, campaign_id, contact_id, user_id, channel, recipient,
                    subject, body, html_body, media_urls, status, scheduled_at, max_retries
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'queued', $12, $13)
                RETURNING *
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(input.tenant_id)
            .bind(input.campaign_id)
            .bind(input.contact_id)
            .bind(input.user_id)
            .bind(input.channel.to_string())
            .bind(&input.recipient)
            .bind(&input.subject)
            .bind(&input.body)
            .bind(&input.html_body)
            .bind(serde_json::json!(input.media_urls))
            .bind(input.scheduled_at)
            .bind(input.max_retries)
            .fetch_one(&mut *tx)
            .await?;

            created.push(message);
        }

        tx.commit().await?;
        Ok(created)
    }

    /// Get a message by ID
    pub async fn get(&self, id: MessageId) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Get a message scoped to a tenant
    pub async fn get_by_tenant(
        &self,
        tenant_id: TenantId,
        id: MessageId,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// List messages for a tenant, newest first
    pub async fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        filter: &MessageFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR channel = $3)
              AND ($4::uuid IS NULL OR campaign_id = $4)
            ORDER BY created_at DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(tenant_id)
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.channel.map(|c| c.to_string()))
        .bind(filter.campaign_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    /// Count messages for a tenant matching a filter
    pub async fn count_by_tenant(
        &self,
        tenant_id: TenantId,
        filter: &MessageFilter,
    ) -> Result<i64, sqlx::Error> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR channel = $3)
              AND ($4::uuid IS NULL OR campaign_id = $4)
            "#,
        )
        .bind(tenant_id)
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.channel.map(|c| c.to_string()))
        .bind(filter.campaign_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    /// Claim due queued messages and move them to `sending`.
    /// Uses FOR UPDATE SKIP LOCKED for concurrent worker safety
    pub async fn claim_due(&self, limit: i64) -> Result<Vec<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = 'sending',
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM messages
                WHERE status = 'queued'
                  AND (scheduled_at IS NULL OR scheduled_at <= NOW())
                ORDER BY COALESCE(scheduled_at, created_at) ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Claim one queued message regardless of its schedule
    pub async fn claim_one(
        &self,
        tenant_id: TenantId,
        id: MessageId,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = 'sending',
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Put messages stuck in `sending` back on the queue
    pub async fn recover_stale_sending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET
                status = 'queued',
                updated_at = NOW()
            WHERE status = 'sending' AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Mark a message as sent
    pub async fn mark_sent(
        &self,
        id: MessageId,
        provider_name: &str,
        external_id: &str,
        cost: f64,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = 'sent',
                provider_name = $2,
                external_id = $3,
                cost_amount = $4,
                error_message = NULL,
                sent_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'sending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(provider_name)
        .bind(external_id)
        .bind(cost)
        .fetch_optional(&self.pool)
        .await
    }

    /// Mark a message as failed
    pub async fn mark_failed(
        &self,
        id: MessageId,
        error: &str,
    ) -> Result<Option<Message>, sqlx::Error> {
        self.mark_terminal(id, MessageStatus::Failed, error).await
    }

    /// Mark a message as bounced
    pub async fn mark_bounced(
        &self,
        id: MessageId,
        error: &str,
    ) -> Result<Option<Message>, sqlx::Error> {
        self.mark_terminal(id, MessageStatus::Bounced, error).await
    }

    async fn mark_terminal(
        &self,
        id: MessageId,
        status: MessageStatus,
        error: &str,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = $2,
                error_message = $3,
                failed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'sending')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(error)
        .fetch_optional(&self.pool)
        .await
    }

    /// Requeue after a failed delivery, counting the retry
    pub async fn reschedule_retry(
        &self,
        id: MessageId,
        scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = 'queued',
                retry_count = retry_count + 1,
                scheduled_at = $2,
                error_message = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'sending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(scheduled_at)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
    }

    /// Requeue without counting a retry (used when a send is postponed)
    pub async fn defer(
        &self,
        id: MessageId,
        scheduled_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = 'queued',
                scheduled_at = $2,
                error_message = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'sending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(scheduled_at)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
    }

    /// Manually requeue a failed or bounced message that has retries left
    pub async fn requeue_for_retry(
        &self,
        tenant_id: TenantId,
        id: MessageId,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = 'queued',
                retry_count = retry_count + 1,
                error_message = NULL,
                failed_at = NULL,
                scheduled_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
              AND status = ANY($3)
              AND retry_count < max_retries
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(retryable_statuses())
        .fetch_optional(&self.pool)
        .await
    }

    /// Requeue every failed or bounced campaign message with retries left
    pub async fn requeue_failed_for_campaign(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET
                status = 'queued',
                retry_count = retry_count + 1,
                error_message = NULL,
                failed_at = NULL,
                scheduled_at = NOW(),
                updated_at = NOW()
            WHERE tenant_id = $1 AND campaign_id = $2
              AND status = ANY($3)
              AND retry_count < max_retries
            "#,
        )
        .bind(tenant_id)
        .bind(campaign_id)
        .bind(retryable_statuses())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Cancel a queued message
    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        id: MessageId,
        reason: &str,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = 'failed',
                error_message = $3,
                failed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
    }

    /// Find the message a provider knows by its own identifier
    pub async fn find_by_external_id(
        &self,
        provider_name: &str,
        external_id: &str,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE provider_name = $1 AND external_id = $2",
        )
        .bind(provider_name)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Compare-and-set status update driven by a provider callback.
    ///
    /// Returns `None` when the message no longer has `expected` status.
    pub async fn apply_callback_status(
        &self,
        id: MessageId,
        expected: MessageStatus,
        next: MessageStatus,
        error: Option<&str>,
        cost: Option<f64>,
    ) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as::<_, Message>(
            r#"
            UPDATE messages SET
                status = $3,
                error_message = COALESCE($4, error_message),
                cost_amount = COALESCE($5, cost_amount),
                sent_at = CASE WHEN $3 = 'sent' THEN COALESCE(sent_at, NOW()) ELSE sent_at END,
                delivered_at = CASE WHEN $3 = 'delivered' THEN NOW() ELSE delivered_at END,
                failed_at = CASE WHEN $3 IN ('failed', 'bounced') THEN NOW() ELSE failed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected.to_string())
        .bind(next.to_string())
        .bind(error)
        .bind(cost)
        .fetch_optional(&self.pool)
        .await
    }

    /// Per-status counts and total cost for a campaign
    pub async fn status_counts(
        &self,
        tenant_id: TenantId,
        campaign_id: CampaignId,
    ) -> Result<MessageStatusCounts, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') as queued,
                COUNT(*) FILTER (WHERE status = 'sending') as sending,
                COUNT(*) FILTER (WHERE status = 'sent') as sent,
                COUNT(*) FILTER (WHERE status = 'delivered') as delivered,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) FILTER (WHERE status = 'bounced') as bounced,
                COALESCE(SUM(cost_amount), 0)::float8 as total_cost
            FROM messages
            WHERE tenant_id = $1 AND campaign_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(MessageStatusCounts {
            queued: row.get::<Option<i64>, _>("queued").unwrap_or(0),
            sending: row.get::<Option<i64>, _>("sending").unwrap_or(0),
            sent: row.get::<Option<i64>, _>("sent").unwrap_or(0),
            delivered: row.get::<Option<i64>, _>("delivered").unwrap_or(0),
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0),
            bounced: row.get::<Option<i64>, _>("bounced").unwrap_or(0),
            total_cost: row.get::<Option<f64>, _>("total_cost").unwrap_or(0.0),
        })
    }
}
