//! Message service - enqueueing, manual retries, cancellation and reports

use chrono::{DateTime, Utc};
use relaycast_common::types::{
    CampaignId, ChannelType, ContactId, MessageId, Paginated, TenantId, UserId,
};
use relaycast_common::{Error, Result};
use relaycast_storage::models::{
    CreateMessage, DeliveryAttempt, Message, MessageFilter, MessageStatusCounts,
};
use relaycast_storage::repository::{DeliveryAttemptRepository, MessageRepository};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db_error;

const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Largest batch accepted by `enqueue_bulk`
pub const MAX_BULK_RECIPIENTS: usize = 10_000;

/// Request to send one message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub channel: ChannelType,
    pub recipient: String,
    pub campaign_id: Option<CampaignId>,
    pub contact_id: Option<ContactId>,
    pub user_id: Option<UserId>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub html_body: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<i32>,
}

/// One addressee of a bulk send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRecipient {
    pub recipient: String,
    pub contact_id: Option<ContactId>,
}

/// Same content to many recipients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkMessage {
    pub channel: ChannelType,
    pub recipients: Vec<BulkRecipient>,
    pub campaign_id: Option<CampaignId>,
    pub user_id: Option<UserId>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub html_body: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<i32>,
}

impl BulkMessage {
    fn expand(&self) -> impl Iterator<Item = NewMessage> + '_ {
        self.recipients.iter().map(|r| NewMessage {
            channel: self.channel,
            recipient: r.recipient.clone(),
            campaign_id: self.campaign_id,
            contact_id: r.contact_id,
            user_id: self.user_id,
            subject: self.subject.clone(),
            body: self.body.clone(),
            html_body: self.html_body.clone(),
            media_urls: self.media_urls.clone(),
            scheduled_at: self.scheduled_at,
            max_retries: self.max_retries,
        })
    }
}

/// Delivery summary for a campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub campaign_id: CampaignId,
    pub total: i64,
    pub queued: i64,
    pub sending: i64,
    pub sent: i64,
    pub delivered: i64,
    pub failed: i64,
    pub bounced: i64,
    /// Percent of messages delivered
    pub delivery_rate: f64,
    /// Percent of messages failed
    pub failure_rate: f64,
    pub total_cost: f64,
    pub average_cost: f64,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

impl DeliveryReport {
    pub fn from_counts(campaign_id: CampaignId, counts: &MessageStatusCounts) -> Self {
        let total = counts.total();
        let ratio = |n: i64| {
            if total > 0 {
                round_to(n as f64 / total as f64 * 100.0, 2)
            } else {
                0.0
            }
        };
        let average_cost = if total > 0 {
            round_to(counts.total_cost / total as f64, 4)
        } else {
            0.0
        };

        Self {
            campaign_id,
            total,
            queued: counts.queued,
            sending: counts.sending,
            sent: counts.sent,
            delivered: counts.delivered,
            failed: counts.failed,
            bounced: counts.bounced,
            delivery_rate: ratio(counts.delivered),
            failure_rate: ratio(counts.failed),
            total_cost: round_to(counts.total_cost, 2),
            average_cost,
        }
    }
}

/// Check a message request before it is queued
pub fn validate(message: &NewMessage) -> Result<()> {
    let recipient = message.recipient.trim();
    if recipient.is_empty() {
        return Err(Error::Validation("recipient is required".into()));
    }
    if message.max_retries.is_some_and(|m| m < 0) {
        return Err(Error::Validation("max_retries must not be negative".into()));
    }

    let has_text = |s: &Option<String>| s.as_deref().is_some_and(|s| !s.trim().is_empty());

    match message.channel {
        ChannelType::Email => {
            if !recipient.contains('@') {
                return Err(Error::Validation(format!(
                    "{} is not an email address",
                    recipient
                )));
            }
            if !has_text(&message.body) && !has_text(&message.html_body) {
                return Err(Error::Validation(
                    "email requires a text or HTML body".into(),
                ));
            }
        }
        ChannelType::Sms => {
            if !has_text(&message.body) {
                return Err(Error::Validation("SMS requires a body".into()));
            }
        }
        ChannelType::Mms => {
            if message.media_urls.is_empty() {
                return Err(Error::Validation("MMS requires at least one media URL".into()));
            }
        }
    }
    Ok(())
}

/// Entry point for everything that creates or manipulates messages
#[derive(Clone)]
pub struct MessageService {
    messages: MessageRepository,
    attempts: DeliveryAttemptRepository,
    default_max_retries: i32,
}

impl MessageService {
    pub fn new(
        messages: MessageRepository,
        attempts: DeliveryAttemptRepository,
        default_max_retries: i32,
    ) -> Self {
        Self {
            messages,
            attempts,
            default_max_retries,
        }
    }

    fn to_create(&self, tenant_id: TenantId, message: NewMessage) -> CreateMessage {
        CreateMessage {
            tenant_id,
            campaign_id: message.campaign_id,
            contact_id: message.contact_id,
            user_id: message.user_id,
            channel: message.channel,
            recipient: message.recipient.trim().to_string(),
            subject: message.subject,
            body: message.body,
            html_body: message.html_body,
            media_urls: message.media_urls,
            scheduled_at: message.scheduled_at,
            max_retries: message.max_retries.unwrap_or(self.default_max_retries),
        }
    }

    pub async fn enqueue(&self, tenant_id: TenantId, message: NewMessage) -> Result<Message> {
        validate(&message)?;
        let created = self
            .messages
            .create(self.to_create(tenant_id, message))
            .await
            .map_err(db_error)?;
        info!(message_id = %created.id, channel = %created.channel, "Message queued");
        Ok(created)
    }

    /// Queue one message per recipient; nothing is queued if any is invalid
    pub async fn enqueue_bulk(&self, tenant_id: TenantId, bulk: BulkMessage) -> Result<Vec<Message>> {
        if bulk.recipients.is_empty() {
            return Err(Error::Validation("at least one recipient is required".into()));
        }
        if bulk.recipients.len() > MAX_BULK_RECIPIENTS {
            return Err(Error::Validation(format!(
                "at most {} recipients per request",
                MAX_BULK_RECIPIENTS
            )));
        }

        let mut inputs = Vec::with_capacity(bulk.recipients.len());
        for message in bulk.expand() {
            validate(&message)?;
            inputs.push(self.to_create(tenant_id, message));
        }

        let created = self.messages.create_batch(inputs).await.map_err(db_error)?;
        info!(count = created.len(), campaign_id = ?bulk.campaign_id, "Bulk messages queued");
        Ok(created)
    }

    pub async fn get(&self, tenant_id: TenantId, id: MessageId) -> Result<Message> {
        self.messages
            .get_by_tenant(tenant_id, id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| Error::NotFound(format!("Message {} not found", id)))
    }

    pub async fn list(
        &self,
        tenant_id: TenantId,
        filter: &MessageFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Paginated<Message>> {
        let data = self
            .messages
            .list_by_tenant(tenant_id, filter, limit, offset)
            .await
            .map_err(db_error)?;
        let total = self
            .messages
            .count_by_tenant(tenant_id, filter)
            .await
            .map_err(db_error)?;
        Ok(Paginated {
            data,
            total,
            limit,
            offset,
        })
    }

    pub async fn attempts(&self, tenant_id: TenantId, id: MessageId) -> Result<Vec<DeliveryAttempt>> {
        let message = self.get(tenant_id, id).await?;
        self.attempts
            .list_for_message(message.id)
            .await
            .map_err(db_error)
    }

    /// Requeue a failed or bounced message that still has retries left
    pub async fn retry_failed(&self, tenant_id: TenantId, id: MessageId) -> Result<Message> {
        if let Some(message) = self
            .messages
            .requeue_for_retry(tenant_id, id)
            .await
            .map_err(db_error)?
        {
            info!(message_id = %id, retry_count = message.retry_count, "Message requeued");
            return Ok(message);
        }

        let message = self.get(tenant_id, id).await?;
        let status = message.status_enum();
        if !status.is_some_and(|s| s.is_retryable_terminal()) {
            return Err(Error::Conflict(format!(
                "Message {} is {} and cannot be retried",
                id, message.status
            )));
        }
        Err(Error::Conflict(format!(
            "Message {} has used all {} retries",
            id, message.max_retries
        )))
    }

    pub async fn retry_failed_for_campaign(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<u64> {
        let count = self
            .messages
            .requeue_failed_for_campaign(tenant_id, campaign_id)
            .await
            .map_err(db_error)?;
        info!(campaign_id = %campaign_id, count, "Campaign failures requeued");
        Ok(count)
    }

    /// Cancel a message that has not been picked up yet
    pub async fn cancel(&self, tenant_id: TenantId, id: MessageId) -> Result<Message> {
        if let Some(message) = self
            .messages
            .cancel(tenant_id, id, CANCELLED_BY_USER)
            .await
            .map_err(db_error)?
        {
            info!(message_id = %id, "Message cancelled");
            return Ok(message);
        }

        let message = self.get(tenant_id, id).await?;
        Err(Error::Conflict(format!(
            "Only queued messages can be cancelled; message {} is {}",
            id,
            message
                .status_enum()
                .map(|s| s.to_string())
                .unwrap_or(message.status)
        )))
    }

    pub async fn delivery_report(&self, tenant_id: TenantId, campaign_id: CampaignId) -> Result<DeliveryReport> {
        let counts = self
            .messages
            .status_counts(tenant_id, campaign_id)
            .await
            .map_err(db_error)?;
        Ok(DeliveryReport::from_counts(campaign_id, &counts))
    }
}
