//! Database models

use chrono::{DateTime, Utc};
use relaycast_common::types::{
    CampaignId, ChannelType, ContactId, FallbackReason, MessageId, MessageStatus, RetryStrategy,
    RoutingStrategy, SuppressionType, TenantId, UserId,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Outbound message model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub campaign_id: Option<CampaignId>,
    pub contact_id: Option<ContactId>,
    pub user_id: Option<UserId>,
    pub channel: String,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub html_body: Option<String>,
    pub media_urls: serde_json::Value,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub external_id: Option<String>,
    pub provider_name: Option<String>,
    pub cost_amount: f64,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Get status enum
    pub fn status_enum(&self) -> Option<MessageStatus> {
        self.status.parse().ok()
    }

    /// Get channel enum
    pub fn channel_enum(&self) -> Option<ChannelType> {
        self.channel.parse().ok()
    }

    /// Get media URLs as a vector
    pub fn media_urls_vec(&self) -> Vec<String> {
        serde_json::from_value(self.media_urls.clone()).unwrap_or_default()
    }

    /// A failed or bounced message that still has retries left
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
            && self
                .status_enum()
                .map(|s| s.is_retryable_terminal())
                .unwrap_or(false)
    }
}

/// Create message input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessage {
    pub tenant_id: TenantId,
    pub campaign_id: Option<CampaignId>,
    pub contact_id: Option<ContactId>,
    pub user_id: Option<UserId>,
    pub channel: ChannelType,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub html_body: Option<String>,
    pub media_urls: Vec<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: i32,
}

/// Message filter for listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageFilter {
    pub status: Option<MessageStatus>,
    pub channel: Option<ChannelType>,
    pub campaign_id: Option<CampaignId>,
}

/// Per-status message counts with summed cost
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageStatusCounts {
    pub queued: i64,
    pub sending: i64,
    pub sent: i64,
    pub delivered: i64,
    pub failed: i64,
    pub bounced: i64,
    pub total_cost: f64,
}

impl MessageStatusCounts {
    pub fn total(&self) -> i64 {
        self.queued + self.sending + self.sent + self.delivered + self.failed + self.bounced
    }
}

/// Routing configuration for one channel
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub id: Uuid,
    pub channel: String,
    pub primary_provider: String,
    pub fallback_providers: serde_json::Value,
    pub routing_strategy: String,
    pub enable_fallback: bool,
    pub max_retries: i32,
    pub retry_strategy: String,
    pub initial_retry_delay_secs: i32,
    pub max_retry_delay_secs: i32,
    pub cost_threshold: Option<f64>,
    pub is_active: bool,
    pub priority: i32,
    pub additional_settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoutingConfig {
    /// Get channel enum
    pub fn channel_enum(&self) -> Option<ChannelType> {
        self.channel.parse().ok()
    }

    /// Unknown strategies fall back to Primary
    pub fn strategy(&self) -> RoutingStrategy {
        self.routing_strategy.parse().unwrap_or_default()
    }

    /// Unknown strategies fall back to Exponential
    pub fn retry_strategy_enum(&self) -> RetryStrategy {
        self.retry_strategy.parse().unwrap_or_default()
    }

    /// Fallback providers in configured order
    pub fn fallback_list(&self) -> Vec<String> {
        serde_json::from_value(self.fallback_providers.clone()).unwrap_or_default()
    }
}

/// Create routing config input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoutingConfig {
    pub channel: ChannelType,
    pub primary_provider: String,
    #[serde(default)]
    pub fallback_providers: Vec<String>,
    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
    #[serde(default = "default_true")]
    pub enable_fallback: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    #[serde(default = "default_initial_delay")]
    pub initial_retry_delay_secs: i32,
    #[serde(default = "default_max_delay")]
    pub max_retry_delay_secs: i32,
    pub cost_threshold: Option<f64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
    pub additional_settings: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> i32 {
    3
}

fn default_initial_delay() -> i32 {
    60
}

fn default_max_delay() -> i32 {
    3600
}

/// Update routing config input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRoutingConfig {
    pub primary_provider: Option<String>,
    pub fallback_providers: Option<Vec<String>>,
    pub routing_strategy: Option<RoutingStrategy>,
    pub enable_fallback: Option<bool>,
    pub max_retries: Option<i32>,
    pub retry_strategy: Option<RetryStrategy>,
    pub initial_retry_delay_secs: Option<i32>,
    pub max_retry_delay_secs: Option<i32>,
    pub cost_threshold: Option<f64>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
    pub additional_settings: Option<serde_json::Value>,
}

/// One provider send attempt for a message
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub message_id: MessageId,
    pub attempt_number: i32,
    pub channel: String,
    pub provider_name: String,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub external_id: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub cost_amount: Option<f64>,
    pub response_time_ms: i64,
    pub fallback_reason: Option<String>,
}

/// New delivery attempt input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeliveryAttempt {
    pub message_id: MessageId,
    pub attempt_number: i32,
    pub channel: ChannelType,
    pub provider_name: String,
    pub success: bool,
    pub external_id: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub cost_amount: Option<f64>,
    pub response_time_ms: i64,
    pub fallback_reason: Option<FallbackReason>,
}

/// Aggregated attempt counters for a period
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
pub struct AttemptAggregate {
    pub channel: String,
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub avg_response_time_ms: f64,
    pub total_cost: f64,
    pub fallback_count: i64,
}

/// Fixed-window limit on API requests
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiRateLimit {
    pub id: Uuid,
    pub user_id: Option<UserId>,
    pub tenant_id: Option<TenantId>,
    pub endpoint_pattern: String,
    pub max_requests: i32,
    pub time_window_secs: i32,
    pub current_request_count: i32,
    pub window_start: DateTime<Utc>,
    pub is_active: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create API rate limit input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApiRateLimit {
    pub user_id: Option<UserId>,
    pub tenant_id: Option<TenantId>,
    pub endpoint_pattern: String,
    pub max_requests: i32,
    pub time_window_secs: i32,
    #[serde(default)]
    pub priority: i32,
}

/// Update API rate limit input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateApiRateLimit {
    pub endpoint_pattern: Option<String>,
    pub max_requests: Option<i32>,
    pub time_window_secs: Option<i32>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
}

/// Fixed-window limit on sends through a provider
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProviderRateLimit {
    pub id: Uuid,
    pub provider_name: String,
    pub provider_type: String,
    pub max_requests: i32,
    pub time_window_secs: i32,
    pub current_request_count: i32,
    pub window_start: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A refused request, kept for auditing
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RateLimitLog {
    pub id: Uuid,
    pub user_id: Option<UserId>,
    pub tenant_id: Option<TenantId>,
    pub endpoint: String,
    pub ip_address: Option<String>,
    pub rule: String,
    pub request_count: i32,
    pub logged_at: DateTime<Utc>,
}

/// New rate limit log input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRateLimitLog {
    pub user_id: Option<UserId>,
    pub tenant_id: Option<TenantId>,
    pub endpoint: String,
    pub ip_address: Option<String>,
    pub rule: String,
    pub request_count: i32,
}

/// Rate limit log filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitLogFilter {
    pub user_id: Option<UserId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Per-contact frequency caps and counters
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FrequencyControl {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub max_per_day: i32,
    pub max_per_week: i32,
    pub max_per_month: i32,
    pub daily_count: i32,
    pub weekly_count: i32,
    pub monthly_count: i32,
    pub last_message_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Suppression list entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Suppression {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub address: String,
    pub suppression_type: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Create suppression input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSuppression {
    pub tenant_id: TenantId,
    pub address: String,
    pub suppression_type: SuppressionType,
    pub reason: Option<String>,
}
