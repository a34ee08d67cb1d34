//! Message handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use relaycast_common::types::{ChannelType, MessageStatus};
use relaycast_core::messages::{BulkMessage, NewMessage};
use relaycast_storage::models::{DeliveryAttempt, Message, MessageFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::{require_scope, require_tenant_access, AppState, AuthContext};
use crate::error::{api_error, ApiResult};

/// Query parameters for listing messages
#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub status: Option<MessageStatus>,
    pub channel: Option<ChannelType>,
    pub campaign_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Message list response
#[derive(Debug, Serialize)]
pub struct MessageListResponse {
    pub data: Vec<MessageResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Message response
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub channel: String,
    pub recipient: String,
    pub subject: Option<String>,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub provider_name: Option<String>,
    pub external_id: Option<String>,
    pub cost_amount: f64,
    pub error_message: Option<String>,
    pub media_urls: Vec<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Message> for MessageResponse {
    fn from(m: Message) -> Self {
        let media_urls = m.media_urls_vec();
        Self {
            id: m.id,
            campaign_id: m.campaign_id,
            contact_id: m.contact_id,
            channel: m.channel,
            recipient: m.recipient,
            subject: m.subject,
            status: m.status,
            scheduled_at: m.scheduled_at,
            retry_count: m.retry_count,
            max_retries: m.max_retries,
            provider_name: m.provider_name,
            external_id: m.external_id,
            cost_amount: m.cost_amount,
            error_message: m.error_message,
            media_urls,
            sent_at: m.sent_at,
            delivered_at: m.delivered_at,
            failed_at: m.failed_at,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BulkEnqueueResponse {
    pub queued: usize,
    pub message_ids: Vec<Uuid>,
}

/// List a tenant's messages
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Json<MessageListResponse>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:read")?;

    let filter = MessageFilter {
        status: query.status,
        channel: query.channel,
        campaign_id: query.campaign_id,
    };
    let limit = query.limit.clamp(1, 500);
    let offset = query.offset.max(0);

    let page = state
        .messages
        .list(tenant_id, &filter, limit, offset)
        .await
        .map_err(api_error)?;

    Ok(Json(MessageListResponse {
        data: page.data.into_iter().map(MessageResponse::from).collect(),
        total: page.total,
        limit: page.limit,
        offset: page.offset,
    }))
}

/// Queue one message
pub async fn enqueue_message(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<NewMessage>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:write")?;

    let message = state
        .messages
        .enqueue(tenant_id, input)
        .await
        .map_err(api_error)?;

    info!(tenant_id = %tenant_id, message_id = %message.id, "Message queued via API");
    Ok((StatusCode::CREATED, Json(message.into())))
}

/// Queue the same content for many recipients
pub async fn enqueue_bulk(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<BulkMessage>,
) -> ApiResult<(StatusCode, Json<BulkEnqueueResponse>)> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:write")?;

    let messages = state
        .messages
        .enqueue_bulk(tenant_id, input)
        .await
        .map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(BulkEnqueueResponse {
            queued: messages.len(),
            message_ids: messages.into_iter().map(|m| m.id).collect(),
        }),
    ))
}

pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((tenant_id, message_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<MessageResponse>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:read")?;

    let message = state
        .messages
        .get(tenant_id, message_id)
        .await
        .map_err(api_error)?;
    Ok(Json(message.into()))
}

/// Provider attempts for a message, oldest first
pub async fn list_attempts(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((tenant_id, message_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<DeliveryAttempt>>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:read")?;

    let attempts = state
        .messages
        .attempts(tenant_id, message_id)
        .await
        .map_err(api_error)?;
    Ok(Json(attempts))
}

/// Requeue a failed or bounced message
pub async fn retry_message(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((tenant_id, message_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<MessageResponse>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:write")?;

    let message = state
        .messages
        .retry_failed(tenant_id, message_id)
        .await
        .map_err(api_error)?;
    Ok(Json(message.into()))
}

pub async fn cancel_message(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((tenant_id, message_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<MessageResponse>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:write")?;

    let message = state
        .messages
        .cancel(tenant_id, message_id)
        .await
        .map_err(api_error)?;
    Ok(Json(message.into()))
}

/// Deliver a queued message immediately instead of waiting for the worker
pub async fn send_now(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((tenant_id, message_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<MessageResponse>> {
    require_tenant_access(&auth, tenant_id)?;
    require_scope(&auth, "messages:write")?;

    let message = state
        .worker
        .send_now(tenant_id, message_id)
        .await
        .map_err(api_error)?;
    Ok(Json(message.into()))
}
