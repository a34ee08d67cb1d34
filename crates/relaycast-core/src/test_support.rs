//! Fixtures for tests against a live Postgres (`--features integration`)

use relaycast_common::config::DatabaseConfig;
use relaycast_common::types::{ChannelType, ContactId, TenantId};
use relaycast_storage::models::CreateMessage;
use relaycast_storage::DatabasePool;

/// Connect to `DATABASE_URL` and bring the schema up to date
pub(crate) async fn database() -> DatabasePool {
    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost:5432/relaycast_test".to_string());
    let db = DatabasePool::new(&DatabaseConfig {
        url: Some(url),
        ..DatabaseConfig::default()
    })
    .await
    .expect("connect to test database");
    db.migrate().await.expect("run migrations");
    db
}

pub(crate) fn sms(tenant_id: TenantId, contact_id: Option<ContactId>) -> CreateMessage {
    CreateMessage {
        tenant_id,
        campaign_id: None,
        contact_id,
        user_id: None,
        channel: ChannelType::Sms,
        recipient: "+15550001111".to_string(),
        subject: None,
        body: Some("Your order has shipped".to_string()),
        html_body: None,
        media_urls: Vec::new(),
        scheduled_at: None,
        max_retries: 3,
    }
}
