//! Delivery providers - the gateways that actually carry SMS, MMS and email

mod health;
mod http;
mod mock;
mod registry;
mod smtp;

pub use health::{check_all, ProviderCheck};
pub use http::HttpProvider;
pub use mock::{MockBehavior, MockProvider};
pub use registry::ProviderRegistry;
pub use smtp::SmtpEmailProvider;

use async_trait::async_trait;
use relaycast_common::config::{ProviderConfig, ProviderKind};
use relaycast_common::types::{ChannelType, MessageId, TenantId};
use relaycast_common::{Error, Result};
use relaycast_storage::models::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// A message as handed to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub channel: ChannelType,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub html_body: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

impl OutboundMessage {
    /// Build from a stored message; `None` if its channel is unknown
    pub fn from_message(message: &Message) -> Option<Self> {
        Some(Self {
            id: message.id,
            tenant_id: message.tenant_id,
            channel: message.channel_enum()?,
            recipient: message.recipient.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            html_body: message.html_body.clone(),
            media_urls: message.media_urls_vec(),
        })
    }

    /// Text body length in characters
    pub fn body_chars(&self) -> usize {
        self.body.as_deref().map(|b| b.chars().count()).unwrap_or(0)
    }
}

/// What a provider returns for an accepted message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReceipt {
    /// The provider's identifier, quoted back in status callbacks
    pub external_id: String,
    /// Charged cost in account currency
    pub cost: f64,
}

/// Errors returned by providers
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider timed out: {0}")]
    Timeout(String),

    #[error("rejected by provider ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("recipient bounced: {0}")]
    Bounced(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider does not deliver {0} messages")]
    UnsupportedChannel(ChannelType),
}

impl ProviderError {
    /// Short machine-readable code stored with delivery attempts
    pub fn error_code(&self) -> String {
        match self {
            ProviderError::RateLimited(_) => "rate_limited".to_string(),
            ProviderError::Unavailable(_) => "unavailable".to_string(),
            ProviderError::Timeout(_) => "timeout".to_string(),
            ProviderError::Rejected { code, .. } => code.clone(),
            ProviderError::Bounced(_) => "bounced".to_string(),
            ProviderError::Transport(_) => "transport".to_string(),
            ProviderError::UnsupportedChannel(_) => "unsupported_channel".to_string(),
        }
    }

    /// Retrying the same message cannot succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProviderError::Rejected { .. }
                | ProviderError::Bounced(_)
                | ProviderError::UnsupportedChannel(_)
        )
    }

    /// Best-effort mapping of free-form provider error text
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("rate limit") || lower.contains("throttle") {
            ProviderError::RateLimited(text.to_string())
        } else if lower.contains("timeout") || lower.contains("timed out") {
            ProviderError::Timeout(text.to_string())
        } else if lower.contains("unavailable") {
            ProviderError::Unavailable(text.to_string())
        } else if lower.contains("bounce") || lower.contains("user unknown") {
            ProviderError::Bounced(text.to_string())
        } else {
            ProviderError::Rejected {
                code: "provider_error".to_string(),
                message: text.to_string(),
            }
        }
    }
}

/// A gateway able to deliver messages on one channel
#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Unique name referenced by routing configs
    fn name(&self) -> &str;

    /// Channel this provider delivers
    fn channel(&self) -> ChannelType;

    /// Expected cost of sending `message`, used for cost ordering and thresholds
    fn estimated_cost(&self, message: &OutboundMessage) -> f64;

    /// Hand the message to the gateway
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<ProviderReceipt, ProviderError>;

    /// Cheap liveness check
    async fn health_check(&self) -> std::result::Result<(), ProviderError> {
        Ok(())
    }
}

/// Build a provider from its configuration
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn MessageProvider>> {
    let provider: Arc<dyn MessageProvider> = match &config.kind {
        ProviderKind::Mock { fail_with } => {
            let behavior = match fail_with {
                Some(text) => MockBehavior::FailAlways(ProviderError::from_text(text)),
                None => MockBehavior::Succeed,
            };
            let mut mock = MockProvider::new(&config.name, config.channel).with_behavior(behavior);
            if let Some(cost) = config.cost_per_message {
                mock = mock.with_flat_cost(cost);
            }
            Arc::new(mock)
        }
        ProviderKind::Http {
            endpoint,
            api_key,
            timeout_secs,
        } => Arc::new(HttpProvider::new(
            &config.name,
            config.channel,
            endpoint,
            api_key.clone(),
            *timeout_secs,
            config.cost_per_message.unwrap_or(0.0),
        )?),
        ProviderKind::Smtp { .. } => {
            if config.channel != ChannelType::Email {
                return Err(Error::Config(format!(
                    "SMTP provider {} must use the email channel",
                    config.name
                )));
            }
            Arc::new(SmtpEmailProvider::from_config(config)?)
        }
    };

    Ok(provider)
}

/// Build the registry of every configured provider
pub fn build_registry(configs: &[ProviderConfig]) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for config in configs {
        if registry.get(&config.name).is_some() {
            return Err(Error::Config(format!(
                "Duplicate provider name: {}",
                config.name
            )));
        }
        registry.register(build_provider(config)?);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_text_classifies_common_failures() {
        assert!(matches!(
            ProviderError::from_text("Rate limit exceeded for account"),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            ProviderError::from_text("gateway timeout"),
            ProviderError::Timeout(_)
        ));
        assert!(matches!(
            ProviderError::from_text("Service Unavailable"),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            ProviderError::from_text("invalid number"),
            ProviderError::Rejected { .. }
        ));
    }

    #[test]
    fn test_permanence() {
        assert!(ProviderError::Bounced("x".into()).is_permanent());
        assert!(!ProviderError::Timeout("x".into()).is_permanent());
        assert_eq!(
            ProviderError::Rejected {
                code: "21211".into(),
                message: "invalid to".into()
            }
            .error_code(),
            "21211"
        );
    }

    #[test]
    fn test_build_registry_rejects_duplicates() {
        let toml = r#"
[[providers]]
name = "sms-a"
channel = "sms"
kind = "mock"

[[providers]]
name = "sms-a"
channel = "sms"
kind = "mock"
"#;
        let config: relaycast_common::Config = toml::from_str(toml).unwrap();
        assert!(build_registry(&config.providers).is_err());
    }

    #[test]
    fn test_build_registry_from_config() {
        let toml = r#"
[[providers]]
name = "sms-a"
channel = "sms"
kind = "mock"

[[providers]]
name = "email-a"
channel = "email"
kind = "mock"
fail_with = "service unavailable"
"#;
        let config: relaycast_common::Config = toml::from_str(toml).unwrap();
        let registry = build_registry(&config.providers).unwrap();
        assert_eq!(registry.list(), vec!["email-a", "sms-a"]);
        assert_eq!(registry.for_channel(ChannelType::Sms).len(), 1);
    }
}
