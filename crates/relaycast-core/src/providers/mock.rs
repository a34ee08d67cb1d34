//! In-process provider simulator
//!
//! Prices messages the way the common gateways do and can be scripted to
//! fail, which makes it the provider of choice for local runs and tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use relaycast_common::types::ChannelType;
use tracing::debug;
use uuid::Uuid;

use super::{MessageProvider, OutboundMessage, ProviderError, ProviderReceipt};

const SMS_SEGMENT_CHARS: usize = 160;
const SMS_SEGMENT_PRICE: f64 = 0.0075;
const MMS_BASE_PRICE: f64 = 0.02;
const MMS_MEDIA_PRICE: f64 = 0.01;
const EMAIL_PRICE: f64 = 0.001;

/// Accepted messages kept for inspection; older ones are dropped
pub const DELIVERED_HISTORY: usize = 256;

/// How a mock provider answers sends
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Accept every message
    Succeed,
    /// Reject every message with this error
    FailAlways(ProviderError),
    /// Reject the first `n` sends, then accept
    FailFirst(u32, ProviderError),
}

/// Deterministic provider simulator
pub struct MockProvider {
    name: String,
    channel: ChannelType,
    behavior: MockBehavior,
    flat_cost: Option<f64>,
    latency: Option<Duration>,
    calls: AtomicU32,
    delivered: Mutex<VecDeque<OutboundMessage>>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, channel: ChannelType) -> Self {
        Self {
            name: name.into(),
            channel,
            behavior: MockBehavior::Succeed,
            flat_cost: None,
            latency: None,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Charge a fixed amount instead of channel pricing
    pub fn with_flat_cost(mut self, cost: f64) -> Self {
        self.flat_cost = Some(cost);
        self
    }

    /// Delay every send and health check
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Number of send calls received
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recently accepted messages, oldest first
    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn channel_price(&self, message: &OutboundMessage) -> f64 {
        match self.channel {
            ChannelType::Sms => {
                let segments = message.body_chars().div_ceil(SMS_SEGMENT_CHARS).max(1);
                segments as f64 * SMS_SEGMENT_PRICE
            }
            ChannelType::Mms => MMS_BASE_PRICE + message.media_urls.len() as f64 * MMS_MEDIA_PRICE,
            ChannelType::Email => EMAIL_PRICE,
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self.channel {
            ChannelType::Sms => "SMS",
            ChannelType::Mms => "MMS",
            ChannelType::Email => "EMAIL",
        }
    }
}

#[async_trait]
impl MessageProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> ChannelType {
        self.channel
    }

    fn estimated_cost(&self, message: &OutboundMessage) -> f64 {
        self.flat_cost.unwrap_or_else(|| self.channel_price(message))
    }

    async fn send(&self, message: &OutboundMessage) -> Result<ProviderReceipt, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if message.channel != self.channel {
            return Err(ProviderError::UnsupportedChannel(message.channel));
        }

        match &self.behavior {
            MockBehavior::Succeed => {}
            MockBehavior::FailAlways(err) => return Err(err.clone()),
            MockBehavior::FailFirst(n, err) if call < *n => return Err(err.clone()),
            MockBehavior::FailFirst(..) => {}
        }

        let external_id = format!("{}_{}", self.id_prefix(), Uuid::new_v4().simple());
        debug!(
            provider = %self.name,
            message_id = %message.id,
            external_id = %external_id,
            "Mock provider accepted message"
        );

        {
            let mut delivered = self
                .delivered
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if delivered.len() == DELIVERED_HISTORY {
                delivered.pop_front();
            }
            delivered.push_back(message.clone());
        }

        Ok(ProviderReceipt {
            external_id,
            cost: self.estimated_cost(message),
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        self.simulate_latency().await;
        match &self.behavior {
            MockBehavior::FailAlways(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn message(channel: ChannelType, body: &str, media: usize) -> OutboundMessage {
        OutboundMessage {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            channel,
            recipient: "+15551234567".to_string(),
            subject: None,
            body: Some(body.to_string()),
            html_body: None,
            media_urls: (0..media)
                .map(|i| format!("https://cdn.example.com/{i}.jpg"))
                .collect(),
        }
    }

    #[test]
    fn sms_is_priced_per_segment() {
        let provider = MockProvider::new("sms", ChannelType::Sms);
        let short = message(ChannelType::Sms, "hello", 0);
        let exact = message(ChannelType::Sms, &"a".repeat(160), 0);
        let long = message(ChannelType::Sms, &"a".repeat(161), 0);
        let empty = message(ChannelType::Sms, "", 0);

        assert_eq!(provider.estimated_cost(&short), 0.0075);
        assert_eq!(provider.estimated_cost(&exact), 0.0075);
        assert_eq!(provider.estimated_cost(&long), 0.015);
        assert_eq!(provider.estimated_cost(&empty), 0.0075);
    }

    #[test]
    fn mms_and_email_pricing() {
        let mms = MockProvider::new("mms", ChannelType::Mms);
        assert!((mms.estimated_cost(&message(ChannelType::Mms, "", 2)) - 0.04).abs() < 1e-9);

        let email = MockProvider::new("email", ChannelType::Email);
        assert_eq!(email.estimated_cost(&message(ChannelType::Email, "hi", 0)), 0.001);

        let flat = MockProvider::new("flat", ChannelType::Email).with_flat_cost(0.5);
        assert_eq!(flat.estimated_cost(&message(ChannelType::Email, "hi", 0)), 0.5);
    }

    #[tokio::test]
    async fn send_returns_prefixed_external_id() {
        let provider = MockProvider::new("sms", ChannelType::Sms);
        let receipt = provider
            .send(&message(ChannelType::Sms, "hello", 0))
            .await
            .unwrap();

        assert!(receipt.external_id.starts_with("SMS_"));
        assert_eq!(receipt.cost, 0.0075);
        assert_eq!(provider.delivered().len(), 1);
    }

    #[tokio::test]
    async fn fail_first_recovers() {
        let provider = MockProvider::new("sms", ChannelType::Sms)
            .with_behavior(MockBehavior::FailFirst(2, ProviderError::Timeout("slow".into())));
        let msg = message(ChannelType::Sms, "hello", 0);

        assert!(provider.send(&msg).await.is_err());
        assert!(provider.send(&msg).await.is_err());
        assert!(provider.send(&msg).await.is_ok());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn delivered_history_is_bounded() {
        let provider = MockProvider::new("sms", ChannelType::Sms);
        let mut last = None;
        for _ in 0..DELIVERED_HISTORY + 5 {
            let msg = message(ChannelType::Sms, "hello", 0);
            last = Some(msg.id);
            provider.send(&msg).await.unwrap();
        }

        let delivered = provider.delivered();
        assert_eq!(delivered.len(), DELIVERED_HISTORY);
        assert_eq!(delivered.last().map(|m| m.id), last);
        assert_eq!(provider.calls() as usize, DELIVERED_HISTORY + 5);
    }

    #[tokio::test]
    async fn wrong_channel_is_rejected() {
        let provider = MockProvider::new("sms", ChannelType::Sms);
        let err = provider
            .send(&message(ChannelType::Email, "hello", 0))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::UnsupportedChannel(ChannelType::Email));
    }
}
