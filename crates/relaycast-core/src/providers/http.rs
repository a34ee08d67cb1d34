//! Generic JSON-over-HTTP gateway provider

use std::time::Duration;

use async_trait::async_trait;
use relaycast_common::types::ChannelType;
use relaycast_common::{Error, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{MessageProvider, OutboundMessage, ProviderError, ProviderReceipt};

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    reference: String,
    channel: ChannelType,
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html_body: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    media_urls: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
    #[serde(default)]
    cost: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "error")]
    message: Option<String>,
}

/// Provider that POSTs messages to a gateway endpoint
pub struct HttpProvider {
    name: String,
    channel: ChannelType,
    endpoint: String,
    api_key: Option<String>,
    cost_per_message: f64,
    client: Client,
}

impl HttpProvider {
    pub fn new(
        name: &str,
        channel: ChannelType,
        endpoint: &str,
        api_key: Option<String>,
        timeout_secs: u64,
        cost_per_message: f64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client for {}: {}", name, e)))?;

        Ok(Self {
            name: name.to_string(),
            channel,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            cost_per_message,
            client,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(format!("{}: {}", self.name, err))
        } else if err.is_connect() {
            ProviderError::Unavailable(format!("{}: {}", self.name, err))
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

fn map_status(status: StatusCode, body: ErrorBody) -> ProviderError {
    let message = body
        .message
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited(message)
    } else if status.is_server_error() {
        ProviderError::Unavailable(format!("{} {}", status.as_u16(), message))
    } else {
        ProviderError::Rejected {
            code: body.code.unwrap_or_else(|| status.as_u16().to_string()),
            message,
        }
    }
}

#[async_trait]
impl MessageProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> ChannelType {
        self.channel
    }

    fn estimated_cost(&self, _message: &OutboundMessage) -> f64 {
        self.cost_per_message
    }

    async fn send(&self, message: &OutboundMessage) -> std::result::Result<ProviderReceipt, ProviderError> {
        if message.channel != self.channel {
            return Err(ProviderError::UnsupportedChannel(message.channel));
        }

        let payload = SendRequest {
            reference: message.id.to_string(),
            channel: message.channel,
            to: &message.recipient,
            subject: message.subject.as_deref(),
            body: message.body.as_deref(),
            html_body: message.html_body.as_deref(),
            media_urls: &message.media_urls,
        };

        let response = self
            .authorize(self.client.post(format!("{}/messages", self.endpoint)))
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<ErrorBody>().await.unwrap_or_default();
            let err = map_status(status, body);
            warn!(provider = %self.name, message_id = %message.id, error = %err, "Gateway rejected message");
            return Err(err);
        }

        let accepted: SendResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("Invalid gateway response: {}", e)))?;

        debug!(provider = %self.name, message_id = %message.id, external_id = %accepted.id, "Gateway accepted message");

        Ok(ProviderReceipt {
            external_id: accepted.id,
            cost: accepted.cost.unwrap_or(self.cost_per_message),
        })
    }

    async fn health_check(&self) -> std::result::Result<(), ProviderError> {
        let response = self
            .authorize(self.client.get(format!("{}/health", self.endpoint)))
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if response.status().is_server_error() {
            return Err(ProviderError::Unavailable(format!(
                "{} health returned {}",
                self.name,
                response.status()
            )));
        }
        Ok(())
    }
}
