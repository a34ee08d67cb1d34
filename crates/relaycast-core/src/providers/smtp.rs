//! SMTP relay provider for the email channel

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use relaycast_common::config::{ProviderConfig, ProviderKind};
use relaycast_common::types::ChannelType;
use relaycast_common::{Error, Result};
use tracing::debug;
use uuid::Uuid;

use super::{MessageProvider, OutboundMessage, ProviderError, ProviderReceipt};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends email through an SMTP relay
pub struct SmtpEmailProvider {
    name: String,
    from: Mailbox,
    cost_per_message: f64,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpEmailProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let ProviderKind::Smtp {
            host,
            port,
            username,
            password,
            from_address,
            starttls,
        } = &config.kind
        else {
            return Err(Error::Config(format!("{} is not an SMTP provider", config.name)));
        };

        let from: Mailbox = from_address
            .parse()
            .map_err(|e| Error::Config(format!("Invalid from address {}: {}", from_address, e)))?;

        let mut transport = if *starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| Error::Config(format!("Failed to create SMTP transport: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        }
        .port(*port);

        if let (Some(username), Some(password)) = (username, password) {
            transport = transport.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            name: config.name.clone(),
            from,
            cost_per_message: config.cost_per_message.unwrap_or(0.0),
            mailer: transport.timeout(Some(SMTP_TIMEOUT)).build(),
        })
    }

    fn build_email(&self, message: &OutboundMessage, message_id: &str) -> std::result::Result<Message, ProviderError> {
        let to: Mailbox = message.recipient.parse().map_err(|e| ProviderError::Rejected {
            code: "invalid_recipient".to_string(),
            message: format!("Invalid to address: {}", e),
        })?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .message_id(Some(message_id.to_string()))
            .subject(message.subject.clone().unwrap_or_default());

        let email = match (&message.html_body, &message.body) {
            (Some(html), Some(text)) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::plain(text.clone()))
                    .singlepart(SinglePart::html(html.clone())),
            ),
            (Some(html), None) => builder.header(ContentType::TEXT_HTML).body(html.clone()),
            (None, Some(text)) => builder.header(ContentType::TEXT_PLAIN).body(text.clone()),
            (None, None) => builder.body(String::new()),
        };

        email.map_err(|e| ProviderError::Rejected {
            code: "invalid_message".to_string(),
            message: format!("Failed to build email: {}", e),
        })
    }
}

/// Sort an SMTP error into bounce, transient or permanent
fn classify_smtp_error(error: &str) -> ProviderError {
    if error.contains("5.1.1")
        || error.contains("550")
        || error.contains("User unknown")
        || error.contains("does not exist")
    {
        ProviderError::Bounced(error.to_string())
    } else if error.contains("timed out") || error.contains("timeout") {
        ProviderError::Timeout(error.to_string())
    } else if error.contains("421")
        || error.contains("450")
        || error.contains("451")
        || error.contains("temporarily")
        || error.contains("try again")
    {
        ProviderError::Unavailable(error.to_string())
    } else if error.contains("Connection") || error.contains("connection") {
        ProviderError::Unavailable(error.to_string())
    } else {
        ProviderError::Rejected {
            code: "smtp_error".to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl MessageProvider for SmtpEmailProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> ChannelType {
        ChannelType::Email
    }

    fn estimated_cost(&self, _message: &OutboundMessage) -> f64 {
        self.cost_per_message
    }

    async fn send(&self, message: &OutboundMessage) -> std::result::Result<ProviderReceipt, ProviderError> {
        if message.channel != ChannelType::Email {
            return Err(ProviderError::UnsupportedChannel(message.channel));
        }

        let message_id = format!("<{}.{}@relaycast>", message.id, Utc::now().timestamp());
        let email = self.build_email(message, &message_id)?;

        match self.mailer.send(email).await {
            Ok(response) => {
                debug!(provider = %self.name, message_id = %message.id, "SMTP relay accepted: {:?}", response.code());
                Ok(ProviderReceipt {
                    external_id: message_id,
                    cost: self.cost_per_message,
                })
            }
            Err(e) => Err(classify_smtp_error(&e.to_string())),
        }
    }

    async fn health_check(&self) -> std::result::Result<(), ProviderError> {
        match self.mailer.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ProviderError::Unavailable(format!("{} refused NOOP", self.name))),
            Err(e) => Err(ProviderError::Unavailable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(from: &str) -> ProviderConfig {
        ProviderConfig {
            name: "relay".to_string(),
            channel: ChannelType::Email,
            cost_per_message: Some(0.001),
            kind: ProviderKind::Smtp {
                host: "localhost".to_string(),
                port: 2525,
                username: None,
                password: None,
                from_address: from.to_string(),
                starttls: false,
            },
        }
    }

    #[test]
    fn test_classify_smtp_error() {
        assert!(matches!(
            classify_smtp_error("permanent error (550): 5.1.1 User unknown"),
            ProviderError::Bounced(_)
        ));
        assert!(matches!(
            classify_smtp_error("transient error (451): try again later"),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            classify_smtp_error("permanent error (554): message rejected"),
            ProviderError::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_from_address_is_config_error() {
        assert!(SmtpEmailProvider::from_config(&config("not an address")).is_err());
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_rejected_before_sending() {
        let provider = SmtpEmailProvider::from_config(&config("news@example.com")).unwrap();
        let message = OutboundMessage {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            channel: ChannelType::Email,
            recipient: "nobody".to_string(),
            subject: Some("Hello".to_string()),
            body: Some("Hi".to_string()),
            html_body: None,
            media_urls: Vec::new(),
        };

        let err = provider.send(&message).await.unwrap_err();
        assert!(err.is_permanent());
    }
}
