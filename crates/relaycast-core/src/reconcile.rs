//! Provider delivery callbacks
//!
//! Providers deliver status webhooks at least once and in no particular
//! order. Each event is claimed in `processed_callbacks` before it is
//! applied, and message status only ever moves forward, so replays and late
//! arrivals leave the message untouched. A callback can beat the worker's
//! write of the provider's id; its claim is released so the redelivery lands.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use relaycast_common::types::{MessageId, MessageStatus, SuppressionType};
use relaycast_common::Result;
use relaycast_storage::repository::{CallbackRepository, MessageRepository};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::db_error;
use crate::suppression::SuppressionList;

type HmacSha256 = Hmac<Sha256>;

/// A status update reported by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCallback {
    pub provider_name: String,
    /// Provider's unique event id; derived from message and status when absent
    pub event_id: Option<String>,
    pub external_id: String,
    pub status: String,
    pub error: Option<String>,
    pub cost: Option<f64>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl ProviderCallback {
    pub fn event_key(&self) -> String {
        self.event_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}:{}", self.external_id, self.status.to_lowercase()))
    }
}

/// What applying a callback did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        message_id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },
    /// The event was processed before
    Duplicate,
    /// The message is already at or past the reported status
    Stale {
        message_id: MessageId,
        current: MessageStatus,
    },
    UnknownMessage,
    /// The provider status has no meaning here
    Ignored { status: String },
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied { .. } => "applied",
            ReconcileOutcome::Duplicate => "duplicate",
            ReconcileOutcome::Stale { .. } => "stale",
            ReconcileOutcome::UnknownMessage => "unknown_message",
            ReconcileOutcome::Ignored { .. } => "ignored",
        }
    }

    /// Whether the event is finished with; an unknown message may simply not
    /// be stored yet, so its event stays open for redelivery
    pub fn settles_event(&self) -> bool {
        !matches!(self, ReconcileOutcome::UnknownMessage)
    }

    fn message_id(&self) -> Option<MessageId> {
        match self {
            ReconcileOutcome::Applied { message_id, .. }
            | ReconcileOutcome::Stale { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }
}

/// Map provider status vocabulary onto message status
pub fn map_provider_status(status: &str) -> Option<MessageStatus> {
    match status.trim().to_lowercase().as_str() {
        "queued" | "accepted" | "scheduled" => Some(MessageStatus::Queued),
        "sending" | "sent" => Some(MessageStatus::Sent),
        "delivered" => Some(MessageStatus::Delivered),
        "failed" | "undelivered" => Some(MessageStatus::Failed),
        "bounced" => Some(MessageStatus::Bounced),
        _ => None,
    }
}

/// The status to move to, if `incoming` advances `current`
pub fn next_status(current: MessageStatus, incoming: MessageStatus) -> Option<MessageStatus> {
    if current.is_terminal() || incoming.rank() <= current.rank() {
        None
    } else {
        Some(incoming)
    }
}

/// Base64 HMAC-SHA256 of `payload`
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    BASE64.encode(mac.finalize().into_bytes())
}

/// Constant-time check of a base64 HMAC-SHA256 signature
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(expected) = BASE64.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Applies provider callbacks exactly once
#[derive(Clone)]
pub struct DeliveryReconciler {
    messages: MessageRepository,
    callbacks: CallbackRepository,
    suppressions: SuppressionList,
}

impl DeliveryReconciler {
    pub fn new(
        messages: MessageRepository,
        callbacks: CallbackRepository,
        suppressions: SuppressionList,
    ) -> Self {
        Self {
            messages,
            callbacks,
            suppressions,
        }
    }

    pub async fn apply(&self, callback: &ProviderCallback) -> Result<ReconcileOutcome> {
        let Some(incoming) = map_provider_status(&callback.status) else {
            debug!(
                provider = %callback.provider_name,
                status = %callback.status,
                "Ignoring unmapped provider status"
            );
            return Ok(ReconcileOutcome::Ignored {
                status: callback.status.clone(),
            });
        };

        let event_id = callback.event_key();
        let claimed = self
            .callbacks
            .claim(&callback.provider_name, &event_id)
            .await
            .map_err(db_error)?;
        if !claimed {
            debug!(provider = %callback.provider_name, event_id = %event_id, "Duplicate callback");
            return Ok(ReconcileOutcome::Duplicate);
        }

        match self.apply_claimed(callback, incoming).await {
            Ok(outcome) if !outcome.settles_event() => {
                self.release_claim(&callback.provider_name, &event_id).await;
                Ok(outcome)
            }
            Ok(outcome) => {
                if let Err(e) = self
                    .callbacks
                    .complete(
                        &callback.provider_name,
                        &event_id,
                        outcome.message_id(),
                        outcome.as_str(),
                    )
                    .await
                {
                    warn!(event_id = %event_id, error = %e, "Failed to store callback outcome");
                }
                Ok(outcome)
            }
            Err(e) => {
                self.release_claim(&callback.provider_name, &event_id).await;
                Err(e)
            }
        }
    }

    /// Let the provider's redelivery try again
    async fn release_claim(&self, provider_name: &str, event_id: &str) {
        if let Err(e) = self.callbacks.release(provider_name, event_id).await {
            warn!(event_id = %event_id, error = %e, "Failed to release callback claim");
        }
    }

    async fn apply_claimed(
        &self,
        callback: &ProviderCallback,
        incoming: MessageStatus,
    ) -> Result<ReconcileOutcome> {
        let Some(message) = self
            .messages
            .find_by_external_id(&callback.provider_name, &callback.external_id)
            .await
            .map_err(db_error)?
        else {
            warn!(
                provider = %callback.provider_name,
                external_id = %callback.external_id,
                "Callback for unknown message"
            );
            return Ok(ReconcileOutcome::UnknownMessage);
        };

        let current = message.status_enum().unwrap_or(MessageStatus::Queued);
        let Some(next) = next_status(current, incoming) else {
            return Ok(ReconcileOutcome::Stale {
                message_id: message.id,
                current,
            });
        };

        let error = match next {
            MessageStatus::Failed | MessageStatus::Bounced => Some(
                callback
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("Provider reported {}", callback.status)),
            ),
            _ => None,
        };

        let updated = self
            .messages
            .apply_callback_status(message.id, current, next, error.as_deref(), callback.cost)
            .await
            .map_err(db_error)?;

        let Some(updated) = updated else {
            // Another writer moved the message first
            let current = self
                .messages
                .get(message.id)
                .await
                .map_err(db_error)?
                .and_then(|m| m.status_enum())
                .unwrap_or(current);
            return Ok(ReconcileOutcome::Stale {
                message_id: message.id,
                current,
            });
        };

        if next == MessageStatus::Bounced {
            self.suppressions
                .add(
                    updated.tenant_id,
                    &updated.recipient,
                    SuppressionType::Bounce,
                    error,
                )
                .await?;
        }

        info!(
            message_id = %message.id,
            provider = %callback.provider_name,
            from = %current,
            to = %next,
            "Applied delivery callback"
        );
        Ok(ReconcileOutcome::Applied {
            message_id: message.id,
            from: current,
            to: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn provider_status_vocabulary() {
        assert_eq!(map_provider_status("accepted"), Some(MessageStatus::Queued));
        assert_eq!(map_provider_status("Sending"), Some(MessageStatus::Sent));
        assert_eq!(map_provider_status("DELIVERED"), Some(MessageStatus::Delivered));
        assert_eq!(map_provider_status("undelivered"), Some(MessageStatus::Failed));
        assert_eq!(map_provider_status("bounced"), Some(MessageStatus::Bounced));
        assert_eq!(map_provider_status("read"), None);
    }

    #[test]
    fn status_only_moves_forward() {
        use MessageStatus::*;
        assert_eq!(next_status(Sending, Sent), Some(Sent));
        assert_eq!(next_status(Sent, Delivered), Some(Delivered));
        assert_eq!(next_status(Sent, Bounced), Some(Bounced));
        assert_eq!(next_status(Sent, Sent), None);
        assert_eq!(next_status(Sent, Queued), None);
        assert_eq!(next_status(Delivered, Sent), None);
        assert_eq!(next_status(Delivered, Failed), None);
        assert_eq!(next_status(Failed, Delivered), None);
    }

    #[test]
    fn signature_round_trip() {
        let payload = br#"{"external_id":"SM1","status":"delivered"}"#;
        let signature = sign("whsec", payload);

        assert!(verify_signature("whsec", payload, &signature));
        assert!(!verify_signature("other", payload, &signature));
        assert!(!verify_signature("whsec", b"tampered", &signature));
        assert!(!verify_signature("whsec", payload, "not base64!"));
    }

    #[test]
    fn event_key_falls_back_to_message_and_status() {
        let mut callback = ProviderCallback {
            provider_name: "twilio".into(),
            event_id: None,
            external_id: "SM1".into(),
            status: "Delivered".into(),
            error: None,
            cost: None,
            occurred_at: None,
        };
        assert_eq!(callback.event_key(), "SM1:delivered");

        callback.event_id = Some("evt_9".into());
        assert_eq!(callback.event_key(), "evt_9");
    }

    #[test]
    fn only_unknown_messages_leave_the_event_open() {
        assert!(!ReconcileOutcome::UnknownMessage.settles_event());
        assert!(ReconcileOutcome::Duplicate.settles_event());
        assert!(ReconcileOutcome::Ignored {
            status: "read".into()
        }
        .settles_event());
        assert!(ReconcileOutcome::Stale {
            message_id: uuid::Uuid::nil(),
            current: MessageStatus::Delivered
        }
        .settles_event());
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(ReconcileOutcome::Duplicate.as_str(), "duplicate");
        assert_eq!(
            ReconcileOutcome::Ignored {
                status: "read".into()
            }
            .as_str(),
            "ignored"
        );
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use crate::test_support;
    use pretty_assertions::assert_eq;
    use relaycast_storage::models::Message;
    use relaycast_storage::repository::SuppressionRepository;
    use uuid::Uuid;

    struct Fixture {
        reconciler: DeliveryReconciler,
        messages: MessageRepository,
        suppressions: SuppressionList,
    }

    async fn fixture() -> Fixture {
        let db = test_support::database().await;
        let pool = db.pool().clone();
        let messages = MessageRepository::new(pool.clone());
        let suppressions = SuppressionList::new(SuppressionRepository::new(pool.clone()));
        Fixture {
            reconciler: DeliveryReconciler::new(
                messages.clone(),
                CallbackRepository::new(pool),
                suppressions.clone(),
            ),
            messages,
            suppressions,
        }
    }

    /// Store a message the worker has handed to twilio as `external_id`
    async fn sent_message(messages: &MessageRepository, external_id: &str) -> Message {
        let tenant_id = Uuid::new_v4();
        let message = messages
            .create(test_support::sms(tenant_id, None))
            .await
            .unwrap();
        messages
            .claim_one(tenant_id, message.id)
            .await
            .unwrap()
            .expect("claimed");
        messages
            .mark_sent(message.id, "twilio", external_id, 0.0075)
            .await
            .unwrap()
            .expect("marked sent")
    }

    fn external_id() -> String {
        format!("SM{}", Uuid::new_v4().simple())
    }

    fn callback(external_id: &str, status: &str) -> ProviderCallback {
        ProviderCallback {
            provider_name: "twilio".into(),
            event_id: Some(format!("evt_{}", Uuid::new_v4().simple())),
            external_id: external_id.to_string(),
            status: status.to_string(),
            error: None,
            cost: None,
            occurred_at: None,
        }
    }

    #[tokio::test]
    async fn early_callback_applies_on_redelivery() {
        let f = fixture().await;
        let external_id = external_id();
        let delivered = callback(&external_id, "delivered");

        let outcome = f.reconciler.apply(&delivered).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::UnknownMessage);

        let message = sent_message(&f.messages, &external_id).await;
        let outcome = f.reconciler.apply(&delivered).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                message_id: message.id,
                from: MessageStatus::Sent,
                to: MessageStatus::Delivered,
            }
        );

        let stored = f.messages.get(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(MessageStatus::Delivered));
    }

    #[tokio::test]
    async fn replayed_event_is_a_duplicate() {
        let f = fixture().await;
        let external_id = external_id();
        let message = sent_message(&f.messages, &external_id).await;
        let delivered = callback(&external_id, "delivered");

        assert!(matches!(
            f.reconciler.apply(&delivered).await.unwrap(),
            ReconcileOutcome::Applied { .. }
        ));
        assert_eq!(
            f.reconciler.apply(&delivered).await.unwrap(),
            ReconcileOutcome::Duplicate
        );

        let stored = f.messages.get(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(MessageStatus::Delivered));
    }

    #[tokio::test]
    async fn late_events_do_not_move_status_back() {
        let f = fixture().await;
        let external_id = external_id();
        let message = sent_message(&f.messages, &external_id).await;

        f.reconciler
            .apply(&callback(&external_id, "delivered"))
            .await
            .unwrap();

        for status in ["sent", "failed"] {
            assert_eq!(
                f.reconciler
                    .apply(&callback(&external_id, status))
                    .await
                    .unwrap(),
                ReconcileOutcome::Stale {
                    message_id: message.id,
                    current: MessageStatus::Delivered,
                }
            );
        }

        // The row changed under a reconciler holding an older status
        let moved = f
            .messages
            .apply_callback_status(
                message.id,
                MessageStatus::Sent,
                MessageStatus::Failed,
                Some("late"),
                None,
            )
            .await
            .unwrap();
        assert!(moved.is_none());
    }

    #[tokio::test]
    async fn bounce_suppresses_the_recipient() {
        let f = fixture().await;
        let external_id = external_id();
        let message = sent_message(&f.messages, &external_id).await;

        let mut bounced = callback(&external_id, "bounced");
        bounced.error = Some("550 mailbox unavailable".into());
        assert_eq!(
            f.reconciler.apply(&bounced).await.unwrap(),
            ReconcileOutcome::Applied {
                message_id: message.id,
                from: MessageStatus::Sent,
                to: MessageStatus::Bounced,
            }
        );

        assert!(f
            .suppressions
            .is_suppressed(message.tenant_id, &message.recipient)
            .await
            .unwrap());
    }
}
