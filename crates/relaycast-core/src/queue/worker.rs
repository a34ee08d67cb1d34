//! Delivery worker - drains the message queue through the router

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use relaycast_common::config::DeliveryConfig;
use relaycast_common::types::{ContactId, MessageId, MessageStatus, SuppressionType, TenantId};
use relaycast_common::{Error, Result};
use relaycast_storage::models::Message;
use relaycast_storage::repository::MessageRepository;
use tokio::sync::Semaphore;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db_error;
use crate::metrics::DeliveryMetrics;
use crate::providers::OutboundMessage;
use crate::ratelimit::{FrequencyDecision, FrequencyGuard};
use crate::retry::{FailureClass, RetryDecision, RetryPolicy};
use crate::routing::{MessageRouter, RouteOutcome};
use crate::suppression::SuppressionList;

/// Messages left in `sending` longer than this are assumed orphaned
const STALE_SENDING_AFTER_MINS: i64 = 10;

/// Storage action that ends a routing pass
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Sent {
        provider: String,
        external_id: String,
        cost: f64,
    },
    Bounced {
        error: String,
    },
    Retry {
        at: DateTime<Utc>,
        attempt: i32,
        error: String,
    },
    Failed {
        error: String,
    },
}

impl Disposition {
    /// Status the message ends up in
    pub fn status(&self) -> MessageStatus {
        match self {
            Disposition::Sent { .. } => MessageStatus::Sent,
            Disposition::Bounced { .. } => MessageStatus::Bounced,
            Disposition::Retry { .. } => MessageStatus::Queued,
            Disposition::Failed { .. } => MessageStatus::Failed,
        }
    }
}

/// Map a routing outcome onto the message, applying the retry policy
pub fn settle(
    outcome: &RouteOutcome,
    retry: &RetryPolicy,
    retry_count: i32,
    now: DateTime<Utc>,
) -> Disposition {
    match outcome {
        RouteOutcome::Delivered {
            provider,
            external_id,
            cost,
            ..
        } => Disposition::Sent {
            provider: provider.clone(),
            external_id: external_id.clone(),
            cost: *cost,
        },
        RouteOutcome::Bounced { error, .. } => Disposition::Bounced {
            error: error.clone(),
        },
        RouteOutcome::Failed {
            error, permanent, ..
        } => {
            let class = if *permanent {
                FailureClass::Permanent
            } else {
                FailureClass::Transient
            };
            match retry.decide(retry_count, class) {
                RetryDecision::Retry { attempt, delay } => Disposition::Retry {
                    at: now + Duration::from_std(delay).unwrap_or_else(|_| Duration::zero()),
                    attempt,
                    error: error.clone(),
                },
                RetryDecision::Terminal(MessageStatus::Bounced) => Disposition::Bounced {
                    error: error.clone(),
                },
                RetryDecision::Terminal(_) => Disposition::Failed {
                    error: error.clone(),
                },
            }
        }
    }
}

/// Background processor for queued messages
pub struct DeliveryWorker {
    messages: MessageRepository,
    router: Arc<MessageRouter>,
    suppressions: SuppressionList,
    frequency: FrequencyGuard,
    metrics: Option<DeliveryMetrics>,
    config: DeliveryConfig,
}

impl DeliveryWorker {
    pub fn new(
        messages: MessageRepository,
        router: Arc<MessageRouter>,
        suppressions: SuppressionList,
        frequency: FrequencyGuard,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            messages,
            router,
            suppressions,
            frequency,
            metrics: None,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: DeliveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll the queue until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut ticker = interval(StdDuration::from_secs(self.config.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval_secs,
            "Delivery worker started"
        );

        let cutoff = Utc::now() - Duration::minutes(STALE_SENDING_AFTER_MINS);
        match self.messages.recover_stale_sending(cutoff).await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "Requeued messages left in sending"),
            Err(e) => error!(error = %e, "Failed to recover stale messages"),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.process_batch(&semaphore).await {
                error!(error = %e, "Error processing message queue");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(StdDuration::from_secs(self.config.error_backoff_secs)) => {}
                }
            }
        }

        info!("Delivery worker stopped");
    }

    /// Claim one batch of due messages and process it
    pub async fn process_batch(self: &Arc<Self>, semaphore: &Arc<Semaphore>) -> Result<usize> {
        let batch = self
            .messages
            .claim_due(self.config.batch_size)
            .await
            .map_err(db_error)?;

        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        debug!(count, "Processing claimed messages");

        let mut handles = Vec::with_capacity(count);
        for message in batch {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            let worker = Arc::clone(self);

            handles.push(tokio::spawn(async move {
                let id = message.id;
                if let Err(e) = worker.process(message).await {
                    error!(message_id = %id, error = %e, "Failed to process message");
                    worker.release(id, &e.to_string()).await;
                }
                drop(permit);
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Delivery task panicked");
            }
        }

        Ok(count)
    }

    /// Deliver a queued message right away, ignoring its schedule
    pub async fn send_now(&self, tenant_id: TenantId, id: MessageId) -> Result<Message> {
        let message = self
            .messages
            .claim_one(tenant_id, id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| Error::Conflict(format!("Message {} is not queued", id)))?;

        match self.process(message).await {
            Ok(Some(updated)) => Ok(updated),
            Ok(None) => self
                .messages
                .get(id)
                .await
                .map_err(db_error)?
                .ok_or_else(|| Error::NotFound(format!("Message {} not found", id))),
            Err(e) => {
                self.release(id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Put a message back on the queue after an internal error
    async fn release(&self, id: MessageId, error: &str) {
        let at = Utc::now() + Duration::seconds(self.config.error_backoff_secs as i64);
        if let Err(e) = self.messages.defer(id, at, error).await {
            error!(message_id = %id, error = %e, "Failed to requeue message");
        }
    }

    /// Run one claimed message through suppression, frequency caps and the
    /// router, then persist the result
    async fn process(&self, message: Message) -> Result<Option<Message>> {
        let Some(outbound) = OutboundMessage::from_message(&message) else {
            let error = format!("Unknown channel {}", message.channel);
            return self.finish(&message, Disposition::Failed { error }).await;
        };

        if self
            .suppressions
            .is_suppressed(message.tenant_id, &message.recipient)
            .await?
        {
            info!(message_id = %message.id, "Recipient suppressed");
            let error = "recipient suppressed".to_string();
            return self.finish(&message, Disposition::Failed { error }).await;
        }

        let reserved = match message.contact_id {
            Some(contact_id) => match self.frequency.reserve(message.tenant_id, contact_id).await? {
                FrequencyDecision::Allowed => Some(contact_id),
                FrequencyDecision::Capped { window, resume_at } => {
                    info!(
                        message_id = %message.id,
                        contact_id = %contact_id,
                        window = ?window,
                        resume_at = %resume_at,
                        "Contact frequency cap reached, deferring"
                    );
                    let reason = format!("frequency cap reached ({:?})", window).to_lowercase();
                    return self
                        .messages
                        .defer(message.id, resume_at, &reason)
                        .await
                        .map_err(db_error);
                }
            },
            None => None,
        };

        let result = match self
            .router
            .route(&outbound, message.retry_count, message.max_retries)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.release_reservation(&message, reserved).await;
                return Err(e);
            }
        };
        let disposition = settle(
            &result.outcome,
            &result.policy.retry,
            message.retry_count,
            Utc::now(),
        );
        if !matches!(disposition, Disposition::Sent { .. }) {
            self.release_reservation(&message, reserved).await;
        }
        self.finish(&message, disposition).await
    }

    async fn release_reservation(&self, message: &Message, contact_id: Option<ContactId>) {
        let Some(contact_id) = contact_id else {
            return;
        };
        if let Err(e) = self.frequency.release(message.tenant_id, contact_id).await {
            warn!(message_id = %message.id, error = %e, "Failed to release contact frequency reservation");
        }
    }

    async fn finish(&self, message: &Message, disposition: Disposition) -> Result<Option<Message>> {
        let status = disposition.status();
        let updated = match &disposition {
            Disposition::Sent {
                provider,
                external_id,
                cost,
            } => self
                .messages
                .mark_sent(message.id, provider, external_id, *cost)
                .await
                .map_err(db_error)?,
            Disposition::Bounced { error } => {
                let updated = self
                    .messages
                    .mark_bounced(message.id, error)
                    .await
                    .map_err(db_error)?;
                if let Err(e) = self
                    .suppressions
                    .add(
                        message.tenant_id,
                        &message.recipient,
                        SuppressionType::Bounce,
                        Some(error.clone()),
                    )
                    .await
                {
                    warn!(message_id = %message.id, error = %e, "Failed to suppress bounced recipient");
                }
                updated
            }
            Disposition::Retry { at, attempt, error } => {
                info!(
                    message_id = %message.id,
                    attempt,
                    retry_at = %at,
                    "Delivery failed, retry scheduled"
                );
                self.messages
                    .reschedule_retry(message.id, *at, error)
                    .await
                    .map_err(db_error)?
            }
            Disposition::Failed { error } => {
                warn!(message_id = %message.id, error = %error, "Delivery failed permanently");
                self.messages
                    .mark_failed(message.id, error)
                    .await
                    .map_err(db_error)?
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_processed(status);
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use relaycast_common::types::{FallbackReason, RetryStrategy};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn failed(permanent: bool) -> RouteOutcome {
        RouteOutcome::Failed {
            error: "provider unavailable: 503".into(),
            reason: FallbackReason::ProviderUnavailable,
            attempt_number: 2,
            permanent,
        }
    }

    #[test]
    fn delivered_becomes_sent() {
        let outcome = RouteOutcome::Delivered {
            provider: "twilio".into(),
            external_id: "SM1".into(),
            cost: 0.0075,
            attempt_number: 1,
            fallback_reason: None,
        };
        assert_eq!(
            settle(&outcome, &RetryPolicy::default(), 0, now()),
            Disposition::Sent {
                provider: "twilio".into(),
                external_id: "SM1".into(),
                cost: 0.0075
            }
        );
    }

    #[test]
    fn transient_failure_is_rescheduled_with_backoff() {
        let d = settle(&failed(false), &RetryPolicy::default(), 1, now());
        assert_eq!(
            d,
            Disposition::Retry {
                at: now() + Duration::seconds(120),
                attempt: 2,
                error: "provider unavailable: 503".into()
            }
        );
        assert_eq!(d.status(), MessageStatus::Queued);
    }

    #[test]
    fn exhausted_budget_fails() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Linear,
            max_retries: 2,
            ..RetryPolicy::default()
        };
        assert_eq!(
            settle(&failed(false), &policy, 2, now()).status(),
            MessageStatus::Failed
        );
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        assert_eq!(
            settle(&failed(true), &RetryPolicy::default(), 0, now()).status(),
            MessageStatus::Failed
        );
    }

    #[test]
    fn bounce_is_terminal() {
        let outcome = RouteOutcome::Bounced {
            provider: "ses".into(),
            error: "5.1.1 user unknown".into(),
        };
        assert_eq!(
            settle(&outcome, &RetryPolicy::default(), 0, now()),
            Disposition::Bounced {
                error: "5.1.1 user unknown".into()
            }
        );
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use crate::providers::{MockBehavior, MockProvider, ProviderError, ProviderRegistry};
    use crate::ratelimit::InMemoryProviderQuota;
    use crate::routing::{DbAttemptRecorder, ProviderHealthTracker, StaticPolicySource};
    use crate::test_support;
    use futures::future::join_all;
    use pretty_assertions::assert_eq;
    use relaycast_common::config::{FrequencyConfig, ProviderLimitsConfig};
    use relaycast_common::types::ChannelType;
    use relaycast_storage::repository::{
        DeliveryAttemptRepository, FrequencyControlRepository, SuppressionRepository,
    };
    use uuid::Uuid;

    const ONE_PER_DAY: FrequencyConfig = FrequencyConfig {
        max_per_day: 1,
        max_per_week: 10,
        max_per_month: 10,
    };

    struct Fixture {
        worker: Arc<DeliveryWorker>,
        messages: MessageRepository,
        frequency: FrequencyControlRepository,
        attempts: DeliveryAttemptRepository,
    }

    async fn fixture(provider: MockProvider, caps: FrequencyConfig) -> Fixture {
        let db = test_support::database().await;
        let pool = db.pool().clone();

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider));
        let attempts = DeliveryAttemptRepository::new(pool.clone());
        let router = Arc::new(MessageRouter::new(
            Arc::new(registry),
            Arc::new(ProviderHealthTracker::default()),
            Arc::new(StaticPolicySource::new()),
            Arc::new(InMemoryProviderQuota::new(ProviderLimitsConfig::default())),
            Arc::new(DbAttemptRecorder::new(attempts.clone())),
        ));

        let messages = MessageRepository::new(pool.clone());
        let frequency = FrequencyControlRepository::new(pool.clone());
        let worker = Arc::new(DeliveryWorker::new(
            messages.clone(),
            router,
            SuppressionList::new(SuppressionRepository::new(pool)),
            FrequencyGuard::new(frequency.clone(), caps),
            DeliveryConfig::default(),
        ));

        Fixture {
            worker,
            messages,
            frequency,
            attempts,
        }
    }

    async fn queue(f: &Fixture, tenant_id: TenantId, contact_id: Option<ContactId>) -> Message {
        f.messages
            .create(test_support::sms(tenant_id, contact_id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn concurrent_sends_to_one_contact_respect_the_daily_cap() {
        let f = fixture(MockProvider::new("twilio", ChannelType::Sms), ONE_PER_DAY).await;
        let tenant_id = Uuid::new_v4();
        let contact_id = Uuid::new_v4();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(queue(&f, tenant_id, Some(contact_id)).await.id);
        }

        let results = join_all(ids.iter().map(|id| {
            let worker = Arc::clone(&f.worker);
            let id = *id;
            async move { worker.send_now(tenant_id, id).await }
        }))
        .await;

        let statuses: Vec<MessageStatus> = results
            .into_iter()
            .map(|r| r.unwrap().status_enum().unwrap())
            .collect();
        let sent = statuses.iter().filter(|s| **s == MessageStatus::Sent).count();
        let deferred = statuses
            .iter()
            .filter(|s| **s == MessageStatus::Queued)
            .count();
        assert_eq!((sent, deferred), (1, 4));

        let control = f.frequency.get(tenant_id, contact_id).await.unwrap().unwrap();
        assert_eq!(control.daily_count, 1);
        assert_eq!(control.max_per_day, 1);
    }

    #[tokio::test]
    async fn sent_message_records_its_attempt() {
        let f = fixture(MockProvider::new("twilio", ChannelType::Sms), ONE_PER_DAY).await;
        let message = queue(&f, Uuid::new_v4(), None).await;

        let sent = f.worker.send_now(message.tenant_id, message.id).await.unwrap();
        assert_eq!(sent.status_enum(), Some(MessageStatus::Sent));
        assert_eq!(sent.provider_name.as_deref(), Some("twilio"));
        assert!(sent.external_id.is_some());

        let attempts = f.attempts.list_for_message(message.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].success);
        assert_eq!(attempts[0].attempt_number, 1);
    }

    #[tokio::test]
    async fn transient_failure_is_requeued_and_keeps_the_cap_free() {
        let provider = MockProvider::new("twilio", ChannelType::Sms).with_behavior(
            MockBehavior::FailAlways(ProviderError::Unavailable("503".into())),
        );
        let f = fixture(provider, ONE_PER_DAY).await;
        let tenant_id = Uuid::new_v4();
        let contact_id = Uuid::new_v4();
        let message = queue(&f, tenant_id, Some(contact_id)).await;

        let before = Utc::now();
        let requeued = f.worker.send_now(tenant_id, message.id).await.unwrap();
        assert_eq!(requeued.status_enum(), Some(MessageStatus::Queued));
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.scheduled_at.unwrap() > before);
        assert!(requeued.error_message.is_some());

        let control = f.frequency.get(tenant_id, contact_id).await.unwrap().unwrap();
        assert_eq!(control.daily_count, 0);
    }

    #[tokio::test]
    async fn rejected_message_fails_and_can_be_retried_by_hand() {
        let provider = MockProvider::new("twilio", ChannelType::Sms).with_behavior(
            MockBehavior::FailAlways(ProviderError::Rejected {
                code: "21211".into(),
                message: "invalid number".into(),
            }),
        );
        let f = fixture(provider, ONE_PER_DAY).await;
        let message = queue(&f, Uuid::new_v4(), None).await;

        let failed = f.worker.send_now(message.tenant_id, message.id).await.unwrap();
        assert_eq!(failed.status_enum(), Some(MessageStatus::Failed));

        let requeued = f
            .messages
            .requeue_for_retry(message.tenant_id, message.id)
            .await
            .unwrap()
            .expect("failed message with retries left is requeued");
        assert_eq!(requeued.status_enum(), Some(MessageStatus::Queued));
        assert_eq!(requeued.retry_count, 1);
    }
}
