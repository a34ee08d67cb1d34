//! Provider selection and fallback for a single message

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use relaycast_common::types::{ChannelType, FallbackReason};
use relaycast_common::Result;
use relaycast_storage::models::NewDeliveryAttempt;
use relaycast_storage::repository::{DeliveryAttemptRepository, RoutingConfigRepository};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::fallback::classify_failure;
use super::health::ProviderHealthTracker;
use super::plan::{plan_route, RoundRobinCursor, RoutePolicy};
use crate::db_error;
use crate::metrics::DeliveryMetrics;
use crate::providers::{OutboundMessage, ProviderError, ProviderRegistry};
use crate::ratelimit::ProviderQuota;

/// Source of the routing policy for a channel
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn policy_for(&self, channel: ChannelType, max_retries: i32) -> Result<RoutePolicy>;
}

/// Policies from `channel_routing_configs`
pub struct DbPolicySource {
    repo: RoutingConfigRepository,
}

impl DbPolicySource {
    pub fn new(repo: RoutingConfigRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl PolicySource for DbPolicySource {
    async fn policy_for(&self, channel: ChannelType, max_retries: i32) -> Result<RoutePolicy> {
        let config = self
            .repo
            .active_for_channel(channel)
            .await
            .map_err(db_error)?;
        Ok(match config {
            Some(config) => RoutePolicy::from_config(&config, channel),
            None => RoutePolicy::unconfigured(channel, max_retries),
        })
    }
}

/// Fixed policies held in memory
#[derive(Default)]
pub struct StaticPolicySource {
    policies: HashMap<ChannelType, RoutePolicy>,
}

impl StaticPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: RoutePolicy) -> Self {
        self.policies.insert(policy.channel, policy);
        self
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn policy_for(&self, channel: ChannelType, max_retries: i32) -> Result<RoutePolicy> {
        Ok(self
            .policies
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| RoutePolicy::unconfigured(channel, max_retries)))
    }
}

/// Sink for per-provider delivery attempts
#[async_trait]
pub trait AttemptRecorder: Send + Sync {
    async fn record(&self, attempt: NewDeliveryAttempt) -> Result<()>;
}

pub struct DbAttemptRecorder {
    repo: DeliveryAttemptRepository,
}

impl DbAttemptRecorder {
    pub fn new(repo: DeliveryAttemptRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl AttemptRecorder for DbAttemptRecorder {
    async fn record(&self, attempt: NewDeliveryAttempt) -> Result<()> {
        self.repo.create(&attempt).await.map_err(db_error)?;
        Ok(())
    }
}

/// Keeps attempts in memory, in recording order
#[derive(Default)]
pub struct InMemoryAttemptRecorder {
    attempts: Mutex<Vec<NewDeliveryAttempt>>,
}

impl InMemoryAttemptRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> Vec<NewDeliveryAttempt> {
        self.attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AttemptRecorder for InMemoryAttemptRecorder {
    async fn record(&self, attempt: NewDeliveryAttempt) -> Result<()> {
        self.attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(attempt);
        Ok(())
    }
}

/// How routing a message ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    Delivered {
        provider: String,
        external_id: String,
        cost: f64,
        attempt_number: i32,
        fallback_reason: Option<FallbackReason>,
    },
    Bounced {
        provider: String,
        error: String,
    },
    Failed {
        error: String,
        reason: FallbackReason,
        attempt_number: i32,
        /// The last provider rejected the message itself
        permanent: bool,
    },
}

/// Outcome together with the policy it was routed under
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub outcome: RouteOutcome,
    pub policy: RoutePolicy,
}

/// Offers a message to providers in planned order until one accepts it
pub struct MessageRouter {
    registry: Arc<ProviderRegistry>,
    health: Arc<ProviderHealthTracker>,
    policies: Arc<dyn PolicySource>,
    quota: Arc<dyn ProviderQuota>,
    attempts: Arc<dyn AttemptRecorder>,
    metrics: Option<DeliveryMetrics>,
    cursor: RoundRobinCursor,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: Arc<ProviderHealthTracker>,
        policies: Arc<dyn PolicySource>,
        quota: Arc<dyn ProviderQuota>,
        attempts: Arc<dyn AttemptRecorder>,
    ) -> Self {
        Self {
            registry,
            health,
            policies,
            quota,
            attempts,
            metrics: None,
            cursor: RoundRobinCursor::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: DeliveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<ProviderHealthTracker> {
        &self.health
    }

    /// Policy that would route a message on `channel`
    pub async fn policy_for(&self, channel: ChannelType, max_retries: i32) -> Result<RoutePolicy> {
        self.policies.policy_for(channel, max_retries).await
    }

    /// Route one message.
    ///
    /// `retry_count` is the number of earlier routing passes; attempts made in
    /// this pass are numbered `retry_count + 1`.
    pub async fn route(
        &self,
        message: &OutboundMessage,
        retry_count: i32,
        max_retries: i32,
    ) -> Result<RouteResult> {
        let policy = self.policies.policy_for(message.channel, max_retries).await?;
        let rotation = self.cursor.next(message.channel);
        let candidates = plan_route(
            &policy,
            &self.registry,
            &self.health,
            message,
            rotation,
            Instant::now(),
        );

        let attempt_number = retry_count + 1;

        if candidates.is_empty() {
            warn!(message_id = %message.id, channel = %message.channel, "No eligible provider");
            return Ok(RouteResult {
                outcome: RouteOutcome::Failed {
                    error: format!("No eligible provider for {}", message.channel),
                    reason: FallbackReason::ProviderUnavailable,
                    attempt_number,
                    permanent: false,
                },
                policy,
            });
        }

        let mut pending_reason: Option<FallbackReason> = None;
        let mut last_error: Option<(String, FallbackReason, bool)> = None;
        let mut sent_any = false;

        for provider in candidates {
            let name = provider.name().to_string();

            if let (Some(reason), Some(metrics)) = (pending_reason, &self.metrics) {
                metrics.record_fallback(reason);
            }

            if let Some(threshold) = policy.cost_threshold {
                let estimate = provider.estimated_cost(message);
                if estimate > threshold {
                    debug!(
                        provider = %name,
                        estimate,
                        threshold,
                        "Skipping provider above cost threshold"
                    );
                    pending_reason = Some(FallbackReason::CostThreshold);
                    last_error = Some((
                        format!("{} exceeds cost threshold ({} > {})", name, estimate, threshold),
                        FallbackReason::CostThreshold,
                        false,
                    ));
                    continue;
                }
            }

            if !self.quota.try_acquire(&name, message.channel).await {
                debug!(provider = %name, "Skipping rate limited provider");
                pending_reason = Some(FallbackReason::RateLimitExceeded);
                last_error = Some((
                    format!("{} rate limit exceeded", name),
                    FallbackReason::RateLimitExceeded,
                    false,
                ));
                continue;
            }

            if !self.health.try_acquire(&name) {
                debug!(provider = %name, "Recovery trial already in flight");
                pending_reason = Some(FallbackReason::ProviderUnavailable);
                last_error = Some((
                    format!("{} is recovering", name),
                    FallbackReason::ProviderUnavailable,
                    false,
                ));
                continue;
            }

            sent_any = true;
            let started = Instant::now();
            let result = provider.send(message).await;
            let elapsed = started.elapsed();

            let attempt = NewDeliveryAttempt {
                message_id: message.id,
                attempt_number,
                channel: message.channel,
                provider_name: name.clone(),
                success: result.is_ok(),
                external_id: result.as_ref().ok().map(|r| r.external_id.clone()),
                error_message: result.as_ref().err().map(ToString::to_string),
                error_code: result.as_ref().err().map(ProviderError::error_code),
                cost_amount: result.as_ref().ok().map(|r| r.cost),
                response_time_ms: elapsed.as_millis() as i64,
                fallback_reason: pending_reason,
            };
            if let Err(e) = self.attempts.record(attempt).await {
                warn!(message_id = %message.id, provider = %name, error = %e, "Failed to record delivery attempt");
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_attempt(&name, message.channel, result.is_ok(), elapsed.as_secs_f64());
            }

            match result {
                Ok(receipt) => {
                    self.health.record_success(&name);
                    info!(
                        message_id = %message.id,
                        provider = %name,
                        external_id = %receipt.external_id,
                        fallback_reason = ?pending_reason,
                        "Message accepted by provider"
                    );
                    return Ok(RouteResult {
                        outcome: RouteOutcome::Delivered {
                            provider: name,
                            external_id: receipt.external_id,
                            cost: receipt.cost,
                            attempt_number,
                            fallback_reason: pending_reason,
                        },
                        policy,
                    });
                }
                Err(ProviderError::Bounced(reason)) => {
                    // The provider answered; the recipient is the problem
                    self.health.record_success(&name);
                    info!(message_id = %message.id, provider = %name, reason = %reason, "Recipient bounced");
                    return Ok(RouteResult {
                        outcome: RouteOutcome::Bounced {
                            provider: name,
                            error: reason,
                        },
                        policy,
                    });
                }
                Err(err) => {
                    if err.is_permanent() {
                        self.health.record_success(&name);
                    } else {
                        self.health.record_failure(&name);
                    }
                    let reason = classify_failure(&err);
                    warn!(
                        message_id = %message.id,
                        provider = %name,
                        error = %err,
                        reason = %reason,
                        "Provider send failed"
                    );
                    pending_reason = Some(reason);
                    last_error = Some((err.to_string(), reason, err.is_permanent()));
                }
            }
        }

        let (error, reason, permanent) = last_error.unwrap_or_else(|| {
            (
                "All providers failed".to_string(),
                FallbackReason::ProviderUnavailable,
                false,
            )
        });

        let reason = if sent_any {
            reason
        } else {
            FallbackReason::ProviderUnavailable
        };

        Ok(RouteResult {
            outcome: RouteOutcome::Failed {
                error,
                reason,
                attempt_number,
                permanent: sent_any && permanent,
            },
            policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MessageProvider, MockBehavior, MockProvider};
    use crate::ratelimit::InMemoryProviderQuota;
    use crate::retry::RetryPolicy;
    use crate::routing::HealthThresholds;
    use pretty_assertions::assert_eq;
    use relaycast_common::config::{ProviderLimitsConfig, WindowLimit};
    use relaycast_common::types::RoutingStrategy;
    use uuid::Uuid;

    struct Harness {
        router: MessageRouter,
        quota: Arc<InMemoryProviderQuota>,
        attempts: Arc<InMemoryAttemptRecorder>,
        health: Arc<ProviderHealthTracker>,
    }

    fn harness(providers: Vec<MockProvider>, policy: Option<RoutePolicy>) -> Harness {
        let mut registry = ProviderRegistry::new();
        for p in providers {
            registry.register(Arc::new(p));
        }
        let mut policies = StaticPolicySource::new();
        if let Some(policy) = policy {
            policies = policies.with_policy(policy);
        }
        let quota = Arc::new(InMemoryProviderQuota::new(ProviderLimitsConfig::default()));
        let attempts = Arc::new(InMemoryAttemptRecorder::new());
        let health = Arc::new(ProviderHealthTracker::new(HealthThresholds::default()));

        let router = MessageRouter::new(
            Arc::new(registry),
            health.clone(),
            Arc::new(policies),
            quota.clone(),
            attempts.clone(),
        );
        Harness {
            router,
            quota,
            attempts,
            health,
        }
    }

    fn policy(primary: &str, fallbacks: &[&str]) -> RoutePolicy {
        RoutePolicy {
            channel: ChannelType::Sms,
            primary_provider: Some(primary.to_string()),
            fallback_providers: fallbacks.iter().map(|s| s.to_string()).collect(),
            strategy: RoutingStrategy::Primary,
            enable_fallback: true,
            cost_threshold: None,
            retry: RetryPolicy::default(),
        }
    }

    fn sms() -> OutboundMessage {
        OutboundMessage {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            channel: ChannelType::Sms,
            recipient: "+15551234567".to_string(),
            subject: None,
            body: Some("Flash sale today".to_string()),
            html_body: None,
            media_urls: Vec::new(),
        }
    }

    fn failing(name: &str, err: ProviderError) -> MockProvider {
        MockProvider::new(name, ChannelType::Sms).with_behavior(MockBehavior::FailAlways(err))
    }

    #[tokio::test]
    async fn primary_success() {
        let h = harness(
            vec![
                MockProvider::new("primary", ChannelType::Sms),
                MockProvider::new("backup", ChannelType::Sms),
            ],
            Some(policy("primary", &["backup"])),
        );

        let result = h.router.route(&sms(), 0, 3).await.unwrap();
        match result.outcome {
            RouteOutcome::Delivered {
                provider,
                attempt_number,
                fallback_reason,
                ..
            } => {
                assert_eq!(provider, "primary");
                assert_eq!(attempt_number, 1);
                assert_eq!(fallback_reason, None);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.attempts.attempts().len(), 1);
    }

    #[tokio::test]
    async fn falls_back_with_reason() {
        let h = harness(
            vec![
                failing("primary", ProviderError::Unavailable("503".into())),
                MockProvider::new("backup", ChannelType::Sms),
            ],
            Some(policy("primary", &["backup"])),
        );

        let result = h.router.route(&sms(), 2, 3).await.unwrap();
        assert!(matches!(
            result.outcome,
            RouteOutcome::Delivered {
                ref provider,
                attempt_number: 3,
                fallback_reason: Some(FallbackReason::ProviderUnavailable),
                ..
            } if provider == "backup"
        ));

        let attempts = h.attempts.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].success);
        assert_eq!(attempts[0].fallback_reason, None);
        assert_eq!(attempts[0].error_code.as_deref(), Some("unavailable"));
        assert!(attempts[1].success);
        assert_eq!(
            attempts[1].fallback_reason,
            Some(FallbackReason::ProviderUnavailable)
        );
        assert_eq!(h.health.reliability("primary"), 0.0);
    }

    #[tokio::test]
    async fn bounce_stops_fallback() {
        let backup = MockProvider::new("backup", ChannelType::Sms);
        let h = harness(
            vec![
                failing("primary", ProviderError::Bounced("unknown subscriber".into())),
                backup,
            ],
            Some(policy("primary", &["backup"])),
        );

        let result = h.router.route(&sms(), 0, 3).await.unwrap();
        assert_eq!(
            result.outcome,
            RouteOutcome::Bounced {
                provider: "primary".into(),
                error: "unknown subscriber".into()
            }
        );
        assert_eq!(h.attempts.attempts().len(), 1);
    }

    #[tokio::test]
    async fn disabled_fallback_uses_only_first() {
        let mut p = policy("primary", &["backup"]);
        p.enable_fallback = false;
        let h = harness(
            vec![
                failing("primary", ProviderError::Timeout("30s".into())),
                MockProvider::new("backup", ChannelType::Sms),
            ],
            Some(p),
        );

        // Third routing pass
        let result = h.router.route(&sms(), 2, 3).await.unwrap();
        assert!(matches!(
            result.outcome,
            RouteOutcome::Failed {
                reason: FallbackReason::ProviderUnavailable,
                attempt_number: 3,
                permanent: false,
                ..
            }
        ));
        let attempts = h.attempts.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt_number, 3);
    }

    #[tokio::test]
    async fn cost_threshold_skips_expensive_provider() {
        let mut p = policy("premium", &["budget"]);
        p.cost_threshold = Some(0.01);
        let h = harness(
            vec![
                MockProvider::new("premium", ChannelType::Sms).with_flat_cost(0.05),
                MockProvider::new("budget", ChannelType::Sms).with_flat_cost(0.005),
            ],
            Some(p),
        );

        let result = h.router.route(&sms(), 0, 3).await.unwrap();
        assert!(matches!(
            result.outcome,
            RouteOutcome::Delivered {
                ref provider,
                fallback_reason: Some(FallbackReason::CostThreshold),
                ..
            } if provider == "budget"
        ));
        // The skipped provider was never called
        assert_eq!(h.attempts.attempts().len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_provider_skipped() {
        let h = harness(
            vec![
                MockProvider::new("primary", ChannelType::Sms),
                MockProvider::new("backup", ChannelType::Sms),
            ],
            Some(policy("primary", &["backup"])),
        );
        h.quota.set_limit("primary", WindowLimit::new(0, 60));

        let result = h.router.route(&sms(), 0, 3).await.unwrap();
        assert!(matches!(
            result.outcome,
            RouteOutcome::Delivered {
                ref provider,
                fallback_reason: Some(FallbackReason::RateLimitExceeded),
                ..
            } if provider == "backup"
        ));
    }

    #[tokio::test]
    async fn all_skipped_is_provider_unavailable() {
        let h = harness(
            vec![MockProvider::new("primary", ChannelType::Sms)],
            Some(policy("primary", &[])),
        );
        h.quota.set_limit("primary", WindowLimit::new(0, 60));

        let result = h.router.route(&sms(), 0, 3).await.unwrap();
        assert!(matches!(
            result.outcome,
            RouteOutcome::Failed {
                reason: FallbackReason::ProviderUnavailable,
                permanent: false,
                ..
            }
        ));
        assert!(h.attempts.attempts().is_empty());
    }

    #[tokio::test]
    async fn no_providers_is_provider_unavailable() {
        let h = harness(Vec::new(), None);
        let result = h.router.route(&sms(), 0, 3).await.unwrap();
        assert!(matches!(
            result.outcome,
            RouteOutcome::Failed {
                reason: FallbackReason::ProviderUnavailable,
                ..
            }
        ));
        assert_eq!(result.policy.retry.max_retries, 3);
    }

    #[tokio::test]
    async fn permanent_rejection_reported() {
        let h = harness(
            vec![failing(
                "primary",
                ProviderError::Rejected {
                    code: "21211".into(),
                    message: "invalid number".into(),
                },
            )],
            Some(policy("primary", &[])),
        );

        let result = h.router.route(&sms(), 0, 3).await.unwrap();
        assert!(matches!(
            result.outcome,
            RouteOutcome::Failed {
                reason: FallbackReason::PrimaryFailed,
                permanent: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn repeated_failures_take_provider_out_of_rotation() {
        let h = harness(
            vec![
                failing("primary", ProviderError::Unavailable("down".into())),
                MockProvider::new("backup", ChannelType::Sms),
            ],
            Some(policy("primary", &["backup"])),
        );

        for _ in 0..5 {
            h.router.route(&sms(), 0, 3).await.unwrap();
        }
        let before = h.attempts.attempts().len();
        h.router.route(&sms(), 0, 3).await.unwrap();
        let new: Vec<_> = h.attempts.attempts()[before..]
            .iter()
            .map(|a| a.provider_name.clone())
            .collect();
        assert_eq!(new, vec!["backup"]);
    }

    #[tokio::test]
    async fn unconfigured_channel_uses_registered_providers() {
        let h = harness(vec![MockProvider::new("solo", ChannelType::Sms)], None);
        let result = h.router.route(&sms(), 0, 3).await.unwrap();
        assert!(matches!(
            result.outcome,
            RouteOutcome::Delivered { ref provider, .. } if provider == "solo"
        ));
        assert_eq!(h.router.registry().get("solo").unwrap().channel(), ChannelType::Sms);
    }

    #[tokio::test]
    async fn concurrent_recovery_trial_is_not_duplicated() {
        let h = harness(
            vec![
                MockProvider::new("primary", ChannelType::Sms),
                MockProvider::new("backup", ChannelType::Sms),
            ],
            Some(policy("primary", &["backup"])),
        );
        let long_ago = Instant::now()
            .checked_sub(std::time::Duration::from_secs(120))
            .unwrap();
        for _ in 0..5 {
            h.health.record_failure_at("primary", long_ago);
        }
        // Another pass already holds the failed provider's trial send
        assert!(h.health.try_acquire("primary"));

        let result = h.router.route(&sms(), 0, 3).await.unwrap();
        assert!(matches!(
            result.outcome,
            RouteOutcome::Delivered { ref provider, .. } if provider == "backup"
        ));
        let tried: Vec<_> = h
            .attempts
            .attempts()
            .into_iter()
            .map(|a| a.provider_name)
            .collect();
        assert_eq!(tried, vec!["backup"]);
    }
}
