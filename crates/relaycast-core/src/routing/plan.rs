//! Candidate ordering for one message

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use relaycast_common::types::{ChannelType, ProviderHealthState, RoutingStrategy};
use relaycast_storage::models::RoutingConfig;
use serde::Serialize;
use tracing::warn;

use super::health::ProviderHealthTracker;
use crate::providers::{MessageProvider, OutboundMessage, ProviderRegistry};
use crate::retry::RetryPolicy;

/// Routing rules in effect for a channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutePolicy {
    pub channel: ChannelType,
    pub primary_provider: Option<String>,
    pub fallback_providers: Vec<String>,
    pub strategy: RoutingStrategy,
    pub enable_fallback: bool,
    pub cost_threshold: Option<f64>,
    pub retry: RetryPolicy,
}

impl RoutePolicy {
    pub fn from_config(config: &RoutingConfig, channel: ChannelType) -> Self {
        Self {
            channel,
            primary_provider: Some(config.primary_provider.clone()),
            fallback_providers: config.fallback_list(),
            strategy: config.strategy(),
            enable_fallback: config.enable_fallback,
            cost_threshold: config.cost_threshold,
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Policy used when no routing config exists: every registered provider
    /// for the channel, in name order
    pub fn unconfigured(channel: ChannelType, max_retries: i32) -> Self {
        Self {
            channel,
            primary_provider: None,
            fallback_providers: Vec::new(),
            strategy: RoutingStrategy::Primary,
            enable_fallback: true,
            cost_threshold: None,
            retry: RetryPolicy::with_max_retries(max_retries),
        }
    }

    /// Provider names in strategy order, before health filtering
    fn chain(&self, registry: &ProviderRegistry) -> Vec<String> {
        let Some(primary) = &self.primary_provider else {
            return registry
                .for_channel(self.channel)
                .iter()
                .map(|p| p.name().to_string())
                .collect();
        };

        let mut chain = Vec::with_capacity(self.fallback_providers.len() + 1);
        match self.strategy {
            RoutingStrategy::Fallback => {
                chain.extend(self.fallback_providers.iter().cloned());
                chain.push(primary.clone());
            }
            _ => {
                chain.push(primary.clone());
                chain.extend(self.fallback_providers.iter().cloned());
            }
        }
        chain
    }
}

/// Per-channel rotation counters for round-robin routing
#[derive(Default)]
pub struct RoundRobinCursor {
    counters: Mutex<HashMap<ChannelType, Arc<AtomicUsize>>>,
}

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position for `channel`, advancing it
    pub fn next(&self, channel: ChannelType) -> usize {
        let counter = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(channel)
            .or_default()
            .clone();
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Order the providers a message should be offered to
pub fn plan_route(
    policy: &RoutePolicy,
    registry: &ProviderRegistry,
    health: &ProviderHealthTracker,
    message: &OutboundMessage,
    rotation: usize,
    now: Instant,
) -> Vec<Arc<dyn MessageProvider>> {
    let mut seen = HashSet::new();
    let mut candidates: Vec<Arc<dyn MessageProvider>> = Vec::new();

    for name in policy.chain(registry) {
        if !seen.insert(name.clone()) {
            continue;
        }
        match registry.get(&name) {
            Some(provider) if provider.channel() == policy.channel => candidates.push(provider),
            Some(provider) => warn!(
                provider = %name,
                provider_channel = %provider.channel(),
                channel = %policy.channel,
                "Skipping provider configured for the wrong channel"
            ),
            None => warn!(provider = %name, channel = %policy.channel, "Skipping unknown provider"),
        }
    }

    match policy.strategy {
        RoutingStrategy::RoundRobin if !candidates.is_empty() => {
            let shift = rotation % candidates.len();
            candidates.rotate_left(shift);
        }
        RoutingStrategy::LeastCost => {
            candidates.sort_by(|a, b| {
                a.estimated_cost(message)
                    .partial_cmp(&b.estimated_cost(message))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        RoutingStrategy::HighestReliability => {
            candidates.sort_by(|a, b| {
                health
                    .reliability(b.name())
                    .partial_cmp(&health.reliability(a.name()))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        _ => {}
    }

    let (active, degraded): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .filter(|p| health.is_eligible_at(p.name(), now))
        .partition(|p| health.effective_state_at(p.name(), now) == ProviderHealthState::Active);

    let mut ordered = active;
    ordered.extend(degraded);

    if !policy.enable_fallback {
        ordered.truncate(1);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;
    use crate::retry::RetryPolicy;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn registry() -> ProviderRegistry {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(
            MockProvider::new("alpha", ChannelType::Sms).with_flat_cost(0.03),
        ));
        reg.register(Arc::new(
            MockProvider::new("beta", ChannelType::Sms).with_flat_cost(0.01),
        ));
        reg.register(Arc::new(
            MockProvider::new("gamma", ChannelType::Sms).with_flat_cost(0.02),
        ));
        reg.register(Arc::new(MockProvider::new("mailer", ChannelType::Email)));
        reg
    }

    fn policy(strategy: RoutingStrategy) -> RoutePolicy {
        RoutePolicy {
            channel: ChannelType::Sms,
            primary_provider: Some("alpha".to_string()),
            fallback_providers: vec!["beta".to_string(), "gamma".to_string()],
            strategy,
            enable_fallback: true,
            cost_threshold: None,
            retry: RetryPolicy::default(),
        }
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            channel: ChannelType::Sms,
            recipient: "+15550001111".to_string(),
            subject: None,
            body: Some("hi".to_string()),
            html_body: None,
            media_urls: Vec::new(),
        }
    }

    fn names(policy: &RoutePolicy, health: &ProviderHealthTracker, rotation: usize) -> Vec<String> {
        plan_route(policy, &registry(), health, &message(), rotation, Instant::now())
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    #[test]
    fn primary_then_fallbacks() {
        let health = ProviderHealthTracker::default();
        assert_eq!(
            names(&policy(RoutingStrategy::Primary), &health, 0),
            vec!["alpha", "beta", "gamma"]
        );
    }

    #[test]
    fn fallback_strategy_tries_fallbacks_first() {
        let health = ProviderHealthTracker::default();
        assert_eq!(
            names(&policy(RoutingStrategy::Fallback), &health, 0),
            vec!["beta", "gamma", "alpha"]
        );
    }

    #[test]
    fn round_robin_rotates() {
        let health = ProviderHealthTracker::default();
        let p = policy(RoutingStrategy::RoundRobin);
        assert_eq!(names(&p, &health, 1), vec!["beta", "gamma", "alpha"]);
        assert_eq!(names(&p, &health, 5), vec!["gamma", "alpha", "beta"]);
    }

    #[test]
    fn least_cost_sorts_by_estimate() {
        let health = ProviderHealthTracker::default();
        assert_eq!(
            names(&policy(RoutingStrategy::LeastCost), &health, 0),
            vec!["beta", "gamma", "alpha"]
        );
    }

    #[test]
    fn highest_reliability_sorts_by_history() {
        let health = ProviderHealthTracker::default();
        health.record_failure("alpha");
        health.record_success("alpha");
        health.record_success("gamma");
        health.record_failure("beta");

        assert_eq!(
            names(&policy(RoutingStrategy::HighestReliability), &health, 0),
            vec!["gamma", "alpha", "beta"]
        );
    }

    #[test]
    fn failed_removed_and_degraded_demoted() {
        let health = ProviderHealthTracker::default();
        for _ in 0..5 {
            health.record_failure("alpha");
        }
        for _ in 0..3 {
            health.record_failure("beta");
        }

        assert_eq!(
            names(&policy(RoutingStrategy::Primary), &health, 0),
            vec!["gamma", "beta"]
        );
    }

    #[test]
    fn unknown_duplicate_and_wrong_channel_skipped() {
        let health = ProviderHealthTracker::default();
        let mut p = policy(RoutingStrategy::Primary);
        p.fallback_providers = vec![
            "ghost".to_string(),
            "alpha".to_string(),
            "mailer".to_string(),
            "gamma".to_string(),
        ];
        assert_eq!(names(&p, &health, 0), vec!["alpha", "gamma"]);
    }

    #[test]
    fn disabled_fallback_keeps_first_eligible() {
        let health = ProviderHealthTracker::default();
        for _ in 0..5 {
            health.record_failure("alpha");
        }
        let mut p = policy(RoutingStrategy::Primary);
        p.enable_fallback = false;
        assert_eq!(names(&p, &health, 0), vec!["beta"]);
    }

    #[test]
    fn unconfigured_uses_every_channel_provider() {
        let health = ProviderHealthTracker::default();
        let p = RoutePolicy::unconfigured(ChannelType::Sms, 3);
        assert_eq!(names(&p, &health, 0), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn cursor_advances_per_channel() {
        let cursor = RoundRobinCursor::new();
        assert_eq!(cursor.next(ChannelType::Sms), 0);
        assert_eq!(cursor.next(ChannelType::Sms), 1);
        assert_eq!(cursor.next(ChannelType::Email), 0);
    }
}
