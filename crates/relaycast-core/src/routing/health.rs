//! Per-provider health state machine
//!
//! Consecutive failures push a provider from Active to Degraded and then to
//! Failed. A failed provider is skipped until its recovery timeout elapses,
//! after which a single send at a time is let through as a recovery trial.
//! Consecutive successes bring a degraded provider back to Active.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use relaycast_common::config::HealthConfig;
use relaycast_common::types::ProviderHealthState;
use serde::Serialize;
use tracing::{info, warn};

/// Thresholds driving state transitions
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub failure_threshold: u32,
    pub failed_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            failed_threshold: config.failed_threshold.max(config.failure_threshold.max(1)),
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
            success_threshold: config.success_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone)]
struct ProviderStats {
    state: ProviderHealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_successes: u64,
    total_failures: u64,
    last_failure: Option<Instant>,
    trial_started: Option<Instant>,
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self {
            state: ProviderHealthState::Active,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_successes: 0,
            total_failures: 0,
            last_failure: None,
            trial_started: None,
        }
    }
}

impl ProviderStats {
    fn reliability(&self) -> f64 {
        let total = self.total_successes + self.total_failures;
        if total == 0 {
            1.0
        } else {
            self.total_successes as f64 / total as f64
        }
    }

    fn recovery_elapsed(&self, now: Instant, timeout: Duration) -> bool {
        self.last_failure
            .map(|at| now.saturating_duration_since(at) >= timeout)
            .unwrap_or(true)
    }

    /// A trial send is in flight until it reports back or outlives the timeout
    fn trial_in_flight(&self, now: Instant, timeout: Duration) -> bool {
        self.trial_started
            .map(|at| now.saturating_duration_since(at) < timeout)
            .unwrap_or(false)
    }
}

/// Health of one provider, as exposed to the API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub state: ProviderHealthState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub reliability: f64,
}

/// Thread-safe registry of provider health
pub struct ProviderHealthTracker {
    thresholds: HealthThresholds,
    providers: RwLock<HashMap<String, ProviderStats>>,
}

impl ProviderHealthTracker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub fn state(&self, provider: &str) -> ProviderHealthState {
        self.read(|p| p.get(provider).map(|s| s.state))
            .unwrap_or(ProviderHealthState::Active)
    }

    /// Whether the provider may be tried right now
    pub fn is_eligible(&self, provider: &str) -> bool {
        self.is_eligible_at(provider, Instant::now())
    }

    pub fn is_eligible_at(&self, provider: &str, now: Instant) -> bool {
        self.read(|p| match p.get(provider) {
            None => true,
            Some(stats) => match stats.state {
                ProviderHealthState::Active | ProviderHealthState::Degraded => true,
                ProviderHealthState::Failed => {
                    let timeout = self.thresholds.recovery_timeout;
                    stats.recovery_elapsed(now, timeout) && !stats.trial_in_flight(now, timeout)
                }
            },
        })
    }

    /// Admit one send to `provider`.
    ///
    /// Always true unless the provider is Failed; then only the first caller
    /// after the recovery timeout gets through, until that trial reports back.
    pub fn try_acquire(&self, provider: &str) -> bool {
        self.try_acquire_at(provider, Instant::now())
    }

    pub fn try_acquire_at(&self, provider: &str, now: Instant) -> bool {
        let mut providers = self.write();
        let Some(stats) = providers.get_mut(provider) else {
            return true;
        };
        if stats.state != ProviderHealthState::Failed {
            return true;
        }

        let timeout = self.thresholds.recovery_timeout;
        if !stats.recovery_elapsed(now, timeout) || stats.trial_in_flight(now, timeout) {
            return false;
        }
        stats.trial_started = Some(now);
        info!(provider = %provider, "Letting one send through to failed provider");
        true
    }

    /// State used for candidate ordering; a failed provider past its
    /// recovery timeout is treated as degraded
    pub fn effective_state_at(&self, provider: &str, now: Instant) -> ProviderHealthState {
        match self.state(provider) {
            ProviderHealthState::Failed if self.is_eligible_at(provider, now) => {
                ProviderHealthState::Degraded
            }
            state => state,
        }
    }

    pub fn record_success(&self, provider: &str) {
        let mut providers = self.write();
        let stats = providers.entry(provider.to_string()).or_default();

        stats.total_successes += 1;
        stats.trial_started = None;
        stats.consecutive_failures = 0;
        stats.consecutive_successes += 1;

        match stats.state {
            ProviderHealthState::Failed => {
                // The recovery trial went through
                stats.state = ProviderHealthState::Degraded;
                stats.consecutive_successes = 1;
                info!(provider = %provider, "Provider recovered to degraded");
                if self.thresholds.success_threshold <= 1 {
                    stats.state = ProviderHealthState::Active;
                }
            }
            ProviderHealthState::Degraded
                if stats.consecutive_successes >= self.thresholds.success_threshold =>
            {
                stats.state = ProviderHealthState::Active;
                info!(provider = %provider, "Provider back to active");
            }
            _ => {}
        }
    }

    pub fn record_failure(&self, provider: &str) {
        self.record_failure_at(provider, Instant::now());
    }

    pub fn record_failure_at(&self, provider: &str, now: Instant) {
        let mut providers = self.write();
        let stats = providers.entry(provider.to_string()).or_default();

        stats.total_failures += 1;
        stats.trial_started = None;
        stats.consecutive_successes = 0;
        stats.consecutive_failures += 1;
        stats.last_failure = Some(now);

        let next = if stats.consecutive_failures >= self.thresholds.failed_threshold {
            ProviderHealthState::Failed
        } else if stats.consecutive_failures >= self.thresholds.failure_threshold {
            ProviderHealthState::Degraded
        } else {
            stats.state
        };

        if next != stats.state {
            warn!(
                provider = %provider,
                from = %stats.state,
                to = %next,
                consecutive_failures = stats.consecutive_failures,
                "Provider health changed"
            );
            stats.state = next;
        }
    }

    /// Share of successful sends; 1.0 without history
    pub fn reliability(&self, provider: &str) -> f64 {
        self.read(|p| p.get(provider).map(ProviderStats::reliability))
            .unwrap_or(1.0)
    }

    /// Forget all history for a provider
    pub fn reset(&self, provider: &str) {
        self.write().remove(provider);
    }

    /// Health of every provider seen so far, sorted by name
    pub fn snapshot(&self) -> Vec<ProviderHealth> {
        let mut health: Vec<ProviderHealth> = self.read(|p| {
            p.iter()
                .map(|(name, stats)| ProviderHealth {
                    provider: name.clone(),
                    state: stats.state,
                    consecutive_failures: stats.consecutive_failures,
                    total_successes: stats.total_successes,
                    total_failures: stats.total_failures,
                    reliability: stats.reliability(),
                })
                .collect()
        });
        health.sort_by(|a, b| a.provider.cmp(&b.provider));
        health
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<String, ProviderStats>) -> T) -> T {
        let guard = self
            .providers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&guard)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ProviderStats>> {
        self.providers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for ProviderHealthTracker {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tracker() -> ProviderHealthTracker {
        ProviderHealthTracker::new(HealthThresholds {
            failure_threshold: 3,
            failed_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        })
    }

    #[test]
    fn unknown_provider_is_active_and_eligible() {
        let t = tracker();
        assert_eq!(t.state("twilio"), ProviderHealthState::Active);
        assert!(t.is_eligible("twilio"));
        assert_eq!(t.reliability("twilio"), 1.0);
    }

    #[test]
    fn failures_degrade_then_fail() {
        let t = tracker();
        let now = Instant::now();

        for _ in 0..2 {
            t.record_failure_at("twilio", now);
        }
        assert_eq!(t.state("twilio"), ProviderHealthState::Active);

        t.record_failure_at("twilio", now);
        assert_eq!(t.state("twilio"), ProviderHealthState::Degraded);
        assert!(t.is_eligible_at("twilio", now));

        t.record_failure_at("twilio", now);
        t.record_failure_at("twilio", now);
        assert_eq!(t.state("twilio"), ProviderHealthState::Failed);
        assert!(!t.is_eligible_at("twilio", now));
    }

    #[test]
    fn failed_provider_retried_after_recovery_timeout() {
        let t = tracker();
        let now = Instant::now();
        for _ in 0..5 {
            t.record_failure_at("twilio", now);
        }

        assert!(!t.is_eligible_at("twilio", now + Duration::from_secs(59)));
        let later = now + Duration::from_secs(60);
        assert!(t.is_eligible_at("twilio", later));
        assert_eq!(
            t.effective_state_at("twilio", later),
            ProviderHealthState::Degraded
        );
    }

    #[test]
    fn one_recovery_trial_at_a_time() {
        let t = tracker();
        let now = Instant::now();
        for _ in 0..5 {
            t.record_failure_at("twilio", now);
        }

        let later = now + Duration::from_secs(61);
        assert!(!t.try_acquire_at("twilio", now + Duration::from_secs(30)));
        assert!(t.try_acquire_at("twilio", later));
        assert!(!t.try_acquire_at("twilio", later));
        assert!(!t.is_eligible_at("twilio", later));

        // The trial send failed: wait out another recovery timeout
        t.record_failure_at("twilio", later);
        assert!(!t.try_acquire_at("twilio", later + Duration::from_secs(1)));
        assert!(t.try_acquire_at("twilio", later + Duration::from_secs(60)));

        // A trial that never reports back stops blocking after the timeout
        assert!(t.try_acquire_at("twilio", later + Duration::from_secs(120)));
    }

    #[test]
    fn healthy_providers_are_never_gated() {
        let t = tracker();
        assert!(t.try_acquire("twilio"));
        t.record_failure("twilio");
        assert!(t.try_acquire("twilio"));
        assert!(t.try_acquire("twilio"));
    }

    #[test]
    fn successes_restore_active() {
        let t = tracker();
        let now = Instant::now();
        for _ in 0..5 {
            t.record_failure_at("twilio", now);
        }

        t.record_success("twilio");
        assert_eq!(t.state("twilio"), ProviderHealthState::Degraded);

        t.record_success("twilio");
        assert_eq!(t.state("twilio"), ProviderHealthState::Active);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let t = tracker();
        t.record_failure("twilio");
        t.record_failure("twilio");
        t.record_success("twilio");
        t.record_failure("twilio");
        t.record_failure("twilio");
        assert_eq!(t.state("twilio"), ProviderHealthState::Active);
    }

    #[test]
    fn reliability_and_snapshot() {
        let t = tracker();
        t.record_success("b");
        t.record_success("b");
        t.record_success("b");
        t.record_failure("b");
        t.record_success("a");

        assert_eq!(t.reliability("b"), 0.75);
        let names: Vec<_> = t.snapshot().into_iter().map(|h| h.provider).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
