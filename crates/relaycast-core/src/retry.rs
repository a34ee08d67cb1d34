//! Retry and backoff policy for failed sends

use std::time::Duration;

use relaycast_common::types::{MessageStatus, RetryStrategy};
use relaycast_storage::models::RoutingConfig;
use serde::{Deserialize, Serialize};

/// How a failed delivery should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// May succeed later or through another provider
    Transient,
    /// The message itself was rejected
    Permanent,
    /// The recipient does not exist
    Bounced,
}

/// What to do with a message after a failed routing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after `delay`; `attempt` is the new retry count
    Retry { attempt: i32, delay: Duration },
    /// Stop retrying with this final status
    Terminal(MessageStatus),
}

/// Backoff parameters for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            initial_delay_secs: 60,
            max_delay_secs: 3600,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            strategy: config.retry_strategy_enum(),
            initial_delay_secs: config.initial_retry_delay_secs.max(0) as u64,
            max_delay_secs: config.max_retry_delay_secs.max(0) as u64,
            max_retries: config.max_retries.max(0),
        }
    }

    /// Defaults with the message's own retry budget
    pub fn with_max_retries(max_retries: i32) -> Self {
        Self {
            max_retries: max_retries.max(0),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at the maximum
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1) as u64;
        let initial = self.initial_delay_secs;

        let secs = match self.strategy {
            RetryStrategy::None => 0,
            RetryStrategy::Linear | RetryStrategy::Custom => initial.saturating_mul(attempt),
            RetryStrategy::Exponential => {
                let factor = 1u64.checked_shl((attempt - 1) as u32).unwrap_or(u64::MAX);
                initial.saturating_mul(factor)
            }
        };

        Duration::from_secs(secs.min(self.max_delay_secs))
    }

    pub fn decide(&self, retry_count: i32, failure: FailureClass) -> RetryDecision {
        match failure {
            FailureClass::Bounced => RetryDecision::Terminal(MessageStatus::Bounced),
            FailureClass::Permanent => RetryDecision::Terminal(MessageStatus::Failed),
            FailureClass::Transient if retry_count >= self.max_retries => {
                RetryDecision::Terminal(MessageStatus::Failed)
            }
            FailureClass::Transient => {
                let attempt = retry_count + 1;
                RetryDecision::Retry {
                    attempt,
                    delay: self.delay_for(attempt as u32),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy {
            strategy,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let p = policy(RetryStrategy::Exponential);
        let delays: Vec<u64> = (1..=8).map(|a| p.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![60, 120, 240, 480, 960, 1920, 3600, 3600]);
        assert_eq!(p.delay_for(200).as_secs(), 3600);
    }

    #[test]
    fn linear_and_custom_grow_by_initial() {
        let linear = policy(RetryStrategy::Linear);
        assert_eq!(linear.delay_for(1).as_secs(), 60);
        assert_eq!(linear.delay_for(3).as_secs(), 180);
        assert_eq!(linear.delay_for(100).as_secs(), 3600);
        assert_eq!(
            policy(RetryStrategy::Custom).delay_for(2),
            linear.delay_for(2)
        );
    }

    #[test]
    fn none_retries_immediately() {
        assert_eq!(policy(RetryStrategy::None).delay_for(5), Duration::ZERO);
    }

    #[test]
    fn decide_respects_budget_and_class() {
        let p = RetryPolicy::default();

        assert_eq!(
            p.decide(0, FailureClass::Transient),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(60)
            }
        );
        assert_eq!(
            p.decide(2, FailureClass::Transient),
            RetryDecision::Retry {
                attempt: 3,
                delay: Duration::from_secs(240)
            }
        );
        assert_eq!(
            p.decide(3, FailureClass::Transient),
            RetryDecision::Terminal(MessageStatus::Failed)
        );
        assert_eq!(
            p.decide(0, FailureClass::Bounced),
            RetryDecision::Terminal(MessageStatus::Bounced)
        );
        assert_eq!(
            p.decide(0, FailureClass::Permanent),
            RetryDecision::Terminal(MessageStatus::Failed)
        );
    }

    #[test]
    fn zero_budget_never_retries() {
        let p = RetryPolicy::with_max_retries(0);
        assert_eq!(
            p.decide(0, FailureClass::Transient),
            RetryDecision::Terminal(MessageStatus::Failed)
        );
    }
}
