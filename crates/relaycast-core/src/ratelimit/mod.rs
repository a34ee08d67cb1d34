//! Rate limiting: API callers, providers and contact frequency

mod api;
mod frequency;
mod provider;
mod window;

pub use api::{applicable_limits, pattern_matches, rule_text, ApiRateLimiter, RateLimitKey};
pub use frequency::{
    evaluate as evaluate_frequency, next_reset, roll_over, try_reserve, unreserve, unrecorded,
    FrequencyDecision, FrequencyGuard, FrequencyWindow,
};
pub use provider::{DbProviderQuota, InMemoryProviderQuota, ProviderQuota};
pub use window::{FixedWindow, RateLimitStatus};
