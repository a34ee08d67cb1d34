//! Common types for Relaycast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tenants
pub type TenantId = Uuid;

/// Unique identifier for users
pub type UserId = Uuid;

/// Unique identifier for messages
pub type MessageId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for contacts
pub type ContactId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Implements snake_case `Display`/`FromStr` for a fieldless enum so it can be
/// stored in TEXT columns and parsed back from rows and query strings.
macro_rules! text_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The stored text form
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(format!("Invalid {}: {}", $label, s)),
                }
            }
        }
    };
}

/// Delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Sms,
    Mms,
    Email,
}

text_enum!(ChannelType, "channel type", {
    Sms => "sms",
    Mms => "mms",
    Email => "email",
});

/// Lifecycle status of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Delivered,
    Failed,
    Bounced,
}

text_enum!(MessageStatus, "message status", {
    Queued => "queued",
    Sending => "sending",
    Sent => "sent",
    Delivered => "delivered",
    Failed => "failed",
    Bounced => "bounced",
});

impl MessageStatus {
    /// Position in the forward-only delivery lifecycle.
    ///
    /// Delivered, Failed and Bounced share the top rank: once a message
    /// reaches any of them no later status replaces it.
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Queued => 0,
            MessageStatus::Sending => 1,
            MessageStatus::Sent => 2,
            MessageStatus::Delivered | MessageStatus::Failed | MessageStatus::Bounced => 3,
        }
    }

    /// No further transitions are accepted from a terminal status
    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Terminal statuses that a user may manually retry
    pub fn is_retryable_terminal(&self) -> bool {
        matches!(self, MessageStatus::Failed | MessageStatus::Bounced)
    }
}

/// How candidate providers are ordered for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Primary,
    Fallback,
    RoundRobin,
    LeastCost,
    HighestReliability,
}

text_enum!(RoutingStrategy, "routing strategy", {
    Primary => "primary",
    Fallback => "fallback",
    RoundRobin => "round_robin",
    LeastCost => "least_cost",
    HighestReliability => "highest_reliability",
});

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::Primary
    }
}

/// Backoff curve between delivery retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    None,
    Linear,
    Exponential,
    Custom,
}

text_enum!(RetryStrategy, "retry strategy", {
    None => "none",
    Linear => "linear",
    Exponential => "exponential",
    Custom => "custom",
});

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential
    }
}

/// Why a candidate provider was abandoned in favour of the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    PrimaryFailed,
    RateLimitExceeded,
    ProviderUnavailable,
    CostThreshold,
}

text_enum!(FallbackReason, "fallback reason", {
    PrimaryFailed => "primary_failed",
    RateLimitExceeded => "rate_limit_exceeded",
    ProviderUnavailable => "provider_unavailable",
    CostThreshold => "cost_threshold",
});

/// Health of a provider as seen by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealthState {
    Active,
    Degraded,
    Failed,
}

text_enum!(ProviderHealthState, "provider health state", {
    Active => "active",
    Degraded => "degraded",
    Failed => "failed",
});

/// Why an address is on a tenant's suppression list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionType {
    OptOut,
    Bounce,
    Complaint,
    Manual,
}

text_enum!(SuppressionType, "suppression type", {
    OptOut => "opt_out",
    Bounce => "bounce",
    Complaint => "complaint",
    Manual => "manual",
});

/// Paginated response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_channel_parse_is_case_insensitive() {
        assert_eq!("SMS".parse::<ChannelType>().unwrap(), ChannelType::Sms);
        assert_eq!(" email ".parse::<ChannelType>().unwrap(), ChannelType::Email);
        assert!("fax".parse::<ChannelType>().is_err());
    }

    #[test]
    fn test_display_matches_serde() {
        for strategy in RoutingStrategy::ALL {
            let json = serde_json::to_string(strategy).unwrap();
            assert_eq!(json, format!("\"{}\"", strategy));
        }
        assert_eq!(FallbackReason::RateLimitExceeded.to_string(), "rate_limit_exceeded");
    }

    #[test]
    fn test_status_rank_is_forward_only() {
        assert!(MessageStatus::Queued.rank() < MessageStatus::Sending.rank());
        assert!(MessageStatus::Sending.rank() < MessageStatus::Sent.rank());
        assert!(MessageStatus::Sent.rank() < MessageStatus::Delivered.rank());
        assert!(MessageStatus::Bounced.is_terminal());
        assert!(!MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Bounced.is_retryable_terminal());
        assert!(!MessageStatus::Delivered.is_retryable_terminal());
    }
}
