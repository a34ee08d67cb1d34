//! Send quotas per provider

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use relaycast_common::config::{ProviderLimitsConfig, WindowLimit};
use relaycast_common::types::ChannelType;
use relaycast_storage::repository::ProviderRateLimitRepository;
use tracing::warn;

use super::window::FixedWindow;

/// Gate on sends through a provider
#[async_trait]
pub trait ProviderQuota: Send + Sync {
    /// Take one unit from the provider's current window; false when exhausted
    async fn try_acquire(&self, provider: &str, channel: ChannelType) -> bool;
}

/// Process-local quotas, one window per provider
pub struct InMemoryProviderQuota {
    defaults: ProviderLimitsConfig,
    windows: Mutex<HashMap<String, FixedWindow>>,
}

impl InMemoryProviderQuota {
    pub fn new(defaults: ProviderLimitsConfig) -> Self {
        Self {
            defaults,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Override the window for one provider
    pub fn set_limit(&self, provider: &str, limit: WindowLimit) {
        let window = FixedWindow::new(limit.max_requests, limit.window_secs, Utc::now());
        self.windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(provider.to_string(), window);
    }
}

#[async_trait]
impl ProviderQuota for InMemoryProviderQuota {
    async fn try_acquire(&self, provider: &str, channel: ChannelType) -> bool {
        let now = Utc::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let window = windows.entry(provider.to_string()).or_insert_with(|| {
            let limit = self.defaults.for_type(channel.as_str());
            FixedWindow::new(limit.max_requests, limit.window_secs, now)
        });
        !window.try_consume(now).limited
    }
}

/// Quotas shared by every worker through `provider_rate_limits`
pub struct DbProviderQuota {
    repo: ProviderRateLimitRepository,
    defaults: ProviderLimitsConfig,
}

impl DbProviderQuota {
    pub fn new(repo: ProviderRateLimitRepository, defaults: ProviderLimitsConfig) -> Self {
        Self { repo, defaults }
    }
}

#[async_trait]
impl ProviderQuota for DbProviderQuota {
    async fn try_acquire(&self, provider: &str, channel: ChannelType) -> bool {
        let provider_type = channel.as_str();
        let row = match self
            .repo
            .get_or_create(provider, provider_type, self.defaults.for_type(provider_type))
            .await
        {
            Ok(row) => row,
            Err(e) => {
                warn!(provider = %provider, error = %e, "Provider quota lookup failed, allowing send");
                return true;
            }
        };

        if !row.is_active {
            return true;
        }

        let consumed = self
            .repo
            .consume_with(row.id, |limit| {
                let mut window = FixedWindow {
                    max_requests: limit.max_requests,
                    window_secs: limit.time_window_secs,
                    count: limit.current_request_count,
                    window_start: limit.window_start,
                };
                let status = window.try_consume(Utc::now());
                limit.current_request_count = window.count;
                limit.window_start = window.window_start;
                status
            })
            .await;

        match consumed {
            Ok(Some((_, status))) => {
                if status.limited {
                    warn!(
                        provider = %provider,
                        retry_after_secs = ?status.retry_after_secs,
                        "Provider rate limit reached"
                    );
                }
                !status.limited
            }
            Ok(None) => true,
            Err(e) => {
                warn!(provider = %provider, error = %e, "Provider quota update failed, allowing send");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_quota_uses_channel_defaults() {
        let defaults = ProviderLimitsConfig {
            mms: WindowLimit::new(2, 60),
            ..ProviderLimitsConfig::default()
        };
        let quota = InMemoryProviderQuota::new(defaults);

        assert!(quota.try_acquire("picture", ChannelType::Mms).await);
        assert!(quota.try_acquire("picture", ChannelType::Mms).await);
        assert!(!quota.try_acquire("picture", ChannelType::Mms).await);
        // Separate provider, separate window
        assert!(quota.try_acquire("other", ChannelType::Mms).await);
    }

    #[tokio::test]
    async fn in_memory_override() {
        let quota = InMemoryProviderQuota::new(ProviderLimitsConfig::default());
        quota.set_limit("tiny", WindowLimit::new(0, 60));
        assert!(!quota.try_acquire("tiny", ChannelType::Sms).await);
    }
}
