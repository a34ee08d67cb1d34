use futures::future::join_all;
use relaycast_common::types::ChannelType;
use serde::Serialize;

use super::ProviderRegistry;

/// Result of checking one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCheck {
    pub provider: String,
    pub channel: ChannelType,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Run every provider's health check concurrently; results are in name order.
pub async fn check_all(registry: &ProviderRegistry) -> Vec<ProviderCheck> {
    let checks = registry
        .list()
        .into_iter()
        .filter_map(|name| registry.get(name))
        .map(|provider| async move {
            let result = provider.health_check().await;
            ProviderCheck {
                provider: provider.name().to_owned(),
                channel: provider.channel(),
                healthy: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            }
        });

    join_all(checks).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::providers::{MockBehavior, MockProvider, ProviderError};

    #[tokio::test]
    async fn check_all_empty_registry() {
        let reg = ProviderRegistry::new();
        assert!(check_all(&reg).await.is_empty());
    }

    #[tokio::test]
    async fn check_all_mixed() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(MockProvider::new("healthy", ChannelType::Sms)));
        reg.register(Arc::new(
            MockProvider::new("unhealthy", ChannelType::Email).with_behavior(
                MockBehavior::FailAlways(ProviderError::Unavailable("connection refused".into())),
            ),
        ));

        let statuses = check_all(&reg).await;
        assert_eq!(statuses.len(), 2);

        let healthy = statuses.iter().find(|s| s.provider == "healthy").unwrap();
        assert!(healthy.healthy);
        assert!(healthy.error.is_none());

        let unhealthy = statuses.iter().find(|s| s.provider == "unhealthy").unwrap();
        assert!(!unhealthy.healthy);
        assert!(unhealthy
            .error
            .as_deref()
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_providers_are_checked_concurrently() {
        let mut reg = ProviderRegistry::new();
        for name in ["a", "b", "c"] {
            reg.register(Arc::new(
                MockProvider::new(name, ChannelType::Sms).with_latency(Duration::from_secs(5)),
            ));
        }

        let started = tokio::time::Instant::now();
        let statuses = check_all(&reg).await;

        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.healthy));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
