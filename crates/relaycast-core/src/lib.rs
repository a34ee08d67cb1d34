//! Relaycast Core - message routing and delivery
//!
//! Provider adapters, route planning with health-aware fallback, retry
//! scheduling, rate limiting, suppression, the queue worker, callback
//! reconciliation and delivery statistics.

pub mod messages;
pub mod metrics;
pub mod providers;
pub mod queue;
pub mod ratelimit;
pub mod reconcile;
pub mod retry;
pub mod routing;
pub mod stats;
pub mod suppression;

pub use messages::{BulkMessage, BulkRecipient, DeliveryReport, MessageService, NewMessage};
pub use metrics::DeliveryMetrics;
pub use providers::{
    build_registry, MessageProvider, OutboundMessage, ProviderError, ProviderReceipt,
    ProviderRegistry,
};
pub use queue::{DeliveryWorker, Disposition, MaintenanceJob};
pub use ratelimit::{ApiRateLimiter, DbProviderQuota, FrequencyGuard, ProviderQuota};
pub use reconcile::{DeliveryReconciler, ProviderCallback, ReconcileOutcome};
pub use retry::{RetryDecision, RetryPolicy};
pub use routing::{MessageRouter, ProviderHealthTracker, RouteOutcome};
pub use stats::{ChannelStats, OverallStats, StatsPeriod, StatsService};
pub use suppression::SuppressionList;

#[cfg(all(test, feature = "integration"))]
mod test_support;

/// Map a repository failure onto the shared error type
pub(crate) fn db_error(err: sqlx::Error) -> relaycast_common::Error {
    relaycast_common::Error::Database(err.to_string())
}
