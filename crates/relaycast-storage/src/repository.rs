//! Repository layer for data access

pub mod api_keys;
pub mod api_rate_limits;
pub mod callbacks;
pub mod delivery_attempts;
pub mod frequency_controls;
pub mod messages;
pub mod provider_rate_limits;
pub mod routing_configs;
pub mod suppressions;

// Re-export concrete repository implementations with simple names
pub use api_keys::DbApiKeyRepository as ApiKeyRepository;
pub use api_rate_limits::{ApiRateLimitRepository, RateLimitLogRepository};
pub use callbacks::CallbackRepository;
pub use delivery_attempts::DeliveryAttemptRepository;
pub use frequency_controls::FrequencyControlRepository;
pub use messages::MessageRepository;
pub use provider_rate_limits::ProviderRateLimitRepository;
pub use routing_configs::RoutingConfigRepository;
pub use suppressions::SuppressionRepository;

// Re-export repository traits
pub use api_keys::ApiKeyRepository as ApiKeyRepositoryTrait;

// Re-export API key types
pub use api_keys::{ApiKey, ApiKeyId};
