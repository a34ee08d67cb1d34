//! Configuration for Relaycast

use crate::types::ChannelType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "RELAYCAST_CONFIG";

/// Prefix for environment overrides, e.g. `RELAYCAST__API__PORT=9090`
pub const ENV_PREFIX: &str = "RELAYCAST";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Delivery worker configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Provider health thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Default provider rate-limit windows
    #[serde(default)]
    pub provider_limits: ProviderLimitsConfig,

    /// Default per-contact frequency caps
    #[serde(default)]
    pub frequency: FrequencyConfig,

    /// Configured delivery providers
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Shared secret for provider status callbacks. Signatures are not
    /// checked when unset.
    pub webhook_secret: Option<String>,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            webhook_secret: None,
            cors_origins: Vec::new(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Delivery worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Seconds between queue polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds to back off after a failed poll cycle
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,

    /// Messages claimed per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Maximum concurrent sends
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Max retries for new messages when the request does not set one
    #[serde(default = "default_max_retries")]
    pub default_max_retries: i32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            error_backoff_secs: default_error_backoff(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            default_max_retries: default_max_retries(),
        }
    }
}

fn default_poll_interval() -> u64 {
    10
}

fn default_error_backoff() -> u64 {
    30
}

fn default_batch_size() -> i64 {
    50
}

fn default_concurrency() -> usize {
    10
}

fn default_max_retries() -> i32 {
    3
}

/// Provider health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before a provider is degraded
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive failures before a provider is taken out of rotation
    #[serde(default = "default_failed_threshold")]
    pub failed_threshold: u32,

    /// Seconds a failed provider waits before it may be tried again
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    /// Consecutive successes needed to restore a degraded provider
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failed_threshold: default_failed_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            success_threshold: default_success_threshold(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_failed_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    2
}

/// A fixed request window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub max_requests: i32,
    pub window_secs: i32,
}

impl WindowLimit {
    pub const fn new(max_requests: i32, window_secs: i32) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }
}

/// Default provider windows, applied when a provider has no stored limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLimitsConfig {
    #[serde(default = "default_sms_limit")]
    pub sms: WindowLimit,

    #[serde(default = "default_mms_limit")]
    pub mms: WindowLimit,

    #[serde(default = "default_email_limit")]
    pub email: WindowLimit,

    /// Used for provider types without a dedicated entry
    #[serde(default = "default_other_limit")]
    pub other: WindowLimit,
}

impl ProviderLimitsConfig {
    /// Default window for a provider type name such as "sms"
    pub fn for_type(&self, provider_type: &str) -> WindowLimit {
        match provider_type.parse::<ChannelType>() {
            Ok(ChannelType::Sms) => self.sms,
            Ok(ChannelType::Mms) => self.mms,
            Ok(ChannelType::Email) => self.email,
            Err(_) => self.other,
        }
    }
}

impl Default for ProviderLimitsConfig {
    fn default() -> Self {
        Self {
            sms: default_sms_limit(),
            mms: default_mms_limit(),
            email: default_email_limit(),
            other: default_other_limit(),
        }
    }
}

fn default_sms_limit() -> WindowLimit {
    WindowLimit::new(100, 60)
}

fn default_mms_limit() -> WindowLimit {
    WindowLimit::new(50, 60)
}

fn default_email_limit() -> WindowLimit {
    WindowLimit::new(1000, 60)
}

fn default_other_limit() -> WindowLimit {
    WindowLimit::new(100, 60)
}

/// Default per-contact frequency caps
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrequencyConfig {
    #[serde(default = "default_daily_cap")]
    pub max_per_day: i32,

    #[serde(default = "default_weekly_cap")]
    pub max_per_week: i32,

    #[serde(default = "default_monthly_cap")]
    pub max_per_month: i32,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            max_per_day: default_daily_cap(),
            max_per_week: default_weekly_cap(),
            max_per_month: default_monthly_cap(),
        }
    }
}

fn default_daily_cap() -> i32 {
    5
}

fn default_weekly_cap() -> i32 {
    20
}

fn default_monthly_cap() -> i32 {
    50
}

/// A configured delivery provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name referenced by routing configs
    pub name: String,

    /// Channel this provider delivers
    pub channel: ChannelType,

    /// Flat cost per message; mock providers use their own pricing when unset
    pub cost_per_message: Option<f64>,

    /// Transport settings
    #[serde(flatten)]
    pub kind: ProviderKind,
}

/// Transport backing a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderKind {
    /// In-process simulator
    Mock {
        /// Reject every send with this error text
        #[serde(default)]
        fail_with: Option<String>,
    },
    /// JSON-over-HTTP gateway
    Http {
        endpoint: String,
        api_key: Option<String>,
        #[serde(default = "default_provider_timeout")]
        timeout_secs: u64,
    },
    /// SMTP relay (email only)
    Smtp {
        host: String,
        #[serde(default = "default_smtp_port")]
        port: u16,
        username: Option<String>,
        password: Option<String>,
        from_address: String,
        #[serde(default = "default_starttls")]
        starttls: bool,
    },
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_smtp_port() -> u16 {
    587
}

fn default_starttls() -> bool {
    true
}

impl Config {
    /// Load configuration from a file, with environment overrides applied on top
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        Self::build(Some(path))
    }

    /// Load configuration from the default locations and environment
    pub fn load() -> crate::Result<Self> {
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(Path::new(&explicit));
        }

        let paths = [
            PathBuf::from("./relaycast.toml"),
            PathBuf::from("/etc/relaycast/relaycast.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        tracing::warn!("No configuration file found, using defaults and environment");
        Self::build(None)
    }

    fn build(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }

    /// Provider definitions for one channel
    pub fn providers_for(&self, channel: ChannelType) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(move |p| p.channel == channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.delivery.batch_size, 50);
        assert_eq!(config.delivery.poll_interval_secs, 10);
        assert_eq!(config.delivery.error_backoff_secs, 30);
        assert_eq!(config.frequency.max_per_day, 5);
        assert_eq!(config.frequency.max_per_week, 20);
        assert_eq!(config.frequency.max_per_month, 50);
    }

    #[test]
    fn test_provider_limit_defaults() {
        let limits = ProviderLimitsConfig::default();
        assert_eq!(limits.for_type("sms"), WindowLimit::new(100, 60));
        assert_eq!(limits.for_type("Email"), WindowLimit::new(1000, 60));
        assert_eq!(limits.for_type("mms"), WindowLimit::new(50, 60));
        assert_eq!(limits.for_type("push"), WindowLimit::new(100, 60));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
url = "postgres://localhost/relaycast"

[api]
port = 9000
webhook_secret = "s3cret"

[[providers]]
name = "twilio"
channel = "sms"
kind = "http"
endpoint = "https://gateway.example.com/messages"
cost_per_message = 0.0075

[[providers]]
name = "mock-email"
channel = "email"
kind = "mock"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.webhook_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.providers.len(), 2);
        assert!(matches!(
            config.providers[0].kind,
            ProviderKind::Http { timeout_secs: 30, .. }
        ));
        assert_eq!(config.providers_for(ChannelType::Email).count(), 1);
    }
}
