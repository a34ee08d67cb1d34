//! API request handlers

pub mod api_keys;
pub mod campaigns;
pub mod contacts;
pub mod health;
pub mod messages;
pub mod metrics;
pub mod providers;
pub mod rate_limits;
pub mod routing_configs;
pub mod stats;
pub mod suppressions;
pub mod webhooks;

pub use health::*;
