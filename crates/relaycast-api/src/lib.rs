//! Relaycast API - REST API server
//!
//! Message submission, routing and rate-limit administration, suppression
//! lists, statistics and provider status callbacks.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod ratelimit;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
