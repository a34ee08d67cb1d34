//! Relaycast Storage - PostgreSQL persistence
//!
//! Connection pooling, embedded migrations, row models and the
//! repositories used by the routing core and the API.

pub mod db;
pub mod models;
pub mod repository;

pub use db::{Database, DatabasePool};
pub use models::*;
pub use repository::*;
