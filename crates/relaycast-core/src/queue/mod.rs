//! Message queue processing

mod maintenance;
mod worker;

pub use maintenance::{resets_due, MaintenanceJob, VIOLATION_RETENTION_DAYS};
pub use worker::{settle, DeliveryWorker, Disposition};
