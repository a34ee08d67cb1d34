//! Midnight housekeeping: frequency counter resets and log pruning

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use std::time::Duration as StdDuration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ratelimit::{next_reset, ApiRateLimiter, FrequencyGuard, FrequencyWindow};

/// Violation records older than this are pruned
pub const VIOLATION_RETENTION_DAYS: i64 = 30;

/// Counter windows that begin at the UTC midnight `boundary`
pub fn resets_due(boundary: DateTime<Utc>) -> Vec<FrequencyWindow> {
    let mut windows = vec![FrequencyWindow::Daily];
    if boundary.weekday() == Weekday::Mon {
        windows.push(FrequencyWindow::Weekly);
    }
    if boundary.day() == 1 {
        windows.push(FrequencyWindow::Monthly);
    }
    windows
}

pub struct MaintenanceJob {
    frequency: FrequencyGuard,
    rate_limiter: ApiRateLimiter,
}

impl MaintenanceJob {
    pub fn new(frequency: FrequencyGuard, rate_limiter: ApiRateLimiter) -> Self {
        Self {
            frequency,
            rate_limiter,
        }
    }

    /// Sleep until each UTC midnight and run the due resets, until cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Maintenance job started");
        loop {
            let now = Utc::now();
            let boundary = next_reset(FrequencyWindow::Daily, now);
            let wait = (boundary - now).to_std().unwrap_or(StdDuration::ZERO);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(wait) => {}
            }

            self.run_once(boundary).await;
        }
        info!("Maintenance job stopped");
    }

    pub async fn run_once(&self, boundary: DateTime<Utc>) {
        for window in resets_due(boundary) {
            if let Err(e) = self.frequency.reset(window).await {
                error!(window = ?window, error = %e, "Failed to reset frequency counters");
            }
        }

        let cutoff = boundary - Duration::days(VIOLATION_RETENTION_DAYS);
        match self.rate_limiter.prune_violations(cutoff).await {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "Pruned rate limit violations"),
            Err(e) => error!(error = %e, "Failed to prune rate limit violations"),
        }
    }
}
