//! Delivery statistics over recorded attempts

use chrono::{DateTime, Duration, Utc};
use relaycast_common::types::ChannelType;
use relaycast_common::Result;
use relaycast_storage::models::AttemptAggregate;
use relaycast_storage::repository::DeliveryAttemptRepository;
use serde::{Deserialize, Serialize};

use crate::db_error;

/// Window used when the caller gives no start
pub const DEFAULT_STATS_DAYS: i64 = 30;

/// Attempt counters for one channel or for all of them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub channel: Option<ChannelType>,
    pub total_attempts: i64,
    pub successful: i64,
    pub failed: i64,
    /// Percent of attempts that succeeded, two decimal places
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub total_cost: f64,
    pub fallback_count: i64,
}

impl ChannelStats {
    fn from_aggregate(channel: Option<ChannelType>, agg: &AttemptAggregate) -> Self {
        Self {
            channel,
            total_attempts: agg.total,
            successful: agg.successful,
            failed: agg.failed,
            success_rate: percent(agg.successful, agg.total),
            avg_response_time_ms: round_to(agg.avg_response_time_ms, 2),
            total_cost: round_to(agg.total_cost, 4),
            fallback_count: agg.fallback_count,
        }
    }

    /// Merge per-channel rows; the average response time is weighted by attempts
    fn combine(rows: &[AttemptAggregate]) -> Self {
        let total: i64 = rows.iter().map(|r| r.total).sum();
        let successful = rows.iter().map(|r| r.successful).sum();
        let weighted_ms: f64 = rows
            .iter()
            .map(|r| r.avg_response_time_ms * r.total as f64)
            .sum();

        let merged = AttemptAggregate {
            channel: String::new(),
            total,
            successful,
            failed: rows.iter().map(|r| r.failed).sum(),
            avg_response_time_ms: if total > 0 {
                weighted_ms / total as f64
            } else {
                0.0
            },
            total_cost: rows.iter().map(|r| r.total_cost).sum(),
            fallback_count: rows.iter().map(|r| r.fallback_count).sum(),
        };
        Self::from_aggregate(None, &merged)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsPeriod {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl StatsPeriod {
    pub fn resolve(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        let to = to.unwrap_or_else(Utc::now);
        let from = from.unwrap_or_else(|| to - Duration::days(DEFAULT_STATS_DAYS));
        Self { from, to }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallStats {
    pub period: StatsPeriod,
    pub overall: ChannelStats,
    pub channels: Vec<ChannelStats>,
}

#[derive(Clone)]
pub struct StatsService {
    attempts: DeliveryAttemptRepository,
}

impl StatsService {
    pub fn new(attempts: DeliveryAttemptRepository) -> Self {
        Self { attempts }
    }

    pub async fn channel(&self, channel: ChannelType, period: &StatsPeriod) -> Result<ChannelStats> {
        let rows = self
            .attempts
            .aggregate(Some(channel), period.from, period.to)
            .await
            .map_err(db_error)?;
        let mut stats = ChannelStats::combine(&rows);
        stats.channel = Some(channel);
        Ok(stats)
    }

    pub async fn overall(&self, period: StatsPeriod) -> Result<OverallStats> {
        let rows = self
            .attempts
            .aggregate(None, period.from, period.to)
            .await
            .map_err(db_error)?;
        Ok(summarize(period, &rows))
    }
}

/// Build the overall view from per-channel aggregate rows
pub fn summarize(period: StatsPeriod, rows: &[AttemptAggregate]) -> OverallStats {
    let channels = rows
        .iter()
        .map(|row| ChannelStats::from_aggregate(row.channel.parse().ok(), row))
        .collect();
    OverallStats {
        period,
        overall: ChannelStats::combine(rows),
        channels,
    }
}

fn percent(part: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_to(part as f64 / total as f64 * 100.0, 2)
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(channel: &str, total: i64, successful: i64, avg_ms: f64, cost: f64) -> AttemptAggregate {
        AttemptAggregate {
            channel: channel.into(),
            total,
            successful,
            failed: total - successful,
            avg_response_time_ms: avg_ms,
            total_cost: cost,
            fallback_count: 1,
        }
    }

    #[test]
    fn empty_period_has_zero_rates() {
        let summary = summarize(StatsPeriod::resolve(None, None), &[]);
        assert_eq!(summary.overall.total_attempts, 0);
        assert_eq!(summary.overall.success_rate, 0.0);
        assert!(summary.channels.is_empty());
    }

    #[test]
    fn overall_weights_response_time_by_attempts() {
        let rows = vec![
            row("email", 1, 1, 400.0, 0.001),
            row("sms", 3, 2, 100.0, 0.015),
        ];
        let summary = summarize(StatsPeriod::resolve(None, None), &rows);

        assert_eq!(summary.overall.total_attempts, 4);
        assert_eq!(summary.overall.successful, 3);
        assert_eq!(summary.overall.failed, 1);
        assert_eq!(summary.overall.success_rate, 75.0);
        assert_eq!(summary.overall.avg_response_time_ms, 175.0);
        assert_eq!(summary.overall.total_cost, 0.016);
        assert_eq!(summary.overall.fallback_count, 2);

        assert_eq!(summary.channels.len(), 2);
        assert_eq!(summary.channels[1].channel, Some(ChannelType::Sms));
        assert_eq!(summary.channels[1].success_rate, 66.67);
    }

    #[test]
    fn default_period_is_thirty_days() {
        let to = Utc::now();
        let period = StatsPeriod::resolve(None, Some(to));
        assert_eq!(period.to - period.from, Duration::days(DEFAULT_STATS_DAYS));
    }
}
