//! Per-caller API rate limiting
//!
//! Limits are stored rows scoped to a user, a tenant, or everyone, and
//! match endpoints by `*` wildcard pattern. The most specific matching
//! limit governs a request: highest priority first, then user-scoped, then
//! tenant-scoped, then global.

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use relaycast_common::types::{TenantId, UserId};
use relaycast_common::{Error, Result};
use relaycast_storage::models::{
    ApiRateLimit, CreateApiRateLimit, NewRateLimitLog, RateLimitLog, RateLimitLogFilter,
    UpdateApiRateLimit,
};
use relaycast_storage::repository::{ApiRateLimitRepository, RateLimitLogRepository};
use tracing::{debug, warn};
use uuid::Uuid;

use super::window::{FixedWindow, RateLimitStatus};
use crate::db_error;

/// Default page size for violation logs
pub const DEFAULT_LOG_PAGE_SIZE: i64 = 100;

/// Identity a request is limited under
#[derive(Debug, Clone, Default)]
pub struct RateLimitKey {
    pub user_id: Option<UserId>,
    pub tenant_id: Option<TenantId>,
    pub endpoint: String,
    pub ip_address: Option<String>,
}

/// Whether `endpoint` matches a `*` wildcard pattern, ignoring case
pub fn pattern_matches(pattern: &str, endpoint: &str) -> bool {
    let expr = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
    match RegexBuilder::new(&expr).case_insensitive(true).build() {
        Ok(re) => re.is_match(endpoint),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Invalid endpoint pattern");
            false
        }
    }
}

/// Limits applying to `key`, most specific first
pub fn applicable_limits<'a>(limits: &'a [ApiRateLimit], key: &RateLimitKey) -> Vec<&'a ApiRateLimit> {
    let mut matching: Vec<&ApiRateLimit> = limits
        .iter()
        .filter(|l| l.is_active)
        .filter(|l| match (l.user_id, l.tenant_id) {
            (Some(user), _) => key.user_id == Some(user),
            (None, Some(tenant)) => key.tenant_id == Some(tenant),
            (None, None) => true,
        })
        .filter(|l| pattern_matches(&l.endpoint_pattern, &key.endpoint))
        .collect();

    matching.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.user_id.is_some().cmp(&a.user_id.is_some()))
            .then_with(|| b.tenant_id.is_some().cmp(&a.tenant_id.is_some()))
    });
    matching
}

/// Human-readable rule text stored with violations
pub fn rule_text(limit: &ApiRateLimit) -> String {
    format!(
        "{} requests per {} seconds",
        limit.max_requests, limit.time_window_secs
    )
}

fn window_of(limit: &ApiRateLimit) -> FixedWindow {
    FixedWindow {
        max_requests: limit.max_requests,
        window_secs: limit.time_window_secs,
        count: limit.current_request_count,
        window_start: limit.window_start,
    }
}

/// API rate limiter backed by `api_rate_limits`
#[derive(Clone)]
pub struct ApiRateLimiter {
    limits: ApiRateLimitRepository,
    logs: RateLimitLogRepository,
}

impl ApiRateLimiter {
    pub fn new(limits: ApiRateLimitRepository, logs: RateLimitLogRepository) -> Self {
        Self { limits, logs }
    }

    async fn governing_limit(&self, key: &RateLimitKey) -> Result<Option<ApiRateLimit>> {
        let candidates = self
            .limits
            .list_candidates(key.user_id, key.tenant_id)
            .await
            .map_err(db_error)?;
        Ok(applicable_limits(&candidates, key).first().map(|l| (*l).clone()))
    }

    /// Quota for `key` without consuming
    pub async fn check(&self, key: &RateLimitKey) -> Result<RateLimitStatus> {
        let now = Utc::now();
        Ok(match self.governing_limit(key).await? {
            Some(limit) => window_of(&limit).status(now),
            None => RateLimitStatus::unlimited(now),
        })
    }

    /// Consume one request for `key`, logging a violation when refused
    pub async fn check_and_record(&self, key: &RateLimitKey) -> Result<RateLimitStatus> {
        let Some(limit) = self.governing_limit(key).await? else {
            return Ok(RateLimitStatus::unlimited(Utc::now()));
        };

        let consumed = self
            .limits
            .consume_with(limit.id, |row| {
                let mut window = window_of(row);
                let status = window.try_consume(Utc::now());
                row.current_request_count = window.count;
                row.window_start = window.window_start;
                status
            })
            .await
            .map_err(db_error)?;

        let Some((row, status)) = consumed else {
            // Deleted between lookup and consume
            return Ok(RateLimitStatus::unlimited(Utc::now()));
        };

        if status.limited {
            let rule = rule_text(&row);
            warn!(
                user_id = ?key.user_id,
                tenant_id = ?key.tenant_id,
                endpoint = %key.endpoint,
                rule = %rule,
                "API rate limit exceeded"
            );
            if let Err(e) = self
                .logs
                .create(NewRateLimitLog {
                    user_id: key.user_id,
                    tenant_id: key.tenant_id,
                    endpoint: key.endpoint.clone(),
                    ip_address: key.ip_address.clone(),
                    rule,
                    request_count: row.current_request_count,
                })
                .await
            {
                warn!(error = %e, "Failed to record rate limit violation");
            }
        } else {
            debug!(endpoint = %key.endpoint, remaining = status.remaining, "Request admitted");
        }

        Ok(status)
    }

    pub async fn create(&self, input: CreateApiRateLimit) -> Result<ApiRateLimit> {
        validate_limit(
            Some(&input.endpoint_pattern),
            Some(input.max_requests),
            Some(input.time_window_secs),
        )?;
        self.limits.create(input).await.map_err(db_error)
    }

    pub async fn get(&self, id: Uuid) -> Result<ApiRateLimit> {
        self.limits
            .get(id)
            .await
            .map_err(db_error)?
            .ok_or_else(|| Error::NotFound(format!("Rate limit {} not found", id)))
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ApiRateLimit>> {
        self.limits.list(limit, offset).await.map_err(db_error)
    }

    pub async fn update(&self, id: Uuid, input: UpdateApiRateLimit) -> Result<ApiRateLimit> {
        validate_limit(
            input.endpoint_pattern.as_deref(),
            input.max_requests,
            input.time_window_secs,
        )?;
        self.limits
            .update(id, input)
            .await
            .map_err(db_error)?
            .ok_or_else(|| Error::NotFound(format!("Rate limit {} not found", id)))
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        if self.limits.delete(id).await.map_err(db_error)? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("Rate limit {} not found", id)))
        }
    }

    pub async fn reset(&self, id: Uuid) -> Result<()> {
        if self.limits.reset(id).await.map_err(db_error)? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("Rate limit {} not found", id)))
        }
    }

    pub async fn violations(
        &self,
        filter: &RateLimitLogFilter,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<RateLimitLog>> {
        self.logs
            .list(filter, limit.unwrap_or(DEFAULT_LOG_PAGE_SIZE), offset)
            .await
            .map_err(db_error)
    }

    /// Drop violation records older than `cutoff`
    pub async fn prune_violations(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.logs.delete_older_than(cutoff).await.map_err(db_error)
    }
}

fn validate_limit(
    pattern: Option<&str>,
    max_requests: Option<i32>,
    window_secs: Option<i32>,
) -> Result<()> {
    if pattern.is_some_and(|p| p.trim().is_empty()) {
        return Err(Error::Validation("endpoint_pattern must not be empty".into()));
    }
    if max_requests.is_some_and(|m| m < 0) {
        return Err(Error::Validation("max_requests must not be negative".into()));
    }
    if window_secs.is_some_and(|w| w <= 0) {
        return Err(Error::Validation("time_window_secs must be positive".into()));
    }
    Ok(())
}
