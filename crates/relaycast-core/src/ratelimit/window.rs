use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Quota state reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub max_requests: i32,
    pub remaining: i32,
    pub window_secs: i32,
    pub reset_at: DateTime<Utc>,
    /// The request was (or would be) refused
    pub limited: bool,
    /// Seconds until the window resets; set only when limited
    pub retry_after_secs: Option<u64>,
}

impl RateLimitStatus {
    /// Status reported when no limit applies
    pub fn unlimited(now: DateTime<Utc>) -> Self {
        Self {
            max_requests: i32::MAX,
            remaining: i32::MAX,
            window_secs: 0,
            reset_at: now,
            limited: false,
            retry_after_secs: None,
        }
    }
}

/// Counter over a window of `window_secs` starting at `window_start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    pub max_requests: i32,
    pub window_secs: i32,
    pub count: i32,
    pub window_start: DateTime<Utc>,
}

impl FixedWindow {
    pub fn new(max_requests: i32, window_secs: i32, now: DateTime<Utc>) -> Self {
        Self {
            max_requests,
            window_secs,
            count: 0,
            window_start: now,
        }
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + Duration::seconds(i64::from(self.window_secs.max(1)))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at()
    }

    /// Start a fresh window at `now` if the current one has ended
    pub fn roll(&mut self, now: DateTime<Utc>) {
        if self.is_expired(now) {
            self.count = 0;
            self.window_start = now;
        }
    }

    /// Status at `now` without consuming
    pub fn status(&self, now: DateTime<Utc>) -> RateLimitStatus {
        let mut current = *self;
        current.roll(now);
        current.report(now, current.count >= current.max_requests)
    }

    /// Admit one request if the window has room
    pub fn try_consume(&mut self, now: DateTime<Utc>) -> RateLimitStatus {
        self.roll(now);
        if self.count >= self.max_requests {
            return self.report(now, true);
        }
        self.count += 1;
        self.report(now, false)
    }

    fn report(&self, now: DateTime<Utc>, limited: bool) -> RateLimitStatus {
        let reset_at = self.reset_at();
        let retry_after_secs = limited.then(|| {
            let millis = (reset_at - now).num_milliseconds().max(0) as u64;
            millis.div_ceil(1000)
        });

        RateLimitStatus {
            max_requests: self.max_requests,
            remaining: (self.max_requests - self.count).max(0),
            window_secs: self.window_secs,
            reset_at,
            limited,
            retry_after_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn admits_until_full() {
        let now = start();
        let mut window = FixedWindow::new(2, 60, now);

        let first = window.try_consume(now);
        assert!(!first.limited);
        assert_eq!(first.remaining, 1);

        let second = window.try_consume(now);
        assert!(!second.limited);
        assert_eq!(second.remaining, 0);

        let third = window.try_consume(now + Duration::seconds(10));
        assert!(third.limited);
        assert_eq!(third.retry_after_secs, Some(50));
        assert_eq!(window.count, 2);
    }

    #[test]
    fn resets_at_boundary() {
        let now = start();
        let mut window = FixedWindow::new(1, 60, now);
        window.try_consume(now);

        assert!(window.status(now + Duration::seconds(59)).limited);

        let later = now + Duration::seconds(60);
        let status = window.try_consume(later);
        assert!(!status.limited);
        assert_eq!(window.window_start, later);
        assert_eq!(status.reset_at, later + Duration::seconds(60));
    }

    #[test]
    fn retry_after_rounds_up() {
        let now = start();
        let mut window = FixedWindow::new(0, 60, now);
        let status = window.try_consume(now + Duration::milliseconds(59_500));
        assert_eq!(status.retry_after_secs, Some(1));
    }

    #[test]
    fn status_does_not_consume() {
        let now = start();
        let window = FixedWindow::new(3, 60, now);
        let status = window.status(now);
        assert_eq!(status.remaining, 3);
        assert_eq!(window.count, 0);
    }

    #[test]
    fn unlimited_status() {
        let status = RateLimitStatus::unlimited(start());
        assert_eq!(status.max_requests, i32::MAX);
        assert!(!status.limited);
    }
}
