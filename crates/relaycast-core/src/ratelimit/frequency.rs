//! Per-contact frequency caps over calendar windows
//!
//! Counters roll over at UTC midnight, at the start of the ISO week
//! (Monday) and on the first of the month. Rollover is applied lazily from
//! `last_message_sent_at` before every check and record.
//!
//! The worker reserves a send under the contact's row lock before routing and
//! gives the reservation back if nothing was sent, so concurrent deliveries
//! to one contact cannot overshoot a cap.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use relaycast_common::config::FrequencyConfig;
use relaycast_common::types::{ContactId, TenantId};
use relaycast_common::Result;
use relaycast_storage::models::FrequencyControl;
use relaycast_storage::repository::FrequencyControlRepository;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db_error;

/// Calendar window of a frequency cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyWindow {
    Daily,
    Weekly,
    Monthly,
}

/// Outcome of checking a contact's caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FrequencyDecision {
    Allowed,
    Capped {
        window: FrequencyWindow,
        resume_at: DateTime<Utc>,
    },
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Start of the next window of this kind after `now`
pub fn next_reset(window: FrequencyWindow, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    match window {
        FrequencyWindow::Daily => midnight(today + Duration::days(1)),
        FrequencyWindow::Weekly => {
            let days = 7 - i64::from(today.weekday().num_days_from_monday());
            midnight(today + Duration::days(days))
        }
        FrequencyWindow::Monthly => today
            .with_day(1)
            .and_then(|first| first.checked_add_months(Months::new(1)))
            .map(midnight)
            .unwrap_or_else(|| midnight(today + Duration::days(31))),
    }
}

/// Zero counters whose window has passed since the last send
pub fn roll_over(control: &mut FrequencyControl, now: DateTime<Utc>) {
    let Some(last) = control.last_message_sent_at else {
        return;
    };
    let (last, today) = (last.date_naive(), now.date_naive());

    if last != today {
        control.daily_count = 0;
    }
    let (last_week, this_week) = (last.iso_week(), today.iso_week());
    if (last_week.year(), last_week.week()) != (this_week.year(), this_week.week()) {
        control.weekly_count = 0;
    }
    if (last.year(), last.month()) != (today.year(), today.month()) {
        control.monthly_count = 0;
    }
}

/// Decide whether one more message fits, after rollover
pub fn evaluate(control: &FrequencyControl, now: DateTime<Utc>) -> FrequencyDecision {
    let mut current = control.clone();
    roll_over(&mut current, now);

    let exceeded = [
        (FrequencyWindow::Daily, current.daily_count >= current.max_per_day),
        (FrequencyWindow::Weekly, current.weekly_count >= current.max_per_week),
        (FrequencyWindow::Monthly, current.monthly_count >= current.max_per_month),
    ];

    exceeded
        .into_iter()
        .filter(|(_, over)| *over)
        .map(|(window, _)| (window, next_reset(window, now)))
        .max_by_key(|(_, resume_at)| *resume_at)
        .map(|(window, resume_at)| FrequencyDecision::Capped { window, resume_at })
        .unwrap_or(FrequencyDecision::Allowed)
}

/// Count one sent message
pub fn record_send(control: &mut FrequencyControl, now: DateTime<Utc>) {
    roll_over(control, now);
    control.daily_count += 1;
    control.weekly_count += 1;
    control.monthly_count += 1;
    control.last_message_sent_at = Some(now);
}

/// Count one send if it fits under every cap
pub fn try_reserve(control: &mut FrequencyControl, now: DateTime<Utc>) -> FrequencyDecision {
    let decision = evaluate(control, now);
    if decision == FrequencyDecision::Allowed {
        record_send(control, now);
    } else {
        roll_over(control, now);
    }
    decision
}

/// Give back a reserved send that was never delivered
pub fn unreserve(control: &mut FrequencyControl) {
    control.daily_count = (control.daily_count - 1).max(0);
    control.weekly_count = (control.weekly_count - 1).max(0);
    control.monthly_count = (control.monthly_count - 1).max(0);
}

/// Counters for a contact that has never been messaged
pub fn unrecorded(
    tenant_id: TenantId,
    contact_id: ContactId,
    caps: FrequencyConfig,
    now: DateTime<Utc>,
) -> FrequencyControl {
    FrequencyControl {
        id: Uuid::nil(),
        tenant_id,
        contact_id,
        max_per_day: caps.max_per_day,
        max_per_week: caps.max_per_week,
        max_per_month: caps.max_per_month,
        daily_count: 0,
        weekly_count: 0,
        monthly_count: 0,
        last_message_sent_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Enforces contact frequency caps stored in `frequency_controls`
#[derive(Clone)]
pub struct FrequencyGuard {
    repo: FrequencyControlRepository,
    defaults: FrequencyConfig,
}

impl FrequencyGuard {
    pub fn new(repo: FrequencyControlRepository, defaults: FrequencyConfig) -> Self {
        Self { repo, defaults }
    }

    /// Current counters, rolled over to now; defaults when never messaged
    pub async fn status(&self, tenant_id: TenantId, contact_id: ContactId) -> Result<FrequencyControl> {
        let mut control = self
            .repo
            .get(tenant_id, contact_id)
            .await
            .map_err(db_error)?
            .unwrap_or_else(|| unrecorded(tenant_id, contact_id, self.defaults, Utc::now()));
        roll_over(&mut control, Utc::now());
        Ok(control)
    }

    /// Check the caps and count the send in one locked step.
    ///
    /// A contact without a row gets one with the default caps first, so the
    /// defaults bind from the very first message.
    pub async fn reserve(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<FrequencyDecision> {
        let (control, decision) = self
            .repo
            .update_with(tenant_id, contact_id, self.defaults, |control| {
                try_reserve(control, Utc::now())
            })
            .await
            .map_err(db_error)?;
        debug!(
            contact_id = %contact_id,
            daily = control.daily_count,
            weekly = control.weekly_count,
            monthly = control.monthly_count,
            decision = ?decision,
            "Reserved contact send"
        );
        Ok(decision)
    }

    /// Undo a reservation whose message was not sent
    pub async fn release(&self, tenant_id: TenantId, contact_id: ContactId) -> Result<()> {
        self.repo
            .update_with(tenant_id, contact_id, self.defaults, unreserve)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    pub async fn set_caps(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
        caps: FrequencyConfig,
    ) -> Result<FrequencyControl> {
        if caps.max_per_day < 0 || caps.max_per_week < 0 || caps.max_per_month < 0 {
            return Err(relaycast_common::Error::Validation(
                "frequency caps must not be negative".into(),
            ));
        }
        self.repo
            .set_caps(tenant_id, contact_id, caps)
            .await
            .map_err(db_error)
    }

    /// Zero one window's counters for every contact
    pub async fn reset(&self, window: FrequencyWindow) -> Result<u64> {
        let reset = match window {
            FrequencyWindow::Daily => self.repo.reset_daily().await,
            FrequencyWindow::Weekly => self.repo.reset_weekly().await,
            FrequencyWindow::Monthly => self.repo.reset_monthly().await,
        }
        .map_err(db_error)?;
        info!(window = ?window, contacts = reset, "Reset frequency counters");
        Ok(reset)
    }
}
