//! Calendar projections of scheduled and historical tests, shaped for a
//! calendar UI (one-off events carry `start`/`end`, recurring events carry
//! `startRecur`/`endRecur`/`daysOfWeek` and local times of day).

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::status::TestStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_recur: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_recur: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,
    /// Local time of day, `HH:MM:SS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// May exceed `24:00:00` when a run crosses midnight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub test_status: TestStatus,
}

/// Link to a test's page under `base_url`.
pub fn test_url(base_url: &str, test_id: &str) -> String {
    format!("{}/test?testId={}", base_url.trim_end_matches('/'), test_id)
}

impl CalendarEvent {
    /// Single run between `start` and `end`.
    pub fn one_off(
        test_id: &str,
        title: &str,
        base_url: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: TestStatus,
    ) -> Self {
        Self {
            id: test_id.to_string(),
            title: title.to_string(),
            url: test_url(base_url, test_id),
            start: Some(start),
            end: Some(end),
            start_recur: None,
            end_recur: None,
            days_of_week: None,
            start_time: None,
            end_time: None,
            test_status: status,
        }
    }

    /// Repeating run. `local_start` is the first run in the scheduler's
    /// timezone; its time of day becomes `startTime`.
    #[allow(clippy::too_many_arguments)]
    pub fn recurring<Tz: chrono::TimeZone>(
        test_id: &str,
        title: &str,
        base_url: &str,
        local_start: &DateTime<Tz>,
        end_recur: DateTime<Utc>,
        days_of_week: &[u8],
        runtime: Duration,
        status: TestStatus,
    ) -> Self {
        let start_secs = i64::from(local_start.num_seconds_from_midnight());
        Self {
            id: test_id.to_string(),
            title: title.to_string(),
            url: test_url(base_url, test_id),
            start: None,
            end: None,
            start_recur: Some(local_start.with_timezone(&Utc)),
            end_recur: Some(end_recur),
            days_of_week: Some(days_of_week.to_vec()),
            start_time: Some(format_time_of_day(start_secs)),
            end_time: Some(format_time_of_day(start_secs + runtime.num_seconds())),
            test_status: status,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.start_recur.is_some()
    }
}

/// Seconds since midnight as `HH:MM:SS`; hours are not wrapped at 24.
pub fn format_time_of_day(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
