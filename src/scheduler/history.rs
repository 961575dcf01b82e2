//! Historical calendar: finished and failed tests kept for display until
//! they age out.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::calendar::CalendarEvent;
use crate::status::TestStatus;

/// A record of a test that reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalTest {
    pub test_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl HistoricalTest {
    pub fn to_event(&self, base_url: &str) -> CalendarEvent {
        CalendarEvent::one_off(&self.test_id, &self.title, base_url, self.start, self.end, self.status)
    }

    /// True if the entry ended before `now - retention`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.end < now - retention
    }
}
