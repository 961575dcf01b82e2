//! The cached view of one test.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::identity::TestIdentity;
use crate::status::{TestStatus, TestStatusMessage};

/// One record per test id, shared by every tier map and caller that holds it.
pub type SharedRecord = Arc<RwLock<TestRecord>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub test_id: String,
    pub storage_folder: String,
    pub status: TestStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub results_locations: Vec<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_requested: Option<DateTime<Utc>>,
    /// Last-modified stamp of the durable status object we last merged.
    pub status_handle: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub version: Option<String>,
    pub queue_name: Option<String>,
    pub instance_id: Option<String>,
    pub hostname: Option<String>,
}

impl TestRecord {
    pub fn new(identity: &TestIdentity, status: TestStatus) -> Self {
        Self {
            test_id: identity.test_id(),
            storage_folder: identity.storage_folder(),
            status,
            start_time: None,
            end_time: None,
            user_id: None,
            results_locations: Vec::new(),
            last_checked: None,
            last_updated: None,
            last_requested: None,
            status_handle: None,
            errors: Vec::new(),
            version: None,
            queue_name: None,
            instance_id: None,
            hostname: None,
        }
    }

    pub fn into_shared(self) -> SharedRecord {
        Arc::new(RwLock::new(self))
    }

    /// Whether a status polled from durable storage may replace the cached
    /// one. A record that reached a terminal status never goes back to a
    /// non-terminal one through polling.
    pub fn accepts_polled(&self, polled: TestStatus) -> bool {
        !self.status.is_terminal() || polled.is_terminal()
    }

    /// Overwrite the status-derived fields from a status message. Fields the
    /// message leaves empty keep their cached value.
    pub fn apply_status(&mut self, message: &TestStatusMessage) {
        self.status = message.status;
        self.start_time = Some(message.start_time);
        self.end_time = Some(message.end_time);
        if !message.results_filenames.is_empty() {
            self.results_locations = message
                .results_filenames
                .iter()
                .map(|name| format!("{}/{}", self.storage_folder, name))
                .collect();
        }
        if message.user_id.is_some() {
            self.user_id = message.user_id.clone();
        }
        if message.version.is_some() {
            self.version = message.version.clone();
        }
        if message.instance_id.is_some() {
            self.instance_id = message.instance_id.clone();
        }
        if message.hostname.is_some() {
            self.hostname = message.hostname.clone();
        }
        for error in &message.errors {
            if !self.errors.contains(error) {
                self.errors.push(error.clone());
            }
        }
    }

    /// Status message reflecting this record, for writing back to storage.
    pub fn to_status_message(&self) -> TestStatusMessage {
        let start = self.start_time.unwrap_or_default();
        let mut message = TestStatusMessage::new(self.status, start, self.end_time.unwrap_or(start));
        message.results_filenames = self
            .results_locations
            .iter()
            .map(|loc| loc.rsplit('/').next().unwrap_or(loc).to_string())
            .collect();
        message.user_id = self.user_id.clone();
        message.version = self.version.clone();
        message.errors = self.errors.clone();
        message.instance_id = self.instance_id.clone();
        message.hostname = self.hostname.clone();
        message
    }
}

/// Most recent of the three touch stamps in epoch millis; 0 if never touched.
pub fn last_touched(record: &TestRecord) -> i64 {
    [record.last_checked, record.last_updated, record.last_requested]
        .into_iter()
        .flatten()
        .map(|t| t.timestamp_millis())
        .max()
        .unwrap_or(0)
        .max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> TestRecord {
        TestRecord::new(&TestIdentity::parse("basic20240101T000000000").unwrap(), TestStatus::Unknown)
    }

    #[test]
    fn test_last_touched_never_touched_is_zero() {
        assert_eq!(last_touched(&record()), 0);
    }

    #[test]
    fn test_last_touched_takes_max_of_any_stamp() {
        let t1 = Utc.timestamp_millis_opt(1_000).unwrap();
        let t2 = Utc.timestamp_millis_opt(5_000).unwrap();
        let t3 = Utc.timestamp_millis_opt(3_000).unwrap();

        let mut r = record();
        r.last_requested = Some(t1);
        assert_eq!(last_touched(&r), 1_000);
        r.last_checked = Some(t2);
        r.last_updated = Some(t3);
        assert_eq!(last_touched(&r), 5_000);
        r.last_checked = None;
        assert_eq!(last_touched(&r), 3_000);
    }

    #[test]
    fn test_apply_status_merges_errors_and_results() {
        let mut r = record();
        r.errors.push("first".into());
        let now = Utc::now();
        let mut msg = TestStatusMessage::new(TestStatus::Failed, now, now);
        msg.errors = vec!["first".into(), "second".into()];
        msg.results_filenames = vec!["stats.json".into()];
        r.apply_status(&msg);
        assert_eq!(r.status, TestStatus::Failed);
        assert_eq!(r.errors, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(r.results_locations, vec!["basic/20240101T000000000/stats.json".to_string()]);
        assert_eq!(r.to_status_message().results_filenames, vec!["stats.json".to_string()]);
    }

    #[test]
    fn test_terminal_record_rejects_polled_active_status() {
        let mut r = record();
        r.status = TestStatus::Running;
        assert!(r.accepts_polled(TestStatus::Finished));
        assert!(r.accepts_polled(TestStatus::Created));
        r.status = TestStatus::Finished;
        assert!(!r.accepts_polled(TestStatus::Running));
        assert!(!r.accepts_polled(TestStatus::Scheduled));
        assert!(r.accepts_polled(TestStatus::Failed));
    }
}
