//! Test status values and the durable per-test status object.

use std::fmt;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::TestIdentity;
use crate::storage::{ObjectStore, Tags};

/// Lifecycle status of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Unknown,
    Created,
    Scheduled,
    Running,
    Finished,
    Failed,
}

impl TestStatus {
    /// Created or Running.
    pub fn is_active(self) -> bool {
        matches!(self, TestStatus::Created | TestStatus::Running)
    }

    /// Finished or Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, TestStatus::Finished | TestStatus::Failed)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Unknown => "unknown",
            TestStatus::Created => "created",
            TestStatus::Scheduled => "scheduled",
            TestStatus::Running => "running",
            TestStatus::Finished => "finished",
            TestStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Durable status object stored next to each test's artifacts. Workers
/// overwrite it as the test progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatusMessage {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end_time: DateTime<Utc>,
    pub status: TestStatus,
    #[serde(default)]
    pub results_filenames: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl TestStatusMessage {
    pub fn new(status: TestStatus, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time,
            status,
            results_filenames: Vec::new(),
            version: None,
            user_id: None,
            errors: Vec::new(),
            instance_id: None,
            hostname: None,
        }
    }
}

/// Durable status object as last read, with its storage stamp.
#[derive(Debug, Clone)]
pub struct StoredStatus {
    pub message: TestStatusMessage,
    pub last_modified: DateTime<Utc>,
}

/// Suffix of status object keys.
pub const STATUS_SUFFIX: &str = ".info";

/// Key of a test's status object.
pub fn status_key(identity: &TestIdentity) -> String {
    identity.object_key(&format!("{}{}", identity.test_id(), STATUS_SUFFIX))
}

/// Read the status object for a test, if one exists.
pub async fn read_status(store: &dyn ObjectStore, identity: &TestIdentity) -> Result<Option<StoredStatus>> {
    let key = status_key(identity);
    let Some(object) = store.get_object(&key).await? else {
        return Ok(None);
    };
    let message: TestStatusMessage = serde_json::from_slice(&object.body)
        .with_context(|| format!("corrupt status object {}", key))?;
    Ok(Some(StoredStatus {
        message,
        last_modified: object.last_modified,
    }))
}

/// Write (create or replace) the status object for a test.
pub async fn write_status(
    store: &dyn ObjectStore,
    identity: &TestIdentity,
    message: &TestStatusMessage,
    tags: &Tags,
) -> Result<DateTime<Utc>> {
    let body = serde_json::to_vec(message)?;
    store
        .put_object(&status_key(identity), Bytes::from(body), tags)
        .await
        .with_context(|| format!("failed to write status for {}", identity))
}
