//! Submission inputs and the manifest stored next to each test's artifacts.

use std::collections::BTreeMap;

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TestError};
use crate::identity::TestIdentity;
use crate::status::TestStatus;
use crate::storage::{ObjectStore, Tags};

/// Name of the manifest object inside each storage folder.
pub const MANIFEST_FILENAME: &str = "submission.json";

/// A file handed over by the upload layer.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub name: String,
    pub body: Bytes,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// An environment variable value. Hidden values are passed to workers but
/// never echoed back when a submission is pre-populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvValue {
    pub value: String,
    #[serde(default)]
    pub hidden: bool,
}

impl EnvValue {
    pub fn visible(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            hidden: false,
        }
    }

    pub fn hidden(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            hidden: true,
        }
    }
}

/// Everything a caller can send with a submission. Dates are raw strings
/// (RFC 3339 or epoch milliseconds) and are parsed during validation.
#[derive(Debug, Clone, Default)]
pub struct TestSubmission {
    pub config_file: Option<UploadedFile>,
    pub additional_files: Vec<UploadedFile>,
    pub queue_name: Option<String>,
    /// Earlier test whose config, files, and environment fill the gaps.
    pub prior_test_id: Option<String>,
    pub version: Option<String>,
    pub environment: BTreeMap<String, EnvValue>,
    pub restart_on_failure: bool,
    pub bypass_validator: bool,
    pub schedule_date: Option<String>,
    pub end_date: Option<String>,
    pub days_of_week: Option<Vec<u8>>,
    /// Custom worker binary (admin only).
    pub binary: Option<UploadedFile>,
}

/// Submission parameters persisted in the storage folder, used to re-run or
/// pre-populate a later submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionManifest {
    pub config_filename: String,
    pub queue_name: String,
    pub version: String,
    #[serde(default)]
    pub additional_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_filename: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub restart_on_failure: bool,
    #[serde(default)]
    pub bypass_validator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,
}

impl SubmissionManifest {
    /// Plain name -> value map, as handed to the validator and workers.
    pub fn env_values(&self) -> BTreeMap<String, String> {
        env_values(&self.environment)
    }

    /// Names of variables that may be shown back to users.
    pub fn visible_variables(&self) -> Vec<String> {
        self.environment
            .iter()
            .filter(|(_, v)| !v.hidden)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_recurring(&self) -> bool {
        self.days_of_week.is_some()
    }
}

pub(crate) fn env_values(environment: &BTreeMap<String, EnvValue>) -> BTreeMap<String, String> {
    environment
        .iter()
        .map(|(name, v)| (name.clone(), v.value.clone()))
        .collect()
}

/// Parameters of an earlier submission, for pre-populating a new one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousSubmission {
    pub test_id: String,
    pub config_filename: String,
    pub queue_name: String,
    pub version: String,
    pub additional_files: Vec<String>,
    /// Non-hidden environment variable names.
    pub variables: Vec<String>,
    pub restart_on_failure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,
}

/// Kind of an inbound status message from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StatusMessageKind {
    /// Progress update; the message's own status applies.
    #[default]
    Status,
    Started,
    Finished,
    Failed,
}

impl StatusMessageKind {
    /// Status the message kind forces, regardless of the payload.
    pub fn implied_status(self) -> Option<TestStatus> {
        match self {
            StatusMessageKind::Status => None,
            StatusMessageKind::Started => Some(TestStatus::Running),
            StatusMessageKind::Finished => Some(TestStatus::Finished),
            StatusMessageKind::Failed => Some(TestStatus::Failed),
        }
    }
}

/// Parse a user-supplied instant: RFC 3339, or integer epoch milliseconds.
pub fn parse_instant(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .ok_or_else(|| TestError::validation(format!("{field} is not a valid date: {raw}")))
}

pub fn manifest_key(identity: &TestIdentity) -> String {
    identity.object_key(MANIFEST_FILENAME)
}

pub async fn read_manifest(
    store: &dyn ObjectStore,
    identity: &TestIdentity,
) -> anyhow::Result<Option<SubmissionManifest>> {
    let key = manifest_key(identity);
    let Some(object) = store.get_object(&key).await? else {
        return Ok(None);
    };
    let manifest = serde_json::from_slice(&object.body).with_context(|| format!("corrupt manifest {}", key))?;
    Ok(Some(manifest))
}

pub async fn write_manifest(
    store: &dyn ObjectStore,
    identity: &TestIdentity,
    manifest: &SubmissionManifest,
    tags: &Tags,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(manifest)?;
    store
        .put_object(&manifest_key(identity), Bytes::from(body), tags)
        .await
        .with_context(|| format!("failed to write manifest for {}", identity))?;
    Ok(())
}
