//! Test identifiers and their storage folders.
//!
//! A test id is the config file's base name followed by the UTC submission
//! timestamp, e.g. `basicrun20240102T030405006`. The storage folder for the
//! same test is `basicrun/20240102T030405006`. The mapping is one-to-one in
//! both directions.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TestError;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3f";
const TIMESTAMP_LEN: usize = 18;

/// Parsed test identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestIdentity {
    base_name: String,
    timestamp: DateTime<Utc>,
}

impl TestIdentity {
    /// Build an identity from a config filename and a submission time.
    pub fn from_config_filename(filename: &str, timestamp: DateTime<Utc>) -> Result<Self, TestError> {
        let stem = filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(filename);
        let base_name = normalize_base_name(stem);
        if base_name.is_empty() {
            return Err(TestError::validation(format!(
                "config filename {filename} does not contain any alphanumeric characters"
            )));
        }
        Ok(Self {
            base_name,
            timestamp: truncate_to_millis(timestamp),
        })
    }

    /// Same base name, new timestamp.
    pub fn with_timestamp(&self, timestamp: DateTime<Utc>) -> Self {
        Self {
            base_name: self.base_name.clone(),
            timestamp: truncate_to_millis(timestamp),
        }
    }

    /// Parse a test id string such as `basicrun20240102T030405006`.
    pub fn parse(test_id: &str) -> Result<Self, TestError> {
        let invalid = || TestError::validation(format!("invalid testId: {test_id}"));
        if !test_id.is_ascii() || test_id.len() <= TIMESTAMP_LEN {
            return Err(invalid());
        }
        let (base_name, stamp) = test_id.split_at(test_id.len() - TIMESTAMP_LEN);
        if base_name != normalize_base_name(base_name) {
            return Err(invalid());
        }
        let timestamp = parse_timestamp(stamp).ok_or_else(invalid)?;
        Ok(Self {
            base_name: base_name.to_string(),
            timestamp,
        })
    }

    /// Parse a storage folder such as `basicrun/20240102T030405006`.
    pub fn from_storage_folder(folder: &str) -> Result<Self, TestError> {
        let folder = folder.trim_end_matches('/');
        let (base_name, stamp) = folder
            .split_once('/')
            .ok_or_else(|| TestError::validation(format!("invalid storage folder: {folder}")))?;
        Self::parse(&format!("{base_name}{stamp}"))
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn test_id(&self) -> String {
        format!("{}{}", self.base_name, self.timestamp.format(TIMESTAMP_FORMAT))
    }

    pub fn storage_folder(&self) -> String {
        format!("{}/{}", self.base_name, self.timestamp.format(TIMESTAMP_FORMAT))
    }

    /// Object key of a file inside this test's storage folder.
    pub fn object_key(&self, filename: &str) -> String {
        format!("{}/{}", self.storage_folder(), filename)
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.test_id())
    }
}

/// Lower-case and strip everything that is not ASCII alphanumeric.
pub fn normalize_base_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn parse_timestamp(stamp: &str) -> Option<DateTime<Utc>> {
    if stamp.len() != TIMESTAMP_LEN || stamp.as_bytes()[8] != b'T' {
        return None;
    }
    // %3f needs a separator-free layout, so split the millis off manually.
    let (seconds, millis) = stamp.split_at(15);
    let naive = NaiveDateTime::parse_from_str(seconds, "%Y%m%dT%H%M%S").ok()?;
    let millis: i64 = millis.parse().ok()?;
    Some(naive.and_utc() + chrono::Duration::milliseconds(millis))
}

fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap() + chrono::Duration::milliseconds(6)
    }

    #[test]
    fn test_from_config_filename() {
        let id = TestIdentity::from_config_filename("Basic_Run.yaml", sample_time()).unwrap();
        assert_eq!(id.base_name(), "basicrun");
        assert_eq!(id.test_id(), "basicrun20240102T030405006");
        assert_eq!(id.storage_folder(), "basicrun/20240102T030405006");
    }

    #[test]
    fn test_parse_is_reversible() {
        let id = TestIdentity::parse("basicrun20240102T030405006").unwrap();
        assert_eq!(id.timestamp(), sample_time());
        assert_eq!(id.test_id(), "basicrun20240102T030405006");
        let from_folder = TestIdentity::from_storage_folder(&id.storage_folder()).unwrap();
        assert_eq!(from_folder, id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TestIdentity::parse("").is_err());
        assert!(TestIdentity::parse("short").is_err());
        assert!(TestIdentity::parse("Basic20240102T030405006").is_err());
        assert!(TestIdentity::parse("basic20241302T030405006").is_err());
        assert!(TestIdentity::parse("basic20240102X030405006").is_err());
        assert!(TestIdentity::from_config_filename("___.yaml", sample_time()).is_err());
    }

    #[test]
    fn test_with_timestamp_keeps_base_name() {
        let id = TestIdentity::parse("basicrun20240102T030405006").unwrap();
        let later = id.with_timestamp(sample_time() + chrono::Duration::days(1));
        assert_eq!(later.base_name(), "basicrun");
        assert_eq!(later.test_id(), "basicrun20240103T030405006");
    }
}
