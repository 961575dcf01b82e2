//! Durable object storage -- the narrow interface the controller needs
//! (list/get/put/delete by key, with tags) and two backends.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

pub use self::memory::InMemoryObjectStore;
pub use self::sqlite::SqliteObjectStore;

/// Object tags (key -> value).
pub type Tags = BTreeMap<String, String>;

/// Tag key used for lifecycle retention rules.
pub const RETENTION_TAG: &str = "retention";
pub const RETENTION_STANDARD: &str = "standard";
pub const RETENTION_RECURRING: &str = "recurring";

/// Retention tags for a one-off (`false`) or recurring (`true`) test's files.
pub fn retention_tags(recurring: bool) -> Tags {
    let value = if recurring {
        RETENTION_RECURRING
    } else {
        RETENTION_STANDARD
    };
    Tags::from([(RETENTION_TAG.to_string(), value.to_string())])
}

/// A full object: body, tags, and last-modified stamp.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
    pub body: Bytes,
    pub tags: Tags,
    pub last_modified: DateTime<Utc>,
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl ObjectSummary {
    /// Final path component of the key.
    pub fn filename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List up to `max_keys` objects whose key starts with `prefix`, in key order.
    async fn list_objects(&self, prefix: &str, max_keys: usize) -> Result<Vec<ObjectSummary>>;

    /// Fetch an object. `Ok(None)` when the key does not exist.
    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>>;

    /// Create or replace an object, returning its new last-modified stamp.
    async fn put_object(&self, key: &str, body: Bytes, tags: &Tags) -> Result<DateTime<Utc>>;

    /// Replace the tag set of an existing object.
    async fn put_tags(&self, key: &str, tags: &Tags) -> Result<()>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Copy an object to a new key with new tags.
    async fn copy_object(&self, from: &str, to: &str, tags: &Tags) -> Result<()> {
        let object = self
            .get_object(from)
            .await?
            .ok_or_else(|| anyhow::anyhow!("object {} not found", from))?;
        self.put_object(to, object.body, tags).await?;
        Ok(())
    }
}

/// True if at least one object exists under `prefix`.
pub async fn prefix_exists(store: &dyn ObjectStore, prefix: &str) -> Result<bool> {
    Ok(!store.list_objects(prefix, 1).await?.is_empty())
}
