//! Versioned JSON blob holding one scheduler map in object storage.

use std::marker::PhantomData;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::{ObjectStore, Tags};

/// Layout version written with every blob.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedStore<T> {
    pub schema_version: u32,
    pub entries: Vec<T>,
}

/// Reads and writes one blob, remembering the last persisted form so an
/// unchanged map is not rewritten.
#[derive(Debug)]
pub struct BlobStore<T> {
    key: String,
    last_persisted: Option<String>,
    _entries: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> BlobStore<T> {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            last_persisted: None,
            _entries: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the blob. A missing blob is an empty list.
    pub async fn load(&mut self, store: &dyn ObjectStore) -> Result<Vec<T>> {
        let Some(object) = store.get_object(&self.key).await? else {
            debug!(key = %self.key, "no persisted blob, starting empty");
            self.last_persisted = None;
            return Ok(Vec::new());
        };
        let persisted: PersistedStore<T> = serde_json::from_slice(&object.body)
            .with_context(|| format!("corrupt scheduler blob {}", self.key))?;
        if persisted.schema_version > SCHEMA_VERSION {
            anyhow::bail!(
                "scheduler blob {} has schema version {}, newer than supported {}",
                self.key,
                persisted.schema_version,
                SCHEMA_VERSION
            );
        }
        // Remember our own serialization so formatting differences in the
        // stored text do not trigger a rewrite.
        self.last_persisted = Some(Self::serialize(persisted.entries.iter())?);
        Ok(persisted.entries)
    }

    /// Persist `entries` unless identical to the last persisted form.
    /// Returns whether a write happened.
    pub async fn save<'a, I>(&mut self, store: &dyn ObjectStore, entries: I) -> Result<bool>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        let text = Self::serialize(entries)?;
        if self.last_persisted.as_deref() == Some(text.as_str()) {
            debug!(key = %self.key, "scheduler blob unchanged, skipping write");
            return Ok(false);
        }
        store
            .put_object(&self.key, Bytes::from(text.clone()), &Tags::new())
            .await
            .with_context(|| format!("failed to persist {}", self.key))?;
        self.last_persisted = Some(text);
        Ok(true)
    }

    fn serialize<'a, I>(entries: I) -> Result<String>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct View<'b, U> {
            schema_version: u32,
            entries: Vec<&'b U>,
        }
        let view = View {
            schema_version: SCHEMA_VERSION,
            entries: entries.into_iter().collect(),
        };
        Ok(serde_json::to_string(&view)?)
    }
}
