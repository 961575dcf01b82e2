//! In-process object store, used by tests and local dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::{ObjectStore, ObjectSummary, StoredObject, Tags};

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    /// Keys containing this substring fail on delete (failure injection).
    fail_deletes_matching: Mutex<Option<String>>,
    fail_puts: AtomicBool,
    puts: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put_object` calls so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes_matching(&self, pattern: Option<&str>) {
        *self.fail_deletes_matching.lock() = pattern.map(str::to_string);
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list_objects(&self, prefix: &str, max_keys: usize) -> Result<Vec<ObjectSummary>> {
        let objects = self.objects.lock();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(max_keys)
            .map(|(key, obj)| ObjectSummary {
                key: key.clone(),
                size: obj.body.len() as u64,
                last_modified: obj.last_modified,
            })
            .collect())
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn put_object(&self, key: &str, body: Bytes, tags: &Tags) -> Result<DateTime<Utc>> {
        if self.fail_puts.load(Ordering::SeqCst) {
            anyhow::bail!("injected put failure for {}", key);
        }
        let mut objects = self.objects.lock();
        let mut last_modified = Utc::now();
        // Stamps must change on every write so readers can detect updates.
        if let Some(prev) = objects.get(key) {
            if last_modified <= prev.last_modified {
                last_modified = prev.last_modified + Duration::microseconds(1);
            }
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                key: key.to_string(),
                body,
                tags: tags.clone(),
                last_modified,
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(last_modified)
    }

    async fn put_tags(&self, key: &str, tags: &Tags) -> Result<()> {
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(key)
            .ok_or_else(|| anyhow::anyhow!("object {} not found", key))?;
        object.tags = tags.clone();
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        if let Some(pattern) = self.fail_deletes_matching.lock().as_deref() {
            if key.contains(pattern) {
                anyhow::bail!("injected delete failure for {}", key);
            }
        }
        self.objects.lock().remove(key);
        Ok(())
    }
}
