//! Queue pool and the messages the controller sends to worker agents.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Job message picked up by a worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub test_id: String,
    pub storage_folder: String,
    pub config_filename: String,
    #[serde(default)]
    pub extra_files: Vec<String>,
    /// Expected runtime in minutes, as reported by the config validator.
    pub estimated_runtime_minutes: u64,
    pub bucket_size_ms: u64,
    pub binary_version: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_on_failure: bool,
    #[serde(default)]
    pub bypass_validator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitting_user: Option<String>,
}

/// Out-of-band instruction for a running test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Stop,
    Kill,
    UpdateConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub test_id: String,
    pub kind: ControlKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_filename: Option<String>,
}

/// A named message queue. The client library behind it is external.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a job for a worker.
    async fn send_job(&self, message: &JobMessage) -> Result<()>;

    /// Broadcast a control message to whichever worker holds the test.
    async fn send_control(&self, message: &ControlMessage) -> Result<()>;
}

/// The fixed set of queues jobs may be dispatched to.
#[derive(Clone, Default)]
pub struct QueuePool {
    queues: HashMap<String, Arc<dyn MessageQueue>>,
    /// Queue used for control messages.
    control: Option<Arc<dyn MessageQueue>>,
}

impl QueuePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, name: impl Into<String>, queue: Arc<dyn MessageQueue>) -> Self {
        self.queues.insert(name.into(), queue);
        self
    }

    pub fn with_control(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.control = Some(queue);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn MessageQueue>> {
        self.queues.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Sorted queue names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn control(&self) -> Option<&Arc<dyn MessageQueue>> {
        self.control.as_ref()
    }
}

/// In-process queue that records what was sent. Used by tests and by the
/// standalone mode when no broker is configured. A bounded queue drops its
/// oldest messages once full.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    jobs: Mutex<VecDeque<JobMessage>>,
    controls: Mutex<VecDeque<ControlMessage>>,
    capacity: Option<usize>,
    failing: AtomicBool,
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, capacity: Option<usize>) -> bool {
    let mut dropped = false;
    if let Some(cap) = capacity {
        while buf.len() >= cap.max(1) {
            buf.pop_front();
            dropped = true;
        }
    }
    buf.push_back(item);
    dropped
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn jobs(&self) -> Vec<JobMessage> {
        self.jobs.lock().iter().cloned().collect()
    }

    pub fn controls(&self) -> Vec<ControlMessage> {
        self.controls.lock().iter().cloned().collect()
    }

    /// Take every pending job message, oldest first.
    pub fn drain_jobs(&self) -> Vec<JobMessage> {
        self.jobs.lock().drain(..).collect()
    }

    /// Take every pending control message, oldest first.
    pub fn drain_controls(&self) -> Vec<ControlMessage> {
        self.controls.lock().drain(..).collect()
    }

    /// Make every send fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn send_job(&self, message: &JobMessage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("queue unavailable");
        }
        tracing::debug!(test_id = %message.test_id, "queued job message");
        if push_bounded(&mut *self.jobs.lock(), message.clone(), self.capacity) {
            tracing::warn!(test_id = %message.test_id, "in-memory queue full, dropped oldest job message");
        }
        Ok(())
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("queue unavailable");
        }
        if push_bounded(&mut *self.controls.lock(), message.clone(), self.capacity) {
            tracing::warn!(test_id = %message.test_id, "in-memory queue full, dropped oldest control message");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_lookup() {
        let q = Arc::new(InMemoryQueue::new());
        let pool = QueuePool::new()
            .with_queue("q2", q.clone())
            .with_queue("q1", q.clone());
        assert!(pool.contains("q1"));
        assert!(!pool.contains("q3"));
        assert_eq!(pool.names(), vec!["q1".to_string(), "q2".to_string()]);
        assert!(pool.control().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_queue_failure_toggle() {
        let q = InMemoryQueue::new();
        let msg = ControlMessage {
            test_id: "t".into(),
            kind: ControlKind::Stop,
            config_filename: None,
        };
        q.send_control(&msg).await.unwrap();
        q.set_failing(true);
        assert!(q.send_control(&msg).await.is_err());
        assert_eq!(q.controls().len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_queue_drops_oldest() {
        let q = InMemoryQueue::bounded(2);
        for n in 0..3 {
            let msg = ControlMessage {
                test_id: format!("t{}", n),
                kind: ControlKind::Stop,
                config_filename: None,
            };
            q.send_control(&msg).await.unwrap();
        }
        let ids: Vec<String> = q.controls().into_iter().map(|c| c.test_id).collect();
        assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);

        assert_eq!(q.drain_controls().len(), 2);
        assert!(q.controls().is_empty());
    }
}
