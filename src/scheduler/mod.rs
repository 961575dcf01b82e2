//! Deferred and recurring test launches, plus the historical calendar.
//!
//! Two maps are kept: pending schedule entries and historical (terminal)
//! tests. Each is loaded lazily from its blob in object storage the first
//! time it is needed and written back after every mutation. Nothing here
//! coordinates across processes; two processes running the loop against the
//! same blobs will race (last writer wins).

pub mod calendar;
pub mod engine;
pub mod history;
pub mod recurrence;
pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use self::calendar::CalendarEvent;
use self::history::HistoricalTest;
use self::recurrence::{add_days, next_occurrence};
use self::store::BlobStore;
use crate::auth::AuthContext;
use crate::cache::TestRecord;
use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::error::{InfraContext, Result, TestError};
use crate::identity::TestIdentity;
use crate::queue::JobMessage;
use crate::status::{self, write_status, TestStatus, TestStatusMessage, STATUS_SUFFIX};
use crate::storage::{retention_tags, ObjectStore};

pub use self::engine::{run_historical_prune_loop, run_scheduler_loop};

/// Most objects a single folder deletion or relabel will touch.
const FOLDER_SCAN_LIMIT: usize = 10_000;
/// Most objects the one-time historical backfill will scan.
const BACKFILL_SCAN_LIMIT: usize = 100_000;

/// Weekday recurrence of a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recurrence {
    pub days_of_week: Vec<u8>,
    pub end_date: DateTime<Utc>,
}

/// What to launch and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub queue_name: String,
    pub job_message: JobMessage,
    pub schedule_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
}

/// One pending entry in the schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTest {
    pub test_id: String,
    pub event: CalendarEvent,
    pub job: ScheduledJob,
    pub next_run: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl ScheduledTest {
    pub fn is_recurring(&self) -> bool {
        self.job.recurrence.is_some()
    }
}

/// Launches due jobs on behalf of the scheduler loop.
#[async_trait]
pub trait TestLauncher: Send + Sync {
    /// Launch a due entry. With `fresh`, the run is a new test cloned from
    /// the entry's artifacts under that identity; otherwise the entry's own
    /// test id and job message are used.
    async fn launch_scheduled(&self, entry: &ScheduledTest, fresh: Option<&TestIdentity>) -> Result<TestRecord>;
}

/// Scheduler tuning, resolved from configuration.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: std::time::Duration,
    pub timezone: chrono_tz::Tz,
    pub historical_retention: Duration,
    pub schedule_key: String,
    pub historical_key: String,
    pub public_url: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(60),
            timezone: chrono_tz::UTC,
            historical_retention: Duration::days(365),
            schedule_key: "settings/schedule.json".to_string(),
            historical_key: "settings/historical.json".to_string(),
            public_url: String::new(),
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &ControllerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            poll_interval: config.scheduler.poll_interval(),
            timezone: config.scheduler.tz()?,
            historical_retention: Duration::days(config.scheduler.historical_retention_days),
            schedule_key: config.storage.schedule_key.clone(),
            historical_key: config.storage.historical_key.clone(),
            public_url: config.server.public_url.clone(),
        })
    }
}

trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for ScheduledTest {
    fn key(&self) -> &str {
        &self.test_id
    }
}

impl Keyed for HistoricalTest {
    fn key(&self) -> &str {
        &self.test_id
    }
}

/// A lazily loaded map and the blob it persists to.
struct PersistedMap<T> {
    entries: Option<BTreeMap<String, T>>,
    blob: BlobStore<T>,
}

impl<T: Keyed + Serialize + DeserializeOwned> PersistedMap<T> {
    fn new(key: &str) -> Self {
        Self {
            entries: None,
            blob: BlobStore::new(key),
        }
    }

    async fn loaded(&mut self, store: &dyn ObjectStore) -> anyhow::Result<&mut BTreeMap<String, T>> {
        let entries = match self.entries.take() {
            Some(entries) => entries,
            None => {
                let list = self.blob.load(store).await?;
                info!(key = %self.blob.key(), count = list.len(), "loaded scheduler blob");
                list.into_iter().map(|e| (e.key().to_string(), e)).collect()
            }
        };
        Ok(self.entries.insert(entries))
    }

    async fn persist(&mut self, store: &dyn ObjectStore) -> anyhow::Result<bool> {
        let Self { entries, blob } = self;
        match entries {
            Some(entries) => blob.save(store, entries.values()).await,
            None => Ok(false),
        }
    }
}

pub struct TestScheduler {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    pending: Mutex<PersistedMap<ScheduledTest>>,
    history: Mutex<PersistedMap<HistoricalTest>>,
}

impl TestScheduler {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>, settings: SchedulerSettings) -> Self {
        let pending = Mutex::new(PersistedMap::new(&settings.schedule_key));
        let history = Mutex::new(PersistedMap::new(&settings.historical_key));
        Self {
            store,
            clock,
            settings,
            pending,
            history,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Drop the in-memory maps; the next access reloads them from storage.
    pub async fn clear_cached_state(&self) {
        self.pending.lock().await.entries = None;
        self.history.lock().await.entries = None;
    }

    /// Add (or replace) a deferred launch and mark the test Scheduled.
    pub async fn add_test(&self, job: ScheduledJob, auth: &AuthContext) -> Result<TestRecord> {
        let now = self.clock.now();
        if job.queue_name.trim().is_empty() {
            return Err(TestError::validation("queueName is required to schedule a test"));
        }
        if job.job_message.test_id.is_empty() {
            return Err(TestError::validation("scheduled job is missing its testId"));
        }
        if job.schedule_date <= now {
            return Err(TestError::validation(format!(
                "scheduleDate {} must be in the future",
                job.schedule_date.to_rfc3339()
            )));
        }

        let identity = TestIdentity::parse(&job.job_message.test_id)?;
        let test_id = identity.test_id();
        let runtime = Duration::minutes(job.job_message.estimated_runtime_minutes as i64);
        let tz = self.settings.timezone;

        let (event, next_run) = match &job.recurrence {
            None => (
                CalendarEvent::one_off(
                    &test_id,
                    identity.base_name(),
                    &self.settings.public_url,
                    job.schedule_date,
                    job.schedule_date + runtime,
                    TestStatus::Scheduled,
                ),
                job.schedule_date,
            ),
            Some(recurrence) => {
                if recurrence.days_of_week.is_empty() || recurrence.days_of_week.iter().any(|d| *d > 6) {
                    return Err(TestError::validation(
                        "daysOfWeek must list at least one day between 0 (Sunday) and 6 (Saturday)",
                    ));
                }
                if recurrence.end_date <= job.schedule_date {
                    return Err(TestError::validation("endDate must be after scheduleDate"));
                }
                let local_start = job.schedule_date.with_timezone(&tz);
                let first = next_occurrence(
                    &local_start,
                    &recurrence.end_date.with_timezone(&tz),
                    &recurrence.days_of_week,
                )
                .ok_or_else(|| {
                    TestError::validation("no day in daysOfWeek falls between scheduleDate and endDate")
                })?;
                let event = CalendarEvent::recurring(
                    &test_id,
                    identity.base_name(),
                    &self.settings.public_url,
                    &local_start,
                    recurrence.end_date,
                    &recurrence.days_of_week,
                    runtime,
                    TestStatus::Scheduled,
                );
                (event, first.with_timezone(&Utc))
            }
        };

        let recurring = job.recurrence.is_some();
        let owner = auth.user_id.clone();
        let queue_name = job.queue_name.clone();
        let version = job.job_message.binary_version.clone();

        let mut pending = self.pending.lock().await;
        let entries = pending
            .loaded(self.store.as_ref())
            .await
            .infra("failed to load the schedule")?;
        if let Some(existing) = entries.get(&test_id) {
            if !auth.may_modify(existing.owner.as_deref()) {
                return Err(TestError::Conflict {
                    message: format!(
                        "{} was scheduled by {}; only that user or an admin may change it",
                        test_id,
                        existing.owner.as_deref().unwrap_or("another user")
                    ),
                    forbidden: true,
                });
            }
        }

        let mut status = TestStatusMessage::new(TestStatus::Scheduled, next_run, next_run + runtime);
        status.user_id = owner.clone();
        status.version = Some(version.clone());
        let stamp = write_status(self.store.as_ref(), &identity, &status, &retention_tags(recurring))
            .await
            .infra("failed to write scheduled status")?;

        entries.insert(
            test_id.clone(),
            ScheduledTest {
                test_id: test_id.clone(),
                event,
                job,
                next_run,
                owner: owner.clone(),
            },
        );
        pending
            .persist(self.store.as_ref())
            .await
            .infra("failed to persist the schedule")?;
        info!(test_id = %test_id, next_run = %next_run.to_rfc3339(), recurring, "test scheduled");

        let mut record = TestRecord::new(&identity, TestStatus::Scheduled);
        record.start_time = Some(next_run);
        record.end_time = Some(next_run + runtime);
        record.user_id = owner;
        record.version = Some(version);
        record.queue_name = Some(queue_name);
        record.status_handle = Some(stamp);
        record.last_updated = Some(now);
        Ok(record)
    }

    /// Remove a pending or historical entry, optionally deleting every
    /// stored artifact of the test.
    pub async fn remove_test(&self, test_id: &str, auth: &AuthContext, delete_storage: bool) -> Result<()> {
        let identity = TestIdentity::parse(test_id)?;
        let test_id = identity.test_id();
        let store = self.store.as_ref();

        let mut removed = false;
        {
            let mut pending = self.pending.lock().await;
            let entries = pending.loaded(store).await.infra("failed to load the schedule")?;
            if let Some(entry) = entries.get(&test_id) {
                if !auth.may_modify(entry.owner.as_deref()) {
                    return Err(TestError::Conflict {
                        message: format!("only the owner or an admin may remove {}", test_id),
                        forbidden: true,
                    });
                }
                entries.remove(&test_id);
                pending.persist(store).await.infra("failed to persist the schedule")?;
                removed = true;
            }
        }
        if !removed {
            let mut history = self.history.lock().await;
            let entries = history
                .loaded(store)
                .await
                .infra("failed to load the historical calendar")?;
            if let Some(entry) = entries.get(&test_id) {
                if !auth.may_modify(entry.owner.as_deref()) {
                    return Err(TestError::Conflict {
                        message: format!("only the owner or an admin may remove {}", test_id),
                        forbidden: true,
                    });
                }
                entries.remove(&test_id);
                history
                    .persist(store)
                    .await
                    .infra("failed to persist the historical calendar")?;
                removed = true;
            }
        }
        if !removed {
            return Err(TestError::not_found(format!("{} is not on the calendar", test_id)));
        }
        info!(test_id = %test_id, delete_storage, "removed calendar entry");

        if delete_storage {
            self.delete_folder(&identity).await?;
        }
        Ok(())
    }

    /// Delete every object in a test's folder. Individual failures are
    /// logged and reported together once all deletions have been attempted.
    async fn delete_folder(&self, identity: &TestIdentity) -> Result<()> {
        let prefix = format!("{}/", identity.storage_folder());
        let objects = self
            .store
            .list_objects(&prefix, FOLDER_SCAN_LIMIT)
            .await
            .infra("failed to list test files")?;
        let total = objects.len();
        let results = join_all(objects.iter().map(|o| self.store.delete_object(&o.key))).await;
        let failures: Vec<String> = objects
            .iter()
            .zip(results)
            .filter_map(|(object, result)| {
                result.err().map(|e| {
                    warn!(key = %object.key, error = %e, "failed to delete test file");
                    object.key.clone()
                })
            })
            .collect();
        if !failures.is_empty() {
            return Err(TestError::infra(
                format!("failed to delete {} of {} files for {}", failures.len(), total, identity),
                anyhow::anyhow!("undeleted: {}", failures.join(", ")),
            ));
        }
        Ok(())
    }

    /// Re-tag every object in a test's folder with one-off or recurring
    /// retention.
    pub(crate) async fn relabel_folder(&self, identity: &TestIdentity, recurring: bool) -> anyhow::Result<()> {
        let prefix = format!("{}/", identity.storage_folder());
        let tags = retention_tags(recurring);
        for object in self.store.list_objects(&prefix, FOLDER_SCAN_LIMIT).await? {
            self.store.put_tags(&object.key, &tags).await?;
        }
        Ok(())
    }

    /// Record a terminal test on the historical calendar. Re-adding the same
    /// test id replaces its entry.
    pub async fn add_historical_test(&self, entry: HistoricalTest) -> Result<()> {
        let mut history = self.history.lock().await;
        let entries = history
            .loaded(self.store.as_ref())
            .await
            .infra("failed to load the historical calendar")?;
        entries.insert(entry.test_id.clone(), entry);
        history
            .persist(self.store.as_ref())
            .await
            .infra("failed to persist the historical calendar")?;
        Ok(())
    }

    /// Drop historical entries older than the retention window.
    pub async fn prune_historical(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = self.settings.historical_retention;
        let mut history = self.history.lock().await;
        let entries = history
            .loaded(self.store.as_ref())
            .await
            .infra("failed to load the historical calendar")?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now, retention));
        let pruned = before - entries.len();
        if pruned > 0 {
            history
                .persist(self.store.as_ref())
                .await
                .infra("failed to persist the historical calendar")?;
            info!(pruned, "pruned historical calendar");
        }
        Ok(pruned)
    }

    /// One-time scan of every stored status object, adding finished and
    /// failed tests to the historical calendar.
    pub async fn backfill_historical(&self) -> Result<usize> {
        let store = self.store.as_ref();
        let objects = store
            .list_objects("", BACKFILL_SCAN_LIMIT)
            .await
            .infra("failed to list stored tests")?;
        let mut found = Vec::new();
        for object in objects.iter().filter(|o| o.key.ends_with(STATUS_SUFFIX)) {
            let Some(test_id) = object.filename().strip_suffix(STATUS_SUFFIX) else {
                continue;
            };
            let Ok(identity) = TestIdentity::parse(test_id) else {
                continue;
            };
            match status::read_status(store, &identity).await {
                Ok(Some(stored)) if stored.message.status.is_terminal() => {
                    found.push(HistoricalTest {
                        test_id: identity.test_id(),
                        title: identity.base_name().to_string(),
                        start: stored.message.start_time,
                        end: stored.message.end_time,
                        status: stored.message.status,
                        owner: stored.message.user_id,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(key = %object.key, error = %e, "skipping unreadable status during backfill"),
            }
        }

        let count = found.len();
        let mut history = self.history.lock().await;
        let entries = history
            .loaded(store)
            .await
            .infra("failed to load the historical calendar")?;
        for entry in found {
            entries.insert(entry.test_id.clone(), entry);
        }
        history
            .persist(store)
            .await
            .infra("failed to persist the historical calendar")?;
        info!(count, "historical calendar backfill complete");
        Ok(count)
    }

    /// Live schedule and history, projected for the calendar.
    pub async fn get_calendar_events(&self) -> Result<Vec<CalendarEvent>> {
        let mut events: Vec<CalendarEvent> = self
            .scheduled_tests()
            .await?
            .into_iter()
            .map(|entry| entry.event)
            .collect();
        let mut history = self.history.lock().await;
        let entries = history
            .loaded(self.store.as_ref())
            .await
            .infra("failed to load the historical calendar")?;
        events.extend(entries.values().map(|h| h.to_event(&self.settings.public_url)));
        Ok(events)
    }

    pub async fn get_scheduled(&self, test_id: &str) -> Result<Option<ScheduledTest>> {
        let mut pending = self.pending.lock().await;
        let entries = pending
            .loaded(self.store.as_ref())
            .await
            .infra("failed to load the schedule")?;
        Ok(entries.get(test_id).cloned())
    }

    /// Every launch due between `now` and `until`, in time order.
    pub async fn upcoming_runs(&self, now: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<(DateTime<Utc>, String)>> {
        let tz = self.settings.timezone;
        let mut runs = Vec::new();
        for entry in self.scheduled_tests().await? {
            let mut next = Some(entry.next_run);
            while let Some(run) = next.filter(|t| *t <= until) {
                if run >= now {
                    runs.push((run, entry.test_id.clone()));
                }
                next = entry.job.recurrence.as_ref().and_then(|recurrence| {
                    let next_day = add_days(&run.with_timezone(&tz), 1)?;
                    next_occurrence(&next_day, &recurrence.end_date.with_timezone(&tz), &recurrence.days_of_week)
                        .map(|t| t.with_timezone(&Utc))
                });
            }
        }
        runs.sort();
        Ok(runs)
    }

    pub async fn scheduled_tests(&self) -> Result<Vec<ScheduledTest>> {
        let mut pending = self.pending.lock().await;
        let entries = pending
            .loaded(self.store.as_ref())
            .await
            .infra("failed to load the schedule")?;
        Ok(entries.values().cloned().collect())
    }

    pub async fn historical_tests(&self) -> Result<Vec<HistoricalTest>> {
        let mut history = self.history.lock().await;
        let entries = history
            .loaded(self.store.as_ref())
            .await
            .infra("failed to load the historical calendar")?;
        Ok(entries.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{InMemoryObjectStore, RETENTION_RECURRING, RETENTION_TAG};
    use bytes::Bytes;
    use chrono::TimeZone;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingLauncher {
        launched: SyncMutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl RecordingLauncher {
        fn launched(&self) -> Vec<String> {
            self.launched.lock().clone()
        }
    }

    #[async_trait]
    impl TestLauncher for RecordingLauncher {
        async fn launch_scheduled(&self, entry: &ScheduledTest, fresh: Option<&TestIdentity>) -> Result<TestRecord> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TestError::infra("launch failed", anyhow::anyhow!("queue down")));
            }
            let identity = match fresh {
                Some(identity) => identity.clone(),
                None => TestIdentity::parse(&entry.test_id)?,
            };
            self.launched.lock().push(identity.test_id());
            Ok(TestRecord::new(&identity, TestStatus::Created))
        }
    }

    // Monday.
    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 50, 0).unwrap()
    }

    struct Harness {
        store: Arc<InMemoryObjectStore>,
        clock: ManualClock,
        scheduler: TestScheduler,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryObjectStore::new());
        let clock = ManualClock::new(start());
        let scheduler = TestScheduler::new(store.clone(), Arc::new(clock.clone()), SchedulerSettings::default());
        Harness { store, clock, scheduler }
    }

    fn job(test_id: &str, schedule_date: DateTime<Utc>, recurrence: Option<Recurrence>) -> ScheduledJob {
        let identity = TestIdentity::parse(test_id).unwrap();
        ScheduledJob {
            queue_name: "q1".to_string(),
            job_message: JobMessage {
                test_id: identity.test_id(),
                storage_folder: identity.storage_folder(),
                config_filename: "basic.yaml".to_string(),
                extra_files: Vec::new(),
                estimated_runtime_minutes: 30,
                bucket_size_ms: 60_000,
                binary_version: "latest".to_string(),
                env_vars: BTreeMap::new(),
                restart_on_failure: false,
                bypass_validator: false,
                submitting_user: Some("alice".to_string()),
            },
            schedule_date,
            recurrence,
        }
    }

    const TEST_ID: &str = "basic20240101T095000000";

    #[tokio::test]
    async fn test_add_one_off_test() {
        let h = harness();
        let when = start() + Duration::minutes(10);
        let record = h.scheduler.add_test(job(TEST_ID, when, None), &AuthContext::user("alice")).await.unwrap();
        assert_eq!(record.status, TestStatus::Scheduled);
        assert_eq!(record.start_time, Some(when));

        let entry = h.scheduler.get_scheduled(TEST_ID).await.unwrap().unwrap();
        assert_eq!(entry.next_run, when);
        assert_eq!(entry.event.start, Some(when));
        assert_eq!(entry.event.end, Some(when + Duration::minutes(30)));

        let identity = TestIdentity::parse(TEST_ID).unwrap();
        let stored = status::read_status(h.store.as_ref(), &identity).await.unwrap().unwrap();
        assert_eq!(stored.message.status, TestStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_add_rejects_past_dates_and_bad_recurrence() {
        let h = harness();
        let alice = AuthContext::user("alice");
        let err = h.scheduler.add_test(job(TEST_ID, start() - Duration::minutes(1), None), &alice).await.unwrap_err();
        assert!(matches!(err, TestError::Validation(_)));

        let bad_days = Recurrence { days_of_week: vec![8], end_date: start() + Duration::days(7) };
        let err = h
            .scheduler
            .add_test(job(TEST_ID, start() + Duration::hours(1), Some(bad_days)), &alice)
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::Validation(_)));

        // Saturday only, but the window ends before Saturday.
        let no_day = Recurrence { days_of_week: vec![6], end_date: start() + Duration::days(2) };
        let err = h
            .scheduler
            .add_test(job(TEST_ID, start() + Duration::hours(1), Some(no_day)), &alice)
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::Validation(_)));
        assert!(h.scheduler.scheduled_tests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_off_launches_exactly_once() {
        let h = harness();
        let launcher = RecordingLauncher::default();
        let when = start() + Duration::minutes(10);
        h.scheduler.add_test(job(TEST_ID, when, None), &AuthContext::user("alice")).await.unwrap();

        let sleep = h.scheduler.tick(&launcher, h.clock.now()).await;
        assert!(launcher.launched().is_empty());
        assert_eq!(sleep, std::time::Duration::from_secs(60));

        h.clock.advance(Duration::minutes(11));
        h.scheduler.tick(&launcher, h.clock.now()).await;
        h.scheduler.tick(&launcher, h.clock.now()).await;
        assert_eq!(launcher.launched(), vec![TEST_ID.to_string()]);
        assert!(h.scheduler.get_scheduled(TEST_ID).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sleep_shortens_for_imminent_entry() {
        let h = harness();
        let launcher = RecordingLauncher::default();
        let when = start() + Duration::seconds(20);
        h.scheduler.add_test(job(TEST_ID, when, None), &AuthContext::user("alice")).await.unwrap();
        let sleep = h.scheduler.tick(&launcher, h.clock.now()).await;
        assert_eq!(sleep, std::time::Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_recurring_skips_days_missed_while_down() {
        let h = harness();
        let launcher = RecordingLauncher::default();
        let first = start() + Duration::minutes(10); // Monday 10:00
        let recurrence = Recurrence { days_of_week: vec![1, 3, 5], end_date: start() + Duration::days(7) };
        h.scheduler
            .add_test(job(TEST_ID, first, Some(recurrence)), &AuthContext::user("alice"))
            .await
            .unwrap();

        // Back up on Thursday: Monday and Wednesday are gone.
        h.clock.set(first + Duration::days(3) + Duration::hours(2));
        h.scheduler.tick(&launcher, h.clock.now()).await;
        h.scheduler.tick(&launcher, h.clock.now()).await;
        assert_eq!(launcher.launched().len(), 1);
        let entry = h.scheduler.get_scheduled(TEST_ID).await.unwrap().unwrap();
        assert_eq!(entry.next_run, first + Duration::days(4));

        h.clock.set(first + Duration::days(4) + Duration::minutes(1));
        h.scheduler.tick(&launcher, h.clock.now()).await;
        let launched = launcher.launched();
        assert_eq!(launched.len(), 2);
        assert_eq!(launched[1], TEST_ID);
        assert!(h.scheduler.get_scheduled(TEST_ID).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recurring_runs_each_listed_day_then_completes() {
        let h = harness();
        let launcher = RecordingLauncher::default();
        let first = start() + Duration::minutes(10); // Monday 10:00
        let recurrence = Recurrence { days_of_week: vec![1, 3, 5], end_date: start() + Duration::days(7) };
        h.scheduler
            .add_test(job(TEST_ID, first, Some(recurrence)), &AuthContext::user("alice"))
            .await
            .unwrap();

        let events = h.scheduler.get_calendar_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].start_recur, Some(first));
        assert_eq!(events[0].days_of_week, Some(vec![1, 3, 5]));

        let identity = TestIdentity::parse(TEST_ID).unwrap();
        let status_key = status::status_key(&identity);
        let tags = h.store.get_object(&status_key).await.unwrap().unwrap().tags;
        assert_eq!(tags[RETENTION_TAG], RETENTION_RECURRING);

        let mut next_runs = Vec::new();
        for day in [0, 2, 4] {
            h.clock.set(first + Duration::days(day) + Duration::minutes(1));
            h.scheduler.tick(&launcher, h.clock.now()).await;
            if let Some(entry) = h.scheduler.get_scheduled(TEST_ID).await.unwrap() {
                next_runs.push(entry.next_run);
            }
        }

        let launched = launcher.launched();
        assert_eq!(launched.len(), 3);
        let mut distinct = launched.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
        // The final occurrence runs under the original id.
        assert_eq!(launched[2], TEST_ID);
        assert_eq!(
            next_runs,
            vec![first + Duration::days(2), first + Duration::days(4)]
        );
        assert!(h.scheduler.get_scheduled(TEST_ID).await.unwrap().is_none());

        let tags = h.store.get_object(&status_key).await.unwrap().unwrap().tags;
        assert_eq!(tags, retention_tags(false));
    }

    #[tokio::test]
    async fn test_upcoming_runs_expand_recurrence() {
        let h = harness();
        let first = start() + Duration::minutes(10);
        let recurrence = Recurrence { days_of_week: vec![1, 3, 5], end_date: start() + Duration::days(7) };
        h.scheduler
            .add_test(job(TEST_ID, first, Some(recurrence)), &AuthContext::user("alice"))
            .await
            .unwrap();
        h.scheduler
            .add_test(job("other20240101T095000001", first + Duration::hours(1), None), &AuthContext::user("alice"))
            .await
            .unwrap();

        let runs = h.scheduler.upcoming_runs(start(), start() + Duration::days(3)).await.unwrap();
        let times: Vec<_> = runs.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![first, first + Duration::hours(1), first + Duration::days(2)]);

        let all = h.scheduler.upcoming_runs(start(), start() + Duration::days(30)).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_launch_is_retried() {
        let h = harness();
        let launcher = RecordingLauncher::default();
        let when = start() + Duration::minutes(10);
        h.scheduler.add_test(job(TEST_ID, when, None), &AuthContext::user("alice")).await.unwrap();

        h.clock.advance(Duration::minutes(15));
        launcher.fail.store(true, Ordering::SeqCst);
        let sleep = h.scheduler.tick(&launcher, h.clock.now()).await;
        assert_eq!(sleep, std::time::Duration::from_secs(60));
        let entry = h.scheduler.get_scheduled(TEST_ID).await.unwrap().unwrap();
        assert_eq!(entry.next_run, when);

        launcher.fail.store(false, Ordering::SeqCst);
        h.scheduler.tick(&launcher, h.clock.now()).await;
        assert_eq!(launcher.launched(), vec![TEST_ID.to_string()]);
    }

    #[tokio::test]
    async fn test_schedule_survives_reload() {
        let h = harness();
        let alice = AuthContext::user("alice");
        let ids = ["basic20240101T095000000", "other20240101T095000001", "third20240101T095000002"];
        for (n, id) in ids.iter().enumerate() {
            let when = start() + Duration::hours(n as i64 + 1);
            h.scheduler.add_test(job(id, when, None), &alice).await.unwrap();
        }
        let before: Vec<_> = h
            .scheduler
            .scheduled_tests()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.test_id, e.next_run))
            .collect();

        h.scheduler.clear_cached_state().await;
        let after: Vec<_> = h
            .scheduler
            .scheduled_tests()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.test_id, e.next_run))
            .collect();
        assert_eq!(before, after);

        let other = TestScheduler::new(h.store.clone(), Arc::new(h.clock.clone()), SchedulerSettings::default());
        assert_eq!(other.scheduled_tests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_only_owner_or_admin_may_overwrite_or_remove() {
        let h = harness();
        let when = start() + Duration::hours(1);
        h.scheduler.add_test(job(TEST_ID, when, None), &AuthContext::user("alice")).await.unwrap();

        let err = h.scheduler.add_test(job(TEST_ID, when, None), &AuthContext::user("bob")).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);
        let err = h.scheduler.remove_test(TEST_ID, &AuthContext::user("bob"), false).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);

        h.scheduler
            .add_test(job(TEST_ID, when + Duration::hours(1), None), &AuthContext::admin("root"))
            .await
            .unwrap();
        let entry = h.scheduler.get_scheduled(TEST_ID).await.unwrap().unwrap();
        assert_eq!(entry.owner.as_deref(), Some("root"));
        h.scheduler.remove_test(TEST_ID, &AuthContext::admin("root"), false).await.unwrap();
        let err = h.scheduler.remove_test(TEST_ID, &AuthContext::user("alice"), false).await.unwrap_err();
        assert!(matches!(err, TestError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_with_storage_reports_failed_deletes() {
        let h = harness();
        let alice = AuthContext::user("alice");
        h.scheduler.add_test(job(TEST_ID, start() + Duration::hours(1), None), &alice).await.unwrap();
        let identity = TestIdentity::parse(TEST_ID).unwrap();
        for name in ["basic.yaml", "data.csv", "stuck.csv"] {
            h.store
                .put_object(&identity.object_key(name), Bytes::from_static(b"x"), &retention_tags(false))
                .await
                .unwrap();
        }
        h.store.fail_deletes_matching(Some("stuck"));

        let err = h.scheduler.remove_test(TEST_ID, &alice, true).await.unwrap_err();
        assert!(matches!(err, TestError::Infra { .. }));
        assert!(err.to_string().contains("1 of 4"));
        let remaining = h.store.list_objects(&identity.storage_folder(), 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    fn historical(test_id: &str, end: DateTime<Utc>) -> HistoricalTest {
        HistoricalTest {
            test_id: test_id.to_string(),
            title: "basic".to_string(),
            start: end - Duration::minutes(30),
            end,
            status: TestStatus::Finished,
            owner: Some("alice".to_string()),
        }
    }

    #[tokio::test]
    async fn test_add_historical_is_idempotent() {
        let h = harness();
        h.scheduler.add_historical_test(historical(TEST_ID, start())).await.unwrap();
        let writes = h.store.put_count();
        h.scheduler.add_historical_test(historical(TEST_ID, start())).await.unwrap();
        assert_eq!(h.scheduler.historical_tests().await.unwrap().len(), 1);
        assert_eq!(h.store.put_count(), writes);
    }

    #[tokio::test]
    async fn test_prune_drops_old_history() {
        let h = harness();
        h.scheduler.add_historical_test(historical(TEST_ID, start() - Duration::days(400))).await.unwrap();
        h.scheduler
            .add_historical_test(historical("other20240101T095000001", start() - Duration::days(10)))
            .await
            .unwrap();
        assert_eq!(h.scheduler.prune_historical(start()).await.unwrap(), 1);
        let left = h.scheduler.historical_tests().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].test_id, "other20240101T095000001");
    }

    #[tokio::test]
    async fn test_backfill_picks_up_terminal_statuses() {
        let h = harness();
        let now = start();
        for (id, st) in [
            ("done20231201T000000000", TestStatus::Finished),
            ("oops20231202T000000000", TestStatus::Failed),
            ("live20231203T000000000", TestStatus::Running),
        ] {
            let identity = TestIdentity::parse(id).unwrap();
            let msg = TestStatusMessage::new(st, now, now);
            write_status(h.store.as_ref(), &identity, &msg, &retention_tags(false)).await.unwrap();
        }
        assert_eq!(h.scheduler.backfill_historical().await.unwrap(), 2);
        let events = h.scheduler.get_calendar_events().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.test_status.is_terminal()));
    }
}
