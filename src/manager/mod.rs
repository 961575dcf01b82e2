//! Test lifecycle: submission, status queries and updates, config
//! replacement, cancellation, search, and the stall sweep.
//!
//! The manager bridges the cache, the queue pool, and durable status. The
//! initial status object is always written before a job message is sent, so
//! a worker can find it; a failed send leaves a record that can be
//! resubmitted.

mod submission;

pub use self::submission::{
    parse_instant, read_manifest, write_manifest, EnvValue, PreviousSubmission, StatusMessageKind,
    SubmissionManifest, TestSubmission, UploadedFile, MANIFEST_FILENAME,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::submission::env_values;
use crate::auth::AuthContext;
use crate::cache::{CacheTier, SharedRecord, TestCache, TestRecord};
use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::error::{InfraContext, Result, TestError};
use crate::identity::TestIdentity;
use crate::queue::{ControlKind, ControlMessage, JobMessage, MessageQueue, QueuePool};
use crate::scheduler::history::HistoricalTest;
use crate::scheduler::{Recurrence, ScheduledJob, ScheduledTest, TestLauncher, TestScheduler};
use crate::status::{self, write_status, TestStatus, TestStatusMessage, STATUS_SUFFIX};
use crate::storage::{prefix_exists, retention_tags, ObjectStore, ObjectSummary};
use crate::validator::{is_local_path, ConfigValidator, ValidatedConfig, ValidationRequest};

/// Version used when a submission names none.
pub const LATEST_VERSION: &str = "latest";
/// Version recorded for tests that run an uploaded binary.
pub const CUSTOM_BINARY_VERSION: &str = "custom";

/// Most objects a search will scan.
const SEARCH_SCAN_LIMIT: usize = 1000;
const DEFAULT_SEARCH_RESULTS: usize = 20;
const MAX_SEARCH_RESULTS: usize = 10_000;
/// Most objects read from one storage folder.
const FOLDER_LIST_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Active records whose last durable check is older than this are
    /// re-read on query.
    pub status_recheck: Duration,
    /// An active test is failed once both its end time and its last check
    /// are older than this.
    pub stall_threshold: Duration,
    pub stall_sweep_interval: std::time::Duration,
    pub binaries_prefix: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            status_recheck: Duration::seconds(60),
            stall_threshold: Duration::minutes(15),
            stall_sweep_interval: std::time::Duration::from_secs(300),
            binaries_prefix: "binaries/".to_string(),
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            status_recheck: Duration::seconds(config.cache.status_recheck_sec as i64),
            stall_sweep_interval: std::time::Duration::from_secs(config.cache.stall_sweep_sec.max(1)),
            binaries_prefix: config.storage.binaries_prefix.clone(),
            ..Self::default()
        }
    }
}

/// A prior test referenced by a submission.
struct PriorTest {
    identity: TestIdentity,
    manifest: SubmissionManifest,
    /// Additional files from the manifest that are still in the folder.
    /// The custom binary, if any, is tracked by the manifest alone.
    files: Vec<String>,
}

pub struct TestManager {
    cache: Arc<TestCache>,
    scheduler: Arc<TestScheduler>,
    store: Arc<dyn ObjectStore>,
    queues: QueuePool,
    validator: Arc<dyn ConfigValidator>,
    clock: Arc<dyn Clock>,
    settings: ManagerSettings,
}

impl TestManager {
    pub fn new(
        cache: Arc<TestCache>,
        scheduler: Arc<TestScheduler>,
        store: Arc<dyn ObjectStore>,
        queues: QueuePool,
        validator: Arc<dyn ConfigValidator>,
        clock: Arc<dyn Clock>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            cache,
            scheduler,
            store,
            queues,
            validator,
            clock,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<TestCache> {
        &self.cache
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Validate a submission, store its artifacts, and either schedule it or
    /// dispatch it right away.
    ///
    /// With `schedule_edit`, `prior_test_id` names a scheduled test whose id
    /// and storage folder are reused.
    pub async fn submit_test(
        &self,
        submission: TestSubmission,
        auth: &AuthContext,
        schedule_edit: bool,
    ) -> Result<TestRecord> {
        if !auth.can_write() {
            return Err(TestError::permission("read-only users may not submit tests"));
        }
        let now = self.clock.now();

        let prior = match submission.prior_test_id.as_deref() {
            Some(test_id) => Some(self.load_prior(test_id).await?),
            None => None,
        };

        let config = match (&submission.config_file, &prior) {
            (Some(file), _) => file.clone(),
            (None, Some(prior)) => self.download_prior_config(prior).await?,
            (None, None) => {
                return Err(TestError::validation(
                    "a config file is required, directly or through a prior testId",
                ))
            }
        };
        let queue_name = submission
            .queue_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| prior.as_ref().map(|p| p.manifest.queue_name.clone()))
            .ok_or_else(|| TestError::validation("queueName is required"))?;
        if !is_local_path(&config.name) {
            return Err(TestError::validation(format!("invalid config filename: {}", config.name)));
        }

        // Prior environment first, then the submission's own values on top.
        let mut environment = prior
            .as_ref()
            .map(|p| p.manifest.environment.clone())
            .unwrap_or_default();
        environment.extend(submission.environment.clone());

        let mut available: BTreeSet<String> = submission.additional_files.iter().map(|f| f.name.clone()).collect();
        let carried: Vec<String> = prior
            .as_ref()
            .map(|p| {
                p.files
                    .iter()
                    .filter(|name| !available.contains(*name) && **name != config.name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        available.extend(carried.iter().cloned());

        if !self.queues.contains(&queue_name) {
            return Err(TestError::validation(format!(
                "unknown queue {}; expected one of: {}",
                queue_name,
                self.queues.names().join(", ")
            )));
        }

        let binary_filename = match (&submission.binary, &prior) {
            (Some(binary), _) => Some(binary.name.clone()),
            (None, Some(prior)) if submission.version.is_none() => prior.manifest.binary_filename.clone(),
            _ => None,
        };
        let version = if binary_filename.is_some() {
            CUSTOM_BINARY_VERSION.to_string()
        } else {
            submission
                .version
                .clone()
                .or_else(|| prior.as_ref().map(|p| p.manifest.version.clone()))
                .unwrap_or_else(|| LATEST_VERSION.to_string())
        };
        if binary_filename.is_none() {
            self.check_version(&version).await?;
        }

        let schedule_date = self.parse_future("scheduleDate", submission.schedule_date.as_deref(), now)?;
        let end_date = self.parse_future("endDate", submission.end_date.as_deref(), now)?;
        let recurrence = match (submission.days_of_week.clone(), end_date) {
            (Some(days_of_week), Some(end_date)) => Some(Recurrence { days_of_week, end_date }),
            (None, None) => None,
            _ => {
                return Err(TestError::validation(
                    "daysOfWeek and endDate must be provided together",
                ))
            }
        };
        if recurrence.is_some() && schedule_date.is_none() {
            return Err(TestError::validation(
                "scheduleDate is required when daysOfWeek and endDate are given",
            ));
        }

        if binary_filename.is_some() && !auth.is_admin() {
            return Err(TestError::permission("only admins may run a custom binary"));
        }
        if submission.bypass_validator && !auth.is_admin() {
            return Err(TestError::permission("only admins may bypass the config validator"));
        }

        let env = env_values(&environment);
        let facts = self
            .validate_config(&config, &env, &version, submission.bypass_validator)
            .await?;
        check_requirements(&config.name, &facts, &available, &env)?;

        let identity = match (&prior, schedule_edit) {
            (Some(prior), true) => {
                if !auth.may_modify(prior.manifest.user_id.as_deref()) {
                    return Err(TestError::Conflict {
                        message: format!("only the submitter or an admin may edit {}", prior.identity),
                        forbidden: true,
                    });
                }
                prior.identity.clone()
            }
            (None, true) => {
                return Err(TestError::validation(
                    "a schedule edit must reference the scheduled testId",
                ))
            }
            (_, false) => TestIdentity::from_config_filename(&config.name, now)?,
        };

        // Artifacts
        let recurring = recurrence.is_some();
        let tags = retention_tags(recurring);
        let store = self.store.as_ref();
        let mut uploads: Vec<&UploadedFile> = vec![&config];
        uploads.extend(submission.additional_files.iter());
        uploads.extend(submission.binary.iter());
        for file in uploads {
            store
                .put_object(&identity.object_key(&file.name), file.body.clone(), &tags)
                .await
                .infra(format!("failed to upload {}", file.name))?;
        }
        let mut carried_all = carried.clone();
        if submission.binary.is_none() {
            carried_all.extend(binary_filename.iter().cloned());
        }
        if let Some(prior) = &prior {
            for name in &carried_all {
                let from = prior.identity.object_key(name);
                let to = identity.object_key(name);
                let result = if from == to {
                    store.put_tags(&to, &tags).await
                } else {
                    store.copy_object(&from, &to, &tags).await
                };
                result.infra(format!("failed to carry {} over from {}", name, prior.identity))?;
            }
        }

        let mut extra_files: Vec<String> = available.into_iter().collect();
        extra_files.extend(binary_filename.iter().cloned());

        let manifest = SubmissionManifest {
            config_filename: config.name.clone(),
            queue_name: queue_name.clone(),
            version: version.clone(),
            additional_files: extra_files.iter().filter(|f| Some(*f) != binary_filename.as_ref()).cloned().collect(),
            binary_filename: binary_filename.clone(),
            environment,
            restart_on_failure: submission.restart_on_failure,
            bypass_validator: submission.bypass_validator,
            user_id: auth.user_id.clone(),
            schedule_date,
            end_date: recurrence.as_ref().map(|r| r.end_date),
            days_of_week: recurrence.as_ref().map(|r| r.days_of_week.clone()),
        };
        write_manifest(store, &identity, &manifest, &tags)
            .await
            .infra("failed to write submission manifest")?;

        let job_message = JobMessage {
            test_id: identity.test_id(),
            storage_folder: identity.storage_folder(),
            config_filename: config.name.clone(),
            extra_files,
            estimated_runtime_minutes: facts.runtime_minutes,
            bucket_size_ms: facts.bucket_size_ms,
            binary_version: version,
            env_vars: env,
            restart_on_failure: submission.restart_on_failure,
            bypass_validator: submission.bypass_validator,
            submitting_user: auth.user_id.clone(),
        };

        match schedule_date {
            Some(schedule_date) => {
                let job = ScheduledJob {
                    queue_name,
                    job_message,
                    schedule_date,
                    recurrence,
                };
                let record = self.scheduler.add_test(job, auth).await?;
                self.cache_record(record.clone(), CacheTier::for_update(record.status));
                Ok(record)
            }
            None => {
                if schedule_edit {
                    match self.scheduler.remove_test(&identity.test_id(), auth, false).await {
                        Ok(()) | Err(TestError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                self.dispatch(&identity, &job_message, &queue_name).await
            }
        }
    }

    async fn load_prior(&self, test_id: &str) -> Result<PriorTest> {
        let identity = TestIdentity::parse(test_id)?;
        let manifest = read_manifest(self.store.as_ref(), &identity)
            .await
            .infra("failed to read prior submission")?
            .ok_or_else(|| TestError::not_found(format!("prior test {} not found", identity)))?;
        let present: BTreeSet<String> = self
            .list_folder(&identity)
            .await?
            .iter()
            .map(|o| o.filename().to_string())
            .collect();
        let files = manifest
            .additional_files
            .iter()
            .filter(|name| present.contains(*name))
            .cloned()
            .collect();
        Ok(PriorTest {
            identity,
            manifest,
            files,
        })
    }

    async fn download_prior_config(&self, prior: &PriorTest) -> Result<UploadedFile> {
        let name = &prior.manifest.config_filename;
        let object = self
            .store
            .get_object(&prior.identity.object_key(name))
            .await
            .infra("failed to download prior config")?
            .ok_or_else(|| TestError::not_found(format!("config {} of {} is missing", name, prior.identity)))?;
        Ok(UploadedFile::new(name.clone(), object.body))
    }

    async fn check_version(&self, version: &str) -> Result<()> {
        if version == LATEST_VERSION {
            return Ok(());
        }
        if !is_local_path(version) {
            return Err(TestError::validation(format!("invalid version: {}", version)));
        }
        let prefix = format!("{}{}/", self.settings.binaries_prefix, version);
        let exists = prefix_exists(self.store.as_ref(), &prefix)
            .await
            .infra("failed to look up binary version")?;
        if !exists {
            return Err(TestError::validation(format!("version {} does not exist", version)));
        }
        Ok(())
    }

    fn parse_future(&self, field: &str, raw: Option<&str>, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
            return Ok(None);
        };
        let instant = parse_instant(field, raw)?;
        if instant <= now {
            return Err(TestError::validation(format!("{} must be in the future", field)));
        }
        Ok(Some(instant))
    }

    async fn validate_config(
        &self,
        config: &UploadedFile,
        env: &BTreeMap<String, String>,
        version: &str,
        bypass: bool,
    ) -> Result<ValidatedConfig> {
        let text = String::from_utf8_lossy(&config.body);
        let request = ValidationRequest {
            config_filename: &config.name,
            config_text: &text,
            environment: env,
            binary_version: version,
            bypass,
        };
        self.validator.validate(request).await.map_err(TestError::Validation)
    }

    /// Write the Created status, send the job, and track it as Running.
    async fn dispatch(&self, identity: &TestIdentity, message: &JobMessage, queue_name: &str) -> Result<TestRecord> {
        let queue = self
            .queues
            .get(queue_name)
            .cloned()
            .ok_or_else(|| TestError::validation(format!("unknown queue {}", queue_name)))?;
        let now = self.clock.now();
        let runtime = Duration::minutes(message.estimated_runtime_minutes as i64);

        let mut status = TestStatusMessage::new(TestStatus::Created, now, now + runtime);
        status.user_id = message.submitting_user.clone();
        status.version = Some(message.binary_version.clone());
        let stamp = write_status(self.store.as_ref(), identity, &status, &retention_tags(false))
            .await
            .infra("failed to write initial status")?;

        queue
            .send_job(message)
            .await
            .infra(format!("failed to send {} to queue {}", identity, queue_name))?;

        let mut record = TestRecord::new(identity, TestStatus::Created);
        record.apply_status(&status);
        record.status_handle = Some(stamp);
        record.last_updated = Some(now);
        record.queue_name = Some(queue_name.to_string());
        self.cache_record(record.clone(), CacheTier::Running);
        info!(test_id = %identity, queue = queue_name, "test dispatched");
        Ok(record)
    }

    /// Store `record` in `tier`, updating the shared handle in place when the
    /// test is already cached.
    fn cache_record(&self, record: TestRecord, tier: CacheTier) -> SharedRecord {
        let test_id = record.test_id.clone();
        let candidate = record.into_shared();
        let (shared, inserted) = self.cache.get_or_insert_with(&test_id, tier, || candidate.clone());
        if !inserted {
            let fresh = candidate.read().clone();
            *shared.write() = fresh;
            self.cache.upsert(shared.clone(), tier);
        }
        shared
    }

    async fn list_folder(&self, identity: &TestIdentity) -> Result<Vec<ObjectSummary>> {
        let prefix = format!("{}/", identity.storage_folder());
        self.store
            .list_objects(&prefix, FOLDER_LIST_LIMIT)
            .await
            .infra("failed to list test files")
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Look a test up, hydrating it from durable status on a cache miss.
    pub async fn query_test(&self, test_id: &str) -> Result<TestRecord> {
        let identity = TestIdentity::parse(test_id)?;
        let now = self.clock.now();
        let shared = match self.cache.get(&identity.test_id()) {
            Some((shared, _)) => {
                let stale = {
                    let record = shared.read();
                    record.status.is_active()
                        && record
                            .last_checked
                            .map_or(true, |checked| now - checked >= self.settings.status_recheck)
                };
                if stale {
                    self.refresh(&identity, &shared, now).await?;
                }
                shared
            }
            None => self.hydrate(&identity, now).await?,
        };
        let mut record = shared.write();
        record.last_requested = Some(now);
        Ok(record.clone())
    }

    /// Status only. Durable storage is consulted only for records that were
    /// never checked.
    pub async fn query_test_status(&self, test_id: &str) -> Result<TestStatus> {
        let identity = TestIdentity::parse(test_id)?;
        let now = self.clock.now();
        let shared = match self.cache.get(&identity.test_id()) {
            Some((shared, _)) => {
                let never_checked = shared.read().last_checked.is_none();
                if never_checked {
                    self.refresh(&identity, &shared, now).await?;
                }
                shared
            }
            None => self.hydrate(&identity, now).await?,
        };
        let mut record = shared.write();
        record.last_requested = Some(now);
        Ok(record.status)
    }

    async fn hydrate(&self, identity: &TestIdentity, now: DateTime<Utc>) -> Result<SharedRecord> {
        let stored = status::read_status(self.store.as_ref(), identity)
            .await
            .infra("failed to read test status")?
            .ok_or_else(|| TestError::not_found(format!("test {} not found", identity)))?;

        let mut record = TestRecord::new(identity, TestStatus::Unknown);
        record.apply_status(&stored.message);
        record.status_handle = Some(stored.last_modified);
        record.last_checked = Some(now);
        let tier = CacheTier::for_query(record.status);

        // A concurrent query or update may have cached the test meanwhile;
        // its handle wins.
        let (shared, inserted) = self
            .cache
            .get_or_insert_with(&identity.test_id(), tier, || record.into_shared());
        if inserted {
            debug!(test_id = %identity, %tier, "hydrated test from storage");
        }
        Ok(shared)
    }

    /// Re-read the durable status and merge it if it changed since the last
    /// merge.
    async fn refresh(&self, identity: &TestIdentity, shared: &SharedRecord, now: DateTime<Utc>) -> Result<()> {
        let stored = status::read_status(self.store.as_ref(), identity)
            .await
            .infra("failed to read test status")?;
        let (previous, current) = {
            let mut record = shared.write();
            let previous = record.status;
            record.last_checked = Some(now);
            if let Some(stored) = stored {
                if record.status_handle != Some(stored.last_modified) {
                    record.status_handle = Some(stored.last_modified);
                    if record.accepts_polled(stored.message.status) {
                        record.apply_status(&stored.message);
                        record.last_updated = Some(now);
                    } else {
                        debug!(
                            test_id = %identity,
                            cached = %record.status,
                            stored = %stored.message.status,
                            "ignoring stale durable status"
                        );
                    }
                }
            }
            (previous, record.status)
        };
        if previous != current {
            self.cache.upsert(shared.clone(), CacheTier::for_update(current));
            if current.is_terminal() {
                let record = shared.read().clone();
                self.record_history(&record).await;
            }
        }
        Ok(())
    }

    /// Parameters of an earlier submission, from the live schedule entry if
    /// there is one and otherwise from the stored manifest.
    pub async fn query_previous_submission(&self, test_id: &str) -> Result<PreviousSubmission> {
        let identity = TestIdentity::parse(test_id)?;
        let scheduled = self.scheduler.get_scheduled(&identity.test_id()).await?;
        let manifest = read_manifest(self.store.as_ref(), &identity)
            .await
            .infra("failed to read submission manifest")?;
        previous_submission(&identity, scheduled.as_ref(), manifest.as_ref())
            .ok_or_else(|| TestError::not_found(format!("no submission found for {}", identity)))
    }

    pub fn running_tests(&self) -> Vec<TestRecord> {
        let mut records: Vec<TestRecord> = self
            .cache
            .records(CacheTier::Running)
            .iter()
            .map(|shared| shared.read().clone())
            .collect();
        records.sort_by(|a, b| a.test_id.cmp(&b.test_id));
        records
    }

    /// Up to `max_results` tests whose storage folder starts with `prefix`,
    /// most recent first.
    pub async fn search_tests(&self, prefix: &str, max_results: Option<usize>) -> Result<Vec<TestRecord>> {
        let limit = max_results.unwrap_or(DEFAULT_SEARCH_RESULTS).min(MAX_SEARCH_RESULTS);
        let objects = self
            .store
            .list_objects(prefix, SEARCH_SCAN_LIMIT)
            .await
            .infra("failed to search storage")?;

        let mut found: BTreeMap<String, TestIdentity> = BTreeMap::new();
        for object in &objects {
            let mut parts = object.key.splitn(3, '/');
            let (Some(base), Some(stamp), Some(_)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            if let Ok(identity) = TestIdentity::from_storage_folder(&format!("{}/{}", base, stamp)) {
                found.entry(identity.test_id()).or_insert(identity);
            }
        }
        let mut identities: Vec<TestIdentity> = found.into_values().collect();
        identities.sort_by(|a, b| {
            b.timestamp()
                .cmp(&a.timestamp())
                .then_with(|| a.base_name().cmp(b.base_name()))
        });
        identities.truncate(limit);

        let mut results = Vec::with_capacity(identities.len());
        for identity in identities {
            let (shared, _) = self.cache.get_or_insert_with(&identity.test_id(), CacheTier::Searched, || {
                let mut record = TestRecord::new(&identity, TestStatus::Unknown);
                record.start_time = Some(identity.timestamp());
                record.into_shared()
            });
            let record = shared.read().clone();
            results.push(record);
        }
        debug!(prefix, scanned = objects.len(), returned = results.len(), "search complete");
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Updates and control
    // -----------------------------------------------------------------------

    /// Merge an inbound status message into the cached record (creating it
    /// if unseen) and re-tier it.
    pub async fn update_running_test(
        &self,
        test_id: &str,
        update: &TestStatusMessage,
        kind: StatusMessageKind,
    ) -> Result<TestRecord> {
        let identity = TestIdentity::parse(test_id)?;
        let now = self.clock.now();
        let reported = kind
            .implied_status()
            .or((update.status != TestStatus::Unknown).then_some(update.status));
        let (shared, _) = self.cache.get_or_insert_with(
            &identity.test_id(),
            CacheTier::for_update(reported.unwrap_or(TestStatus::Unknown)),
            || TestRecord::new(&identity, TestStatus::Unknown).into_shared(),
        );
        let (previous, record) = {
            let mut record = shared.write();
            let previous = record.status;
            record.apply_status(update);
            record.status = reported.unwrap_or(previous);
            // The queue message is at least as fresh as the durable object,
            // so it counts as a check.
            record.last_updated = Some(now);
            record.last_checked = Some(now);
            (previous, record.clone())
        };
        self.cache.upsert(shared, CacheTier::for_update(record.status));
        if record.status.is_terminal() && previous != record.status {
            self.record_history(&record).await;
        }
        debug!(test_id = %identity, ?kind, status = %record.status, "status update merged");
        Ok(record)
    }

    async fn record_history(&self, record: &TestRecord) {
        let Ok(identity) = TestIdentity::parse(&record.test_id) else {
            return;
        };
        let start = record.start_time.unwrap_or_else(|| identity.timestamp());
        let entry = HistoricalTest {
            test_id: record.test_id.clone(),
            title: identity.base_name().to_string(),
            start,
            end: record.end_time.unwrap_or(start),
            status: record.status,
            owner: record.user_id.clone(),
        };
        if let Err(e) = self.scheduler.add_historical_test(entry).await {
            warn!(test_id = %record.test_id, error = %e, "failed to record historical test");
        }
    }

    /// Replace the config of a test in place and tell its worker.
    pub async fn replace_config(&self, test_id: &str, new_config: UploadedFile, auth: &AuthContext) -> Result<()> {
        let identity = TestIdentity::parse(test_id)?;
        let manifest = read_manifest(self.store.as_ref(), &identity)
            .await
            .infra("failed to read submission manifest")?
            .ok_or_else(|| TestError::not_found(format!("test {} not found", identity)))?;
        if !auth.may_modify(manifest.user_id.as_deref()) {
            return Err(TestError::permission(format!(
                "only the submitter or an admin may change the config of {}",
                identity
            )));
        }
        if new_config.name != manifest.config_filename {
            return Err(TestError::validation(format!(
                "replacement config must keep the name {}",
                manifest.config_filename
            )));
        }

        let env = manifest.env_values();
        let facts = self
            .validate_config(&new_config, &env, &manifest.version, manifest.bypass_validator)
            .await?;
        let present: BTreeSet<String> = self
            .list_folder(&identity)
            .await?
            .iter()
            .map(|o| o.filename().to_string())
            .collect();
        check_requirements(&new_config.name, &facts, &present, &env)?;

        self.store
            .put_object(
                &identity.object_key(&new_config.name),
                new_config.body.clone(),
                &retention_tags(manifest.is_recurring()),
            )
            .await
            .infra("failed to upload replacement config")?;

        let message = ControlMessage {
            test_id: identity.test_id(),
            kind: ControlKind::UpdateConfig,
            config_filename: Some(new_config.name),
        };
        self.send_control(&message, Some(&manifest.queue_name)).await?;
        info!(test_id = %identity, "config replaced");
        Ok(())
    }

    /// Ask the worker running a test to stop, or kill it outright.
    pub async fn cancel_test(&self, test_id: &str, auth: &AuthContext, force_kill: bool) -> Result<()> {
        let identity = TestIdentity::parse(test_id)?;
        let folder = format!("{}/", identity.storage_folder());
        let exists = prefix_exists(self.store.as_ref(), &folder)
            .await
            .infra("failed to look up test folder")?;
        if !exists {
            return Err(TestError::not_found(format!("test {} not found", identity)));
        }

        let stored = status::read_status(self.store.as_ref(), &identity)
            .await
            .infra("failed to read test status")?;
        let owner = stored.as_ref().and_then(|s| s.message.user_id.clone());
        if !auth.may_modify(owner.as_deref()) {
            return Err(TestError::permission(format!(
                "only the submitter or an admin may cancel {}",
                identity
            )));
        }

        let queue_name = self
            .cache
            .get(&identity.test_id())
            .and_then(|(shared, _)| shared.read().queue_name.clone());
        let message = ControlMessage {
            test_id: identity.test_id(),
            kind: if force_kill { ControlKind::Kill } else { ControlKind::Stop },
            config_filename: None,
        };
        self.send_control(&message, queue_name.as_deref()).await?;
        info!(test_id = %identity, force_kill, "cancel requested");
        Ok(())
    }

    async fn send_control(&self, message: &ControlMessage, queue_name: Option<&str>) -> Result<()> {
        let queue: Arc<dyn MessageQueue> = self
            .queues
            .control()
            .or_else(|| queue_name.and_then(|name| self.queues.get(name)))
            .cloned()
            .ok_or_else(|| {
                TestError::infra(
                    "no queue available for control messages",
                    anyhow::anyhow!("queue pool has no control queue"),
                )
            })?;
        queue
            .send_control(message)
            .await
            .infra(format!("failed to send {:?} for {}", message.kind, message.test_id))
    }

    // -----------------------------------------------------------------------
    // Stall sweep
    // -----------------------------------------------------------------------

    /// Fail active tests whose end time and last check are both older than
    /// the stall threshold. Returns how many were failed.
    pub async fn sweep_stalled(&self, now: DateTime<Utc>) -> usize {
        let threshold = now - self.settings.stall_threshold;
        let mut failed = 0;
        for shared in self.cache.records(CacheTier::Running) {
            let (test_id, stalled) = {
                let record = shared.read();
                (record.test_id.clone(), is_stalled(&record, threshold))
            };
            if !stalled {
                continue;
            }
            let Ok(identity) = TestIdentity::parse(&test_id) else {
                continue;
            };
            // Workers may have written a status we have not merged yet.
            if let Err(e) = self.refresh(&identity, &shared, now).await {
                warn!(test_id = %test_id, error = %e, "stall check could not read status");
                continue;
            }
            let still_stalled = {
                let record = shared.read();
                record.status.is_active() && record.end_time.is_some_and(|end| end < threshold)
            };
            if !still_stalled {
                continue;
            }
            match self.fail_stalled(&identity, &shared, now).await {
                Ok(()) => failed += 1,
                Err(e) => warn!(test_id = %test_id, error = %e, "failed to mark stalled test"),
            }
        }
        if failed > 0 {
            info!(failed, "stall sweep failed tests");
        }
        failed
    }

    async fn fail_stalled(&self, identity: &TestIdentity, shared: &SharedRecord, now: DateTime<Utc>) -> anyhow::Result<()> {
        let message = {
            let mut record = shared.write();
            record.status = TestStatus::Failed;
            let note = format!("no status update since {}; marked failed", record.end_time.unwrap_or(now).to_rfc3339());
            record.errors.push(note);
            record.to_status_message()
        };
        let stamp = write_status(self.store.as_ref(), identity, &message, &retention_tags(false)).await?;
        let record = {
            let mut record = shared.write();
            record.status_handle = Some(stamp);
            record.last_updated = Some(now);
            record.clone()
        };
        self.cache.upsert(shared.clone(), CacheTier::Recent);
        self.record_history(&record).await;
        warn!(test_id = %identity, "stalled test marked failed");
        Ok(())
    }

    /// Copy a scheduled test's artifacts into a fresh folder for one run.
    async fn copy_artifacts(&self, from: &TestIdentity, to: &TestIdentity) -> Result<()> {
        let tags = retention_tags(false);
        for object in self.list_folder(from).await? {
            let name = object.filename();
            if name.ends_with(STATUS_SUFFIX) {
                continue;
            }
            self.store
                .copy_object(&object.key, &to.object_key(name), &tags)
                .await
                .infra(format!("failed to copy {} for {}", name, to))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TestLauncher for TestManager {
    async fn launch_scheduled(&self, entry: &ScheduledTest, fresh: Option<&TestIdentity>) -> Result<TestRecord> {
        let original = TestIdentity::parse(&entry.test_id)?;
        let mut message = entry.job.job_message.clone();
        let identity = match fresh {
            Some(clone) => {
                self.copy_artifacts(&original, clone).await?;
                message.test_id = clone.test_id();
                message.storage_folder = clone.storage_folder();
                clone.clone()
            }
            None => original,
        };
        self.dispatch(&identity, &message, &entry.job.queue_name).await
    }
}

fn is_stalled(record: &TestRecord, threshold: DateTime<Utc>) -> bool {
    record.status.is_active()
        && record.end_time.is_some_and(|end| end < threshold)
        && record.last_checked.map_or(true, |checked| checked < threshold)
}

/// Required files must be local and present; required variables must be set.
fn check_requirements(
    config_name: &str,
    facts: &ValidatedConfig,
    available: &BTreeSet<String>,
    env: &BTreeMap<String, String>,
) -> Result<()> {
    let outside: Vec<&str> = facts
        .required_files
        .iter()
        .filter(|f| !is_local_path(f))
        .map(String::as_str)
        .collect();
    if !outside.is_empty() {
        return Err(TestError::validation(format!(
            "{} references files outside its directory: {}",
            config_name,
            outside.join(", ")
        )));
    }
    let missing_files: Vec<&str> = facts
        .required_files
        .iter()
        .filter(|f| !available.contains(*f))
        .map(String::as_str)
        .collect();
    if !missing_files.is_empty() {
        return Err(TestError::validation(format!(
            "missing required files: {}",
            missing_files.join(", ")
        )));
    }
    let missing_vars: Vec<&str> = facts
        .required_env_vars
        .iter()
        .filter(|v| !env.contains_key(*v))
        .map(String::as_str)
        .collect();
    if !missing_vars.is_empty() {
        return Err(TestError::validation(format!(
            "missing environment variables: {}",
            missing_vars.join(", ")
        )));
    }
    Ok(())
}

fn previous_submission(
    identity: &TestIdentity,
    scheduled: Option<&ScheduledTest>,
    manifest: Option<&SubmissionManifest>,
) -> Option<PreviousSubmission> {
    let mut previous = match manifest {
        Some(m) => PreviousSubmission {
            test_id: identity.test_id(),
            config_filename: m.config_filename.clone(),
            queue_name: m.queue_name.clone(),
            version: m.version.clone(),
            additional_files: m.additional_files.clone(),
            variables: m.visible_variables(),
            restart_on_failure: m.restart_on_failure,
            schedule_date: m.schedule_date,
            end_date: m.end_date,
            days_of_week: m.days_of_week.clone(),
        },
        None => {
            let entry = scheduled?;
            PreviousSubmission {
                test_id: identity.test_id(),
                config_filename: entry.job.job_message.config_filename.clone(),
                queue_name: String::new(),
                version: String::new(),
                additional_files: Vec::new(),
                // Hidden flags live only in the manifest.
                variables: Vec::new(),
                restart_on_failure: entry.job.job_message.restart_on_failure,
                schedule_date: None,
                end_date: None,
                days_of_week: None,
            }
        }
    };
    if let Some(entry) = scheduled {
        let job = &entry.job;
        previous.config_filename = job.job_message.config_filename.clone();
        previous.queue_name = job.queue_name.clone();
        previous.version = job.job_message.binary_version.clone();
        previous.additional_files = job.job_message.extra_files.clone();
        previous.schedule_date = Some(entry.next_run);
        previous.end_date = job.recurrence.as_ref().map(|r| r.end_date);
        previous.days_of_week = job.recurrence.as_ref().map(|r| r.days_of_week.clone());
    }
    Some(previous)
}

/// Run the stall sweep until `shutdown` fires.
pub async fn run_stall_sweep_loop(manager: Arc<TestManager>, clock: Arc<dyn Clock>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(manager.settings.stall_sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                manager.sweep_stalled(clock.now()).await;
            }
        }
    }
}
