//! The scheduler loop and the daily historical prune.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::recurrence::{add_days, next_occurrence};
use super::{ScheduledTest, TestLauncher, TestScheduler};
use crate::clock::Clock;
use crate::identity::TestIdentity;

const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// What one due entry turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LaunchOutcome {
    /// A recurring entry launched a clone and moved to its next occurrence.
    Advanced { launched: String },
    /// The entry ran for the last time and was removed.
    Completed { launched: String },
    /// Launch failed; the entry is untouched and will be retried.
    Failed,
}

impl TestScheduler {
    /// Run one loop iteration at `now` and return how long to sleep before
    /// the next one.
    pub async fn tick(&self, launcher: &dyn TestLauncher, now: DateTime<Utc>) -> Duration {
        let due = match self.due_entries(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to load schedule, will retry");
                return self.settings.poll_interval;
            }
        };

        // Clones launched in the same tick need distinct timestamps.
        let mut stamp = now;
        let mut launched = Vec::new();
        for entry in due {
            match self.launch_due(launcher, &entry, stamp).await {
                LaunchOutcome::Advanced { launched: id } => {
                    stamp += chrono::Duration::milliseconds(1);
                    launched.push(id);
                }
                LaunchOutcome::Completed { launched: id } => launched.push(id),
                LaunchOutcome::Failed => {}
            }
        }
        if !launched.is_empty() {
            debug!(count = launched.len(), tests = ?launched, "scheduler tick launched tests");
        }

        self.next_sleep(now).await
    }

    async fn due_entries(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledTest>> {
        let mut pending = self.pending.lock().await;
        let entries = pending.loaded(self.store.as_ref()).await?;
        Ok(entries.values().filter(|e| e.next_run <= now).cloned().collect())
    }

    /// The first occurrence after both the entry's current run and `now`, if
    /// it recurs and one remains before its end date. Days missed while the
    /// loop was down are skipped, not replayed.
    fn following_occurrence(&self, entry: &ScheduledTest, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let recurrence = entry.job.recurrence.as_ref()?;
        let tz = self.settings.timezone;
        let end = recurrence.end_date.with_timezone(&tz);
        let mut from = add_days(&entry.next_run.with_timezone(&tz), 1)?;
        while from.with_timezone(&Utc) <= now {
            if from > end {
                return None;
            }
            from = add_days(&from, 1)?;
        }
        next_occurrence(&from, &end, &recurrence.days_of_week).map(|t| t.with_timezone(&Utc))
    }

    async fn launch_due(
        &self,
        launcher: &dyn TestLauncher,
        entry: &ScheduledTest,
        now: DateTime<Utc>,
    ) -> LaunchOutcome {
        let test_id = entry.test_id.as_str();

        if let Some(following) = self.following_occurrence(entry, now) {
            let fresh = match TestIdentity::parse(test_id) {
                Ok(identity) => identity.with_timestamp(now),
                Err(e) => {
                    error!(test_id, error = %e, "scheduled entry has an invalid testId");
                    return LaunchOutcome::Failed;
                }
            };
            if let Err(e) = launcher.launch_scheduled(entry, Some(&fresh)).await {
                error!(test_id, error = %e, "failed to launch recurring test, will retry");
                return LaunchOutcome::Failed;
            }
            info!(test_id, launched = %fresh, next_run = %following.to_rfc3339(), "launched recurring test");
            if let Err(e) = self.advance(test_id, following).await {
                error!(test_id, error = %e, "failed to advance recurring schedule");
            }
            return LaunchOutcome::Advanced {
                launched: fresh.test_id(),
            };
        }

        if let Err(e) = launcher.launch_scheduled(entry, None).await {
            error!(test_id, error = %e, "failed to launch scheduled test, will retry");
            return LaunchOutcome::Failed;
        }
        info!(test_id, "launched scheduled test");

        if entry.is_recurring() {
            match TestIdentity::parse(test_id) {
                Ok(identity) => {
                    if let Err(e) = self.relabel_folder(&identity, false).await {
                        warn!(test_id, error = %e, "failed to relabel final recurring run");
                    }
                }
                Err(e) => warn!(test_id, error = %e, "cannot relabel files for invalid testId"),
            }
        }
        if let Err(e) = self.complete(test_id).await {
            error!(test_id, error = %e, "failed to remove completed schedule entry");
        }
        LaunchOutcome::Completed {
            launched: test_id.to_string(),
        }
    }

    async fn advance(&self, test_id: &str, next_run: DateTime<Utc>) -> anyhow::Result<()> {
        let mut pending = self.pending.lock().await;
        let entries = pending.loaded(self.store.as_ref()).await?;
        let Some(entry) = entries.get_mut(test_id) else {
            warn!(test_id, "schedule entry removed while launching");
            return Ok(());
        };
        entry.next_run = next_run;
        entry.job.schedule_date = next_run;
        if entry.event.start_recur.is_some() {
            entry.event.start_recur = Some(next_run);
        }
        pending.persist(self.store.as_ref()).await?;
        Ok(())
    }

    async fn complete(&self, test_id: &str) -> anyhow::Result<()> {
        let mut pending = self.pending.lock().await;
        let entries = pending.loaded(self.store.as_ref()).await?;
        if entries.remove(test_id).is_some() {
            pending.persist(self.store.as_ref()).await?;
        }
        Ok(())
    }

    /// Sleep until the earliest future entry, capped at the poll interval.
    /// Entries still due (their launch failed) wait a full interval.
    async fn next_sleep(&self, now: DateTime<Utc>) -> Duration {
        let poll = self.settings.poll_interval;
        let mut pending = self.pending.lock().await;
        let Ok(entries) = pending.loaded(self.store.as_ref()).await else {
            return poll;
        };
        entries
            .values()
            .map(|e| e.next_run)
            .filter(|t| *t > now)
            .min()
            .and_then(|t| (t - now).to_std().ok())
            .map_or(poll, |until| until.min(poll))
    }
}

/// Drive the scheduler until `shutdown` fires.
pub async fn run_scheduler_loop(
    scheduler: Arc<TestScheduler>,
    launcher: Arc<dyn TestLauncher>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) {
    info!("Scheduler engine started");
    loop {
        let sleep = scheduler.tick(launcher.as_ref(), clock.now()).await;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(sleep) => {}
        }
    }
    info!("Scheduler engine stopped");
}

/// Prune the historical calendar once a day until `shutdown` fires.
pub async fn run_historical_prune_loop(
    scheduler: Arc<TestScheduler>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = scheduler.prune_historical(clock.now()).await {
                    error!(error = %e, "historical prune failed");
                }
            }
        }
    }
}
