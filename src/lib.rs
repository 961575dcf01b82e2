//! loadcontrol -- controller for distributed load-test jobs.
//!
//! Accepts test submissions, dispatches them to named worker queues, tracks
//! each test through a tiered in-memory cache backed by object storage, and
//! runs a recurrence-aware scheduler for deferred and repeating tests.

pub mod api;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod manager;
pub mod queue;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod validator;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::{CacheLimits, TestCache};
use crate::clock::{Clock, SystemClock};
use crate::config::ControllerConfig;
use crate::manager::{run_stall_sweep_loop, ManagerSettings, TestManager};
use crate::queue::{InMemoryQueue, QueuePool};
use crate::scheduler::{
    run_historical_prune_loop, run_scheduler_loop, SchedulerSettings, TestLauncher, TestScheduler,
};
use crate::storage::{ObjectStore, SqliteObjectStore};
use crate::validator::{ConfigValidator, StaticValidator};

/// The controller's shared state. Built once at startup and handed to
/// request handlers by `Arc`.
pub struct Controller {
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    cache: Arc<TestCache>,
    scheduler: Arc<TestScheduler>,
    manager: Arc<TestManager>,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn ObjectStore>,
        queues: QueuePool,
        validator: Arc<dyn ConfigValidator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cache = Arc::new(TestCache::new(CacheLimits::from(&config.cache)));
        let scheduler = Arc::new(TestScheduler::new(
            store.clone(),
            clock.clone(),
            SchedulerSettings::from_config(&config)?,
        ));
        let manager = Arc::new(TestManager::new(
            cache.clone(),
            scheduler.clone(),
            store,
            queues,
            validator,
            clock.clone(),
            ManagerSettings::from_config(&config),
        ));
        Ok(Self {
            config,
            clock,
            cache,
            scheduler,
            manager,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TestCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<TestScheduler> {
        &self.scheduler
    }

    pub fn manager(&self) -> &Arc<TestManager> {
        &self.manager
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the scheduler loop, the daily historical prune, and the stall
    /// sweep. All of them stop when [`Controller::shutdown`] is called.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        if self.config.scheduler.enabled {
            if self.config.scheduler.backfill_on_start {
                let scheduler = self.scheduler.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = scheduler.backfill_historical().await {
                        error!(error = %e, "historical backfill failed");
                    }
                }));
            }
            let launcher: Arc<dyn TestLauncher> = self.manager.clone();
            tasks.push(tokio::spawn(run_scheduler_loop(
                self.scheduler.clone(),
                launcher,
                self.clock.clone(),
                self.shutdown.clone(),
            )));
            tasks.push(tokio::spawn(run_historical_prune_loop(
                self.scheduler.clone(),
                self.clock.clone(),
                self.shutdown.clone(),
            )));
        } else {
            info!("scheduler disabled in configuration");
        }

        tasks.push(tokio::spawn(run_stall_sweep_loop(
            self.manager.clone(),
            self.clock.clone(),
            self.shutdown.clone(),
        )));
        tasks
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Build a single-node controller: SQLite object store, an in-process queue
/// for every configured name, and the pass-through validator.
pub fn standalone(config: ControllerConfig) -> Result<Controller> {
    let db_path = config.storage.database_path.clone();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    info!(db_path = %db_path.display(), "Initializing object store");
    let store: Arc<dyn ObjectStore> = Arc::new(SqliteObjectStore::open(&db_path.to_string_lossy())?);

    let mut queues = QueuePool::new();
    for name in &config.queues.names {
        queues = queues.with_queue(
            name.clone(),
            Arc::new(InMemoryQueue::bounded(config.queues.in_memory_capacity)),
        );
    }
    // No external validator is wired in: every config is accepted with a
    // one-hour runtime and one-second buckets.
    let validator: Arc<dyn ConfigValidator> = Arc::new(StaticValidator::new(60, 1000));
    Controller::new(config, store, queues, validator, Arc::new(SystemClock))
}

/// Run the controller: background tasks plus the HTTP API, until Ctrl-C.
pub async fn serve(config: ControllerConfig) -> Result<()> {
    let controller = Arc::new(standalone(config)?);
    warn!(
        queues = ?controller.config().queues.names,
        capacity = controller.config().queues.in_memory_capacity,
        "no message broker configured; jobs stay in bounded in-process queues and no worker will receive them"
    );
    let tasks = controller.start();

    let addr: std::net::SocketAddr = controller
        .config()
        .server
        .bind
        .parse()
        .context("invalid server.bind address")?;
    let app = api::router(api::state::AppState::new(controller.clone()));

    info!(%addr, "loadcontrol listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let token = controller.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
                _ = token.cancelled() => {}
            }
        })
        .await?;

    controller.shutdown();
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "background task ended abnormally");
        }
    }
    Ok(())
}
