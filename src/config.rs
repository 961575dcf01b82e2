//! TOML configuration for the load-test controller.
//!
//! Layered: compiled-in defaults, overridden section by section by a TOML
//! file found through `LOADCONTROL_CONFIG` or the standard system location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "LOADCONTROL_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the controller process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ControllerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded controller configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `LOADCONTROL_CONFIG` environment variable.
    /// 2. `/etc/loadcontrol/loadcontrol.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LOADCONTROL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/loadcontrol/loadcontrol.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API binds to.
    pub bind: String,
    /// Base URL used for calendar event links.
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            public_url: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file backing the object store.
    pub database_path: PathBuf,
    /// Key of the persisted pending-schedule blob.
    pub schedule_key: String,
    /// Key of the persisted historical-calendar blob.
    pub historical_key: String,
    /// Prefix under which binary versions are stored.
    pub binaries_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/loadcontrol.db"),
            schedule_key: "settings/schedule.json".to_string(),
            historical_key: "settings/historical.json".to_string(),
            binaries_prefix: "binaries/".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Names of the queues jobs may be dispatched to.
    pub names: Vec<String>,
    /// Messages each in-process queue keeps before dropping the oldest.
    /// Only used when no broker is wired in.
    pub in_memory_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            names: vec!["default".to_string()],
            in_memory_capacity: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_recent: usize,
    pub max_requested: usize,
    pub max_searched: usize,
    /// Minimum age of the last durable check before an active record is
    /// re-read on query.
    pub status_recheck_sec: u64,
    /// How often the stall sweep runs.
    pub stall_sweep_sec: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_recent: 10,
            max_requested: 10,
            max_searched: 1000,
            status_recheck_sec: 60,
            stall_sweep_sec: 300,
        }
    }
}

impl CacheConfig {
    pub fn status_recheck(&self) -> Duration {
        Duration::from_secs(self.status_recheck_sec)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether this process runs the scheduler loop at all.
    pub enabled: bool,
    /// Upper bound on the loop's sleep between iterations.
    pub poll_interval_sec: u64,
    /// IANA timezone used for weekday recurrence.
    pub timezone: String,
    /// Historical calendar entries older than this are pruned daily.
    pub historical_retention_days: i64,
    /// Scan storage for finished tests on startup.
    pub backfill_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_sec: 60,
            timezone: "UTC".to_string(),
            historical_retention_days: 365,
            backfill_on_start: false,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec.max(1))
    }

    /// Parse the configured timezone.
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("invalid scheduler timezone '{}': {}", self.timezone, e))
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.cache.max_recent, 10);
        assert_eq!(cfg.cache.max_requested, 10);
        assert_eq!(cfg.cache.max_searched, 1000);
        assert_eq!(cfg.scheduler.poll_interval(), Duration::from_secs(60));
        assert_eq!(cfg.scheduler.historical_retention_days, 365);
        assert_eq!(cfg.scheduler.tz().unwrap(), chrono_tz::UTC);
        assert_eq!(cfg.queues.names, vec!["default".to_string()]);
        assert_eq!(cfg.queues.in_memory_capacity, 1000);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:9000"
public_url = "https://loadtests.example.com"

[queues]
names = ["east", "west"]

[cache]
max_recent = 5
max_searched = 50

[scheduler]
poll_interval_sec = 15
timezone = "America/Denver"
historical_retention_days = 90

[logging]
level = "debug"
json = true
"#;

        let cfg: ControllerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.queues.names, vec!["east".to_string(), "west".to_string()]);
        assert_eq!(cfg.cache.max_recent, 5);
        assert_eq!(cfg.cache.max_requested, 10);
        assert_eq!(cfg.cache.max_searched, 50);
        assert_eq!(cfg.scheduler.poll_interval(), Duration::from_secs(15));
        assert_eq!(cfg.scheduler.tz().unwrap(), chrono_tz::America::Denver);
        assert_eq!(cfg.scheduler.historical_retention_days, 90);
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_invalid_timezone_errors() {
        let cfg = SchedulerConfig {
            timezone: "Mars/Olympus".to_string(),
            ..SchedulerConfig::default()
        };
        assert!(cfg.tz().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("loadcontrol.toml");
        std::fs::write(
            &path,
            r#"
[storage]
database_path = "/tmp/objects.db"
"#,
        )
        .unwrap();

        let cfg = ControllerConfig::load(&path).unwrap();
        assert_eq!(cfg.storage.database_path, PathBuf::from("/tmp/objects.db"));
        assert_eq!(cfg.storage.schedule_key, "settings/schedule.json");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = ControllerConfig::load(Path::new("/nonexistent/path/loadcontrol.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = ControllerConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let roundtripped: ControllerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg.cache, roundtripped.cache);
        assert_eq!(cfg.scheduler.timezone, roundtripped.scheduler.timezone);
    }
}
