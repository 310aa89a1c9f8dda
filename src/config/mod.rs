//! Layered configuration: built-in defaults ← optional config file ←
//! environment variables.
//!
//! The config file is line-oriented `KEY=value` with optional double quotes
//! and `#` comments. Environment variables use the same keys and override the
//! file when set to a non-empty value. The loaded snapshot is immutable;
//! `ConfigHandle::reload` builds a fresh snapshot and swaps it atomically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Environment variable naming the config file location.
pub const CONFIG_PATH_VAR: &str = "FALLPAPER_CONFIG";

/// Default config file path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "fallpaper.conf";

/// Prefix shared by all config keys.
const KEY_PREFIX: &str = "FALLPAPER_";

/// Database settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file path.
    pub path: String,
    /// Log every SQL statement at DEBUG.
    pub query_logging: bool,
    /// Wrap repository operations in named `db.query` spans.
    pub tracing: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "fallpaper.db".to_string(),
            query_logging: false,
            tracing: false,
        }
    }
}

/// Run scheduler / processor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cron expression driving run-processor ticks (6-field cron syntax).
    pub poll_cron: String,
    /// A RUNNING run older than this is considered orphaned (milliseconds).
    pub stale_run_timeout_ms: i64,
    /// Maximum pending runs claimed per tick.
    pub max_runs_per_poll: u32,
    /// Retry backoff base: the first retry waits this long, each further
    /// retry doubles it.
    pub retry_backoff_base_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_cron: "0 * * * * *".to_string(),
            stale_run_timeout_ms: 30 * 60 * 1000,
            max_runs_per_poll: 5,
            retry_backoff_base_ms: 30_000,
        }
    }
}

/// Source runner / downloader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Root directory for per-device image directories.
    pub image_dir: String,
    /// Staging directory for in-progress downloads.
    pub temp_dir: String,
    /// Maximum concurrent downloads per active run.
    pub max_concurrent_downloads: usize,
    /// Throughput floor; sustained transfers below it are aborted.
    pub min_speed_bytes_per_sec: u64,
    /// How long a transfer may stay below the floor before abort (milliseconds).
    pub slow_speed_timeout_ms: u64,
    /// Interval between throughput samples (milliseconds).
    pub speed_check_interval_ms: u64,
    /// Overall per-request deadline (milliseconds).
    pub request_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            image_dir: "images".to_string(),
            temp_dir: "tmp".to_string(),
            max_concurrent_downloads: 4,
            min_speed_bytes_per_sec: 10 * 1024,
            slow_speed_timeout_ms: 30_000,
            speed_check_interval_ms: 1_000,
            request_timeout_ms: 120_000,
        }
    }
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub runner: RunnerConfig,
}

impl AppConfig {
    /// Load a snapshot from defaults, the config file (if present) and the
    /// process environment, then validate it.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load a snapshot using an explicit config file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut values = HashMap::new();

        match std::fs::read_to_string(path) {
            Ok(contents) => {
                debug!(path = %path.display(), "Loading config file");
                parse_config_file(&contents, &mut values)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file; using defaults");
            }
            Err(e) => return Err(Error::io_path("reading config file", path, e)),
        }

        // Environment overrides the file when set to a non-empty value.
        for (key, value) in std::env::vars() {
            if key.starts_with(KEY_PREFIX) && key != CONFIG_PATH_VAR && !value.is_empty() {
                values.insert(key, value);
            }
        }

        let config = Self::from_values(&values)?;
        config.validate()?;
        Ok(config)
    }

    fn from_values(values: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = values.get("FALLPAPER_DATABASE_PATH") {
            config.database.path = v.clone();
        }
        if let Some(v) = values.get("FALLPAPER_DATABASE_QUERY_LOGGING") {
            config.database.query_logging = parse_bool("FALLPAPER_DATABASE_QUERY_LOGGING", v)?;
        }
        if let Some(v) = values.get("FALLPAPER_DATABASE_TRACING") {
            config.database.tracing = parse_bool("FALLPAPER_DATABASE_TRACING", v)?;
        }

        if let Some(v) = values.get("FALLPAPER_SCHEDULER_POLL_CRON") {
            config.scheduler.poll_cron = v.clone();
        }
        if let Some(v) = values.get("FALLPAPER_SCHEDULER_STALE_RUN_TIMEOUT_MS") {
            config.scheduler.stale_run_timeout_ms =
                parse_int("FALLPAPER_SCHEDULER_STALE_RUN_TIMEOUT_MS", v)?;
        }
        if let Some(v) = values.get("FALLPAPER_SCHEDULER_MAX_RUNS_PER_POLL") {
            config.scheduler.max_runs_per_poll =
                parse_int("FALLPAPER_SCHEDULER_MAX_RUNS_PER_POLL", v)?;
        }
        if let Some(v) = values.get("FALLPAPER_SCHEDULER_RETRY_BACKOFF_BASE_MS") {
            config.scheduler.retry_backoff_base_ms =
                parse_int("FALLPAPER_SCHEDULER_RETRY_BACKOFF_BASE_MS", v)?;
        }

        if let Some(v) = values.get("FALLPAPER_RUNNER_IMAGE_DIR") {
            config.runner.image_dir = v.clone();
        }
        if let Some(v) = values.get("FALLPAPER_RUNNER_TEMP_DIR") {
            config.runner.temp_dir = v.clone();
        }
        if let Some(v) = values.get("FALLPAPER_RUNNER_MAX_CONCURRENT_DOWNLOADS") {
            config.runner.max_concurrent_downloads =
                parse_int("FALLPAPER_RUNNER_MAX_CONCURRENT_DOWNLOADS", v)?;
        }
        if let Some(v) = values.get("FALLPAPER_RUNNER_MIN_SPEED_BYTES_PER_SEC") {
            config.runner.min_speed_bytes_per_sec =
                parse_int("FALLPAPER_RUNNER_MIN_SPEED_BYTES_PER_SEC", v)?;
        }
        if let Some(v) = values.get("FALLPAPER_RUNNER_SLOW_SPEED_TIMEOUT_MS") {
            config.runner.slow_speed_timeout_ms =
                parse_int("FALLPAPER_RUNNER_SLOW_SPEED_TIMEOUT_MS", v)?;
        }
        if let Some(v) = values.get("FALLPAPER_RUNNER_SPEED_CHECK_INTERVAL_MS") {
            config.runner.speed_check_interval_ms =
                parse_int("FALLPAPER_RUNNER_SPEED_CHECK_INTERVAL_MS", v)?;
        }
        if let Some(v) = values.get("FALLPAPER_RUNNER_REQUEST_TIMEOUT_MS") {
            config.runner.request_timeout_ms =
                parse_int("FALLPAPER_RUNNER_REQUEST_TIMEOUT_MS", v)?;
        }

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        cron::Schedule::from_str(&self.scheduler.poll_cron).map_err(|e| {
            Error::config(format!(
                "invalid scheduler poll cron '{}': {}",
                self.scheduler.poll_cron, e
            ))
        })?;

        if self.scheduler.stale_run_timeout_ms <= 0 {
            return Err(Error::config("stale run timeout must be positive"));
        }
        if self.scheduler.max_runs_per_poll == 0 {
            return Err(Error::config("max runs per poll must be positive"));
        }
        if self.scheduler.retry_backoff_base_ms <= 0 {
            return Err(Error::config("retry backoff base must be positive"));
        }
        if self.runner.max_concurrent_downloads == 0 {
            return Err(Error::config("max concurrent downloads must be positive"));
        }
        if self.runner.speed_check_interval_ms == 0 {
            return Err(Error::config("speed check interval must be positive"));
        }
        Ok(())
    }

    /// Root image directory as a path.
    pub fn image_dir(&self) -> PathBuf {
        PathBuf::from(&self.runner.image_dir)
    }

    /// Staging directory as a path.
    pub fn temp_dir(&self) -> PathBuf {
        PathBuf::from(&self.runner.temp_dir)
    }
}

/// Process-wide configuration handle: shared readers, single writer on reload.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<AppConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current immutable snapshot.
    pub fn current(&self) -> Arc<AppConfig> {
        self.inner.read().clone()
    }

    /// Re-load from file + environment and swap the snapshot in.
    pub fn reload(&self) -> Result<Arc<AppConfig>> {
        let fresh = Arc::new(AppConfig::load()?);
        *self.inner.write() = fresh.clone();
        info!("Configuration reloaded");
        Ok(fresh)
    }
}

fn parse_config_file(contents: &str, values: &mut HashMap<String, String>) -> Result<()> {
    for (lineno, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::config(format!(
                "config line {} is not KEY=value: '{}'",
                lineno + 1,
                raw
            )));
        };

        let key = key.trim();
        if !key.starts_with(KEY_PREFIX) {
            return Err(Error::config(format!(
                "config line {}: key '{}' does not start with {}",
                lineno + 1,
                key,
                KEY_PREFIX
            )));
        }

        values.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    Ok(())
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::config(format!(
            "{} expects true/false/1/0, got '{}'",
            key, other
        ))),
    }
}

fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{} expects an integer, got '{}'", key, value)))
}
