//! TOML configuration for the bugtriage update service.
//!
//! Every section has compiled-in defaults; a config file only needs the keys
//! it wants to change. The file is located via `--config`, then the
//! `BUGTRIAGE_CONFIG` environment variable, then the system path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "BUGTRIAGE_CONFIG";
pub const API_KEY_ENV: &str = "BUGTRIAGE_TRACKER_API_KEY";
const SYSTEM_CONFIG_PATH: &str = "/etc/bugtriage/bugtriage.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        info!(path = %path.display(), "loaded service configuration");
        Ok(config)
    }

    /// Resolve the configuration: explicit path, `BUGTRIAGE_CONFIG`, the
    /// system location, then defaults. An explicit path must load.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "BUGTRIAGE_CONFIG set but file could not be loaded, trying fallback"
                ),
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => warn!(
                    path = %system_path.display(),
                    error = %e,
                    "system config file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                self.tracker.api_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracker.base_url.trim().is_empty() {
            bail!("tracker.base_url must not be empty");
        }
        if self.scheduler.workers == 0 {
            bail!("scheduler.workers must be at least 1");
        }
        if self.scheduler.max_attempts == 0 {
            bail!("scheduler.max_attempts must be at least 1");
        }
        if self.scheduler.execution_timeout_secs == 0 {
            bail!("scheduler.execution_timeout_secs must be at least 1");
        }
        if self.scheduler.tick_interval_secs == 0 {
            bail!("scheduler.tick_interval_secs must be at least 1");
        }
        if self.health.heartbeat_window_secs <= self.scheduler.tick_interval_secs {
            bail!(
                "health.heartbeat_window_secs ({}) must exceed scheduler.tick_interval_secs ({})",
                self.health.heartbeat_window_secs,
                self.scheduler.tick_interval_secs
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("data/bugtriage.db") }
    }
}

/// External tracker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub base_url: String,
    /// Sent as `api_key`; prefer the environment variable over the file.
    pub api_key: Option<String>,
    /// Bug ids per detail request.
    pub page_size: usize,
    pub request_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://bugzilla.mozilla.org".to_string(),
            api_key: None,
            page_size: 200,
            request_timeout_secs: 30,
        }
    }
}

/// What to record when retries run out with only part of the result fetched.
/// The obtained records are persisted either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialPolicy {
    RecordPartial,
    RecordFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// Concurrent executions across all queries.
    pub workers: usize,
    /// Tracker calls per execution, first attempt included.
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter_ms: u64,
    pub execution_timeout_secs: u64,
    pub partial_policy: PartialPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            workers: 4,
            max_attempts: 3,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_jitter_ms: 250,
            execution_timeout_secs: 300,
            partial_policy: PartialPolicy::RecordPartial,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// A heartbeat older than this reports the scheduler offline.
    pub heartbeat_window_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { heartbeat_window_secs: 15 }
    }
}

impl HealthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.heartbeat_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:8080".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.scheduler.backoff_initial_ms, 1_000);
        assert_eq!(config.scheduler.partial_policy, PartialPolicy::RecordPartial);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[scheduler]\nworkers = 8\npartial_policy = \"record_failure\"\n\n[tracker]\nbase_url = \"https://bugs.example.org\""
        )
        .unwrap();

        let config = ServiceConfig::load(file.path()).unwrap();
        assert_eq!(config.scheduler.workers, 8);
        assert_eq!(config.scheduler.partial_policy, PartialPolicy::RecordFailure);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.tracker.base_url, "https://bugs.example.org");
        assert_eq!(config.api.bind, "127.0.0.1:8080");
    }

    #[test]
    fn test_heartbeat_window_must_exceed_tick() {
        let mut config = ServiceConfig::default();
        config.health.heartbeat_window_secs = config.scheduler.tick_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = ServiceConfig::default();
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_execution_timeout_rejected() {
        let mut config = ServiceConfig::default();
        config.scheduler.execution_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("execution_timeout_secs"));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        assert!(ServiceConfig::resolve(Some(Path::new("/nonexistent/bugtriage.toml"))).is_err());
    }
}
