//! TOML configuration for runwright.
//!
//! Layered like the rest of the tooling: a file named by `RUNWRIGHT_CONFIG`,
//! then `/etc/runwright/runwright.toml`, then compiled-in defaults. Every
//! section is optional and every field has a default.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "RUNWRIGHT_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/runwright/runwright.toml";
pub const ENCRYPTION_KEY_ENV: &str = "ENCRYPTION_KEY";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunwrightConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub fixtures: FixturesConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RunwrightConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order: `$RUNWRIGHT_CONFIG`, the system path, defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "RUNWRIGHT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
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

    /// The fixture-state key: `$ENCRYPTION_KEY` wins over the file.
    pub fn encryption_key(&self) -> Option<String> {
        std::env::var(ENCRYPTION_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.fixtures.encryption_key.clone().filter(|k| !k.is_empty()))
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API listens on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file; parent directories are created.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/runwright.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between due-schedule polls.
    pub tick_interval_secs: u64,
    /// A run still pending/running this long after starting is considered orphaned.
    pub liveness_threshold_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            liveness_threshold_secs: 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn liveness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.liveness_threshold_secs).unwrap_or(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Base URL of the browser executor service.
    pub executor_url: String,
    pub attempt_timeout_secs: u64,
    pub classifier_timeout_secs: u64,
    /// Concurrent target executions allowed per project.
    pub max_concurrent_per_project: usize,
    pub default_browser: String,
    /// When false, `intelligent` schedules retry like `simple` ones.
    pub intelligent_retry_enabled: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            executor_url: "http://127.0.0.1:8001".to_string(),
            attempt_timeout_secs: 300,
            classifier_timeout_secs: 30,
            max_concurrent_per_project: 4,
            default_browser: "chromium".to_string(),
            intelligent_retry_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixturesConfig {
    pub capture_timeout_secs: u64,
    /// Secret the state cipher key is derived from. Prefer `ENCRYPTION_KEY`.
    pub encryption_key: Option<String>,
}

impl Default for FixturesConfig {
    fn default() -> Self {
        Self {
            capture_timeout_secs: 120,
            encryption_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub send_timeout_secs: u64,
    /// Email channels fail with a configuration error while this is unset.
    pub smtp: Option<SmtpConfig>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 30,
            smtp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// `Name <address>` or a bare address.
    pub from: String,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
