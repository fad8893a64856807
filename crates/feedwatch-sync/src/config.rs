use std::path::{Path, PathBuf};
use std::time::Duration;

use feedwatch_adapters::{AdapterError, FeedSelectors, SourceConfig};
use feedwatch_notify::{NotifyConfig, NotifyConfigError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::walker::WalkerConfig;

pub const DEFAULT_CONFIG_PATH: &str = "feedwatch.yaml";
const TARGET_PLACEHOLDER: &str = "{target}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid selectors: {0}")]
    Selectors(#[from] AdapterError),
    #[error("notification config: {0}")]
    Notify(#[from] NotifyConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("database/feedwatch.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub interval_minutes: u64,
    pub run_immediately: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 1,
            interval_minutes: 0,
            run_immediately: false,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600 + self.interval_minutes * 60)
    }
}

/// Everything a `feedwatch` process needs, read from YAML (JSON also parses)
/// and then overridden from `FEEDWATCH_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Profile handle substituted into `profile_url_template`.
    pub target: String,
    pub profile_url_template: String,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub walker: WalkerConfig,
    pub source: SourceConfig,
    pub selectors: FeedSelectors,
    pub notify: NotifyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target: "goingsun".to_string(),
            profile_url_template: "https://www.binance.com/en/square/profile/{target}".to_string(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            walker: WalkerConfig::default(),
            source: SourceConfig::default(),
            selectors: FeedSelectors::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `path`, or `feedwatch.yaml` when `None`. A missing default file
    /// falls back to built-in defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    warn!(path = DEFAULT_CONFIG_PATH, "config file not found, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FEEDWATCH_*` overrides through `lookup` (normally the process
    /// environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(target) = lookup("FEEDWATCH_TARGET") {
            self.target = target;
        }
        if let Some(path) = lookup("FEEDWATCH_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("FEEDWATCH_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        if let Some(v) = lookup("FEEDWATCH_NOTIFY_ENABLED") {
            self.notify.enabled = parse_flag(&v);
        }
        if let Some(v) = lookup("FEEDWATCH_SCHEDULER_ENABLED") {
            self.scheduler.enabled = parse_flag(&v);
        }
        if let Some(v) = lookup("FEEDWATCH_RUN_IMMEDIATELY") {
            self.scheduler.run_immediately = parse_flag(&v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.trim().is_empty() {
            return Err(ConfigError::Invalid("target must not be empty".into()));
        }
        if !self.profile_url_template.contains(TARGET_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "profile_url_template must contain {TARGET_PLACEHOLDER}"
            )));
        }
        if self.walker.duplicate_threshold == 0 {
            return Err(ConfigError::Invalid(
                "walker.duplicate_threshold must be at least 1".into(),
            ));
        }
        if self.scheduler.enabled && self.scheduler.interval().is_zero() {
            return Err(ConfigError::Invalid(
                "scheduler interval must be longer than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}
