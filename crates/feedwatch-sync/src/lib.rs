//! Incremental feed sync: walker, per-run job and the interval scheduler.

use anyhow::{Context, Result};
use feedwatch_adapters::AdapterError;
use feedwatch_storage::StorageError;
use std::sync::Arc;
use thiserror::Error;

pub mod config;
pub mod job;
pub mod scheduler;
pub mod walker;

pub use config::{AppConfig, ConfigError, DatabaseConfig, SchedulerConfig, DEFAULT_CONFIG_PATH};
pub use job::{RunOutcome, SyncJob, SyncRunner};
pub use scheduler::{Scheduler, SchedulerState};
pub use walker::{FeedWalker, StopReason, WalkReport, WalkStats, WalkerConfig};

pub const CRATE_NAME: &str = "feedwatch-sync";

/// Run-level failures. Element-level problems never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("navigation failed: {0}")]
    NavigationFailed(#[source] AdapterError),
    #[error("feed source error: {0}")]
    Source(#[from] AdapterError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Build the job from `config` and run it once for the configured target.
pub async fn run_once_from_config(config: &AppConfig) -> Result<RunOutcome> {
    let job = SyncJob::from_config(config).context("building sync job")?;
    Ok(job.run(&config.target).await)
}

/// Scheduler over a [`SyncJob`] built from `config`.
pub fn scheduler_from_config(config: &AppConfig) -> Result<Scheduler> {
    let job = SyncJob::from_config(config).context("building sync job")?;
    Ok(Scheduler::new(
        Arc::new(job),
        config.target.clone(),
        &config.scheduler,
    ))
}
