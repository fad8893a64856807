use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use feedwatch_core::{RunStats, RunStatus};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::job::{RunOutcome, SyncRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

struct Inner {
    runner: Arc<dyn SyncRunner>,
    target: String,
    interval: Duration,
    run_immediately: bool,
    stats: Mutex<RunStats>,
    state: Mutex<SchedulerState>,
    /// Held for the duration of a run; a tick that cannot take it is skipped.
    run_lock: Arc<Mutex<()>>,
}

/// Drives a [`SyncRunner`] on a fixed interval and keeps [`RunStats`].
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn SyncRunner>,
        target: impl Into<String>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                target: target.into(),
                interval: config.interval(),
                run_immediately: config.run_immediately,
                stats: Mutex::new(RunStats::default()),
                state: Mutex::new(SchedulerState::Idle),
                run_lock: Arc::new(Mutex::new(())),
            }),
        }
    }

    pub async fn stats(&self) -> RunStats {
        self.inner.stats.lock().await.clone()
    }

    pub async fn state(&self) -> SchedulerState {
        *self.inner.state.lock().await
    }

    async fn set_state(&self, state: SchedulerState) {
        let mut current = self.inner.state.lock().await;
        debug!(from = ?*current, to = ?state, "scheduler state change");
        *current = state;
    }

    /// Run once unless a run is already in flight, in which case `None`.
    pub async fn tick(&self) -> Option<RunOutcome> {
        let Ok(_guard) = self.inner.run_lock.clone().try_lock_owned() else {
            warn!("previous run still in progress, skipping tick");
            return None;
        };

        let was_scheduled = self.state().await == SchedulerState::Scheduled;
        self.set_state(SchedulerState::Running).await;
        info!(profile = %self.inner.target, "scheduled run starting");

        let outcome = self.inner.runner.run(&self.inner.target).await;
        let status = outcome.status();

        let stats = {
            let mut stats = self.inner.stats.lock().await;
            stats.record(status, outcome.finished_at);
            stats.clone()
        };
        self.set_state(match status {
            RunStatus::Success => SchedulerState::Succeeded,
            RunStatus::Failed => SchedulerState::Failed,
        })
        .await;

        match status {
            RunStatus::Success => info!(
                new = outcome.new_record_count(),
                %stats,
                "scheduled run succeeded"
            ),
            RunStatus::Failed => error!(%stats, "scheduled run failed"),
        }

        if was_scheduled {
            self.set_state(SchedulerState::Scheduled).await;
        }
        Some(outcome)
    }

    /// Register the repeating job and start ticking. The first tick fires
    /// one interval from now.
    pub async fn start(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let scheduler = self.clone();
        let job = Job::new_repeated_async(self.inner.interval, move |_uuid, _l| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                scheduler.tick().await;
            })
        })
        .with_context(|| format!("creating repeated job every {:?}", self.inner.interval))?;
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;

        self.set_state(SchedulerState::Scheduled).await;
        info!(
            interval_secs = self.inner.interval.as_secs(),
            profile = %self.inner.target,
            "scheduler started"
        );
        Ok(sched)
    }

    /// Tick until `shutdown` resolves, then wait out an in-flight run and
    /// return the final statistics.
    ///
    /// With `run_immediately` one run happens before the first interval; its
    /// failure is only logged. `shutdown` is watched during that run too, and
    /// resolving it there skips scheduling altogether.
    pub async fn serve<F>(&self, shutdown: F) -> Result<RunStats>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.inner.run_immediately {
            info!("running once before the first interval");
            let immediate = self.tick();
            tokio::pin!(immediate);
            let stopped_early = tokio::select! {
                _ = &mut immediate => false,
                _ = &mut shutdown => true,
            };
            if stopped_early {
                info!("stop requested during the startup run, waiting for it to finish");
                immediate.await;
                return Ok(self.finish().await);
            }
        }

        let mut sched = self.start().await?;
        shutdown.await;
        info!("stop requested, shutting down scheduler");

        sched.shutdown().await.context("stopping scheduler")?;
        Ok(self.finish().await)
    }

    async fn finish(&self) -> RunStats {
        let _in_flight = self.inner.run_lock.lock().await;
        self.set_state(SchedulerState::Stopped).await;

        let stats = self.stats().await;
        info!(%stats, "scheduler stopped");
        stats
    }

    /// [`Scheduler::serve`] until Ctrl-C.
    pub async fn serve_until_ctrl_c(&self) -> Result<RunStats> {
        self.serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "listening for ctrl-c failed");
            }
        })
        .await
    }
}
