use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedwatch_adapters::{
    ConfiguredSourceFactory, Extractor, FeedSource, FeedSourceFactory, HtmlExtractor,
};
use feedwatch_core::{Record, RunStatus};
use feedwatch_notify::Notifier;
use feedwatch_storage::DedupStore;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{AppConfig, ConfigError};
use crate::walker::{FeedWalker, StopReason, WalkReport, WalkerConfig};
use crate::SyncError;

/// Result of one end-to-end run. Failures land in `error`, never in a panic
/// or a dropped future.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub new_records: Vec<Record>,
    pub report: Option<WalkReport>,
    pub error: Option<SyncError>,
}

impl RunOutcome {
    pub fn new_record_count(&self) -> usize {
        self.new_records.len()
    }

    pub fn status(&self) -> RunStatus {
        if self.error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Success
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.report.as_ref().map(|r| r.stop_reason)
    }
}

/// Anything the scheduler can drive.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run(&self, target: &str) -> RunOutcome;
}

/// One harvest: open the store, open the feed, walk, close both.
pub struct SyncJob {
    profile_url_template: String,
    database_path: PathBuf,
    walker: WalkerConfig,
    sources: Arc<dyn FeedSourceFactory>,
    extractor: Arc<dyn Extractor>,
    notifier: Option<Arc<Notifier>>,
}

impl SyncJob {
    pub fn new(
        profile_url_template: impl Into<String>,
        database_path: impl Into<PathBuf>,
        walker: WalkerConfig,
        sources: Arc<dyn FeedSourceFactory>,
        extractor: Arc<dyn Extractor>,
        notifier: Option<Arc<Notifier>>,
    ) -> Self {
        Self {
            profile_url_template: profile_url_template.into(),
            database_path: database_path.into(),
            walker,
            sources,
            extractor,
            notifier,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let sources = ConfiguredSourceFactory::new(config.source.clone(), config.selectors.clone())?;
        let extractor = HtmlExtractor::new(&config.selectors)?;
        let notifier = Notifier::from_config(&config.notify)?;
        if let Some(notifier) = &notifier {
            info!(transport = notifier.transport_name(), "notifications enabled");
        }
        Ok(Self::new(
            config.profile_url_template.clone(),
            config.database.path.clone(),
            config.walker,
            Arc::new(sources),
            Arc::new(extractor),
            notifier.map(Arc::new),
        ))
    }

    pub fn profile_url(&self, target: &str) -> String {
        self.profile_url_template.replace("{target}", target.trim())
    }

    async fn execute(&self, target: &str) -> Result<WalkReport, SyncError> {
        let store = DedupStore::open(&self.database_path).await?;

        let mut source = match self.sources.create() {
            Ok(source) => source,
            Err(err) => {
                store.close().await;
                return Err(SyncError::Source(err));
            }
        };

        let url = self.profile_url(target);
        info!(%url, "walking profile feed");
        let walker = FeedWalker::new(
            &store,
            self.extractor.as_ref(),
            self.notifier.as_deref(),
            self.walker,
        );
        let result = walker.walk(source.as_mut(), &url).await;

        close_source(source.as_mut()).await;
        if let Ok(report) = &result {
            if !report.accepted.is_empty() {
                log_store_summary(&store, &report.accepted[0].author).await;
            }
        }
        store.close().await;
        result
    }
}

async fn close_source(source: &mut dyn FeedSource) {
    if let Err(err) = source.close().await {
        warn!(error = %err, "closing feed source failed");
    }
}

async fn log_store_summary(store: &DedupStore, author: &str) {
    let total = store.count().await;
    let by_author = store.list_by_author(author).await.map(|rows| rows.len());
    match (total, by_author) {
        (Ok(total), Ok(by_author)) => {
            info!(total, author, by_author, "dedup store summary");
        }
        (Err(err), _) | (_, Err(err)) => {
            warn!(error = %err, "could not summarize dedup store");
        }
    }
}

#[async_trait]
impl SyncRunner for SyncJob {
    async fn run(&self, target: &str) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, profile = target);

        let result = self.execute(target).instrument(span).await;
        let finished_at = Utc::now();

        match result {
            Ok(report) => {
                info!(
                    %run_id,
                    new = report.stats.new,
                    duplicate = report.stats.duplicate,
                    pinned = report.stats.pinned,
                    unparsable = report.stats.unparsable,
                    scroll_requests = report.stats.scroll_requests,
                    stop_reason = ?report.stop_reason,
                    "sync run finished"
                );
                RunOutcome {
                    run_id,
                    target: target.to_string(),
                    started_at,
                    finished_at,
                    new_records: report.accepted.clone(),
                    report: Some(report),
                    error: None,
                }
            }
            Err(err) => {
                error!(%run_id, error = %err, "sync run failed");
                RunOutcome {
                    run_id,
                    target: target.to_string(),
                    started_at,
                    finished_at,
                    new_records: Vec::new(),
                    report: None,
                    error: Some(err),
                }
            }
        }
    }
}
