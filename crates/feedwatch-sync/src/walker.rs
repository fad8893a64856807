//! Scroll-and-extract loop with the consecutive-duplicate stopping rule.

use feedwatch_adapters::{Extractor, FeedSource};
use feedwatch_core::Record;
use feedwatch_notify::Notifier;
use feedwatch_storage::{DedupIndex, InsertOutcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    /// Consecutive already-stored entries that end the walk.
    pub duplicate_threshold: u32,
    pub max_scroll_attempts: u32,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: 2,
            max_scroll_attempts: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DuplicateThreshold,
    FeedExhausted,
    ScrollLimit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalkStats {
    pub evaluated: usize,
    pub new: usize,
    pub duplicate: usize,
    pub pinned: usize,
    pub unparsable: usize,
    pub notified: usize,
    pub scroll_requests: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkReport {
    /// Newly stored records, newest-first as the feed presented them.
    pub accepted: Vec<Record>,
    pub stats: WalkStats,
    pub stop_reason: StopReason,
}

/// Walks one opened feed against the dedup store.
///
/// The store's unique insert is the only protection against an entry that
/// re-renders at another position; no per-walk fingerprint set is kept.
pub struct FeedWalker<'a> {
    store: &'a dyn DedupIndex,
    extractor: &'a dyn Extractor,
    notifier: Option<&'a Notifier>,
    config: WalkerConfig,
}

impl<'a> FeedWalker<'a> {
    pub fn new(
        store: &'a dyn DedupIndex,
        extractor: &'a dyn Extractor,
        notifier: Option<&'a Notifier>,
        config: WalkerConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            notifier,
            config,
        }
    }

    /// Navigate `source` to `url`, then walk it until the stopping rule fires.
    pub async fn walk(
        &self,
        source: &mut dyn FeedSource,
        url: &str,
    ) -> Result<WalkReport, SyncError> {
        source
            .open(url)
            .await
            .map_err(SyncError::NavigationFailed)?;
        if let Err(err) = source.dismiss_consent_if_present().await {
            warn!(error = %err, "could not dismiss consent dialog");
        }
        self.walk_opened(source).await
    }

    /// Walk a source that is already positioned on the feed.
    pub async fn walk_opened(&self, source: &mut dyn FeedSource) -> Result<WalkReport, SyncError> {
        let threshold = self.config.duplicate_threshold.max(1);
        let mut processed_count = 0usize;
        let mut consecutive_duplicates = 0u32;
        let mut stats = WalkStats::default();
        let mut accepted = Vec::new();

        loop {
            let elements = source.current_elements().await?;
            debug!(
                rendered = elements.len(),
                processed_count, "scanning feed entries"
            );

            for element in elements.iter().skip(processed_count) {
                processed_count += 1;
                stats.evaluated += 1;

                if self.extractor.is_pinned(element) {
                    stats.pinned += 1;
                    debug!(index = processed_count - 1, "pinned entry skipped");
                    continue;
                }

                let record = match self.extractor.extract(element) {
                    Ok(record) => record,
                    Err(err) => {
                        stats.unparsable += 1;
                        debug!(index = processed_count - 1, error = %err, "entry not parsable");
                        continue;
                    }
                };

                let fingerprint = record.fingerprint();
                if self.store.exists(&fingerprint).await? {
                    consecutive_duplicates += 1;
                    stats.duplicate += 1;
                    debug!(
                        fingerprint = fingerprint.short(),
                        consecutive_duplicates, "entry already stored"
                    );
                    if consecutive_duplicates >= threshold {
                        info!(
                            consecutive_duplicates,
                            new = stats.new,
                            "reached already-stored content, stopping"
                        );
                        return Ok(WalkReport {
                            accepted,
                            stats,
                            stop_reason: StopReason::DuplicateThreshold,
                        });
                    }
                    continue;
                }

                consecutive_duplicates = 0;
                match self.store.insert(&record).await? {
                    InsertOutcome::Inserted => {
                        stats.new += 1;
                        debug!(
                            fingerprint = fingerprint.short(),
                            title = record.display_title(),
                            "new entry stored"
                        );
                        if let Some(notifier) = self.notifier {
                            if notifier.notify(&record).await {
                                stats.notified += 1;
                            }
                        }
                        accepted.push(record);
                    }
                    InsertOutcome::AlreadyExists => {
                        warn!(
                            fingerprint = fingerprint.short(),
                            "entry stored concurrently, not counted as new"
                        );
                    }
                }
            }

            if stats.scroll_requests >= self.config.max_scroll_attempts {
                info!(scroll_requests = stats.scroll_requests, "scroll limit reached");
                return Ok(WalkReport {
                    accepted,
                    stats,
                    stop_reason: StopReason::ScrollLimit,
                });
            }

            stats.scroll_requests += 1;
            if !source.request_more().await? {
                info!(
                    scroll_requests = stats.scroll_requests,
                    "feed stopped growing"
                );
                return Ok(WalkReport {
                    accepted,
                    stats,
                    stop_reason: StopReason::FeedExhausted,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use feedwatch_adapters::{AdapterError, ExtractionError, FeedElement};
    use feedwatch_core::Fingerprint;
    use feedwatch_notify::{NotificationMessage, Transport, TransportError};
    use feedwatch_storage::{DedupStore, StorageError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Each page is the full rendered sequence after that many scrolls.
    struct ScriptedSource {
        pages: Vec<Vec<FeedElement>>,
        page: usize,
        fail_open: bool,
    }

    impl ScriptedSource {
        fn new(pages: &[&[&str]]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|page| page.iter().map(|m| FeedElement::new(*m)).collect())
                    .collect(),
                page: 0,
                fail_open: false,
            }
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedSource {
        async fn open(&mut self, url: &str) -> Result<(), AdapterError> {
            if self.fail_open {
                return Err(AdapterError::NavigationFailed {
                    url: url.to_string(),
                    reason: "timed out".to_string(),
                });
            }
            Ok(())
        }

        async fn dismiss_consent_if_present(&mut self) -> Result<(), AdapterError> {
            Ok(())
        }

        async fn current_elements(&mut self) -> Result<Vec<FeedElement>, AdapterError> {
            Ok(self.pages[self.page].clone())
        }

        async fn request_more(&mut self) -> Result<bool, AdapterError> {
            if self.page + 1 >= self.pages.len() {
                return Ok(false);
            }
            let before = self.pages[self.page].len();
            self.page += 1;
            Ok(self.pages[self.page].len() > before)
        }

        async fn close(&mut self) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    /// Markup is `author|description`, `pinned` or anything unparsable.
    #[derive(Default)]
    struct RecordingExtractor {
        extracted: Mutex<Vec<String>>,
    }

    impl Extractor for RecordingExtractor {
        fn is_pinned(&self, element: &FeedElement) -> bool {
            element.markup() == "pinned"
        }

        fn extract(&self, element: &FeedElement) -> Result<Record, ExtractionError> {
            self.extracted
                .lock()
                .unwrap()
                .push(element.markup().to_string());
            let (author, description) = element
                .markup()
                .split_once('|')
                .ok_or(ExtractionError::MissingField("author"))?;
            Ok(mk_record(author, description))
        }
    }

    struct CountingTransport {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn send(&self, _message: &NotificationMessage) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TransportError::Rejected {
                    code: 500,
                    message: "unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    fn mk_record(author: &str, description: &str) -> Record {
        Record {
            author: author.to_string(),
            title: None,
            description: description.to_string(),
            published_at: "2026-03-01 08:00".to_string(),
            images: Vec::new(),
        }
    }

    async fn store_with(dir: &tempfile::TempDir, stored: &[&str]) -> DedupStore {
        let store = DedupStore::open(dir.path().join("feedwatch.db")).await.unwrap();
        for markup in stored {
            let (author, description) = markup.split_once('|').unwrap();
            store.insert(&mk_record(author, description)).await.unwrap();
        }
        store
    }

    fn descriptions(report: &WalkReport) -> Vec<&str> {
        report.accepted.iter().map(|r| r.description.as_str()).collect()
    }

    #[tokio::test]
    async fn stops_after_two_consecutive_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &["kol|C", "kol|D"]).await;
        let extractor = RecordingExtractor::default();
        let mut source = ScriptedSource::new(&[&["kol|A", "kol|B", "kol|C", "kol|D", "kol|E"]]);

        let walker = FeedWalker::new(&store, &extractor, None, WalkerConfig::default());
        let report = walker.walk(&mut source, "https://example.test/kol").await.unwrap();

        assert_eq!(descriptions(&report), vec!["A", "B"]);
        assert_eq!(report.stop_reason, StopReason::DuplicateThreshold);
        assert_eq!(report.stats.scroll_requests, 0);
        assert!(!extractor
            .extracted
            .lock()
            .unwrap()
            .contains(&"kol|E".to_string()));
        assert_eq!(store.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn pinned_and_unparsable_do_not_break_a_duplicate_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &["kol|C", "kol|D"]).await;
        let extractor = RecordingExtractor::default();
        let mut source = ScriptedSource::new(&[&[
            "pinned", "kol|C", "garbage", "pinned", "kol|D", "kol|E",
        ]]);

        let walker = FeedWalker::new(&store, &extractor, None, WalkerConfig::default());
        let report = walker.walk(&mut source, "u").await.unwrap();

        assert!(report.accepted.is_empty());
        assert_eq!(report.stop_reason, StopReason::DuplicateThreshold);
        assert_eq!(report.stats.pinned, 2);
        assert_eq!(report.stats.unparsable, 1);
        assert_eq!(report.stats.duplicate, 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn new_entry_resets_the_duplicate_counter() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &["kol|C", "kol|D"]).await;
        let extractor = RecordingExtractor::default();
        let mut source = ScriptedSource::new(&[&["kol|C", "kol|A", "kol|D", "kol|B"]]);

        let walker = FeedWalker::new(&store, &extractor, None, WalkerConfig::default());
        let report = walker.walk(&mut source, "u").await.unwrap();

        assert_eq!(descriptions(&report), vec!["A", "B"]);
        assert_eq!(report.stop_reason, StopReason::FeedExhausted);
        assert_eq!(report.stats.scroll_requests, 1);
    }

    #[tokio::test]
    async fn scrolls_and_resumes_after_processed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &["kol|C", "kol|D"]).await;
        let extractor = RecordingExtractor::default();
        let mut source = ScriptedSource::new(&[
            &["kol|A", "kol|B"],
            // Re-render swapped the first two; only indexes >= 2 are scanned.
            &["kol|B", "kol|A", "kol|X", "kol|C", "kol|D", "kol|Y"],
        ]);

        let walker = FeedWalker::new(&store, &extractor, None, WalkerConfig::default());
        let report = walker.walk(&mut source, "u").await.unwrap();

        assert_eq!(descriptions(&report), vec!["A", "B", "X"]);
        assert_eq!(report.stats.scroll_requests, 1);
        assert_eq!(report.stats.evaluated, 5);
        assert_eq!(
            *extractor.extracted.lock().unwrap(),
            vec!["kol|A", "kol|B", "kol|X", "kol|C", "kol|D"]
        );
    }

    #[tokio::test]
    async fn entries_pushed_down_by_new_posts_are_read_again_as_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &["kol|C"]).await;
        let extractor = RecordingExtractor::default();
        let mut source = ScriptedSource::new(&[
            &["kol|A", "kol|B"],
            // X arrived on top; A and B shifted down past processed_count.
            &["kol|X", "kol|A", "kol|B", "kol|C", "kol|D"],
        ]);

        let walker = FeedWalker::new(&store, &extractor, None, WalkerConfig::default());
        let report = walker.walk(&mut source, "u").await.unwrap();

        assert_eq!(descriptions(&report), vec!["A", "B"]);
        assert_eq!(report.stop_reason, StopReason::DuplicateThreshold);
        // Re-read B plus stored C end the walk before D.
        assert_eq!(report.stats.duplicate, 2);
        assert_eq!(
            *extractor.extracted.lock().unwrap(),
            vec!["kol|A", "kol|B", "kol|B", "kol|C"]
        );
        assert_eq!(store.count().await.unwrap(), 3);
    }

    /// Reports one fingerprint as unseen even though it is stored, the way a
    /// second writer committing between `exists` and `insert` looks.
    struct LateWriterIndex {
        inner: DedupStore,
        raced: Fingerprint,
    }

    #[async_trait]
    impl DedupIndex for LateWriterIndex {
        async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, StorageError> {
            if fingerprint == &self.raced {
                return Ok(false);
            }
            self.inner.exists(fingerprint).await
        }

        async fn insert(&self, record: &Record) -> Result<InsertOutcome, StorageError> {
            self.inner.insert(record).await
        }
    }

    #[tokio::test]
    async fn entry_stored_by_another_writer_is_not_accepted_or_announced() {
        let dir = tempfile::tempdir().unwrap();
        let inner = store_with(&dir, &["kol|B"]).await;
        let index = LateWriterIndex {
            inner: inner.clone(),
            raced: mk_record("kol", "B").fingerprint(),
        };
        let extractor = RecordingExtractor::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(Box::new(CountingTransport {
            calls: calls.clone(),
            fail: false,
        }));
        let mut source = ScriptedSource::new(&[&["kol|A", "kol|B", "kol|C"]]);

        let walker = FeedWalker::new(&index, &extractor, Some(&notifier), WalkerConfig::default());
        let report = walker.walk(&mut source, "u").await.unwrap();

        assert_eq!(descriptions(&report), vec!["A", "C"]);
        assert_eq!(report.stats.new, 2);
        assert_eq!(report.stats.notified, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(inner.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn scroll_limit_ends_a_growing_feed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[]).await;
        let extractor = RecordingExtractor::default();
        let mut source = ScriptedSource::new(&[
            &["kol|A"],
            &["kol|A", "kol|B"],
            &["kol|A", "kol|B", "kol|C"],
        ]);
        let config = WalkerConfig {
            max_scroll_attempts: 1,
            ..Default::default()
        };

        let walker = FeedWalker::new(&store, &extractor, None, config);
        let report = walker.walk(&mut source, "u").await.unwrap();

        assert_eq!(descriptions(&report), vec!["A", "B"]);
        assert_eq!(report.stop_reason, StopReason::ScrollLimit);
    }

    #[tokio::test]
    async fn navigation_failure_extracts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[]).await;
        let extractor = RecordingExtractor::default();
        let mut source = ScriptedSource::new(&[&["kol|A"]]);
        source.fail_open = true;

        let walker = FeedWalker::new(&store, &extractor, None, WalkerConfig::default());
        let err = walker.walk(&mut source, "u").await.unwrap_err();

        assert!(matches!(err, SyncError::NavigationFailed(_)));
        assert!(extractor.extracted.lock().unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failing_transport_does_not_affect_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[]).await;
        let extractor = RecordingExtractor::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(Box::new(CountingTransport {
            calls: calls.clone(),
            fail: true,
        }));
        let mut source = ScriptedSource::new(&[&["kol|A", "kol|B"]]);

        let walker = FeedWalker::new(&store, &extractor, Some(&notifier), WalkerConfig::default());
        let report = walker.walk(&mut source, "u").await.unwrap();

        assert_eq!(descriptions(&report), vec!["A", "B"]);
        assert_eq!(report.stats.new, 2);
        assert_eq!(report.stats.notified, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_description_is_stored_but_not_announced() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, &[]).await;
        let extractor = RecordingExtractor::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(Box::new(CountingTransport {
            calls: calls.clone(),
            fail: false,
        }));
        let mut source = ScriptedSource::new(&[&["kol|  ", "kol|B"]]);

        let walker = FeedWalker::new(&store, &extractor, Some(&notifier), WalkerConfig::default());
        let report = walker.walk(&mut source, "u").await.unwrap();

        assert_eq!(report.accepted.len(), 2);
        assert_eq!(report.stats.notified, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store
            .exists(&mk_record("kol", "  ").fingerprint())
            .await
            .unwrap());
    }
}
