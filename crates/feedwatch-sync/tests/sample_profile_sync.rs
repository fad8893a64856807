use std::path::{Path, PathBuf};

use feedwatch_core::RunStatus;
use feedwatch_storage::DedupStore;
use feedwatch_sync::{AppConfig, StopReason, SyncError, SyncJob, SyncRunner};

fn snapshot_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/sample-profile/snapshots")
        .canonicalize()
        .expect("fixture dir")
}

fn config_for(dir: &tempfile::TempDir, snapshots: PathBuf) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.path = dir.path().join("db").join("feedwatch.db");
    config.source.snapshot_dir = snapshots;
    config
}

#[tokio::test]
async fn second_run_stops_at_stored_posts() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir, snapshot_dir());
    let job = SyncJob::from_config(&config).unwrap();

    let first = job.run(&config.target).await;
    assert!(first.error.is_none(), "{:?}", first.error);
    assert_eq!(first.status(), RunStatus::Success);
    assert_eq!(first.new_record_count(), 4);
    assert_eq!(first.stop_reason(), Some(StopReason::FeedExhausted));
    let report = first.report.as_ref().unwrap();
    assert_eq!(report.stats.pinned, 1);
    assert_eq!(report.stats.unparsable, 1);
    assert_eq!(report.stats.scroll_requests, 2);
    assert_eq!(
        first.new_records[0].title.as_deref(),
        Some("Weekly outlook")
    );

    let second = job.run(&config.target).await;
    assert_eq!(second.new_record_count(), 0);
    assert_eq!(second.stop_reason(), Some(StopReason::DuplicateThreshold));

    let store = DedupStore::open(&config.database.path).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 4);
    assert_eq!(store.list_by_author("goingsun").await.unwrap().len(), 4);
    store.close().await;
}

#[tokio::test]
async fn run_with_two_unseen_posts_stores_only_those() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir, snapshot_dir());

    // Store everything, then forget the two newest posts.
    let seed_job = SyncJob::from_config(&config).unwrap();
    seed_job.run(&config.target).await;
    let store = DedupStore::open(&config.database.path).await.unwrap();
    let newest = store.list_by_author("goingsun").await.unwrap();
    for article in newest.iter().take(2) {
        store.remove(&article.fingerprint).await.unwrap();
    }
    assert_eq!(store.count().await.unwrap(), 2);
    store.close().await;

    let outcome = seed_job.run(&config.target).await;
    let descriptions: Vec<_> = outcome
        .new_records
        .iter()
        .map(|r| r.description.as_str())
        .collect();
    assert_eq!(
        descriptions,
        vec!["BTC holding the range into the close.", "Watching 3.2k as support."]
    );
    assert_eq!(outcome.stop_reason(), Some(StopReason::DuplicateThreshold));

    let store = DedupStore::open(&config.database.path).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 4);
    store.close().await;
}

#[tokio::test]
async fn empty_capture_dir_fails_navigation() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("captures");
    std::fs::create_dir_all(&empty).unwrap();
    let config = config_for(&dir, empty);

    let outcome = SyncJob::from_config(&config)
        .unwrap()
        .run(&config.target)
        .await;

    assert_eq!(outcome.status(), RunStatus::Failed);
    assert!(matches!(outcome.error, Some(SyncError::NavigationFailed(_))));
    assert_eq!(outcome.new_record_count(), 0);
}

#[tokio::test]
async fn unusable_database_path_is_a_storage_failure() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let mut config = config_for(&dir, snapshot_dir());
    config.database.path = blocker.join("feedwatch.db");

    let outcome = SyncJob::from_config(&config)
        .unwrap()
        .run(&config.target)
        .await;

    assert!(matches!(outcome.error, Some(SyncError::Storage(_))));
}
