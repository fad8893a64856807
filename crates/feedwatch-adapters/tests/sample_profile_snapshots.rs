use std::path::{Path, PathBuf};

use feedwatch_adapters::{
    Extractor, ExtractionError, FeedSelectors, FeedSource, HtmlExtractor, SnapshotFeedSource,
};

fn snapshot_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/sample-profile/snapshots")
        .canonicalize()
        .expect("fixture dir")
}

#[tokio::test]
async fn sample_profile_scrolls_through_captures() {
    let selectors = FeedSelectors::default();
    let mut source = SnapshotFeedSource::new(snapshot_dir(), &selectors).unwrap();
    source
        .open("https://www.binance.com/en/square/profile/goingsun")
        .await
        .unwrap();
    source.dismiss_consent_if_present().await.unwrap();

    let first = source.current_elements().await.unwrap();
    assert_eq!(first.len(), 3);

    assert!(source.request_more().await.unwrap());
    let second = source.current_elements().await.unwrap();
    assert_eq!(second.len(), 6);
    assert_eq!(&second[..3], &first[..]);

    assert!(!source.request_more().await.unwrap());
    source.close().await.unwrap();
}

#[tokio::test]
async fn sample_profile_entries_classify_as_expected() {
    let selectors = FeedSelectors::default();
    let extractor = HtmlExtractor::new(&selectors).unwrap();
    let mut source = SnapshotFeedSource::new(snapshot_dir(), &selectors).unwrap();
    source.open("file://sample-profile").await.unwrap();
    source.request_more().await.unwrap();
    let elements = source.current_elements().await.unwrap();

    assert!(extractor.is_pinned(&elements[0]));
    assert!(elements[1..].iter().all(|e| !extractor.is_pinned(e)));

    let newest = extractor.extract(&elements[1]).unwrap();
    assert_eq!(newest.author, "goingsun");
    assert_eq!(newest.title.as_deref(), Some("Weekly outlook"));
    assert_eq!(newest.published_at, "2026-03-05 08:00");

    let with_images = extractor.extract(&elements[2]).unwrap();
    assert_eq!(with_images.images.len(), 2);

    assert_eq!(
        extractor.extract(&elements[3]),
        Err(ExtractionError::MissingField("author"))
    );

    let untitled = extractor.extract(&elements[4]).unwrap();
    assert_eq!(untitled.title, None);
    assert_eq!(untitled.description, "gm");
}
