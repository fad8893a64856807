//! Feed source and extraction contracts, plus the snapshot/HTTP sources and
//! the CSS-selector extractor that implement them.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use feedwatch_core::Record;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "feedwatch-adapters";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// One rendered feed entry, carried as its outer HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedElement {
    markup: String,
}

impl FeedElement {
    pub fn new(markup: impl Into<String>) -> Self {
        Self {
            markup: markup.into(),
        }
    }

    pub fn markup(&self) -> &str {
        &self.markup
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("navigation to {url} failed: {reason}")]
    NavigationFailed { url: String, reason: String },
    #[error("invalid selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("feed source is not open")]
    NotOpen,
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("building http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("missing `{0}` element")]
    MissingField(&'static str),
    #[error("`{0}` element is empty")]
    EmptyField(&'static str),
}

/// The rendering collaborator: a scrollable, newest-first feed.
///
/// `current_elements` always returns the full currently-rendered sequence;
/// entries seen on an earlier read may come back at other positions.
#[async_trait]
pub trait FeedSource: Send {
    async fn open(&mut self, url: &str) -> Result<(), AdapterError>;

    async fn dismiss_consent_if_present(&mut self) -> Result<(), AdapterError>;

    async fn current_elements(&mut self) -> Result<Vec<FeedElement>, AdapterError>;

    /// Ask for more entries. Returns whether the rendered sequence grew.
    async fn request_more(&mut self) -> Result<bool, AdapterError>;

    async fn close(&mut self) -> Result<(), AdapterError>;
}

/// Builds one fresh [`FeedSource`] per sync run.
pub trait FeedSourceFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FeedSource>, AdapterError>;
}

/// Turns a rendered feed entry into a [`Record`].
pub trait Extractor: Send + Sync {
    /// Sticky/promoted entries; checked before field extraction.
    fn is_pinned(&self, element: &FeedElement) -> bool;

    fn extract(&self, element: &FeedElement) -> Result<Record, ExtractionError>;
}

/// CSS selectors for the profile feed markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSelectors {
    pub feed_item: String,
    pub author: String,
    pub title: String,
    pub description: String,
    pub published_at: String,
    pub images: String,
    pub pinned: String,
}

impl Default for FeedSelectors {
    fn default() -> Self {
        Self {
            feed_item: r#"[class*="FeedList"] > *"#.to_string(),
            author: ".nick-username".to_string(),
            title: r#"[class*="card__title"]"#.to_string(),
            description: r#"[class*="card__description"]"#.to_string(),
            published_at: ".create-time".to_string(),
            images: r#"[class*="card-images-box"] img"#.to_string(),
            pinned: r#"[class*="text-EmphasizeText"]"#.to_string(),
        }
    }
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Split a rendered page into feed entries, preserving document order.
pub fn split_feed_items(document: &str, item_selector: &Selector) -> Vec<FeedElement> {
    let html = Html::parse_document(document);
    html.select(item_selector)
        .map(|el| FeedElement::new(el.html()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct HtmlExtractor {
    author: Selector,
    title: Selector,
    description: Selector,
    published_at: Selector,
    images: Selector,
    pinned: Selector,
}

impl HtmlExtractor {
    pub fn new(selectors: &FeedSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            author: compile(&selectors.author)?,
            title: compile(&selectors.title)?,
            description: compile(&selectors.description)?,
            published_at: compile(&selectors.published_at)?,
            images: compile(&selectors.images)?,
            pinned: compile(&selectors.pinned)?,
        })
    }
}

impl Extractor for HtmlExtractor {
    fn is_pinned(&self, element: &FeedElement) -> bool {
        let fragment = Html::parse_fragment(element.markup());
        fragment.select(&self.pinned).next().is_some()
    }

    fn extract(&self, element: &FeedElement) -> Result<Record, ExtractionError> {
        let fragment = Html::parse_fragment(element.markup());

        let author = fragment
            .select(&self.author)
            .next()
            .map(text_of)
            .ok_or(ExtractionError::MissingField("author"))?;
        if author.is_empty() {
            return Err(ExtractionError::EmptyField("author"));
        }

        let description = fragment
            .select(&self.description)
            .next()
            .map(text_of)
            .ok_or(ExtractionError::MissingField("description"))?;

        let published_at = fragment
            .select(&self.published_at)
            .next()
            .map(text_of)
            .ok_or(ExtractionError::MissingField("published_at"))?;

        let title = fragment
            .select(&self.title)
            .next()
            .and_then(|n| text_or_none(text_of(n)));

        let images = fragment
            .select(&self.images)
            .filter_map(|img| img.value().attr("src"))
            .filter_map(|src| text_or_none(src.to_string()))
            .collect();

        Ok(Record {
            author,
            title,
            description,
            published_at,
            images,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Directory of successively-scrolled page captures.
    Snapshot,
    /// Single HTTP fetch of the profile page; cannot scroll.
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub snapshot_dir: PathBuf,
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Reserved for a browser-backed source; the snapshot and HTTP sources
    /// render nothing and ignore it.
    pub headless: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Snapshot,
            snapshot_dir: PathBuf::from("./snapshots"),
            timeout_secs: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headless: true,
        }
    }
}

/// Reads `*.html` captures from a directory in file-name order. Each
/// `request_more` advances to the next capture, standing in for one scroll.
#[derive(Debug)]
pub struct SnapshotFeedSource {
    dir: PathBuf,
    item_selector: Selector,
    snapshots: Vec<PathBuf>,
    cursor: usize,
    current: Option<Vec<FeedElement>>,
}

impl SnapshotFeedSource {
    pub fn new(dir: impl Into<PathBuf>, selectors: &FeedSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            dir: dir.into(),
            item_selector: compile(&selectors.feed_item)?,
            snapshots: Vec::new(),
            cursor: 0,
            current: None,
        })
    }

    async fn list_snapshots(&self) -> Result<Vec<PathBuf>, AdapterError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| AdapterError::Io {
                path: self.dir.clone(),
                source,
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("html") {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    async fn load(&self, index: usize) -> Result<Vec<FeedElement>, AdapterError> {
        let path = &self.snapshots[index];
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| AdapterError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(split_feed_items(&text, &self.item_selector))
    }
}

#[async_trait]
impl FeedSource for SnapshotFeedSource {
    async fn open(&mut self, url: &str) -> Result<(), AdapterError> {
        let snapshots = self
            .list_snapshots()
            .await
            .map_err(|err| AdapterError::NavigationFailed {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        if snapshots.is_empty() {
            return Err(AdapterError::NavigationFailed {
                url: url.to_string(),
                reason: format!("no captures in {}", self.dir.display()),
            });
        }
        self.snapshots = snapshots;
        self.cursor = 0;
        let first = self.load(0).await?;
        info!(
            url,
            dir = %self.dir.display(),
            captures = self.snapshots.len(),
            elements = first.len(),
            "snapshot feed opened"
        );
        self.current = Some(first);
        Ok(())
    }

    async fn dismiss_consent_if_present(&mut self) -> Result<(), AdapterError> {
        debug!("snapshot captures carry no consent dialog");
        Ok(())
    }

    async fn current_elements(&mut self) -> Result<Vec<FeedElement>, AdapterError> {
        self.current.clone().ok_or(AdapterError::NotOpen)
    }

    async fn request_more(&mut self) -> Result<bool, AdapterError> {
        let previous = self.current.as_ref().ok_or(AdapterError::NotOpen)?.len();
        if self.cursor + 1 >= self.snapshots.len() {
            return Ok(false);
        }
        self.cursor += 1;
        let next = self.load(self.cursor).await?;
        let grew = next.len() > previous;
        debug!(capture = self.cursor, elements = next.len(), grew, "advanced to next capture");
        self.current = Some(next);
        Ok(grew)
    }

    async fn close(&mut self) -> Result<(), AdapterError> {
        self.current = None;
        self.snapshots.clear();
        Ok(())
    }
}

/// Fetches the profile page once over HTTP. Content rendered client-side
/// is invisible to this source, and it never grows on `request_more`.
#[derive(Debug)]
pub struct HttpFeedSource {
    client: reqwest::Client,
    item_selector: Selector,
    body: Option<String>,
}

impl HttpFeedSource {
    pub fn new(config: &SourceConfig, selectors: &FeedSelectors) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            item_selector: compile(&selectors.feed_item)?,
            body: None,
        })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn open(&mut self, url: &str) -> Result<(), AdapterError> {
        let span = info_span!("feed_fetch", url);
        let navigation_failed = |reason: String| AdapterError::NavigationFailed {
            url: url.to_string(),
            reason,
        };

        let resp = self
            .client
            .get(url)
            .send()
            .instrument(span.clone())
            .await
            .map_err(|e| navigation_failed(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(navigation_failed(format!("http status {}", status.as_u16())));
        }
        let body = resp
            .text()
            .instrument(span)
            .await
            .map_err(|e| navigation_failed(e.to_string()))?;

        let lower = body.to_ascii_lowercase();
        if lower.contains("cloudflare") || lower.contains("checking your browser") {
            warn!(url, "page looks like a bot challenge; feed entries may be missing");
        }
        info!(url, bytes = body.len(), "profile page fetched");
        self.body = Some(body);
        Ok(())
    }

    async fn dismiss_consent_if_present(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn current_elements(&mut self) -> Result<Vec<FeedElement>, AdapterError> {
        let body = self.body.as_deref().ok_or(AdapterError::NotOpen)?;
        Ok(split_feed_items(body, &self.item_selector))
    }

    async fn request_more(&mut self) -> Result<bool, AdapterError> {
        Ok(false)
    }

    async fn close(&mut self) -> Result<(), AdapterError> {
        self.body = None;
        Ok(())
    }
}

/// Creates sources of the configured kind.
#[derive(Debug, Clone)]
pub struct ConfiguredSourceFactory {
    config: SourceConfig,
    selectors: FeedSelectors,
}

impl ConfiguredSourceFactory {
    pub fn new(config: SourceConfig, selectors: FeedSelectors) -> Result<Self, AdapterError> {
        compile(&selectors.feed_item)?;
        Ok(Self { config, selectors })
    }
}

impl FeedSourceFactory for ConfiguredSourceFactory {
    fn create(&self) -> Result<Box<dyn FeedSource>, AdapterError> {
        debug!(kind = ?self.config.kind, headless = self.config.headless, "creating feed source");
        match self.config.kind {
            SourceKind::Snapshot => Ok(Box::new(SnapshotFeedSource::new(
                self.config.snapshot_dir.clone(),
                &self.selectors,
            )?)),
            SourceKind::Http => Ok(Box::new(HttpFeedSource::new(&self.config, &self.selectors)?)),
        }
    }
}
