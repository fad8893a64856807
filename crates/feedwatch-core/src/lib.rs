//! Core domain model for feedwatch: harvested records, content fingerprints
//! and run statistics.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "feedwatch-core";

/// A post harvested from the profile feed, validated once at extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub author: String,
    pub title: Option<String>,
    pub description: String,
    /// Publish time exactly as the source renders it; never parsed.
    pub published_at: String,
    #[serde(default)]
    pub images: Vec<String>,
}

impl Record {
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(self)
    }

    /// Short label for log lines.
    pub fn display_title(&self) -> &str {
        match self.title.as_deref() {
            Some(title) if !title.trim().is_empty() => title,
            _ => "<untitled>",
        }
    }
}

/// Hex-encoded SHA-256 identity of a record. Primary key of the dedup store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex chars, enough to tell rows apart in logs.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(16);
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity is `author` immediately followed by `description`, no separator.
///
/// Stored rows are keyed by this value, so field order and concatenation are
/// part of the on-disk contract. `published_at` is deliberately left out: two
/// posts with the same author and text collapse into one.
pub fn fingerprint(record: &Record) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(record.author.as_bytes());
    hasher.update(record.description.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Persisted form of a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArticle {
    pub fingerprint: Fingerprint,
    pub author: String,
    pub title: Option<String>,
    pub description: String,
    pub published_at: String,
    pub images: Vec<String>,
    pub scraped_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredArticle {
    pub fn to_record(&self) -> Record {
        Record {
            author: self.author.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            published_at: self.published_at.clone(),
            images: self.images.clone(),
        }
    }
}

/// Partial update of a stored article. `None` leaves the column untouched.
///
/// Changing `author` or `description` changes the fingerprint, so the store
/// re-keys the row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleUpdate {
    pub author: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub published_at: Option<String>,
    pub images: Option<Vec<String>>,
}

impl ArticleUpdate {
    pub fn touches_identity(&self) -> bool {
        self.author.is_some() || self.description.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-lifetime counters over scheduled runs. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_runs: u64,
    pub success_runs: u64,
    pub failed_runs: u64,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
}

impl RunStats {
    pub fn record(&mut self, status: RunStatus, at: DateTime<Utc>) {
        self.total_runs += 1;
        match status {
            RunStatus::Success => self.success_runs += 1,
            RunStatus::Failed => self.failed_runs += 1,
        }
        self.last_run_time = Some(at);
        self.last_run_status = Some(status);
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total_runs={} success_runs={} failed_runs={} last_run_time={} last_run_status={}",
            self.total_runs,
            self.success_runs,
            self.failed_runs,
            self.last_run_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            self.last_run_status.map(|s| s.as_str()).unwrap_or_default(),
        )
    }
}
