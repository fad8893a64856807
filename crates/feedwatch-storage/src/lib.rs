//! Durable dedup store for harvested articles, keyed by content fingerprint.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedwatch_core::{fingerprint, ArticleUpdate, Fingerprint, Record, StoredArticle};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "feedwatch-storage";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS articles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content_hash TEXT UNIQUE NOT NULL,
        author TEXT NOT NULL,
        title TEXT,
        description TEXT NOT NULL,
        published_at TEXT,
        images TEXT,
        scraped_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_articles_author ON articles(author)",
    "CREATE INDEX IF NOT EXISTS idx_articles_published_at ON articles(published_at)",
];

const ARTICLE_COLUMNS: &str =
    "content_hash, author, title, description, published_at, images, scraped_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding images column: {0}")]
    Images(#[from] serde_json::Error),
    #[error("preparing database directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// `author` or `description` changed; the row now lives under this key.
    Rekeyed(Fingerprint),
    NotFound,
    /// The edited identity already belongs to another row. Nothing changed.
    Conflict(Fingerprint),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// SQLite-backed set of fingerprints with their article bodies.
///
/// Every statement runs in autocommit mode on a single pooled connection, so
/// a mutation is durable once the call returns.
#[derive(Debug, Clone)]
pub struct DedupStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl DedupStore {
    /// Open (creating if needed) the database file and ensure the schema.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool, path };
        store.init_schema().await?;
        info!(path = %store.path.display(), "dedup store opened");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Close the underlying connection. Callers invoke this on every exit path.
    pub async fn close(self) {
        self.pool.close().await;
        debug!(path = %self.path.display(), "dedup store closed");
    }

    pub async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM articles WHERE content_hash = ? LIMIT 1")
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Unique insert. An existing row with the same fingerprint is left as-is.
    pub async fn insert(&self, record: &Record) -> Result<InsertOutcome, StorageError> {
        let fp = fingerprint(record);
        let images = serde_json::to_string(&record.images)?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO articles
                (content_hash, author, title, description, published_at, images, scraped_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(fp.as_str())
        .bind(&record.author)
        .bind(record.title.as_deref())
        .bind(&record.description)
        .bind(&record.published_at)
        .bind(images)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                warn!(fingerprint = fp.short(), "article already stored, skipping insert");
                Ok(InsertOutcome::AlreadyExists)
            }
            Ok(_) => {
                info!(fingerprint = fp.short(), title = record.display_title(), "article stored");
                Ok(InsertOutcome::Inserted)
            }
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                warn!(fingerprint = fp.short(), "lost insert race, article already stored");
                Ok(InsertOutcome::AlreadyExists)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Insert each record in order, returning `(inserted, skipped)`.
    pub async fn insert_many(&self, records: &[Record]) -> Result<(usize, usize), StorageError> {
        let mut inserted = 0usize;
        let mut skipped = 0usize;
        for record in records {
            match self.insert(record).await? {
                InsertOutcome::Inserted => inserted += 1,
                InsertOutcome::AlreadyExists => skipped += 1,
            }
        }
        info!(inserted, skipped, "batch insert finished");
        Ok((inserted, skipped))
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<StoredArticle>, StorageError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE content_hash = ?");
        let row = sqlx::query(&sql)
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| article_from_row(&r)).transpose()
    }

    pub async fn count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM articles")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }

    /// Articles by `author`, newest first by the source's own timestamp text.
    pub async fn list_by_author(&self, author: &str) -> Result<Vec<StoredArticle>, StorageError> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE author = ? ORDER BY published_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql).bind(author).fetch_all(&self.pool).await?;
        rows.iter().map(article_from_row).collect()
    }

    /// Most recently harvested articles across all authors.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<StoredArticle>, StorageError> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles ORDER BY scraped_at DESC, id DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(article_from_row).collect()
    }

    /// Partial update. `updated_at` is refreshed even when `changes` is empty.
    ///
    /// Editing `author` or `description` recomputes the fingerprint and moves
    /// `content_hash` in the same statement, so a row's key always matches
    /// its content.
    pub async fn update(
        &self,
        fingerprint: &Fingerprint,
        changes: &ArticleUpdate,
    ) -> Result<UpdateOutcome, StorageError> {
        let mut new_key = None;
        if changes.touches_identity() {
            let Some(current) = self.get(fingerprint).await? else {
                warn!(fingerprint = fingerprint.short(), "update target not found");
                return Ok(UpdateOutcome::NotFound);
            };
            let mut merged = current.to_record();
            if let Some(author) = &changes.author {
                merged.author = author.clone();
            }
            if let Some(description) = &changes.description {
                merged.description = description.clone();
            }
            let recomputed = merged.fingerprint();
            if &recomputed != fingerprint {
                if self.exists(&recomputed).await? {
                    warn!(
                        fingerprint = fingerprint.short(),
                        clashes_with = recomputed.short(),
                        "update would duplicate a stored article"
                    );
                    return Ok(UpdateOutcome::Conflict(recomputed));
                }
                new_key = Some(recomputed);
            }
        }

        let images = changes
            .images
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE articles SET ");
        {
            let mut set = builder.separated(", ");
            if let Some(key) = &new_key {
                set.push("content_hash = ")
                    .push_bind_unseparated(key.as_str().to_string());
            }
            if let Some(author) = &changes.author {
                set.push("author = ").push_bind_unseparated(author.clone());
            }
            if let Some(title) = &changes.title {
                set.push("title = ").push_bind_unseparated(title.clone());
            }
            if let Some(description) = &changes.description {
                set.push("description = ").push_bind_unseparated(description.clone());
            }
            if let Some(published_at) = &changes.published_at {
                set.push("published_at = ").push_bind_unseparated(published_at.clone());
            }
            if let Some(images) = images {
                set.push("images = ").push_bind_unseparated(images);
            }
            set.push("updated_at = ").push_bind_unseparated(Utc::now());
        }
        builder
            .push(" WHERE content_hash = ")
            .push_bind(fingerprint.as_str().to_string());

        let done = match builder.build().execute(&self.pool).await {
            Ok(done) => done,
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                warn!(fingerprint = fingerprint.short(), "lost update race to an identical article");
                return Ok(UpdateOutcome::Conflict(
                    new_key.unwrap_or_else(|| fingerprint.clone()),
                ));
            }
            Err(err) => return Err(err.into()),
        };
        if done.rows_affected() == 0 {
            warn!(fingerprint = fingerprint.short(), "update target not found");
            return Ok(UpdateOutcome::NotFound);
        }
        match new_key {
            Some(key) => {
                info!(from = fingerprint.short(), to = key.short(), "article updated and re-keyed");
                Ok(UpdateOutcome::Rekeyed(key))
            }
            None => {
                info!(fingerprint = fingerprint.short(), "article updated");
                Ok(UpdateOutcome::Updated)
            }
        }
    }

    /// Administrative deletion. The sync path never calls this.
    pub async fn remove(&self, fingerprint: &Fingerprint) -> Result<RemoveOutcome, StorageError> {
        let done = sqlx::query("DELETE FROM articles WHERE content_hash = ?")
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            warn!(fingerprint = fingerprint.short(), "remove target not found");
            return Ok(RemoveOutcome::NotFound);
        }
        info!(fingerprint = fingerprint.short(), "article removed");
        Ok(RemoveOutcome::Removed)
    }
}

/// The slice of the store the feed walker depends on.
#[async_trait]
pub trait DedupIndex: Send + Sync {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, StorageError>;

    async fn insert(&self, record: &Record) -> Result<InsertOutcome, StorageError>;
}

#[async_trait]
impl DedupIndex for DedupStore {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, StorageError> {
        DedupStore::exists(self, fingerprint).await
    }

    async fn insert(&self, record: &Record) -> Result<InsertOutcome, StorageError> {
        DedupStore::insert(self, record).await
    }
}

fn article_from_row(row: &SqliteRow) -> Result<StoredArticle, StorageError> {
    let images: Option<String> = row.try_get("images")?;
    let images = match images.as_deref() {
        Some(text) if !text.trim().is_empty() => serde_json::from_str(text)?,
        _ => Vec::new(),
    };
    let published_at: Option<String> = row.try_get("published_at")?;
    let scraped_at: DateTime<Utc> = row.try_get("scraped_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(StoredArticle {
        fingerprint: Fingerprint::from_hex(row.try_get::<String, _>("content_hash")?),
        author: row.try_get("author")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        published_at: published_at.unwrap_or_default(),
        images,
        scraped_at,
        updated_at,
    })
}
