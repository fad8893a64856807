use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use feedwatch_core::{Fingerprint, StoredArticle};
use feedwatch_storage::{DedupStore, RemoveOutcome};
use feedwatch_sync::AppConfig;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "feedwatch")]
#[command(about = "Profile feed watcher: harvest new posts, dedup, notify")]
struct Cli {
    /// Config file (YAML or JSON). Defaults to ./feedwatch.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and print how many new posts were stored.
    RunOnce,
    /// Sync on the configured interval until Ctrl-C.
    Schedule,
    /// Stored posts by one author, newest first.
    List {
        #[arg(long)]
        author: String,
    },
    /// Most recently harvested posts.
    Recent {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Delete a stored post by fingerprint.
    Remove { fingerprint: String },
    /// Number of stored posts.
    Count,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading config")?;

    match cli.command.unwrap_or(Commands::RunOnce) {
        Commands::RunOnce => {
            let outcome = feedwatch_sync::run_once_from_config(&config).await?;
            println!("new records: {}", outcome.new_record_count());
            if let Some(err) = outcome.error {
                bail!("sync run {} failed: {err}", outcome.run_id);
            }
        }
        Commands::Schedule => {
            if !config.scheduler.enabled {
                warn!("scheduler disabled in config (scheduler.enabled = false), exiting");
                return Ok(());
            }
            let scheduler = feedwatch_sync::scheduler_from_config(&config)?;
            let stats = scheduler.serve_until_ctrl_c().await?;
            println!("{stats}");
        }
        Commands::List { author } => {
            let store = open_store(&config).await?;
            let articles = store.list_by_author(&author).await;
            store.close().await;
            for article in articles? {
                print_article(&article);
            }
        }
        Commands::Recent { limit } => {
            let store = open_store(&config).await?;
            let articles = store.list_recent(limit).await;
            store.close().await;
            for article in articles? {
                print_article(&article);
            }
        }
        Commands::Remove { fingerprint } => {
            let store = open_store(&config).await?;
            let fingerprint = Fingerprint::from_hex(fingerprint.trim().to_ascii_lowercase());
            let outcome = store.remove(&fingerprint).await;
            store.close().await;
            match outcome? {
                RemoveOutcome::Removed => println!("removed {fingerprint}"),
                RemoveOutcome::NotFound => bail!("no stored post with fingerprint {fingerprint}"),
            }
        }
        Commands::Count => {
            let store = open_store(&config).await?;
            let count = store.count().await;
            store.close().await;
            println!("{}", count?);
        }
    }

    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<DedupStore> {
    DedupStore::open(&config.database.path)
        .await
        .with_context(|| format!("opening {}", config.database.path.display()))
}

fn print_article(article: &StoredArticle) {
    println!(
        "{}  {}  {}  {}",
        article.fingerprint,
        article.published_at,
        article.author,
        article.to_record().display_title()
    );
}
