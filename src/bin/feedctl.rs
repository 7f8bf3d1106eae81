use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use feed_normalizer::database_ops::checkpoint::{release_stale, reset_source};
use feed_normalizer::database_ops::raw_store::import_ndjson;
use feed_normalizer::database_ops::recount::recount;
use feed_normalizer::normalization::Source;
use feed_normalizer::tracing::{init_tracing, DEFAULT_FILTER};
use feed_normalizer::util::env;
use feed_normalizer::{Db, Normalizer, PipelineConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "feedctl", version, about = "Product feed normalization CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct DbArgs {
    /// Optional override for the database URL
    #[arg(long)]
    db_url: Option<String>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Normalize unprocessed raw records of one source
    Normalize {
        #[arg(long)]
        source: Source,
        /// Maximum number of raw records to claim this pass
        #[arg(long)]
        limit: Option<u64>,
        /// Parallel workers (disjoint id partitions)
        #[arg(long)]
        workers: Option<u32>,
        /// Drafts per upsert batch (1..=500)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Skip the product_count recount at the end of the pass
        #[arg(long, default_value_t = false)]
        no_recount: bool,
        #[command(flatten)]
        db: DbArgs,
    },
    /// Flip all processed records of a source back to unprocessed
    ResetMigration {
        #[arg(long)]
        source: Source,
        #[command(flatten)]
        db: DbArgs,
    },
    /// Recompute product_count on every master table for a source
    Recount {
        #[arg(long)]
        source: Source,
        #[command(flatten)]
        db: DbArgs,
    },
    /// Return claims older than the timeout to the queue
    ReleaseStale {
        #[arg(long)]
        source: Source,
        /// Defaults to CLAIM_TIMEOUT_SECS
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[command(flatten)]
        db: DbArgs,
    },
    /// Load newline-delimited JSON payloads into the raw store
    ImportRaw {
        #[arg(long)]
        source: Source,
        #[arg(long)]
        file: PathBuf,
        #[command(flatten)]
        db: DbArgs,
    },
    /// Print queue state and row counts
    Status {
        #[arg(long)]
        source: Option<Source>,
        #[command(flatten)]
        db: DbArgs,
    },
}

async fn open(cfg: &PipelineConfig) -> Result<Db> {
    info!(url = %env::redact_db_url(&cfg.database_url), "feedctl: connecting");
    Db::connect(
        &cfg.database_url,
        cfg.effective_max_connections(),
        cfg.busy_timeout,
    )
    .await
    .with_context(|| format!("failed to open {}", env::redact_db_url(&cfg.database_url)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(DEFAULT_FILTER)?;
    env::bootstrap_cli("feedctl");

    let cli = Cli::parse();
    let base = PipelineConfig::from_env();

    match cli.command {
        Commands::Normalize {
            source,
            limit,
            workers,
            batch_size,
            no_recount,
            db,
        } => {
            let mut cfg = base
                .with_database_url(db.db_url.as_deref())
                .with_workers(workers)
                .with_batch_size(batch_size);
            cfg.recount = !no_recount;
            let pool = open(&cfg).await?;
            let summary = Normalizer::new(pool, cfg).run_pass(source, limit).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ResetMigration { source, db } => {
            let cfg = base.with_database_url(db.db_url.as_deref());
            let pool = open(&cfg).await?;
            let reset = reset_source(&pool, source).await?;
            println!("reset {reset} raw records of source {source} to unprocessed");
        }
        Commands::Recount { source, db } => {
            let cfg = base.with_database_url(db.db_url.as_deref());
            let pool = open(&cfg).await?;
            for (kind, rows) in recount(&pool, source).await? {
                println!("{kind}: {rows} rows recounted");
            }
        }
        Commands::ReleaseStale {
            source,
            timeout_secs,
            db,
        } => {
            let cfg = base.with_database_url(db.db_url.as_deref());
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(cfg.claim_timeout);
            let pool = open(&cfg).await?;
            let released = release_stale(&pool, source, timeout).await?;
            println!("released {released} stale claims for source {source}");
        }
        Commands::ImportRaw { source, file, db } => {
            let cfg = base.with_database_url(db.db_url.as_deref());
            let pool = open(&cfg).await?;
            let summary = import_ndjson(&pool, source, &file).await?;
            println!(
                "imported {} (duplicates {}, invalid lines {}) from {}",
                summary.inserted,
                summary.duplicates,
                summary.invalid_lines,
                file.display()
            );
        }
        Commands::Status { source, db } => {
            let cfg = base.with_database_url(db.db_url.as_deref());
            let pool = open(&cfg).await?;
            feed_normalizer::cli::status::run(&pool, source).await?;
        }
    }
    Ok(())
}
