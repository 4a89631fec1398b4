//! txiter-daemon - redundant broadcast-transaction iterator.
//!
//! One binary, several entry points:
//!
//! - `iterator`: runs one iterator process from the `[iterator]` config
//!   section, serving status and control over HTTP.
//! - `supervisor`: polls every configured iterator, terminates redundant
//!   leaders and records checkpoints.
//! - `dump`, `checkpoints`, `status`: operator tools for inspecting a digest
//!   store, the checkpoint database and a running iterator.
//!
//! `main` stays synchronous and builds the Tokio runtime itself so logging is
//! configured before any worker thread starts.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use txiter_core::checkpoint::SqliteCheckpointStore;
use txiter_core::runtime::ExitReason;
use txiter_core::store::{scan, DEFAULT_SCAN_PAGE};
use txiter_core::{CheckpointStore, IteratorStatus, SeqNum, SqliteDigestStore, TxiterConfig};
use txiter_daemon::{iterator, shutdown_signal, supervisor};

/// txiter - redundant broadcast-transaction iterator
#[derive(Parser, Debug)]
#[command(name = "txiter-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "txiter.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (logs to stdout if not set)
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one iterator process
    Iterator {
        /// Start here, ignoring both the checkpoint and the configured origin
        #[arg(long)]
        start_seq: Option<SeqNum>,
    },

    /// Run the supervisor
    Supervisor,

    /// Print stored digests for an entity
    Dump {
        /// Digest store database
        #[arg(long)]
        store: PathBuf,

        /// Entity whose digests to print
        #[arg(long)]
        entity: String,

        /// First seq# to print
        #[arg(long, default_value_t = 0)]
        from: SeqNum,

        /// Stop after this many entries
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print recorded checkpoints
    Checkpoints {
        /// Checkpoint database
        #[arg(long)]
        db: PathBuf,
    },

    /// Query a running iterator's status
    Status {
        /// Base URL of the iterator HTTP server
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

async fn async_main(args: Args) -> Result<()> {
    match args.command {
        Command::Iterator { start_seq } => run_iterator(&args.config, start_seq).await,
        Command::Supervisor => run_supervisor(&args.config).await,
        Command::Dump {
            store,
            entity,
            from,
            limit,
        } => dump(&store, &entity, from, limit).await,
        Command::Checkpoints { db } => checkpoints(&db).await,
        Command::Status { url } => status(&url).await,
    }
}

fn load_config(path: &std::path::Path) -> Result<TxiterConfig> {
    TxiterConfig::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

async fn run_iterator(config_path: &std::path::Path, start_seq: Option<SeqNum>) -> Result<()> {
    let config = load_config(config_path)?
        .iterator
        .context("config has no [iterator] section")?;

    let running = iterator::start(&config, start_seq, None).await?;
    let handle = running.handle.clone();
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        handle.terminate().await;
    });

    let exit = running.wait().await;
    signals.abort();
    match exit? {
        ExitReason::Terminated => info!("Iterator terminated"),
        ExitReason::HandlesDropped => warn!("Iterator stopped: all control handles dropped"),
    }
    Ok(())
}

async fn run_supervisor(config_path: &std::path::Path) -> Result<()> {
    let config = load_config(config_path)?
        .supervisor
        .context("config has no [supervisor] section")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    supervisor::run(&config, shutdown_rx).await?;
    info!("Supervisor stopped");
    Ok(())
}

async fn dump(
    store: &std::path::Path,
    entity: &str,
    from: SeqNum,
    limit: Option<usize>,
) -> Result<()> {
    let store = SqliteDigestStore::open(store)
        .with_context(|| format!("failed to open digest store {}", store.display()))?;
    let entries = scan(&store, entity, from, DEFAULT_SCAN_PAGE);
    futures::pin_mut!(entries);

    let mut stdout = std::io::stdout().lock();
    let mut printed = 0usize;
    while let Some(entry) = entries.try_next().await.context("failed to read digest store")? {
        if limit.is_some_and(|limit| printed >= limit) {
            break;
        }
        writeln!(stdout, "{}\t{}", entry.seq, entry.digest)?;
        printed += 1;
    }
    Ok(())
}

async fn checkpoints(db: &std::path::Path) -> Result<()> {
    let store = SqliteCheckpointStore::open(db)
        .with_context(|| format!("failed to open checkpoint db {}", db.display()))?;
    let mut stdout = std::io::stdout().lock();
    for checkpoint in store.list().await.context("failed to list checkpoints")? {
        writeln!(
            stdout,
            "{}\t{}\t{}",
            checkpoint.iterator_id,
            checkpoint.seq,
            checkpoint.recorded_at.to_rfc3339()
        )?;
    }
    Ok(())
}

async fn status(url: &str) -> Result<()> {
    let url = format!("{}/status", url.trim_end_matches('/'));
    let status: IteratorStatus = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()
        .context("iterator rejected the status request")?
        .json()
        .await
        .context("malformed status response")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("failed to render status")?
    );
    Ok(())
}
