//! LedgerIndex CLI — run, backfill, replay and inspect a transfer index.
//!
//! # Commands
//! ```text
//! ledgerindex run       --config <file> --address <0x..>...
//! ledgerindex backfill  --config <file> --address <0x..>... --from N --to M
//! ledgerindex replay    --config <file> --from N --to M
//! ledgerindex status    --config <file>
//! ledgerindex events    --config <file> [--tx <hash>] [--from N --to M]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use ledgerindex_core::store::IndexStore;
use ledgerindex_evm::{source_config, EvmChainSource, HttpEvmClient, Indexer};
use ledgerindex_storage::{MemoryCache, MemoryStore, PostgresStorage, SqliteStorage};

mod settings;
mod tracing_setup;

use settings::{Database, Settings};

#[derive(Parser)]
#[command(
    name = "ledgerindex",
    about = "Reorg-aware ERC-721 / ERC-20 transfer indexer",
    long_about = "
LedgerIndex: index NFT and token Transfer events into SQLite or Postgres,
resume from a durable checkpoint, and roll back on chain reorganizations.

ENVIRONMENT VARIABLES:
  LEDGERINDEX_RPC_URL        JSON-RPC endpoint (overrides the config file)
  LEDGERINDEX_DATABASE_URL   sqlite:<path>, postgres://… or memory:
  LEDGERINDEX_LOG            default log level (RUST_LOG takes precedence)
",
    version
)]
struct Cli {
    /// JSON settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL; overrides the config file and environment
    #[arg(long, global = true)]
    database: Option<String>,

    /// JSON-RPC endpoint; overrides the config file and environment
    #[arg(long, global = true)]
    rpc_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resume from the checkpoint and follow the chain until Ctrl-C
    Run {
        /// Contract to index (repeatable; defaults to the configured list)
        #[arg(long = "address")]
        addresses: Vec<String>,
    },

    /// Index a fixed block range without moving the checkpoint
    Backfill {
        #[arg(long = "address")]
        addresses: Vec<String>,
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },

    /// Re-process a block range for the configured contracts
    Replay {
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },

    /// Print checkpoint and index statistics
    Status,

    /// Print indexed events as JSON
    Events {
        /// Look up one event by transaction hash
        #[arg(long, conflicts_with_all = ["from", "to", "block"])]
        tx: Option<String>,
        #[arg(long, requires = "to")]
        from: Option<u64>,
        #[arg(long, requires = "from")]
        to: Option<u64>,
        /// All events of a single block
        #[arg(long, conflicts_with_all = ["from", "to"])]
        block: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(url) = cli.database {
        settings.database_url = url;
    }
    if let Some(url) = cli.rpc_url {
        settings.rpc_url = url;
    }
    if cli.json_logs {
        settings.log.json = true;
    }
    tracing_setup::init_tracing(&settings.log)?;

    match Database::parse(&settings.database_url)? {
        Database::Sqlite(path) => {
            let store = SqliteStorage::open(&path)
                .await
                .with_context(|| format!("opening sqlite database {path}"))?;
            run_with_store(Arc::new(store), &settings, cli.command).await
        }
        Database::Postgres(url) => {
            let store = PostgresStorage::connect(&url)
                .await
                .context("connecting to postgres")?;
            run_with_store(Arc::new(store), &settings, cli.command).await
        }
        Database::Memory => {
            tracing::warn!("Using the in-memory store; nothing will be persisted");
            run_with_store(Arc::new(MemoryStore::new()), &settings, cli.command).await
        }
    }
}

async fn run_with_store<S: IndexStore + 'static>(
    store: Arc<S>,
    settings: &Settings,
    command: Commands,
) -> Result<()> {
    let client = HttpEvmClient::default_for(settings.rpc_url.clone())?;
    let source = Arc::new(EvmChainSource::new(client, source_config(&settings.indexer)));
    let indexer = Indexer::new(
        settings.indexer.clone(),
        source,
        store,
        Arc::new(MemoryCache::new()),
    )?;

    let result = match command {
        Commands::Run { addresses } => cmd_run(&indexer, &addresses).await,
        Commands::Backfill { addresses, from, to } => {
            cmd_backfill(&indexer, &addresses, from, to).await
        }
        Commands::Replay { from, to } => cmd_replay(&indexer, from, to).await,
        Commands::Status => cmd_status(&indexer).await,
        Commands::Events { tx, from, to, block } => {
            cmd_events(&indexer, tx.as_deref(), from.zip(to), block).await
        }
    };

    if let Err(e) = indexer.shutdown().await {
        tracing::warn!(error = %e, "Shutdown did not complete cleanly");
    }
    result
}

async fn cmd_run(indexer: &Indexer, addresses: &[String]) -> Result<()> {
    indexer.start_indexing(addresses).await?;
    tracing::info!(
        contracts = indexer.watched_addresses().len(),
        "Indexing; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Ctrl-C received, shutting down");

    let metrics = indexer.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    if let Some(reason) = indexer.halt_reason() {
        anyhow::bail!("indexer halted: {reason}");
    }
    Ok(())
}

async fn cmd_backfill(indexer: &Indexer, addresses: &[String], from: u64, to: u64) -> Result<()> {
    let addresses = if addresses.is_empty() {
        indexer.watched_addresses()
    } else {
        addresses.to_vec()
    };
    indexer
        .process_historical_events(&addresses, from, to)
        .await?;

    let metrics = indexer.metrics();
    println!(
        "Backfilled blocks {from}..={to}: {} event(s) written, {} duplicate(s) skipped",
        metrics.events_flushed, metrics.duplicates_skipped
    );
    Ok(())
}

async fn cmd_replay(indexer: &Indexer, from: u64, to: u64) -> Result<()> {
    indexer.replay_events(from, to).await?;
    println!(
        "Replayed blocks {from}..={to}; checkpoint at {}",
        indexer.get_last_processed_block().await?
    );
    Ok(())
}

async fn cmd_status(indexer: &Indexer) -> Result<()> {
    let stats = indexer.get_stats().await?;
    let status = json!({
        "chain_id": indexer.config().chain_id,
        "contracts": indexer.watched_addresses(),
        "last_processed_block": indexer.get_last_processed_block().await?,
        "latest_indexed_block": indexer.get_latest_indexed_block().await?,
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_events(
    indexer: &Indexer,
    tx: Option<&str>,
    range: Option<(u64, u64)>,
    block: Option<u64>,
) -> Result<()> {
    let events = match (tx, range, block) {
        (Some(tx), _, _) => indexer.get_event_by_tx_hash(tx).await?.into_iter().collect(),
        (None, Some((from, to)), _) => indexer.get_events_by_block_range(from, to).await?,
        (None, None, Some(block)) => indexer.get_events_by_block_number(block).await?,
        (None, None, None) => indexer.get_events(&Default::default()).await?,
    };
    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_repeated_addresses() {
        let cli = Cli::try_parse_from([
            "ledgerindex",
            "backfill",
            "--address",
            "0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d",
            "--address",
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
            "--from",
            "100",
            "--to",
            "200",
        ])
        .unwrap();
        match cli.command {
            Commands::Backfill { addresses, from, to } => {
                assert_eq!(addresses.len(), 2);
                assert_eq!((from, to), (100, 200));
            }
            _ => panic!("expected backfill"),
        }
    }

    #[test]
    fn events_rejects_tx_with_range() {
        let parsed = Cli::try_parse_from([
            "ledgerindex", "events", "--tx", "0xabc", "--from", "1", "--to", "2",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "ledgerindex", "status", "--config", "index.json", "--database", "memory:",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("index.json")));
        assert_eq!(cli.database.as_deref(), Some("memory:"));
    }
}
