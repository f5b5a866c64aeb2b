//! ibcindex CLI: run the multi-chain IBC indexer and inspect its state.
//!
//! # Commands
//! ```bash
//! ibcindex run          --config ibcindex.yaml
//! ibcindex status       --config ibcindex.yaml [--json]
//! ibcindex stats        --config ibcindex.yaml [--full]
//! ibcindex reset        --config ibcindex.yaml --chain osmosis-1
//! ibcindex check-config --config ibcindex.yaml
//! ibcindex info
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ibcindex_core::checkpoint::{CheckpointManager, CheckpointStore};
use ibcindex_core::config::{load_config, IbcIndexConfig, StoreBackend};
use ibcindex_core::logging::init_tracing;
use ibcindex_core::status;
use ibcindex_core::{EventSink, Pipeline, ReadModelStore, StatisticsAggregator};
use ibcindex_cosmos::Supervisor;
use ibcindex_storage::{InMemoryStorage, SqliteStorage};

#[derive(Parser)]
#[command(
    name = "ibcindex",
    about = "Multi-chain IBC indexer: ibcindex CLI",
    long_about = "
ibcindex follows CometBFT chains, normalizes their IBC events and keeps a
cross-chain read model of clients, connections, channels, packets and
transfers.

ENVIRONMENT VARIABLES:
  RUST_LOG    Overrides the log filter from the config file
",
    version
)]
struct Cli {
    /// Path to the YAML configuration
    #[arg(short, long, global = true, default_value = "ibcindex.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index every enabled chain until interrupted
    Run,

    /// Show per-chain progress and the health check
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Refresh the statistics rollups and print them
    Stats {
        /// Recompute from scratch instead of folding in new rows
        #[arg(long)]
        full: bool,
    },

    /// Forget a chain's checkpoint so it restarts at `start_height`
    Reset {
        #[arg(long)]
        chain: String,
    },

    /// Validate the configuration file
    #[command(name = "check-config")]
    CheckConfig,

    /// Show ibcindex build and capability info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::CheckConfig => cmd_check_config(&cli.config),
        command => {
            let config = load_config(&cli.config)
                .with_context(|| format!("loading config '{}'", cli.config))?;
            init_tracing(&config.log).context("initialising logging")?;
            let stores = open_stores(&config).await?;
            match command {
                Commands::Run => cmd_run(config, stores).await,
                Commands::Status { json } => cmd_status(&config, stores, json).await,
                Commands::Stats { full } => cmd_stats(stores, full).await,
                Commands::Reset { chain } => cmd_reset(&config, stores, &chain).await,
                Commands::Info | Commands::CheckConfig => Ok(()),
            }
        }
    }
}

// ─── Storage ─────────────────────────────────────────────────────────────────

struct Stores {
    read_model: Arc<dyn ReadModelStore>,
    checkpoints: Arc<dyn CheckpointStore>,
}

async fn open_stores(config: &IbcIndexConfig) -> Result<Stores> {
    let stores = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(InMemoryStorage::new());
            Stores {
                read_model: store.clone(),
                checkpoints: store,
            }
        }
        StoreBackend::Sqlite => {
            let path = config
                .store
                .path
                .as_deref()
                .context("store.path is required for the sqlite backend")?;
            let store = Arc::new(
                SqliteStorage::open(path)
                    .await
                    .with_context(|| format!("opening sqlite database '{path}'"))?,
            );
            Stores {
                read_model: store.clone(),
                checkpoints: store,
            }
        }
    };

    for chain in &config.chains {
        stores
            .read_model
            .upsert_chain(chain.chain_row())
            .await
            .with_context(|| format!("registering chain {}", chain.chain_id))?;
    }
    Ok(stores)
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_run(config: IbcIndexConfig, stores: Stores) -> Result<()> {
    let cancel = CancellationToken::new();

    let pipeline = Arc::new(Pipeline::spawn(
        stores.read_model.clone(),
        config.topology_overrides(),
        &config.indexer,
        CancellationToken::new(),
    ));
    let sink: Arc<dyn EventSink> = pipeline.clone();

    let supervisor = Supervisor::spawn_http(
        &config,
        sink,
        stores.read_model.clone(),
        stores.checkpoints.clone(),
        cancel.clone(),
    )
    .context("starting chain watchers")?;

    let stats = tokio::spawn(StatisticsAggregator::new(stores.read_model.clone()).run(
        Duration::from_secs(config.indexer.statistics_interval_secs),
        cancel.clone(),
    ));

    tracing::info!(
        chains = ?supervisor.chain_ids(),
        shards = pipeline.shard_count(),
        backend = ?config.store.backend,
        "ibcindex running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    // Watchers first, so their last blocks reach the pipeline before it stops.
    supervisor.shutdown().await;
    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline.shutdown().await,
        Err(_) => tracing::warn!("pipeline still referenced, workers left running"),
    }
    if let Err(e) = stats.await {
        tracing::warn!(error = %e, "statistics task panicked");
    }
    Ok(())
}

async fn cmd_status(config: &IbcIndexConfig, stores: Stores, as_json: bool) -> Result<()> {
    let chains = config.enabled_chain_ids();
    let health = status::health_check(
        stores.read_model.clone(),
        &chains,
        config.indexer.health_policy(),
        Utc::now(),
    )
    .await?;
    let rows = stores.read_model.list_index_status().await?;

    if as_json {
        let out = serde_json::json!({ "health": health, "chains": rows });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Health: {:?}", health.status);
    println!("Open anomalies: {}", health.open_anomalies);
    println!();
    println!("{:24} {:>12} {:>10} {:12} {}", "CHAIN", "HEIGHT", "AGE (s)", "STATE", "ERROR");
    for chain in &health.chains {
        let row = rows.iter().find(|r| r.chain_id == chain.chain_id);
        println!(
            "{:24} {:>12} {:>10} {:12} {}",
            chain.chain_id,
            row.map_or("-".to_string(), |r| r.last_height.to_string()),
            chain.tip_age_secs.map_or("-".to_string(), |a| a.to_string()),
            chain.state.map_or("-".to_string(), |s| format!("{s:?}").to_lowercase()),
            row.and_then(|r| r.last_error.as_deref()).unwrap_or(""),
        );
    }
    Ok(())
}

async fn cmd_stats(stores: Stores, full: bool) -> Result<()> {
    let aggregator = StatisticsAggregator::new(stores.read_model);
    let snapshot = if full {
        aggregator.rebuild().await?
    } else {
        aggregator.refresh().await?
    };
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn cmd_reset(config: &IbcIndexConfig, stores: Stores, chain: &str) -> Result<()> {
    if !config.chains.iter().any(|c| c.chain_id == chain) {
        anyhow::bail!("chain '{chain}' is not configured");
    }
    CheckpointManager::new(stores.checkpoints, chain, &config.indexer.id, 1)
        .reset()
        .await
        .with_context(|| format!("deleting checkpoint of {chain}"))?;
    println!("Checkpoint of {chain} deleted; it restarts from its start_height.");
    Ok(())
}

fn cmd_check_config(path: &str) -> Result<()> {
    let config = load_config(path).with_context(|| format!("loading config '{path}'"))?;
    println!("✓ {path} is valid");
    println!("  Store:   {:?}", config.store.backend);
    println!("  Shards:  {}", config.indexer.shards);
    println!("  Chains:");
    for chain in &config.chains {
        println!(
            "    {:24} {:8} start={} confirmations={} {}",
            chain.chain_id,
            if chain.enabled { "enabled" } else { "disabled" },
            chain.start_height,
            chain.confirmations,
            chain.rpc_url,
        );
    }
    Ok(())
}

fn cmd_info() -> Result<()> {
    println!("ibcindex v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Capabilities:");
    println!("  ✓ IBC classic events        (send/recv/write_ack/ack/timeout, handshakes, clients)");
    println!("  ✓ Union wasm events         (wasm-* event family)");
    println!("  ✓ Packet lifecycle          (out-of-order buffering, proof-checked timeouts)");
    println!("  ✓ Packet forwarding         (multi-hop transfer routes)");
    println!("  ✓ Light-client tracking     (tips, regressions)");
    println!("  ✓ Statistics                (daily and per-address rollups)");
    println!();
    println!("Storage backends:             memory, SQLite");
    println!("Chain source:                 CometBFT RPC (status, block, block_results)");
    Ok(())
}
