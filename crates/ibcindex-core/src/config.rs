//! YAML configuration: chains to index, storage, pipeline tuning, logging.
//!
//! ```yaml
//! store: { backend: sqlite, path: ./ibcindex.db }
//! indexer: { shards: 4, pending_ttl_secs: 600 }
//! chains:
//!   - chain_id: osmosis-1
//!     rpc_url: https://rpc.osmosis.zone
//!     client_counterparties: { 07-tendermint-1: union-testnet-9 }
//! ```
//!
//! Unknown fields are rejected; [`IbcIndexConfig::validate`] runs after
//! every load.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, Result};
use crate::logging::LogConfig;
use crate::model::{AssetRow, ChainRow, ExplorerRow, RpcRow};
use crate::status::HealthPolicy;
use crate::topology::TopologyOverrides;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IbcIndexConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database file for the `sqlite` backend.
    #[serde(default)]
    pub path: Option<String>,
}

/// Pipeline tuning shared by every chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexerConfig {
    /// Unique name for this indexer (used for checkpoint keys).
    #[serde(default = "IndexerConfig::default_id")]
    pub id: String,
    /// Number of packet workers.
    #[serde(default = "IndexerConfig::default_shards")]
    pub shards: usize,
    /// How long a buffered event may wait for its predecessor.
    #[serde(default = "IndexerConfig::default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
    /// Capacity of each pending buffer.
    #[serde(default = "IndexerConfig::default_pending_capacity")]
    pub pending_capacity: usize,
    #[serde(default = "IndexerConfig::default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "IndexerConfig::default_statistics_interval_secs")]
    pub statistics_interval_secs: u64,
    /// A chain whose tip is older than this is reported as lagging.
    #[serde(default = "IndexerConfig::default_max_tip_age_secs")]
    pub max_tip_age_secs: u64,
    /// Anomalies younger than this count as open in the health check.
    #[serde(default = "IndexerConfig::default_anomaly_window_secs")]
    pub anomaly_window_secs: u64,
    /// Save a checkpoint every N blocks.
    #[serde(default = "IndexerConfig::default_checkpoint_interval")]
    pub checkpoint_interval: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: Self::default_id(),
            shards: Self::default_shards(),
            pending_ttl_secs: Self::default_pending_ttl_secs(),
            pending_capacity: Self::default_pending_capacity(),
            sweep_interval_ms: Self::default_sweep_interval_ms(),
            statistics_interval_secs: Self::default_statistics_interval_secs(),
            max_tip_age_secs: Self::default_max_tip_age_secs(),
            anomaly_window_secs: Self::default_anomaly_window_secs(),
            checkpoint_interval: Self::default_checkpoint_interval(),
        }
    }
}

impl IndexerConfig {
    fn default_id() -> String {
        "ibcindex".to_string()
    }

    const fn default_shards() -> usize {
        4
    }

    const fn default_pending_ttl_secs() -> u64 {
        600
    }

    const fn default_pending_capacity() -> usize {
        10_000
    }

    const fn default_sweep_interval_ms() -> u64 {
        1_000
    }

    const fn default_statistics_interval_secs() -> u64 {
        60
    }

    const fn default_max_tip_age_secs() -> u64 {
        120
    }

    const fn default_anomaly_window_secs() -> u64 {
        3_600
    }

    const fn default_checkpoint_interval() -> u64 {
        10
    }

    pub fn pending_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_ttl_secs as i64)
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            max_tip_age_secs: self.max_tip_age_secs as i64,
            anomaly_window_secs: self.anomaly_window_secs as i64,
        }
    }
}

/// Backoff for a chain's RPC calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RetryConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "RetryConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    const fn default_max_retries() -> u32 {
        5
    }

    const fn default_initial_backoff_ms() -> u64 {
        500
    }

    const fn default_max_backoff_ms() -> u64 {
        30_000
    }
}

/// One chain to index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub chain_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// CometBFT RPC endpoint.
    #[serde(default)]
    pub rpc_url: String,
    /// First height to index when no checkpoint exists.
    #[serde(default = "ChainConfig::default_start_height")]
    pub start_height: u64,
    /// Blocks to stay behind the head.
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default = "ChainConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Client id → the chain it tracks, for clients created before `start_height`.
    #[serde(default)]
    pub client_counterparties: BTreeMap<String, String>,
    /// `"port/channel"` (or a bare union channel id) → counterparty chain.
    #[serde(default)]
    pub channel_counterparties: BTreeMap<String, String>,
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
    #[serde(default)]
    pub explorers: Vec<ExplorerConfig>,
}

fn default_true() -> bool {
    true
}

impl ChainConfig {
    const fn default_start_height() -> u64 {
        1
    }

    const fn default_poll_interval_ms() -> u64 {
        2_000
    }

    /// The chain's row in the read model.
    pub fn chain_row(&self) -> ChainRow {
        ChainRow {
            chain_id: self.chain_id.clone(),
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| self.chain_id.clone()),
            testnet: self.testnet,
            enabled: self.enabled,
            assets: self
                .assets
                .iter()
                .map(|a| AssetRow {
                    denom: a.denom.clone(),
                    symbol: a.symbol.clone(),
                    decimals: a.decimals,
                })
                .collect(),
            explorers: self
                .explorers
                .iter()
                .map(|e| ExplorerRow {
                    home_url: e.home_url.clone(),
                    tx_url: e.tx_url.clone(),
                    block_url: e.block_url.clone(),
                })
                .collect(),
            rpcs: if self.rpc_url.is_empty() {
                Vec::new()
            } else {
                vec![RpcRow {
                    url: self.rpc_url.clone(),
                    kind: "rpc".into(),
                }]
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetConfig {
    pub denom: String,
    pub symbol: String,
    #[serde(default)]
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExplorerConfig {
    pub home_url: String,
    #[serde(default)]
    pub tx_url: String,
    #[serde(default)]
    pub block_url: String,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and validate configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<IbcIndexConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| IndexerError::Config(format!("cannot read {}: {e}", path.display())))?;
    load_config_from_str(&content, &path.display().to_string())
}

/// Load and validate configuration from a YAML string.
pub fn load_config_from_str(content: &str, source_name: &str) -> Result<IbcIndexConfig> {
    let config: IbcIndexConfig = serde_yaml::from_str(content)
        .map_err(|e| IndexerError::Config(format!("{source_name}: {e}")))?;
    config.validate()?;
    Ok(config)
}

impl IbcIndexConfig {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.chains.is_empty() {
            errors.push("at least one chain must be configured".to_string());
        }
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if chain.chain_id.trim().is_empty() {
                errors.push("chain_id must not be empty".to_string());
            } else if !seen.insert(chain.chain_id.as_str()) {
                errors.push(format!("duplicate chain_id {}", chain.chain_id));
            }
            if chain.enabled && chain.rpc_url.trim().is_empty() {
                errors.push(format!("{}: rpc_url is required for enabled chains", chain.chain_id));
            }
            if chain.retry.initial_backoff_ms > chain.retry.max_backoff_ms {
                errors.push(format!(
                    "{}: retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
                    chain.chain_id
                ));
            }
            if chain.poll_interval_ms == 0 {
                errors.push(format!("{}: poll_interval_ms must be positive", chain.chain_id));
            }
        }

        let indexer = &self.indexer;
        if indexer.shards == 0 {
            errors.push("indexer.shards must be at least 1".to_string());
        }
        if indexer.pending_ttl_secs == 0 {
            errors.push("indexer.pending_ttl_secs must be positive".to_string());
        }
        if indexer.pending_capacity == 0 {
            errors.push("indexer.pending_capacity must be positive".to_string());
        }
        if indexer.sweep_interval_ms == 0 || indexer.statistics_interval_secs == 0 {
            errors.push("indexer intervals must be positive".to_string());
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_none() {
            errors.push("store.path is required for the sqlite backend".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(IndexerError::Config(errors.join("; ")))
        }
    }

    pub fn enabled_chains(&self) -> impl Iterator<Item = &ChainConfig> {
        self.chains.iter().filter(|c| c.enabled)
    }

    pub fn enabled_chain_ids(&self) -> Vec<String> {
        self.enabled_chains().map(|c| c.chain_id.clone()).collect()
    }

    /// Configured topology facts for the trackers.
    pub fn topology_overrides(&self) -> TopologyOverrides {
        let mut overrides = TopologyOverrides {
            indexed_chains: self.enabled_chain_ids().into_iter().collect(),
            ..Default::default()
        };
        for chain in &self.chains {
            for (client_id, counterparty) in &chain.client_counterparties {
                overrides.clients.insert(
                    (chain.chain_id.clone(), client_id.clone()),
                    counterparty.clone(),
                );
            }
            for (end, counterparty) in &chain.channel_counterparties {
                let (port, channel) = end.split_once('/').unwrap_or(("", end.as_str()));
                overrides.channels.insert(
                    (chain.chain_id.clone(), port.to_string(), channel.to_string()),
                    counterparty.clone(),
                );
            }
        }
        overrides
    }
}
