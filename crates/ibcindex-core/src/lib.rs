//! ibcindex-core: canonical IBC events and the trackers that turn them into a
//! cross-chain read model.
//!
//! # Architecture
//!
//! ```text
//! ChainWatcher (per chain) ──RawBlock──▶ EventSink (Pipeline | SharedIndexer)
//!                                          ├── Normalizer          (ABCI → CanonicalEvent)
//!                                          ├── LightClientTracker  (client tips, regressions)
//!                                          ├── HandshakeTracker    (connections, channels)
//!                                          ├── PacketTracker       (packet lifecycle)
//!                                          │     └── ForwardCorrelator (multi-hop transfers)
//!                                          └── ReadModelStore      (memory / SQLite)
//!
//! StatisticsAggregator ── reads the store, writes daily / per-address rollups
//! ```

pub mod address;
pub mod anomaly;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod forward;
pub mod handshake;
pub mod indexer;
pub mod lightclient;
pub mod logging;
pub mod model;
pub mod normalizer;
pub mod packet;
pub mod payload;
pub mod pending;
pub mod pipeline;
pub mod stats;
pub mod status;
pub mod store;
pub mod topology;
pub mod types;

pub use anomaly::{Anomaly, AnomalyKind};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore};
pub use config::{load_config, IbcIndexConfig};
pub use error::IndexerError;
pub use event::{AbciEvent, CanonicalEvent, EventKind, RawBlock, RawTx};
pub use indexer::{EventSink, Indexer, SharedIndexer, TrackerSettings};
pub use normalizer::Normalizer;
pub use pipeline::Pipeline;
pub use stats::StatisticsAggregator;
pub use store::ReadModelStore;
pub use topology::TopologyOverrides;
pub use types::{ChannelKey, ClientKey, ConnectionKey, Height, IbcVersion, PacketKey, PacketStatus};
