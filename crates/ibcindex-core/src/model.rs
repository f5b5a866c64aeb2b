//! Read-model rows.
//!
//! These are the entities the query layer serves. Rows are plain serde
//! structs; backends decide how to lay them out.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::HandshakeStep;
use crate::payload::{AckSummary, FillType, ForwardInstruction};
use crate::types::{
    ChannelKey, ChannelStatus, ClientKey, ConnectionKey, ConnectionStatus, EventRef, Height,
    IbcVersion, PacketKey, PacketStatus,
};

// ─── Chains ──────────────────────────────────────────────────────────────────

/// A chain and its metadata. Identity is immutable; metadata is re-synced
/// from configuration on every start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRow {
    pub chain_id: String,
    pub display_name: String,
    pub testnet: bool,
    pub enabled: bool,
    pub assets: Vec<AssetRow>,
    pub explorers: Vec<ExplorerRow>,
    pub rpcs: Vec<RpcRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRow {
    pub denom: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerRow {
    pub home_url: String,
    pub tx_url: String,
    pub block_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRow {
    pub url: String,
    /// e.g. `"rpc"` for CometBFT RPC.
    pub kind: String,
}

// ─── Clients ─────────────────────────────────────────────────────────────────

/// A light client hosted on `key.chain_id` that tracks `counterparty_chain_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRow {
    pub key: ClientKey,
    pub client_type: String,
    pub counterparty_chain_id: Option<String>,
    pub initial_height: Height,
    pub created_at: EventRef,
    /// Set once misbehaviour has been submitted for this client.
    pub frozen: bool,
    /// Substitute client that recovered this one, if any.
    pub substituted_by: Option<String>,
}

/// The highest applied consensus height of a client; the time oracle for
/// packet timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTipRow {
    pub key: ClientKey,
    pub height: Height,
    /// Counterparty consensus time at `height`, ns since epoch.
    pub timestamp_ns: Option<u64>,
    pub updated_at: EventRef,
}

/// One entry of the append-only light-client update log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightClientUpdateRow {
    pub key: ClientKey,
    pub height: Height,
    pub revision_height: u64,
    pub execution_height: Option<u64>,
    pub timestamp_ns: Option<u64>,
    /// Written by a recover/upgrade event; allowed to move the tip backwards.
    pub recovery: bool,
    pub event: EventRef,
}

// ─── Handshakes ──────────────────────────────────────────────────────────────

/// One end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRow {
    pub key: ConnectionKey,
    pub client_id: String,
    pub counterparty_chain_id: Option<String>,
    pub counterparty_client_id: String,
    pub counterparty_connection_id: Option<String>,
    pub status: ConnectionStatus,
    pub created_at: EventRef,
    pub updated_at: EventRef,
}

/// One end of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub key: ChannelKey,
    pub connection_id: String,
    pub counterparty_chain_id: Option<String>,
    pub counterparty_port_id: String,
    pub counterparty_channel_id: Option<String>,
    pub version: Option<String>,
    pub status: ChannelStatus,
    pub created_at: EventRef,
    pub updated_at: EventRef,
}

impl ChannelRow {
    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey::new(self.key.ibc, self.key.chain_id.clone(), self.connection_id.clone())
    }
}

/// The entity a handshake step belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum HandshakeEntity {
    Connection(ConnectionKey),
    Channel(ChannelKey),
}

impl HandshakeEntity {
    pub fn ibc(&self) -> IbcVersion {
        match self {
            Self::Connection(k) => k.ibc,
            Self::Channel(k) => k.ibc,
        }
    }

    pub fn chain_id(&self) -> &str {
        match self {
            Self::Connection(k) => &k.chain_id,
            Self::Channel(k) => &k.chain_id,
        }
    }
}

impl std::fmt::Display for HandshakeEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(k) => write!(f, "connection {k}"),
            Self::Channel(k) => write!(f, "channel {k}"),
        }
    }
}

/// A handshake sub-event. Unique per `(entity, step)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeEventRow {
    pub entity: HandshakeEntity,
    pub step: HandshakeStep,
    pub event: EventRef,
}

// ─── Packets ─────────────────────────────────────────────────────────────────

/// The send half of a packet; always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSource {
    pub event: EventRef,
    pub timeout_height: Height,
    /// ns since epoch; zero when unset.
    pub timeout_timestamp: u64,
    pub data_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRow {
    pub key: PacketKey,
    pub destination_chain_id: Option<String>,
    pub destination_port_id: String,
    pub destination_channel_id: String,
    pub source: PacketSource,
    /// The recv event on the destination chain.
    pub destination: Option<EventRef>,
    pub write_ack: Option<EventRef>,
    pub acknowledgement_hex: Option<String>,
    pub ack: Option<AckSummary>,
    /// The ack or timeout event on the source chain.
    pub resolution: Option<EventRef>,
    pub status: PacketStatus,
    /// Optimistic-concurrency revision, bumped by the store on each write.
    pub revision: u64,
    /// Store-wide change counter at the last write.
    pub write_seq: u64,
    /// Store-wide change counter at insertion.
    pub created_seq: u64,
}

impl PacketRow {
    /// A fresh `SENT` row. Revision and sequence numbers are assigned by the store.
    pub fn sent(
        key: PacketKey,
        destination_chain_id: Option<String>,
        destination_port_id: impl Into<String>,
        destination_channel_id: impl Into<String>,
        source: PacketSource,
    ) -> Self {
        Self {
            key,
            destination_chain_id,
            destination_port_id: destination_port_id.into(),
            destination_channel_id: destination_channel_id.into(),
            source,
            destination: None,
            write_ack: None,
            acknowledgement_hex: None,
            ack: None,
            resolution: None,
            status: PacketStatus::Sent,
            revision: 0,
            write_seq: 0,
            created_seq: 0,
        }
    }

    /// UTC day of the send.
    pub fn day(&self) -> NaiveDate {
        self.source.event.timestamp.date_naive()
    }
}

/// What a packet effect records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EffectKind {
    Send,
    Recv,
    WriteAck,
    Ack,
    Timeout,
}

/// One on-chain event attributable to a packet (`traces`).
/// Unique per `(key, event.event_id())`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketEffectRow {
    pub key: PacketKey,
    pub kind: EffectKind,
    pub event: EventRef,
}

// ─── Transfers ───────────────────────────────────────────────────────────────

/// Position of a forwarded transfer in a multi-hop route.
///
/// `(root, hop_index)` identifies a hop; re-sends of the same hop after a
/// failed attempt share it and carry an increasing `retries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopLink {
    pub root: PacketKey,
    pub parent: PacketKey,
    pub hop_index: u32,
    pub retries: u32,
}

/// A packet whose payload decodes as an ICS-20 fungible transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRow {
    pub key: PacketKey,
    pub sender: String,
    pub sender_normalized: String,
    pub receiver: String,
    pub receiver_normalized: String,
    pub denom: String,
    pub amount: String,
    pub memo: String,
    pub packet_data: Value,
    pub forward: Option<ForwardInstruction>,
    pub hop: Option<HopLink>,
    pub destination_chain_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub write_seq: u64,
    pub created_seq: u64,
}

impl TransferRow {
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// A union fungible asset order and what its acknowledgement reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FungibleAssetOrderRow {
    pub key: PacketKey,
    pub sender: String,
    pub sender_normalized: String,
    pub receiver: String,
    pub receiver_normalized: String,
    pub base_token: String,
    pub base_amount: String,
    pub base_token_symbol: Option<String>,
    pub base_token_name: Option<String>,
    pub base_token_decimals: Option<u8>,
    pub base_token_path: Option<String>,
    pub quote_token: String,
    pub quote_amount: String,
    pub instruction: Value,
    pub ack_success: Option<bool>,
    pub ack_fill_type: Option<FillType>,
    pub ack_market_maker: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ─── Statistics ──────────────────────────────────────────────────────────────

/// `(day, count)` for daily packet and transfer rollups.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DailyCountRow {
    pub day: NaiveDate,
    pub count: u64,
}

/// Global totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsRow {
    pub packets: u64,
    pub transfers: u64,
    pub sent: u64,
    pub received: u64,
    pub acknowledged: u64,
    pub timed_out: u64,
    /// `sent + received`: packets without a resolution yet.
    pub in_flight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsAddressRow {
    /// Normalized address (lowercase hex of the payload bytes).
    pub address: String,
    pub transfers_sent: u64,
    pub transfers_received: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Every statistics table at once, plus the change counter they cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub daily_packets: Vec<DailyCountRow>,
    pub daily_transfers: Vec<DailyCountRow>,
    pub statistics: StatisticsRow,
    pub addresses: Vec<StatisticsAddressRow>,
    /// Highest `created_seq` folded into the rollups.
    pub watermark: u64,
}

/// Packet counts by status, as returned by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub sent: u64,
    pub received: u64,
    pub acknowledged: u64,
    pub timed_out: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: PacketStatus) {
        match status {
            PacketStatus::Sent => self.sent += 1,
            PacketStatus::Received => self.received += 1,
            PacketStatus::Acknowledged => self.acknowledged += 1,
            PacketStatus::TimedOut => self.timed_out += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.sent + self.received + self.acknowledged + self.timed_out
    }
}

// ─── Index status & health ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Backfilling,
    Live,
    Failing,
    Stopped,
}

/// Ingestion progress of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatusRow {
    pub chain_id: String,
    pub last_height: u64,
    pub last_block_hash: String,
    pub last_block_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: WatcherState,
    pub last_error: Option<String>,
}

impl IndexStatusRow {
    /// Seconds between the last indexed block and `now`.
    pub fn tip_age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_block_time).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHealth {
    pub chain_id: String,
    /// `None` when nothing has been indexed yet.
    pub tip_age_secs: Option<i64>,
    pub state: Option<WatcherState>,
    pub lagging: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub chains: Vec<ChainHealth>,
    pub lagging_chains: Vec<String>,
    pub open_anomalies: u64,
    pub checked_at: DateTime<Utc>,
}
