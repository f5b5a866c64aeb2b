//! The read-model store: the single persistence seam of the indexer.
//!
//! Trackers write through this trait; the query layer and the statistics
//! aggregator read through it. Implementations live in `ibcindex-storage`.
//!
//! Write contract:
//! - `insert_*` methods are idempotent on the row's natural key and return
//!   `false` when the row already existed.
//! - [`put_packet`](ReadModelStore::put_packet) is a compare-and-swap on the
//!   packet's `revision`; it assigns the next revision and `write_seq`.
//! - `write_seq` is a single store-wide counter shared by packets and
//!   transfers, so "everything changed since N" is one comparison.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::anomaly::Anomaly;
use crate::error::Result;
use crate::event::HandshakeStep;
use crate::model::{
    ChainRow, ChannelRow, ClientRow, ClientTipRow, ConnectionRow, FungibleAssetOrderRow,
    HandshakeEntity, HandshakeEventRow, IndexStatusRow, LightClientUpdateRow, PacketEffectRow,
    PacketRow, StatsSnapshot, StatusCounts, TransferRow,
};
use crate::types::{ChannelKey, ClientKey, ConnectionKey, Height, IbcVersion, PacketKey};

#[async_trait]
pub trait ReadModelStore: Send + Sync {
    // ─── Chains ──────────────────────────────────────────────────────────────

    async fn upsert_chain(&self, chain: ChainRow) -> Result<()>;
    async fn get_chain(&self, chain_id: &str) -> Result<Option<ChainRow>>;
    async fn list_chains(&self) -> Result<Vec<ChainRow>>;

    // ─── Clients & light-client updates ──────────────────────────────────────

    async fn upsert_client(&self, client: ClientRow) -> Result<()>;
    async fn get_client(&self, key: &ClientKey) -> Result<Option<ClientRow>>;
    async fn list_clients(&self, chain_id: Option<&str>) -> Result<Vec<ClientRow>>;

    async fn get_client_tip(&self, key: &ClientKey) -> Result<Option<ClientTipRow>>;
    async fn put_client_tip(&self, tip: ClientTipRow) -> Result<()>;

    /// Unique per `(key, height)`.
    async fn insert_light_client_update(&self, update: LightClientUpdateRow) -> Result<bool>;
    async fn get_light_client_update(
        &self,
        key: &ClientKey,
        height: Height,
    ) -> Result<Option<LightClientUpdateRow>>;
    /// Ordered by height.
    async fn light_client_updates(&self, key: &ClientKey) -> Result<Vec<LightClientUpdateRow>>;

    // ─── Connections & channels ──────────────────────────────────────────────

    async fn get_connection(&self, key: &ConnectionKey) -> Result<Option<ConnectionRow>>;
    async fn put_connection(&self, row: ConnectionRow) -> Result<()>;
    async fn list_connections(&self, chain_id: Option<&str>) -> Result<Vec<ConnectionRow>>;

    async fn get_channel(&self, key: &ChannelKey) -> Result<Option<ChannelRow>>;
    async fn put_channel(&self, row: ChannelRow) -> Result<()>;
    /// Look a channel up by id alone; union packets do not name their ports.
    async fn find_channel(
        &self,
        ibc: IbcVersion,
        chain_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelRow>>;
    async fn list_channels(&self, chain_id: Option<&str>) -> Result<Vec<ChannelRow>>;

    /// Unique per `(entity, step)`.
    async fn insert_handshake_event(&self, row: HandshakeEventRow) -> Result<bool>;
    async fn has_handshake_event(&self, entity: &HandshakeEntity, step: HandshakeStep)
        -> Result<bool>;
    /// Ordered by step.
    async fn handshake_events(&self, entity: &HandshakeEntity) -> Result<Vec<HandshakeEventRow>>;

    // ─── Packets ─────────────────────────────────────────────────────────────

    async fn get_packet(&self, key: &PacketKey) -> Result<Option<PacketRow>>;

    /// Write a packet if its stored revision equals `expected_revision`
    /// (`None` = must not exist yet). Returns the row as stored, with the new
    /// `revision` and `write_seq`. A mismatch is [`IndexerError::Conflict`].
    ///
    /// [`IndexerError::Conflict`]: crate::error::IndexerError::Conflict
    async fn put_packet(&self, row: PacketRow, expected_revision: Option<u64>)
        -> Result<PacketRow>;

    /// All packets, ordered by key.
    async fn list_packets(&self) -> Result<Vec<PacketRow>>;
    /// Packets inserted after `created_seq`, ordered by `created_seq`.
    async fn packets_created_since(&self, created_seq: u64) -> Result<Vec<PacketRow>>;
    /// Status totals over packets with `created_seq <= created_up_to`.
    async fn packet_status_counts(&self, created_up_to: u64) -> Result<StatusCounts>;
    /// The highest `write_seq` assigned so far. Every row with a lower
    /// sequence is already visible to readers.
    async fn last_write_seq(&self) -> Result<u64>;

    /// Unique per `(key, event_id)`.
    async fn insert_packet_effect(&self, effect: PacketEffectRow) -> Result<bool>;
    /// Ordered by effect kind, then event position.
    async fn packet_effects(&self, key: &PacketKey) -> Result<Vec<PacketEffectRow>>;
    /// `ACK` effects, optionally restricted to the chain they were observed on.
    async fn acknowledge_events(&self, chain_id: Option<&str>) -> Result<Vec<PacketEffectRow>>;

    // ─── Transfers & orders ──────────────────────────────────────────────────

    /// Upsert a transfer; assigns `write_seq` (and `created_seq` on insert).
    async fn put_transfer(&self, row: TransferRow) -> Result<TransferRow>;
    async fn get_transfer(&self, key: &PacketKey) -> Result<Option<TransferRow>>;
    async fn list_transfers(&self) -> Result<Vec<TransferRow>>;
    async fn transfers_created_since(&self, created_seq: u64) -> Result<Vec<TransferRow>>;
    /// Transfers whose hop root is `root`, ordered by `(hop_index, retries)`.
    async fn forwards(&self, root: &PacketKey) -> Result<Vec<TransferRow>>;

    async fn put_fungible_asset_order(&self, row: FungibleAssetOrderRow) -> Result<()>;
    async fn get_fungible_asset_order(&self, key: &PacketKey)
        -> Result<Option<FungibleAssetOrderRow>>;
    async fn list_fungible_asset_orders(&self) -> Result<Vec<FungibleAssetOrderRow>>;

    // ─── Block times ─────────────────────────────────────────────────────────

    /// Header time of an applied block. A light client tracking this chain
    /// stores the same time as its consensus timestamp for that height.
    async fn put_block_time(&self, chain_id: &str, height: u64, time: DateTime<Utc>) -> Result<()>;
    async fn block_time(&self, chain_id: &str, height: u64) -> Result<Option<DateTime<Utc>>>;

    // ─── Statistics ──────────────────────────────────────────────────────────

    /// Replace every statistics table at once.
    async fn replace_statistics(&self, snapshot: StatsSnapshot) -> Result<()>;
    /// The last stored statistics, or an empty snapshot.
    async fn statistics(&self) -> Result<StatsSnapshot>;

    // ─── Index status & anomalies ────────────────────────────────────────────

    async fn put_index_status(&self, row: IndexStatusRow) -> Result<()>;
    async fn get_index_status(&self, chain_id: &str) -> Result<Option<IndexStatusRow>>;
    async fn list_index_status(&self) -> Result<Vec<IndexStatusRow>>;

    /// Unique per `anomaly.id`.
    async fn insert_anomaly(&self, anomaly: Anomaly) -> Result<bool>;
    /// Anomalies observed at or after `since`, oldest first.
    async fn list_anomalies(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Anomaly>>;
}
