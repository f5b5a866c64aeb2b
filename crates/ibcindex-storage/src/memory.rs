//! In-memory storage backend.
//!
//! Holds the whole read model and the watcher checkpoints in RAM.
//! Useful for tests and short-lived indexers that don't need persistence.
//!
//! Every table sits behind one mutex so sequence assignment and the write it
//! belongs to are a single step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use ibcindex_core::anomaly::Anomaly;
use ibcindex_core::checkpoint::{Checkpoint, CheckpointStore};
use ibcindex_core::error::{IndexerError, Result};
use ibcindex_core::event::HandshakeStep;
use ibcindex_core::model::{
    ChainRow, ChannelRow, ClientRow, ClientTipRow, ConnectionRow, EffectKind,
    FungibleAssetOrderRow, HandshakeEntity, HandshakeEventRow, IndexStatusRow,
    LightClientUpdateRow, PacketEffectRow, PacketRow, StatsSnapshot, StatusCounts, TransferRow,
};
use ibcindex_core::store::ReadModelStore;
use ibcindex_core::types::{ChannelKey, ClientKey, ConnectionKey, Height, IbcVersion, PacketKey};

#[derive(Default)]
struct Tables {
    write_seq: u64,
    chains: BTreeMap<String, ChainRow>,
    clients: BTreeMap<ClientKey, ClientRow>,
    client_tips: HashMap<ClientKey, ClientTipRow>,
    light_client_updates: BTreeMap<(ClientKey, Height), LightClientUpdateRow>,
    connections: BTreeMap<ConnectionKey, ConnectionRow>,
    channels: BTreeMap<ChannelKey, ChannelRow>,
    handshake_events: BTreeMap<(HandshakeEntity, HandshakeStep), HandshakeEventRow>,
    packets: BTreeMap<PacketKey, PacketRow>,
    packet_effects: BTreeMap<(PacketKey, String), PacketEffectRow>,
    transfers: BTreeMap<PacketKey, TransferRow>,
    orders: BTreeMap<PacketKey, FungibleAssetOrderRow>,
    block_times: HashMap<(String, u64), DateTime<Utc>>,
    statistics: StatsSnapshot,
    index_status: BTreeMap<String, IndexStatusRow>,
    anomaly_ids: HashSet<String>,
    anomalies: Vec<Anomaly>,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.write_seq += 1;
        self.write_seq
    }
}

/// In-memory read model and checkpoint store.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checkpoints(&self) -> MutexGuard<'_, HashMap<String, Checkpoint>> {
        self.checkpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of anomalies recorded so far.
    pub fn anomaly_count(&self) -> usize {
        self.tables().anomalies.len()
    }
}

fn by_chain<'a, V: Clone + 'a>(
    rows: impl Iterator<Item = &'a V>,
    chain_id: Option<&str>,
    chain_of: impl Fn(&V) -> &str,
) -> Vec<V> {
    rows.filter(|r| chain_id.map_or(true, |c| chain_of(r) == c))
        .cloned()
        .collect()
}

fn effect_order(e: &PacketEffectRow) -> (EffectKind, u64, Option<u32>, u32) {
    (
        e.kind,
        e.event.height,
        e.event.transaction_index,
        e.event.event_index,
    )
}

#[async_trait]
impl ReadModelStore for InMemoryStorage {
    // ─── Chains ─────────────────────────────────────────────────────────────

    async fn upsert_chain(&self, chain: ChainRow) -> Result<()> {
        self.tables().chains.insert(chain.chain_id.clone(), chain);
        Ok(())
    }

    async fn get_chain(&self, chain_id: &str) -> Result<Option<ChainRow>> {
        Ok(self.tables().chains.get(chain_id).cloned())
    }

    async fn list_chains(&self) -> Result<Vec<ChainRow>> {
        Ok(self.tables().chains.values().cloned().collect())
    }

    // ─── Clients ────────────────────────────────────────────────────────────

    async fn upsert_client(&self, client: ClientRow) -> Result<()> {
        self.tables().clients.insert(client.key.clone(), client);
        Ok(())
    }

    async fn get_client(&self, key: &ClientKey) -> Result<Option<ClientRow>> {
        Ok(self.tables().clients.get(key).cloned())
    }

    async fn list_clients(&self, chain_id: Option<&str>) -> Result<Vec<ClientRow>> {
        Ok(by_chain(self.tables().clients.values(), chain_id, |c| {
            c.key.chain_id.as_str()
        }))
    }

    async fn get_client_tip(&self, key: &ClientKey) -> Result<Option<ClientTipRow>> {
        Ok(self.tables().client_tips.get(key).cloned())
    }

    async fn put_client_tip(&self, tip: ClientTipRow) -> Result<()> {
        self.tables().client_tips.insert(tip.key.clone(), tip);
        Ok(())
    }

    async fn insert_light_client_update(&self, update: LightClientUpdateRow) -> Result<bool> {
        let mut t = self.tables();
        let key = (update.key.clone(), update.height);
        if t.light_client_updates.contains_key(&key) {
            return Ok(false);
        }
        t.light_client_updates.insert(key, update);
        Ok(true)
    }

    async fn get_light_client_update(
        &self,
        key: &ClientKey,
        height: Height,
    ) -> Result<Option<LightClientUpdateRow>> {
        Ok(self
            .tables()
            .light_client_updates
            .get(&(key.clone(), height))
            .cloned())
    }

    async fn light_client_updates(&self, key: &ClientKey) -> Result<Vec<LightClientUpdateRow>> {
        Ok(self
            .tables()
            .light_client_updates
            .values()
            .filter(|u| &u.key == key)
            .cloned()
            .collect())
    }

    // ─── Connections & channels ─────────────────────────────────────────────

    async fn get_connection(&self, key: &ConnectionKey) -> Result<Option<ConnectionRow>> {
        Ok(self.tables().connections.get(key).cloned())
    }

    async fn put_connection(&self, row: ConnectionRow) -> Result<()> {
        self.tables().connections.insert(row.key.clone(), row);
        Ok(())
    }

    async fn list_connections(&self, chain_id: Option<&str>) -> Result<Vec<ConnectionRow>> {
        Ok(by_chain(self.tables().connections.values(), chain_id, |c| {
            c.key.chain_id.as_str()
        }))
    }

    async fn get_channel(&self, key: &ChannelKey) -> Result<Option<ChannelRow>> {
        Ok(self.tables().channels.get(key).cloned())
    }

    async fn put_channel(&self, row: ChannelRow) -> Result<()> {
        self.tables().channels.insert(row.key.clone(), row);
        Ok(())
    }

    async fn find_channel(
        &self,
        ibc: IbcVersion,
        chain_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelRow>> {
        Ok(self
            .tables()
            .channels
            .values()
            .find(|c| c.key.ibc == ibc && c.key.chain_id == chain_id && c.key.channel_id == channel_id)
            .cloned())
    }

    async fn list_channels(&self, chain_id: Option<&str>) -> Result<Vec<ChannelRow>> {
        Ok(by_chain(self.tables().channels.values(), chain_id, |c| {
            c.key.chain_id.as_str()
        }))
    }

    async fn insert_handshake_event(&self, row: HandshakeEventRow) -> Result<bool> {
        let mut t = self.tables();
        let key = (row.entity.clone(), row.step);
        if t.handshake_events.contains_key(&key) {
            return Ok(false);
        }
        t.handshake_events.insert(key, row);
        Ok(true)
    }

    async fn has_handshake_event(
        &self,
        entity: &HandshakeEntity,
        step: HandshakeStep,
    ) -> Result<bool> {
        Ok(self
            .tables()
            .handshake_events
            .contains_key(&(entity.clone(), step)))
    }

    async fn handshake_events(&self, entity: &HandshakeEntity) -> Result<Vec<HandshakeEventRow>> {
        Ok(self
            .tables()
            .handshake_events
            .values()
            .filter(|r| &r.entity == entity)
            .cloned()
            .collect())
    }

    // ─── Packets ────────────────────────────────────────────────────────────

    async fn get_packet(&self, key: &PacketKey) -> Result<Option<PacketRow>> {
        Ok(self.tables().packets.get(key).cloned())
    }

    async fn put_packet(
        &self,
        mut row: PacketRow,
        expected_revision: Option<u64>,
    ) -> Result<PacketRow> {
        let mut t = self.tables();
        let current = t.packets.get(&row.key).map(|p| (p.revision, p.created_seq));
        let found = current.map(|(revision, _)| revision);
        if found != expected_revision {
            return Err(IndexerError::Conflict {
                entity: format!("packet {}", row.key),
                expected: expected_revision,
                found,
            });
        }
        let seq = t.next_seq();
        row.revision = found.map_or(1, |r| r + 1);
        row.write_seq = seq;
        row.created_seq = current.map_or(seq, |(_, created)| created);
        t.packets.insert(row.key.clone(), row.clone());
        Ok(row)
    }

    async fn list_packets(&self) -> Result<Vec<PacketRow>> {
        Ok(self.tables().packets.values().cloned().collect())
    }

    async fn packets_created_since(&self, created_seq: u64) -> Result<Vec<PacketRow>> {
        let mut rows: Vec<PacketRow> = self
            .tables()
            .packets
            .values()
            .filter(|p| p.created_seq > created_seq)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.created_seq);
        Ok(rows)
    }

    async fn packet_status_counts(&self, created_up_to: u64) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for p in self
            .tables()
            .packets
            .values()
            .filter(|p| p.created_seq <= created_up_to)
        {
            counts.add(p.status);
        }
        Ok(counts)
    }

    async fn last_write_seq(&self) -> Result<u64> {
        Ok(self.tables().write_seq)
    }

    async fn insert_packet_effect(&self, effect: PacketEffectRow) -> Result<bool> {
        let mut t = self.tables();
        let key = (effect.key.clone(), effect.event.event_id());
        if t.packet_effects.contains_key(&key) {
            return Ok(false);
        }
        t.packet_effects.insert(key, effect);
        Ok(true)
    }

    async fn packet_effects(&self, key: &PacketKey) -> Result<Vec<PacketEffectRow>> {
        let mut rows: Vec<PacketEffectRow> = self
            .tables()
            .packet_effects
            .values()
            .filter(|e| &e.key == key)
            .cloned()
            .collect();
        rows.sort_by_key(effect_order);
        Ok(rows)
    }

    async fn acknowledge_events(&self, chain_id: Option<&str>) -> Result<Vec<PacketEffectRow>> {
        let mut rows: Vec<PacketEffectRow> = self
            .tables()
            .packet_effects
            .values()
            .filter(|e| e.kind == EffectKind::Ack)
            .filter(|e| chain_id.map_or(true, |c| e.event.chain_id == c))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (&a.event.chain_id, a.event.height, a.event.event_index)
                .cmp(&(&b.event.chain_id, b.event.height, b.event.event_index))
        });
        Ok(rows)
    }

    // ─── Transfers & orders ─────────────────────────────────────────────────

    async fn put_transfer(&self, mut row: TransferRow) -> Result<TransferRow> {
        let mut t = self.tables();
        let created = t.transfers.get(&row.key).map(|r| r.created_seq);
        let seq = t.next_seq();
        row.write_seq = seq;
        row.created_seq = created.unwrap_or(seq);
        t.transfers.insert(row.key.clone(), row.clone());
        Ok(row)
    }

    async fn get_transfer(&self, key: &PacketKey) -> Result<Option<TransferRow>> {
        Ok(self.tables().transfers.get(key).cloned())
    }

    async fn list_transfers(&self) -> Result<Vec<TransferRow>> {
        Ok(self.tables().transfers.values().cloned().collect())
    }

    async fn transfers_created_since(&self, created_seq: u64) -> Result<Vec<TransferRow>> {
        let mut rows: Vec<TransferRow> = self
            .tables()
            .transfers
            .values()
            .filter(|r| r.created_seq > created_seq)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_seq);
        Ok(rows)
    }

    async fn forwards(&self, root: &PacketKey) -> Result<Vec<TransferRow>> {
        let mut rows: Vec<TransferRow> = self
            .tables()
            .transfers
            .values()
            .filter(|r| r.hop.as_ref().map_or(false, |h| &h.root == root))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.hop.as_ref().map(|h| (h.hop_index, h.retries)));
        Ok(rows)
    }

    async fn put_fungible_asset_order(&self, row: FungibleAssetOrderRow) -> Result<()> {
        self.tables().orders.insert(row.key.clone(), row);
        Ok(())
    }

    async fn get_fungible_asset_order(
        &self,
        key: &PacketKey,
    ) -> Result<Option<FungibleAssetOrderRow>> {
        Ok(self.tables().orders.get(key).cloned())
    }

    async fn list_fungible_asset_orders(&self) -> Result<Vec<FungibleAssetOrderRow>> {
        Ok(self.tables().orders.values().cloned().collect())
    }

    // ─── Block times ────────────────────────────────────────────────────────

    async fn put_block_time(&self, chain_id: &str, height: u64, time: DateTime<Utc>) -> Result<()> {
        self.tables()
            .block_times
            .insert((chain_id.to_string(), height), time);
        Ok(())
    }

    async fn block_time(&self, chain_id: &str, height: u64) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .tables()
            .block_times
            .get(&(chain_id.to_string(), height))
            .copied())
    }

    // ─── Statistics ─────────────────────────────────────────────────────────

    async fn replace_statistics(&self, snapshot: StatsSnapshot) -> Result<()> {
        self.tables().statistics = snapshot;
        Ok(())
    }

    async fn statistics(&self) -> Result<StatsSnapshot> {
        Ok(self.tables().statistics.clone())
    }

    // ─── Index status & anomalies ───────────────────────────────────────────

    async fn put_index_status(&self, row: IndexStatusRow) -> Result<()> {
        self.tables().index_status.insert(row.chain_id.clone(), row);
        Ok(())
    }

    async fn get_index_status(&self, chain_id: &str) -> Result<Option<IndexStatusRow>> {
        Ok(self.tables().index_status.get(chain_id).cloned())
    }

    async fn list_index_status(&self) -> Result<Vec<IndexStatusRow>> {
        Ok(self.tables().index_status.values().cloned().collect())
    }

    async fn insert_anomaly(&self, anomaly: Anomaly) -> Result<bool> {
        let mut t = self.tables();
        if !t.anomaly_ids.insert(anomaly.id.clone()) {
            return Ok(false);
        }
        t.anomalies.push(anomaly);
        Ok(true)
    }

    async fn list_anomalies(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Anomaly>> {
        let mut rows: Vec<Anomaly> = self
            .tables()
            .anomalies
            .iter()
            .filter(|a| since.map_or(true, |s| a.observed_at >= s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
        Ok(rows)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(
        &self,
        chain_id: &str,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        let key = format!("{chain_id}:{indexer_id}");
        Ok(self.checkpoints().get(&key).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let key = format!("{}:{}", checkpoint.chain_id, checkpoint.indexer_id);
        self.checkpoints().insert(key, checkpoint);
        Ok(())
    }

    async fn delete(&self, chain_id: &str, indexer_id: &str) -> Result<(), IndexerError> {
        let key = format!("{chain_id}:{indexer_id}");
        self.checkpoints().remove(&key);
        Ok(())
    }
}
