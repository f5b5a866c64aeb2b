//! Recovery from storage failures part-way through an event.
//!
//! A block whose apply fails is applied again by its watcher. These tests
//! fail single writes and check the second pass completes the work.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use ibcindex_core::anomaly::Anomaly;
use ibcindex_core::error::Result;
use ibcindex_core::event::HandshakeStep;
use ibcindex_core::model::{
    ChainRow, ChannelRow, ClientRow, ClientTipRow, ConnectionRow, EffectKind,
    FungibleAssetOrderRow, HandshakeEntity, HandshakeEventRow, IndexStatusRow,
    LightClientUpdateRow, PacketEffectRow, PacketRow, StatsSnapshot, StatusCounts, TransferRow,
};
use ibcindex_core::payload::{FillType, FILL_TYPE_PROTOCOL};
use ibcindex_core::types::ConnectionStatus;
use ibcindex_core::{
    AbciEvent, ChannelKey, ClientKey, ConnectionKey, Height, IbcVersion, Indexer, IndexerError,
    PacketKey, PacketStatus, RawBlock, RawTx, ReadModelStore, StatisticsAggregator,
    TopologyOverrides, TrackerSettings,
};
use ibcindex_storage::InMemoryStorage;

const OSMOSIS: &str = "osmosis-1";
const HUB: &str = "cosmoshub-4";
const UNION: &str = "union-testnet-9";
const SEPOLIA: &str = "11155111";

/// An in-memory store whose armed writes fail once, and whose write
/// sequence can be held back to mimic rows landing after a reader's bound.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStorage,
    armed: Mutex<HashSet<&'static str>>,
    seq_cap: Mutex<Option<u64>>,
}

impl FlakyStore {
    fn fail_next(&self, op: &'static str) {
        self.armed.lock().unwrap().insert(op);
    }

    fn cap_write_seq(&self, seq: u64) {
        *self.seq_cap.lock().unwrap() = Some(seq);
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.armed.lock().unwrap().remove(op) {
            return Err(IndexerError::Storage(format!("{op}: disk I/O error")));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadModelStore for FlakyStore {
    async fn upsert_chain(&self, chain: ChainRow) -> Result<()> {
        self.inner.upsert_chain(chain).await
    }
    async fn get_chain(&self, chain_id: &str) -> Result<Option<ChainRow>> {
        self.inner.get_chain(chain_id).await
    }
    async fn list_chains(&self) -> Result<Vec<ChainRow>> {
        self.inner.list_chains().await
    }

    async fn upsert_client(&self, client: ClientRow) -> Result<()> {
        self.inner.upsert_client(client).await
    }
    async fn get_client(&self, key: &ClientKey) -> Result<Option<ClientRow>> {
        self.inner.get_client(key).await
    }
    async fn list_clients(&self, chain_id: Option<&str>) -> Result<Vec<ClientRow>> {
        self.inner.list_clients(chain_id).await
    }
    async fn get_client_tip(&self, key: &ClientKey) -> Result<Option<ClientTipRow>> {
        self.inner.get_client_tip(key).await
    }
    async fn put_client_tip(&self, tip: ClientTipRow) -> Result<()> {
        self.inner.put_client_tip(tip).await
    }
    async fn insert_light_client_update(&self, update: LightClientUpdateRow) -> Result<bool> {
        self.inner.insert_light_client_update(update).await
    }
    async fn get_light_client_update(
        &self,
        key: &ClientKey,
        height: Height,
    ) -> Result<Option<LightClientUpdateRow>> {
        self.inner.get_light_client_update(key, height).await
    }
    async fn light_client_updates(&self, key: &ClientKey) -> Result<Vec<LightClientUpdateRow>> {
        self.inner.light_client_updates(key).await
    }

    async fn get_connection(&self, key: &ConnectionKey) -> Result<Option<ConnectionRow>> {
        self.inner.get_connection(key).await
    }
    async fn put_connection(&self, row: ConnectionRow) -> Result<()> {
        self.check("put_connection")?;
        self.inner.put_connection(row).await
    }
    async fn list_connections(&self, chain_id: Option<&str>) -> Result<Vec<ConnectionRow>> {
        self.inner.list_connections(chain_id).await
    }
    async fn get_channel(&self, key: &ChannelKey) -> Result<Option<ChannelRow>> {
        self.inner.get_channel(key).await
    }
    async fn put_channel(&self, row: ChannelRow) -> Result<()> {
        self.check("put_channel")?;
        self.inner.put_channel(row).await
    }
    async fn find_channel(
        &self,
        ibc: IbcVersion,
        chain_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelRow>> {
        self.inner.find_channel(ibc, chain_id, channel_id).await
    }
    async fn list_channels(&self, chain_id: Option<&str>) -> Result<Vec<ChannelRow>> {
        self.inner.list_channels(chain_id).await
    }
    async fn insert_handshake_event(&self, row: HandshakeEventRow) -> Result<bool> {
        self.check("insert_handshake_event")?;
        self.inner.insert_handshake_event(row).await
    }
    async fn has_handshake_event(
        &self,
        entity: &HandshakeEntity,
        step: HandshakeStep,
    ) -> Result<bool> {
        self.inner.has_handshake_event(entity, step).await
    }
    async fn handshake_events(&self, entity: &HandshakeEntity) -> Result<Vec<HandshakeEventRow>> {
        self.inner.handshake_events(entity).await
    }

    async fn get_packet(&self, key: &PacketKey) -> Result<Option<PacketRow>> {
        self.inner.get_packet(key).await
    }
    async fn put_packet(&self, row: PacketRow, expected_revision: Option<u64>) -> Result<PacketRow> {
        self.check("put_packet")?;
        self.inner.put_packet(row, expected_revision).await
    }
    async fn list_packets(&self) -> Result<Vec<PacketRow>> {
        self.inner.list_packets().await
    }
    async fn packets_created_since(&self, created_seq: u64) -> Result<Vec<PacketRow>> {
        self.inner.packets_created_since(created_seq).await
    }
    async fn packet_status_counts(&self, created_up_to: u64) -> Result<StatusCounts> {
        self.inner.packet_status_counts(created_up_to).await
    }
    async fn last_write_seq(&self) -> Result<u64> {
        let seq = self.inner.last_write_seq().await?;
        Ok(match *self.seq_cap.lock().unwrap() {
            Some(cap) => seq.min(cap),
            None => seq,
        })
    }
    async fn insert_packet_effect(&self, effect: PacketEffectRow) -> Result<bool> {
        self.check("insert_packet_effect")?;
        self.inner.insert_packet_effect(effect).await
    }
    async fn packet_effects(&self, key: &PacketKey) -> Result<Vec<PacketEffectRow>> {
        self.inner.packet_effects(key).await
    }
    async fn acknowledge_events(&self, chain_id: Option<&str>) -> Result<Vec<PacketEffectRow>> {
        self.inner.acknowledge_events(chain_id).await
    }

    async fn put_transfer(&self, row: TransferRow) -> Result<TransferRow> {
        self.check("put_transfer")?;
        self.inner.put_transfer(row).await
    }
    async fn get_transfer(&self, key: &PacketKey) -> Result<Option<TransferRow>> {
        self.inner.get_transfer(key).await
    }
    async fn list_transfers(&self) -> Result<Vec<TransferRow>> {
        self.inner.list_transfers().await
    }
    async fn transfers_created_since(&self, created_seq: u64) -> Result<Vec<TransferRow>> {
        self.inner.transfers_created_since(created_seq).await
    }
    async fn forwards(&self, root: &PacketKey) -> Result<Vec<TransferRow>> {
        self.inner.forwards(root).await
    }
    async fn put_fungible_asset_order(&self, row: FungibleAssetOrderRow) -> Result<()> {
        self.check("put_fungible_asset_order")?;
        self.inner.put_fungible_asset_order(row).await
    }
    async fn get_fungible_asset_order(
        &self,
        key: &PacketKey,
    ) -> Result<Option<FungibleAssetOrderRow>> {
        self.inner.get_fungible_asset_order(key).await
    }
    async fn list_fungible_asset_orders(&self) -> Result<Vec<FungibleAssetOrderRow>> {
        self.inner.list_fungible_asset_orders().await
    }

    async fn put_block_time(&self, chain_id: &str, height: u64, time: DateTime<Utc>) -> Result<()> {
        self.inner.put_block_time(chain_id, height, time).await
    }
    async fn block_time(&self, chain_id: &str, height: u64) -> Result<Option<DateTime<Utc>>> {
        self.inner.block_time(chain_id, height).await
    }

    async fn replace_statistics(&self, snapshot: StatsSnapshot) -> Result<()> {
        self.inner.replace_statistics(snapshot).await
    }
    async fn statistics(&self) -> Result<StatsSnapshot> {
        self.inner.statistics().await
    }

    async fn put_index_status(&self, row: IndexStatusRow) -> Result<()> {
        self.inner.put_index_status(row).await
    }
    async fn get_index_status(&self, chain_id: &str) -> Result<Option<IndexStatusRow>> {
        self.inner.get_index_status(chain_id).await
    }
    async fn list_index_status(&self) -> Result<Vec<IndexStatusRow>> {
        self.inner.list_index_status().await
    }
    async fn insert_anomaly(&self, anomaly: Anomaly) -> Result<bool> {
        self.inner.insert_anomaly(anomaly).await
    }
    async fn list_anomalies(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Anomaly>> {
        self.inner.list_anomalies(since).await
    }
}

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn block(chain: &str, height: u64, events: Vec<AbciEvent>) -> RawBlock {
    RawBlock {
        chain_id: chain.into(),
        height,
        hash: format!("{chain}-{height}").to_uppercase(),
        time: t(height as i64),
        txs: vec![RawTx {
            hash: format!("TX{height}"),
            index: 0,
            events,
        }],
        block_events: vec![],
    }
}

fn hexed(value: &serde_json::Value) -> String {
    hex::encode(serde_json::to_vec(value).unwrap())
}

fn transfer_hex(receiver: &str, memo: &str) -> String {
    hexed(&json!({
        "denom": "uosmo",
        "amount": "1000",
        "sender": "osmo1sender",
        "receiver": receiver,
        "memo": memo,
    }))
}

fn packet_event(kind: &str, seq: u64, src: &str, dst: &str, data_hex: &str) -> AbciEvent {
    AbciEvent::new(kind)
        .attr("packet_data_hex", data_hex)
        .attr("packet_timeout_height", "1-999999")
        .attr("packet_sequence", seq.to_string())
        .attr("packet_src_port", "transfer")
        .attr("packet_src_channel", src)
        .attr("packet_dst_port", "transfer")
        .attr("packet_dst_channel", dst)
}

fn topology(chains: &[&str], channels: &[(&str, &str, &str, &str)]) -> TopologyOverrides {
    let mut o = TopologyOverrides {
        indexed_chains: chains.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    };
    for (chain, port, channel, counterparty) in channels {
        o.channels.insert(
            (chain.to_string(), port.to_string(), channel.to_string()),
            counterparty.to_string(),
        );
    }
    o
}

fn indexer(store: &Arc<FlakyStore>, overrides: TopologyOverrides) -> Indexer {
    Indexer::new(store.clone(), overrides, TrackerSettings::default())
}

// ─── Handshakes ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_step_survives_a_failed_entity_write() {
    let store = Arc::new(FlakyStore::default());
    let mut overrides = topology(&[OSMOSIS], &[]);
    overrides
        .clients
        .insert((OSMOSIS.to_string(), "07-tendermint-0".to_string()), HUB.to_string());
    let mut indexer = indexer(&store, overrides);
    let init = block(
        OSMOSIS,
        10,
        vec![AbciEvent::new("connection_open_init")
            .attr("connection_id", "connection-0")
            .attr("client_id", "07-tendermint-0")
            .attr("counterparty_client_id", "07-tendermint-5")],
    );
    let key = ConnectionKey::new(IbcVersion::Classic, OSMOSIS, "connection-0");
    let entity = HandshakeEntity::Connection(key.clone());

    store.fail_next("put_connection");
    assert!(indexer.apply_block(&init, t(1_000)).await.is_err());
    assert!(store.get_connection(&key).await.unwrap().is_none());
    assert!(!store.has_handshake_event(&entity, HandshakeStep::OpenInit).await.unwrap());

    indexer.apply_block(&init, t(1_001)).await.unwrap();
    let row = store.get_connection(&key).await.unwrap().unwrap();
    assert_eq!(row.status, ConnectionStatus::Init);
    assert!(store.has_handshake_event(&entity, HandshakeStep::OpenInit).await.unwrap());
}

#[tokio::test]
async fn handshake_step_recorded_after_a_failed_event_write() {
    let store = Arc::new(FlakyStore::default());
    let mut overrides = topology(&[OSMOSIS], &[]);
    overrides
        .clients
        .insert((OSMOSIS.to_string(), "07-tendermint-0".to_string()), HUB.to_string());
    let mut indexer = indexer(&store, overrides);
    let init = block(
        OSMOSIS,
        10,
        vec![AbciEvent::new("connection_open_init")
            .attr("connection_id", "connection-0")
            .attr("client_id", "07-tendermint-0")
            .attr("counterparty_client_id", "07-tendermint-5")],
    );
    let key = ConnectionKey::new(IbcVersion::Classic, OSMOSIS, "connection-0");
    let entity = HandshakeEntity::Connection(key.clone());

    store.fail_next("insert_handshake_event");
    assert!(indexer.apply_block(&init, t(1_000)).await.is_err());
    let row = store.get_connection(&key).await.unwrap().unwrap();

    indexer.apply_block(&init, t(1_001)).await.unwrap();
    assert!(store.has_handshake_event(&entity, HandshakeStep::OpenInit).await.unwrap());
    assert_eq!(store.get_connection(&key).await.unwrap().unwrap(), row);
}

// ─── Packets ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn recv_effects_are_completed_on_replay() {
    let store = Arc::new(FlakyStore::default());
    let overrides = topology(
        &[OSMOSIS, HUB],
        &[
            (OSMOSIS, "transfer", "channel-1", HUB),
            (HUB, "transfer", "channel-2", OSMOSIS),
        ],
    );
    let mut indexer = indexer(&store, overrides);
    let memo = json!({"forward": {"receiver": "neutron1dest", "port": "transfer", "channel": "channel-10"}});
    let root = transfer_hex("cosmos1hub", &memo.to_string());
    let hop = transfer_hex("neutron1dest", "");
    let root_key = PacketKey::new(IbcVersion::Classic, OSMOSIS, "channel-1", "transfer", 1);
    let hop_key = PacketKey::new(IbcVersion::Classic, HUB, "channel-10", "transfer", 7);

    indexer
        .apply_block(
            &block(OSMOSIS, 100, vec![packet_event("send_packet", 1, "channel-1", "channel-2", &root)]),
            t(1_000),
        )
        .await
        .unwrap();

    let hub = block(
        HUB,
        500,
        vec![
            packet_event("recv_packet", 1, "channel-1", "channel-2", &root),
            packet_event("send_packet", 7, "channel-10", "channel-11", &hop),
        ],
    );
    // The packet row is written; its effect and the forward expectation are not.
    store.fail_next("insert_packet_effect");
    assert!(indexer.apply_block(&hub, t(1_000)).await.is_err());
    assert_eq!(store.get_packet(&root_key).await.unwrap().unwrap().status, PacketStatus::Received);
    assert_eq!(indexer.pending().await.forward_expectations, 0);

    indexer.apply_block(&hub, t(1_001)).await.unwrap();

    let kinds: Vec<EffectKind> = store
        .packet_effects(&root_key)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![EffectKind::Send, EffectKind::Recv]);
    let forwards = store.forwards(&root_key).await.unwrap();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].key, hop_key);
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn order_fill_is_completed_on_replay() {
    let store = Arc::new(FlakyStore::default());
    let overrides = topology(
        &[UNION, SEPOLIA],
        &[(UNION, "", "1", SEPOLIA), (SEPOLIA, "", "2", UNION)],
    );
    let mut indexer = indexer(&store, overrides);
    let order = hexed(&json!({"opcode": 3, "version": 1, "operand": {
        "sender": "union1sender", "receiver": "0xbb", "base_token": "muno", "base_amount": "5",
        "quote_token": "0x7e57", "quote_amount": "5"}}));
    let ack = hexed(&json!({"tag": 1, "inner_ack": {"fill_type": FILL_TYPE_PROTOCOL}}));
    let union_packet = |kind: &str| {
        AbciEvent::new(format!("wasm-{kind}"))
            .attr("packet_source_channel_id", "1")
            .attr("packet_destination_channel_id", "2")
            .attr("packet_sequence", "9")
            .attr("packet_data", order.clone())
    };
    let key = PacketKey::new(IbcVersion::Union, UNION, "1", "", 9);

    indexer
        .apply_block(&block(UNION, 10, vec![union_packet("packet_send")]), t(1_000))
        .await
        .unwrap();
    let destination = block(
        SEPOLIA,
        7_000,
        vec![
            union_packet("packet_recv"),
            union_packet("write_ack").attr("acknowledgement", ack.clone()),
        ],
    );
    store.fail_next("put_fungible_asset_order");
    assert!(indexer.apply_block(&destination, t(1_000)).await.is_err());
    assert!(store.get_packet(&key).await.unwrap().unwrap().write_ack.is_some());
    assert_eq!(store.get_fungible_asset_order(&key).await.unwrap().unwrap().ack_fill_type, None);

    indexer.apply_block(&destination, t(1_001)).await.unwrap();

    let order = store.get_fungible_asset_order(&key).await.unwrap().unwrap();
    assert_eq!(order.ack_success, Some(true));
    assert_eq!(order.ack_fill_type, Some(FillType::Protocol));
    assert_eq!(order.ack_market_maker, None);
}

// ─── Statistics ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn totals_and_daily_rows_share_a_bound() {
    let store = Arc::new(FlakyStore::default());
    let overrides = topology(
        &[OSMOSIS, HUB],
        &[(OSMOSIS, "transfer", "channel-1", HUB)],
    );
    let mut indexer = indexer(&store, overrides);
    let aggregator = StatisticsAggregator::new(store.clone());
    let send = |seq: u64, height: u64| {
        let data = transfer_hex("cosmos1hub", "");
        block(OSMOSIS, height, vec![packet_event("send_packet", seq, "channel-1", "channel-2", &data)])
    };

    indexer.apply_block(&send(1, 100), t(1_000)).await.unwrap();
    // Packet 2 lands after the aggregator read its bound.
    store.cap_write_seq(store.inner.last_write_seq().await.unwrap());
    indexer.apply_block(&send(2, 101), t(1_000)).await.unwrap();

    let snapshot = aggregator.refresh().await.unwrap();
    let daily: u64 = snapshot.daily_packets.iter().map(|d| d.count).sum();
    assert_eq!(snapshot.statistics.packets, 1);
    assert_eq!(daily, 1);

    *store.seq_cap.lock().unwrap() = None;
    let snapshot = aggregator.refresh().await.unwrap();
    let daily: u64 = snapshot.daily_packets.iter().map(|d| d.count).sum();
    assert_eq!(snapshot.statistics.packets, 2);
    assert_eq!(daily, 2);
}
