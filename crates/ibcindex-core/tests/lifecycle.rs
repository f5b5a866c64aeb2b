//! End-to-end behaviour of the trackers over the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ibcindex_core::config::IndexerConfig;
use ibcindex_core::event::HandshakeStep;
use ibcindex_core::model::{
    ChannelRow, ConnectionRow, EffectKind, HandshakeEntity, HealthStatus, HopLink, WatcherState,
};
use ibcindex_core::payload::{FillType, FILL_TYPE_MARKET_MAKER};
use ibcindex_core::status::{self, HealthPolicy};
use ibcindex_core::types::{ChannelStatus, ConnectionStatus, EventRef};
use ibcindex_core::{
    AbciEvent, AnomalyKind, ChannelKey, ClientKey, ConnectionKey, EventSink, Height, IbcVersion,
    Indexer, PacketKey, PacketStatus, Pipeline, RawBlock, RawTx, ReadModelStore,
    StatisticsAggregator, TopologyOverrides, TrackerSettings,
};
use ibcindex_storage::InMemoryStorage;

const OSMOSIS: &str = "osmosis-1";
const UNION: &str = "union-testnet-9";

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

fn transfer_hex(sender: &str, receiver: &str, memo: &str) -> String {
    let data = json!({
        "denom": "uosmo",
        "amount": "1000",
        "sender": sender,
        "receiver": receiver,
        "memo": memo,
    });
    hex::encode(serde_json::to_vec(&data).unwrap())
}

/// A classic packet event from `src` to `dst` channel, both on port `transfer`.
fn packet_event(kind: &str, seq: u64, src: &str, dst: &str, data_hex: &str, timeout: &str) -> AbciEvent {
    timed_packet_event(kind, seq, src, dst, data_hex, timeout, 0)
}

fn timed_packet_event(
    kind: &str,
    seq: u64,
    src: &str,
    dst: &str,
    data_hex: &str,
    timeout_height: &str,
    timeout_timestamp: u64,
) -> AbciEvent {
    AbciEvent::new(kind)
        .attr("packet_data_hex", data_hex)
        .attr("packet_timeout_height", timeout_height)
        .attr("packet_timeout_timestamp", timeout_timestamp.to_string())
        .attr("packet_sequence", seq.to_string())
        .attr("packet_src_port", "transfer")
        .attr("packet_src_channel", src)
        .attr("packet_dst_port", "transfer")
        .attr("packet_dst_channel", dst)
}

fn write_ack(seq: u64, src: &str, dst: &str, data_hex: &str, ack: &str) -> AbciEvent {
    packet_event("write_acknowledgement", seq, src, dst, data_hex, "1-999999").attr("packet_ack", ack)
}

/// Channel pairs as `(chain, channel, counterparty chain)`.
fn overrides(chains: &[&str], channels: &[(&str, &str, &str)]) -> TopologyOverrides {
    let mut o = TopologyOverrides {
        indexed_chains: chains.iter().map(|c| c.to_string()).collect::<HashSet<_>>(),
        ..Default::default()
    };
    for (chain, channel, counterparty) in channels {
        o.channels.insert(
            (chain.to_string(), "transfer".to_string(), channel.to_string()),
            counterparty.to_string(),
        );
    }
    o
}

fn osmosis_union() -> TopologyOverrides {
    overrides(
        &[OSMOSIS, UNION],
        &[(OSMOSIS, "channel-1", UNION), (UNION, "channel-7", OSMOSIS)],
    )
}

fn key(seq: u64) -> PacketKey {
    PacketKey::new(IbcVersion::Classic, OSMOSIS, "channel-1", "transfer", seq)
}

/// The osmosis → union transfer 42: send, recv + write ack, ack.
fn transfer_42() -> Vec<RawBlock> {
    let data = transfer_hex("osmo1sender", "union1receiver", "");
    vec![
        block(
            OSMOSIS,
            100,
            vec![packet_event("send_packet", 42, "channel-1", "channel-7", &data, "1-999999")],
        ),
        block(
            UNION,
            200,
            vec![
                packet_event("recv_packet", 42, "channel-1", "channel-7", &data, "1-999999"),
                write_ack(42, "channel-1", "channel-7", &data, r#"{"result":"AQ=="}"#),
            ],
        ),
        block(
            OSMOSIS,
            101,
            vec![packet_event("acknowledge_packet", 42, "channel-1", "channel-7", &data, "1-999999")],
        ),
    ]
}

fn indexer(store: &Arc<InMemoryStorage>, overrides: TopologyOverrides) -> Indexer {
    Indexer::new(store.clone(), overrides, TrackerSettings::default())
}

// ─── Packet lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn transfer_is_acknowledged_end_to_end() {
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&store, osmosis_union());
    for b in transfer_42() {
        indexer.apply_block(&b, t(1_000)).await.unwrap();
    }

    let packet = store.get_packet(&key(42)).await.unwrap().unwrap();
    assert_eq!(packet.status, PacketStatus::Acknowledged);
    assert_eq!(packet.destination_chain_id.as_deref(), Some(UNION));
    assert_eq!(packet.destination_channel_id, "channel-7");
    assert_eq!(packet.source.timeout_height, Height::new(1, 999_999));
    assert_eq!(
        packet.acknowledgement_hex.as_deref(),
        Some(hex::encode(r#"{"result":"AQ=="}"#).as_str())
    );
    assert_eq!(packet.ack.as_ref().and_then(|a| a.success), Some(true));
    assert_eq!(packet.resolution.as_ref().map(|r| r.height), Some(101));

    let kinds: Vec<EffectKind> = store
        .packet_effects(&key(42))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![EffectKind::Send, EffectKind::Recv, EffectKind::WriteAck, EffectKind::Ack]
    );

    let transfer = store.get_transfer(&key(42)).await.unwrap().unwrap();
    assert_eq!(transfer.amount, "1000");
    assert_eq!(transfer.destination_chain_id.as_deref(), Some(UNION));
    assert_eq!(store.acknowledge_events(Some(OSMOSIS)).await.unwrap().len(), 1);

    assert_eq!(indexer.pending().await.packet, 0);
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn replaying_blocks_changes_nothing() {
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&store, osmosis_union());
    for b in transfer_42() {
        indexer.apply_block(&b, t(1_000)).await.unwrap();
    }
    let packet = store.get_packet(&key(42)).await.unwrap().unwrap();
    let seq = store.last_write_seq().await.unwrap();

    for b in transfer_42() {
        indexer.apply_block(&b, t(2_000)).await.unwrap();
    }

    assert_eq!(store.get_packet(&key(42)).await.unwrap().unwrap(), packet);
    assert_eq!(store.last_write_seq().await.unwrap(), seq);
    assert_eq!(store.packet_effects(&key(42)).await.unwrap().len(), 4);
    assert_eq!(store.list_transfers().await.unwrap().len(), 1);
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn recv_before_send_is_buffered_until_the_send() {
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&store, osmosis_union());
    let blocks = transfer_42();

    indexer.apply_block(&blocks[1], t(1_000)).await.unwrap();
    assert!(store.get_packet(&key(42)).await.unwrap().is_none());
    assert_eq!(indexer.pending().await.packet, 2);

    indexer.apply_block(&blocks[0], t(1_001)).await.unwrap();
    let packet = store.get_packet(&key(42)).await.unwrap().unwrap();
    assert_eq!(packet.status, PacketStatus::Received);
    assert!(packet.write_ack.is_some());
    assert_eq!(indexer.pending().await.packet, 0);
}

#[tokio::test]
async fn unmatched_recv_escalates_after_ttl() {
    let store = Arc::new(InMemoryStorage::new());
    let settings = TrackerSettings {
        pending_capacity: 16,
        pending_ttl: Duration::seconds(60),
    };
    let mut indexer = Indexer::new(store.clone(), osmosis_union(), settings);

    indexer.apply_block(&transfer_42()[1], t(0)).await.unwrap();
    indexer.sweep(t(30)).await.unwrap();
    assert_eq!(indexer.pending().await.packet, 2);

    indexer.sweep(t(120)).await.unwrap();
    assert_eq!(indexer.pending().await.packet, 0);
    let anomalies = store.list_anomalies(None).await.unwrap();
    assert_eq!(anomalies.len(), 2);
    assert!(anomalies.iter().all(|a| a.kind == AnomalyKind::Correlation));
}

/// An open `transfer` channel on `chain` over `connection` and `client`.
async fn seed_channel(
    store: &InMemoryStorage,
    chain: &str,
    channel: &str,
    connection: &str,
    client: &str,
    counterparty: &str,
    counterparty_channel: &str,
) {
    let at = EventRef {
        chain_id: chain.into(),
        height: 1,
        block_hash: "GENESIS".into(),
        timestamp: t(0),
        transaction_hash: None,
        transaction_index: None,
        event_index: 0,
    };
    store
        .put_connection(ConnectionRow {
            key: ConnectionKey::new(IbcVersion::Classic, chain, connection),
            client_id: client.into(),
            counterparty_chain_id: Some(counterparty.into()),
            counterparty_client_id: "07-tendermint-5".into(),
            counterparty_connection_id: Some("connection-3".into()),
            status: ConnectionStatus::Open,
            created_at: at.clone(),
            updated_at: at.clone(),
        })
        .await
        .unwrap();
    store
        .put_channel(ChannelRow {
            key: ChannelKey::new(IbcVersion::Classic, chain, "transfer", channel),
            connection_id: connection.into(),
            counterparty_chain_id: Some(counterparty.into()),
            counterparty_port_id: "transfer".into(),
            counterparty_channel_id: Some(counterparty_channel.into()),
            version: Some("ics20-1".into()),
            status: ChannelStatus::Open,
            created_at: at.clone(),
            updated_at: at,
        })
        .await
        .unwrap();
}

/// Osmosis knows channel-1 through connection-0 and client 07-tendermint-0.
async fn seed_osmosis_channel(store: &InMemoryStorage) {
    seed_channel(store, OSMOSIS, "channel-1", "connection-0", "07-tendermint-0", UNION, "channel-7").await;
}

#[tokio::test]
async fn timeout_waits_for_light_client_proof() {
    let store = Arc::new(InMemoryStorage::new());
    seed_osmosis_channel(&store).await;
    let mut indexer = indexer(&store, osmosis_union());
    let data = transfer_hex("osmo1sender", "union1receiver", "");

    indexer
        .apply_block(
            &block(
                OSMOSIS,
                100,
                vec![packet_event("send_packet", 43, "channel-1", "channel-7", &data, "1-200")],
            ),
            t(1_000),
        )
        .await
        .unwrap();
    indexer
        .apply_block(
            &block(
                OSMOSIS,
                110,
                vec![packet_event("timeout_packet", 43, "channel-1", "channel-7", &data, "1-200")],
            ),
            t(1_000),
        )
        .await
        .unwrap();
    assert_eq!(store.get_packet(&key(43)).await.unwrap().unwrap().status, PacketStatus::Sent);
    assert_eq!(indexer.pending().await.packet, 1);

    let update = AbciEvent::new("update_client")
        .attr("client_id", "07-tendermint-0")
        .attr("client_type", "07-tendermint")
        .attr("consensus_height", "1-250");
    indexer.apply_block(&block(OSMOSIS, 111, vec![update]), t(1_001)).await.unwrap();
    indexer.sweep(t(1_002)).await.unwrap();

    let packet = store.get_packet(&key(43)).await.unwrap().unwrap();
    assert_eq!(packet.status, PacketStatus::TimedOut);
    assert_eq!(indexer.pending().await.packet, 0);

    // A recv surfacing after the timeout is a conflict, not a transition.
    indexer
        .apply_block(
            &block(
                UNION,
                300,
                vec![packet_event("recv_packet", 43, "channel-1", "channel-7", &data, "1-200")],
            ),
            t(1_003),
        )
        .await
        .unwrap();
    let packet = store.get_packet(&key(43)).await.unwrap().unwrap();
    assert_eq!(packet.status, PacketStatus::TimedOut);
    assert!(packet.destination.is_none());
    let anomalies = store.list_anomalies(None).await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::Correlation);
    assert_eq!(anomalies[0].detail, "recv after timeout");
}

#[tokio::test]
async fn terminal_states_are_exclusive() {
    let store = Arc::new(InMemoryStorage::new());
    seed_osmosis_channel(&store).await;
    let mut indexer = indexer(&store, osmosis_union());
    for b in transfer_42() {
        indexer.apply_block(&b, t(1_000)).await.unwrap();
    }
    let data = transfer_hex("osmo1sender", "union1receiver", "");
    indexer
        .apply_block(
            &block(
                OSMOSIS,
                150,
                vec![packet_event("timeout_packet", 42, "channel-1", "channel-7", &data, "1-999999")],
            ),
            t(1_001),
        )
        .await
        .unwrap();

    let packet = store.get_packet(&key(42)).await.unwrap().unwrap();
    assert_eq!(packet.status, PacketStatus::Acknowledged);
    let anomalies = store.list_anomalies(None).await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].detail, "timeout after acknowledgement");
    assert_eq!(indexer.pending().await.packet, 0);
}

#[tokio::test]
async fn timestamp_timeout_is_proven_by_the_tracked_chain_block_time() {
    let store = Arc::new(InMemoryStorage::new());
    seed_osmosis_channel(&store).await;
    let mut topology = osmosis_union();
    topology
        .clients
        .insert((OSMOSIS.to_string(), "07-tendermint-0".to_string()), UNION.to_string());
    let mut indexer = indexer(&store, topology);
    let data = transfer_hex("osmo1sender", "union1receiver", "");
    // Deadline: the union header time of block 250.
    let deadline = t(250).timestamp() as u64 * 1_000_000_000;

    for (height, kind) in [(100, "send_packet"), (110, "timeout_packet")] {
        let ev = timed_packet_event(kind, 45, "channel-1", "channel-7", &data, "0-0", deadline);
        indexer.apply_block(&block(OSMOSIS, height, vec![ev]), t(1_000)).await.unwrap();
    }
    // ibc-go reports the height only.
    let update = AbciEvent::new("update_client")
        .attr("client_id", "07-tendermint-0")
        .attr("client_type", "07-tendermint")
        .attr("consensus_height", "1-300");
    indexer.apply_block(&block(OSMOSIS, 111, vec![update]), t(1_001)).await.unwrap();
    indexer.sweep(t(1_002)).await.unwrap();
    assert_eq!(store.get_packet(&key(45)).await.unwrap().unwrap().status, PacketStatus::Sent);
    assert_eq!(indexer.pending().await.packet, 1);

    indexer.apply_block(&block(UNION, 300, vec![]), t(1_003)).await.unwrap();
    indexer.sweep(t(1_004)).await.unwrap();

    let packet = store.get_packet(&key(45)).await.unwrap().unwrap();
    assert_eq!(packet.status, PacketStatus::TimedOut);
    assert_eq!(packet.resolution.as_ref().map(|r| r.height), Some(110));
    assert_eq!(indexer.pending().await.packet, 0);
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

// ─── Fungible asset orders ───────────────────────────────────────────────────

const SEPOLIA: &str = "11155111";

fn union_packet(kind: &str, seq: u64, data_hex: &str) -> AbciEvent {
    AbciEvent::new(format!("wasm-{kind}"))
        .attr("packet_source_channel_id", "1")
        .attr("packet_destination_channel_id", "2")
        .attr("packet_sequence", seq.to_string())
        .attr("packet_data", format!("0x{data_hex}"))
}

fn union_write_ack(seq: u64, data_hex: &str, ack: serde_json::Value) -> AbciEvent {
    let ack = hex::encode(serde_json::to_vec(&ack).unwrap());
    union_packet("write_ack", seq, data_hex).attr("acknowledgement", format!("0x{ack}"))
}

fn order_hex(receiver: &str) -> String {
    let ins = json!({"opcode": 3, "version": 1, "operand": {
        "sender": "0xAA00000000000000000000000000000000000001",
        "receiver": receiver,
        "base_token": "0xba5e",
        "base_amount": "1000",
        "base_token_symbol": "USDC",
        "base_token_decimals": 6,
        "quote_token": "0x9e0e",
        "quote_amount": "990",
    }});
    hex::encode(serde_json::to_vec(&ins).unwrap())
}

#[tokio::test]
async fn order_fill_is_taken_from_the_write_ack() {
    let store = Arc::new(InMemoryStorage::new());
    let mut topology = TopologyOverrides {
        indexed_chains: [UNION, SEPOLIA].iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    };
    topology
        .channels
        .insert((UNION.to_string(), String::new(), "1".to_string()), SEPOLIA.to_string());
    topology
        .channels
        .insert((SEPOLIA.to_string(), String::new(), "2".to_string()), UNION.to_string());
    let mut indexer = indexer(&store, topology);

    let filled = order_hex("0xbb00000000000000000000000000000000000002");
    let refused = order_hex("0xbb00000000000000000000000000000000000003");
    let blocks = vec![
        block(
            UNION,
            10,
            vec![union_packet("packet_send", 5, &filled), union_packet("packet_send", 6, &refused)],
        ),
        block(
            SEPOLIA,
            7_000,
            vec![
                union_packet("packet_recv", 5, &filled),
                union_write_ack(
                    5,
                    &filled,
                    json!({"tag": 1, "inner_ack": {"fill_type": FILL_TYPE_MARKET_MAKER, "market_maker": "0xmaker"}}),
                ),
                union_packet("packet_recv", 6, &refused),
                union_write_ack(6, &refused, json!({"tag": 0})),
            ],
        ),
        block(
            UNION,
            11,
            vec![union_packet("packet_ack", 5, &filled), union_packet("packet_ack", 6, &refused)],
        ),
    ];
    for b in &blocks {
        indexer.apply_block(b, t(1_000)).await.unwrap();
    }

    let order_key = |seq| PacketKey::new(IbcVersion::Union, UNION, "1", "", seq);
    let filled = store.get_fungible_asset_order(&order_key(5)).await.unwrap().unwrap();
    assert_eq!(filled.base_amount, "1000");
    assert_eq!(filled.base_token_symbol.as_deref(), Some("USDC"));
    assert_eq!(filled.ack_success, Some(true));
    assert_eq!(filled.ack_fill_type, Some(FillType::MarketMaker));
    assert_eq!(filled.ack_market_maker.as_deref(), Some("0xmaker"));

    let refused = store.get_fungible_asset_order(&order_key(6)).await.unwrap().unwrap();
    assert_eq!(refused.ack_success, Some(false));
    assert_eq!(refused.ack_fill_type, None);
    assert_eq!(refused.ack_market_maker, None);

    for seq in [5, 6] {
        let packet = store.get_packet(&order_key(seq)).await.unwrap().unwrap();
        assert_eq!(packet.status, PacketStatus::Acknowledged);
        assert_eq!(packet.destination_chain_id.as_deref(), Some(SEPOLIA));
    }
    assert!(store.list_transfers().await.unwrap().is_empty());
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

// ─── Handshakes ──────────────────────────────────────────────────────────────

fn connection_event(step: &str, connection: &str, client: &str, counterparty_client: &str, counterparty: Option<&str>) -> AbciEvent {
    AbciEvent::new(format!("connection_{step}"))
        .attr("connection_id", connection)
        .attr("client_id", client)
        .attr("counterparty_client_id", counterparty_client)
        .attr("counterparty_connection_id", counterparty.unwrap_or_default())
}

fn channel_event(step: &str, channel: &str, counterparty: Option<&str>, connection: &str) -> AbciEvent {
    AbciEvent::new(format!("channel_{step}"))
        .attr("port_id", "transfer")
        .attr("channel_id", channel)
        .attr("counterparty_port_id", "transfer")
        .attr("counterparty_channel_id", counterparty.unwrap_or_default())
        .attr("connection_id", connection)
        .attr("version", "ics20-1")
}

/// Osmosis opens connection-0/channel-1 with union's connection-3/channel-7:
/// four connection steps, then four channel steps.
fn open_handshake() -> Vec<RawBlock> {
    let osmosis = |step: &str, counterparty: Option<&str>| connection_event(step, "connection-0", "07-tendermint-0", "07-tendermint-5", counterparty);
    let union = |step: &str, counterparty: Option<&str>| connection_event(step, "connection-3", "07-tendermint-5", "07-tendermint-0", counterparty);
    vec![
        block(OSMOSIS, 10, vec![osmosis("open_init", None)]),
        block(UNION, 20, vec![union("open_try", Some("connection-0"))]),
        block(OSMOSIS, 11, vec![osmosis("open_ack", Some("connection-3"))]),
        block(UNION, 21, vec![union("open_confirm", Some("connection-0"))]),
        block(OSMOSIS, 12, vec![channel_event("open_init", "channel-1", None, "connection-0")]),
        block(UNION, 22, vec![channel_event("open_try", "channel-7", Some("channel-1"), "connection-3")]),
        block(OSMOSIS, 13, vec![channel_event("open_ack", "channel-1", Some("channel-7"), "connection-0")]),
        block(UNION, 23, vec![channel_event("open_confirm", "channel-7", Some("channel-1"), "connection-3")]),
    ]
}

/// Both chains indexed; each one's client names the other.
fn handshake_topology() -> TopologyOverrides {
    let mut o = overrides(&[OSMOSIS, UNION], &[]);
    o.clients
        .insert((OSMOSIS.to_string(), "07-tendermint-0".to_string()), UNION.to_string());
    o.clients
        .insert((UNION.to_string(), "07-tendermint-5".to_string()), OSMOSIS.to_string());
    o
}

fn osmosis_connection() -> ConnectionKey {
    ConnectionKey::new(IbcVersion::Classic, OSMOSIS, "connection-0")
}

fn union_connection() -> ConnectionKey {
    ConnectionKey::new(IbcVersion::Classic, UNION, "connection-3")
}

fn osmosis_channel() -> ChannelKey {
    ChannelKey::new(IbcVersion::Classic, OSMOSIS, "transfer", "channel-1")
}

fn union_channel() -> ChannelKey {
    ChannelKey::new(IbcVersion::Classic, UNION, "transfer", "channel-7")
}

async fn connection_status(store: &InMemoryStorage, key: &ConnectionKey) -> Option<ConnectionStatus> {
    store.get_connection(key).await.unwrap().map(|c| c.status)
}

async fn channel_status(store: &InMemoryStorage, key: &ChannelKey) -> Option<ChannelStatus> {
    store.get_channel(key).await.unwrap().map(|c| c.status)
}

#[tokio::test]
async fn handshake_opens_both_ends() {
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&store, handshake_topology());
    let blocks = open_handshake();

    indexer.apply_block(&blocks[0], t(1_000)).await.unwrap();
    assert_eq!(connection_status(&store, &osmosis_connection()).await, Some(ConnectionStatus::Init));
    indexer.apply_block(&blocks[1], t(1_000)).await.unwrap();
    assert_eq!(connection_status(&store, &osmosis_connection()).await, Some(ConnectionStatus::Tryopen));
    assert_eq!(connection_status(&store, &union_connection()).await, Some(ConnectionStatus::Tryopen));
    for b in &blocks[2..] {
        indexer.apply_block(b, t(1_000)).await.unwrap();
    }

    let osmosis = store.get_connection(&osmosis_connection()).await.unwrap().unwrap();
    assert_eq!(osmosis.status, ConnectionStatus::Open);
    assert_eq!(osmosis.counterparty_chain_id.as_deref(), Some(UNION));
    assert_eq!(osmosis.counterparty_connection_id.as_deref(), Some("connection-3"));
    let union = store.get_connection(&union_connection()).await.unwrap().unwrap();
    assert_eq!(union.status, ConnectionStatus::Open);
    assert_eq!(union.counterparty_chain_id.as_deref(), Some(OSMOSIS));

    let channel = store.get_channel(&osmosis_channel()).await.unwrap().unwrap();
    assert_eq!(channel.status, ChannelStatus::Open);
    assert_eq!(channel.counterparty_chain_id.as_deref(), Some(UNION));
    assert_eq!(channel.counterparty_channel_id.as_deref(), Some("channel-7"));
    assert_eq!(channel.version.as_deref(), Some("ics20-1"));
    assert_eq!(channel_status(&store, &union_channel()).await, Some(ChannelStatus::Open));

    let steps: Vec<HandshakeStep> = store
        .handshake_events(&HandshakeEntity::Connection(osmosis_connection()))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.step)
        .collect();
    assert_eq!(steps, vec![HandshakeStep::OpenInit, HandshakeStep::OpenAck]);
    assert_eq!(indexer.pending().await.handshake, 0);
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn ack_seen_before_try_waits_for_it() {
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&store, handshake_topology());
    let blocks = open_handshake();

    indexer.apply_block(&blocks[0], t(1_000)).await.unwrap();
    indexer.apply_block(&blocks[2], t(1_000)).await.unwrap();
    assert_eq!(connection_status(&store, &osmosis_connection()).await, Some(ConnectionStatus::Init));
    assert_eq!(indexer.pending().await.handshake, 1);

    indexer.apply_block(&blocks[1], t(1_001)).await.unwrap();
    assert_eq!(connection_status(&store, &osmosis_connection()).await, Some(ConnectionStatus::Open));
    assert_eq!(connection_status(&store, &union_connection()).await, Some(ConnectionStatus::Tryopen));
    assert_eq!(indexer.pending().await.handshake, 0);

    indexer.apply_block(&blocks[3], t(1_002)).await.unwrap();
    assert_eq!(connection_status(&store, &union_connection()).await, Some(ConnectionStatus::Open));
}

#[tokio::test]
async fn channel_ack_waits_for_its_connection() {
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&store, handshake_topology());
    let blocks = open_handshake();

    // Connection stops at TRYOPEN on osmosis; the channel gets to its ack.
    for i in [0, 1, 4, 5, 6] {
        indexer.apply_block(&blocks[i], t(1_000)).await.unwrap();
    }
    assert_eq!(channel_status(&store, &osmosis_channel()).await, Some(ChannelStatus::Tryopen));
    assert_eq!(indexer.pending().await.handshake, 1);

    indexer.apply_block(&blocks[2], t(1_001)).await.unwrap();
    assert_eq!(connection_status(&store, &osmosis_connection()).await, Some(ConnectionStatus::Open));
    assert_eq!(channel_status(&store, &osmosis_channel()).await, Some(ChannelStatus::Open));
    assert_eq!(indexer.pending().await.handshake, 0);
}

#[tokio::test]
async fn closing_a_channel_closes_both_ends() {
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&store, handshake_topology());
    for b in open_handshake() {
        indexer.apply_block(&b, t(1_000)).await.unwrap();
    }

    let close_init = block(OSMOSIS, 14, vec![channel_event("close_init", "channel-1", Some("channel-7"), "connection-0")]);
    let close_confirm = block(UNION, 24, vec![channel_event("close_confirm", "channel-7", Some("channel-1"), "connection-3")]);
    indexer.apply_block(&close_init, t(1_001)).await.unwrap();
    assert_eq!(channel_status(&store, &osmosis_channel()).await, Some(ChannelStatus::Closed));
    assert_eq!(channel_status(&store, &union_channel()).await, Some(ChannelStatus::Open));
    indexer.apply_block(&close_confirm, t(1_002)).await.unwrap();
    assert_eq!(channel_status(&store, &union_channel()).await, Some(ChannelStatus::Closed));

    // Connections stay open.
    assert_eq!(connection_status(&store, &osmosis_connection()).await, Some(ConnectionStatus::Open));
    assert_eq!(indexer.pending().await.handshake, 0);
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn unindexed_counterparty_opens_on_ack() {
    let store = Arc::new(InMemoryStorage::new());
    let mut topology = overrides(&[OSMOSIS], &[]);
    topology
        .clients
        .insert((OSMOSIS.to_string(), "07-tendermint-0".to_string()), HUB.to_string());
    let mut indexer = indexer(&store, topology);

    // Only osmosis' own steps are ever observed.
    let blocks = open_handshake();
    for i in [0, 2, 4, 6] {
        indexer.apply_block(&blocks[i], t(1_000)).await.unwrap();
    }

    let connection = store.get_connection(&osmosis_connection()).await.unwrap().unwrap();
    assert_eq!(connection.status, ConnectionStatus::Open);
    assert_eq!(connection.counterparty_chain_id.as_deref(), Some(HUB));
    let channel = store.get_channel(&osmosis_channel()).await.unwrap().unwrap();
    assert_eq!(channel.status, ChannelStatus::Open);
    assert_eq!(channel.counterparty_chain_id.as_deref(), Some(HUB));
    assert_eq!(indexer.pending().await.handshake, 0);
}

#[tokio::test]
async fn replayed_handshake_steps_change_nothing() {
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&store, handshake_topology());
    for b in open_handshake() {
        indexer.apply_block(&b, t(1_000)).await.unwrap();
    }
    let connections = store.list_connections(None).await.unwrap();
    let channels = store.list_channels(None).await.unwrap();
    let events = store
        .handshake_events(&HandshakeEntity::Channel(union_channel()))
        .await
        .unwrap();

    for b in open_handshake() {
        indexer.apply_block(&b, t(2_000)).await.unwrap();
    }

    assert_eq!(store.list_connections(None).await.unwrap(), connections);
    assert_eq!(store.list_channels(None).await.unwrap(), channels);
    assert_eq!(
        store
            .handshake_events(&HandshakeEntity::Channel(union_channel()))
            .await
            .unwrap(),
        events
    );
    assert_eq!(indexer.pending().await.handshake, 0);
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

// ─── Light clients ───────────────────────────────────────────────────────────

#[tokio::test]
async fn light_client_regression_is_flagged() {
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&store, osmosis_union());
    let update = |height: u64| {
        AbciEvent::new("wasm-update_client")
            .attr("client_id", "3")
            .attr("counterparty_height", height.to_string())
    };
    for (i, h) in [100u64, 80, 120].into_iter().enumerate() {
        indexer
            .apply_block(&block(UNION, 10 + i as u64, vec![update(h)]), t(1_000))
            .await
            .unwrap();
    }

    let client = ClientKey::new(IbcVersion::Union, UNION, "3");
    let tip = store.get_client_tip(&client).await.unwrap().unwrap();
    assert_eq!(tip.height, Height::new(0, 120));

    let heights: Vec<u64> = store
        .light_client_updates(&client)
        .await
        .unwrap()
        .iter()
        .map(|u| u.revision_height)
        .collect();
    assert_eq!(heights, vec![100, 120]);

    let anomalies = store.list_anomalies(None).await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::LightClientRegression);
    assert!(anomalies[0].detail.contains("0-80"), "{}", anomalies[0].detail);
}

// ─── Packet forwarding ───────────────────────────────────────────────────────

#[tokio::test]
async fn three_hop_forward_builds_one_route() {
    let store = Arc::new(InMemoryStorage::new());
    let topology = overrides(
        &[OSMOSIS, HUB, NEUTRON, UNION],
        &[
            (OSMOSIS, "channel-1", HUB),
            (HUB, "channel-2", OSMOSIS),
            (HUB, "channel-10", NEUTRON),
            (NEUTRON, "channel-11", HUB),
            (NEUTRON, "channel-20", UNION),
            (UNION, "channel-21", NEUTRON),
        ],
    );
    let mut indexer = indexer(&store, topology);

    let last_hop = json!({"forward": {"receiver": "union1final", "port": "transfer", "channel": "channel-20"}});
    let root_memo = json!({"forward": {
        "receiver": "neutron1middle",
        "port": "transfer",
        "channel": "channel-10",
        "next": last_hop,
    }})
    .to_string();
    let root_data = transfer_hex("osmo1sender", "cosmos1hub", &root_memo);
    let hop1_data = transfer_hex("cosmos1hub", "neutron1middle", &last_hop.to_string());
    let hop2_data = transfer_hex("neutron1middle", "union1final", "");

    let blocks = vec![
        block(OSMOSIS, 100, vec![packet_event("send_packet", 1, "channel-1", "channel-2", &root_data, "1-999999")]),
        block(
            HUB,
            500,
            vec![
                packet_event("recv_packet", 1, "channel-1", "channel-2", &root_data, "1-999999"),
                packet_event("send_packet", 7, "channel-10", "channel-11", &hop1_data, "1-999999"),
            ],
        ),
        block(
            NEUTRON,
            900,
            vec![
                packet_event("recv_packet", 7, "channel-10", "channel-11", &hop1_data, "1-999999"),
                packet_event("send_packet", 3, "channel-20", "channel-21", &hop2_data, "1-999999"),
            ],
        ),
    ];
    for b in &blocks {
        indexer.apply_block(b, t(1_000)).await.unwrap();
    }

    let root = key(1);
    let hop1 = PacketKey::new(IbcVersion::Classic, HUB, "channel-10", "transfer", 7);
    let hop2 = PacketKey::new(IbcVersion::Classic, NEUTRON, "channel-20", "transfer", 3);

    let forwards = store.forwards(&root).await.unwrap();
    assert_eq!(forwards.len(), 2);
    let links: Vec<_> = forwards
        .iter()
        .map(|t| {
            let hop = t.hop.as_ref().unwrap();
            (t.key.clone(), hop.parent.clone(), hop.hop_index, hop.retries)
        })
        .collect();
    assert_eq!(
        links,
        vec![(hop1.clone(), root.clone(), 1, 0), (hop2, hop1.clone(), 2, 0)]
    );
    assert!(store.get_transfer(&root).await.unwrap().unwrap().hop.is_none());
    assert!(store.forwards(&hop1).await.unwrap().is_empty());
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

const HUB: &str = "cosmoshub-4";
const NEUTRON: &str = "neutron-1";

/// Osmosis → hub → neutron, hub's channel-10 known through client 07-tendermint-9.
fn hub_topology() -> TopologyOverrides {
    overrides(
        &[OSMOSIS, HUB, NEUTRON],
        &[
            (OSMOSIS, "channel-1", HUB),
            (HUB, "channel-2", OSMOSIS),
            (HUB, "channel-10", NEUTRON),
            (NEUTRON, "channel-11", HUB),
        ],
    )
}

async fn hub_store() -> Arc<InMemoryStorage> {
    let store = Arc::new(InMemoryStorage::new());
    seed_channel(&store, HUB, "channel-10", "connection-5", "07-tendermint-9", NEUTRON, "channel-11").await;
    store
}

fn root_data(retries: Option<u32>) -> String {
    let mut forward = json!({"receiver": "neutron1dest", "port": "transfer", "channel": "channel-10"});
    if let Some(retries) = retries {
        forward["retries"] = json!(retries);
    }
    transfer_hex("osmo1sender", "cosmos1hub", &json!({ "forward": forward }).to_string())
}

fn root_send(data: &str) -> RawBlock {
    block(OSMOSIS, 100, vec![packet_event("send_packet", 1, "channel-1", "channel-2", data, "1-999999")])
}

fn hub_recv(data: &str) -> AbciEvent {
    packet_event("recv_packet", 1, "channel-1", "channel-2", data, "1-999999")
}

/// An attempt at the hop out of the hub, timing out at hub height 1-200.
fn hub_attempt(kind: &str, seq: u64) -> AbciEvent {
    let data = transfer_hex("cosmos1hub", "neutron1dest", "");
    packet_event(kind, seq, "channel-10", "channel-11", &data, "1-200")
}

fn hub_client_update(height: &str) -> AbciEvent {
    AbciEvent::new("update_client")
        .attr("client_id", "07-tendermint-9")
        .attr("client_type", "07-tendermint")
        .attr("consensus_height", height)
}

/// `(sequence, hop_index, retries)` of every hop under osmosis packet 1.
async fn hops(store: &InMemoryStorage) -> Vec<(u64, u32, u32)> {
    store
        .forwards(&key(1))
        .await
        .unwrap()
        .iter()
        .map(|t| {
            let hop = t.hop.as_ref().unwrap();
            assert_eq!(hop.root, key(1));
            (t.key.sequence, hop.hop_index, hop.retries)
        })
        .collect()
}

fn hub_key(seq: u64) -> PacketKey {
    PacketKey::new(IbcVersion::Classic, HUB, "channel-10", "transfer", seq)
}

#[tokio::test]
async fn forward_sent_before_the_root_is_rerooted() {
    let store = Arc::new(InMemoryStorage::new());
    let topology = overrides(
        &[OSMOSIS, HUB, NEUTRON],
        &[
            (OSMOSIS, "channel-1", HUB),
            (HUB, "channel-2", OSMOSIS),
            (HUB, "channel-10", NEUTRON),
            (NEUTRON, "channel-11", HUB),
            (NEUTRON, "channel-20", UNION),
        ],
    );
    let mut indexer = indexer(&store, topology);

    let last_hop = json!({"forward": {"receiver": "union1final", "port": "transfer", "channel": "channel-20"}});
    let root_memo = json!({"forward": {
        "receiver": "neutron1middle",
        "port": "transfer",
        "channel": "channel-10",
        "next": last_hop,
    }})
    .to_string();
    let root_data = transfer_hex("osmo1sender", "cosmos1hub", &root_memo);
    let hop1_data = transfer_hex("cosmos1hub", "neutron1middle", &last_hop.to_string());
    let hop2_data = transfer_hex("neutron1middle", "union1final", "");

    // Hub and neutron are indexed ahead of osmosis.
    indexer
        .apply_block(
            &block(
                HUB,
                500,
                vec![
                    hub_recv(&root_data),
                    packet_event("send_packet", 7, "channel-10", "channel-11", &hop1_data, "1-999999"),
                ],
            ),
            t(1_000),
        )
        .await
        .unwrap();
    assert_eq!(indexer.pending().await.forward_candidates, 1);
    indexer
        .apply_block(
            &block(
                NEUTRON,
                900,
                vec![
                    packet_event("recv_packet", 7, "channel-10", "channel-11", &hop1_data, "1-999999"),
                    packet_event("send_packet", 3, "channel-20", "channel-21", &hop2_data, "1-999999"),
                ],
            ),
            t(1_000),
        )
        .await
        .unwrap();
    // Linked under hop 7 for now, which is not yet known to be a hop itself.
    let last = PacketKey::new(IbcVersion::Classic, NEUTRON, "channel-20", "transfer", 3);
    let hop = store.get_transfer(&last).await.unwrap().unwrap().hop.unwrap();
    assert_eq!((hop.root, hop.hop_index), (hub_key(7), 1));

    indexer.apply_block(&root_send(&root_data), t(1_001)).await.unwrap();

    assert_eq!(hops(&store).await, vec![(7, 1, 0), (3, 2, 0)]);
    assert!(store.forwards(&hub_key(7)).await.unwrap().is_empty());
    assert_eq!(indexer.pending().await.forward_candidates, 1);
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_links_once_the_failed_attempt_is_proven() {
    let store = hub_store().await;
    let mut indexer = indexer(&store, hub_topology());
    let data = root_data(None);

    indexer.apply_block(&root_send(&data), t(1_000)).await.unwrap();
    indexer
        .apply_block(&block(HUB, 500, vec![hub_recv(&data), hub_attempt("send_packet", 7)]), t(1_000))
        .await
        .unwrap();
    // The retry goes out before the client proves the first attempt timed out.
    indexer
        .apply_block(
            &block(HUB, 600, vec![hub_attempt("timeout_packet", 7), hub_attempt("send_packet", 8)]),
            t(1_000),
        )
        .await
        .unwrap();
    // Candidates: the root itself and the held-back retry.
    assert_eq!(hops(&store).await, vec![(7, 1, 0)]);
    assert_eq!(indexer.pending().await.forward_candidates, 2);

    indexer
        .apply_block(&block(HUB, 601, vec![hub_client_update("1-250")]), t(1_001))
        .await
        .unwrap();
    indexer.sweep(t(1_002)).await.unwrap();

    assert_eq!(store.get_packet(&hub_key(7)).await.unwrap().unwrap().status, PacketStatus::TimedOut);
    assert_eq!(hops(&store).await, vec![(7, 1, 0), (8, 1, 1)]);
    let retry = store.get_transfer(&hub_key(8)).await.unwrap().unwrap();
    assert_eq!(retry.hop.map(|h| h.parent), Some(key(1)));
    assert_eq!(indexer.pending().await.forward_candidates, 1);
    assert!(store.list_anomalies(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_sent_after_the_failure_links_directly() {
    let store = hub_store().await;
    let mut indexer = indexer(&store, hub_topology());
    let data = root_data(None);

    let blocks = vec![
        root_send(&data),
        block(HUB, 500, vec![hub_recv(&data), hub_attempt("send_packet", 7)]),
        block(HUB, 550, vec![hub_client_update("1-250")]),
        block(HUB, 600, vec![hub_attempt("timeout_packet", 7)]),
        block(HUB, 601, vec![hub_attempt("send_packet", 8)]),
    ];
    for b in &blocks {
        indexer.apply_block(b, t(1_000)).await.unwrap();
    }

    assert_eq!(hops(&store).await, vec![(7, 1, 0), (8, 1, 1)]);
    assert_eq!(indexer.pending().await.forward_candidates, 1);
}

#[tokio::test]
async fn retries_stop_at_the_memo_limit() {
    let store = hub_store().await;
    let mut indexer = indexer(&store, hub_topology());
    let data = root_data(Some(0));

    let blocks = vec![
        root_send(&data),
        block(HUB, 500, vec![hub_recv(&data), hub_attempt("send_packet", 7)]),
        block(HUB, 550, vec![hub_client_update("1-250")]),
        block(HUB, 600, vec![hub_attempt("timeout_packet", 7)]),
        block(HUB, 601, vec![hub_attempt("send_packet", 8)]),
    ];
    for b in &blocks {
        indexer.apply_block(b, t(1_000)).await.unwrap();
    }

    assert_eq!(hops(&store).await, vec![(7, 1, 0)]);
    assert!(store.get_transfer(&hub_key(8)).await.unwrap().unwrap().hop.is_none());
    assert_eq!(indexer.pending().await.forward_candidates, 2);
}

#[tokio::test]
async fn link_that_would_close_a_cycle_is_refused() {
    let store = hub_store().await;
    let mut indexer = indexer(&store, hub_topology());
    let data = root_data(None);

    indexer.apply_block(&root_send(&data), t(1_000)).await.unwrap();
    // A corrupted route: the root already claims to descend from hub packet 7.
    let mut root = store.get_transfer(&key(1)).await.unwrap().unwrap();
    root.hop = Some(HopLink {
        root: hub_key(7),
        parent: hub_key(7),
        hop_index: 1,
        retries: 0,
    });
    store.put_transfer(root).await.unwrap();

    indexer
        .apply_block(&block(HUB, 500, vec![hub_recv(&data), hub_attempt("send_packet", 7)]), t(1_000))
        .await
        .unwrap();

    assert!(store.get_transfer(&hub_key(7)).await.unwrap().unwrap().hop.is_none());
    let anomalies = store.list_anomalies(None).await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::Correlation);
    assert!(anomalies[0].detail.contains("cycle"), "{}", anomalies[0].detail);
}

#[tokio::test]
async fn pipeline_links_a_retry_racing_its_timeout() {
    let store = hub_store().await;
    let cancel = CancellationToken::new();
    let config = IndexerConfig {
        shards: 4,
        ..IndexerConfig::default()
    };
    let pipeline = Pipeline::spawn(store.clone(), hub_topology(), &config, cancel.clone());
    let data = root_data(None);

    // The timeout and the retry land on different shards of one block.
    let blocks = vec![
        root_send(&data),
        block(HUB, 500, vec![hub_recv(&data), hub_attempt("send_packet", 7)]),
        block(HUB, 550, vec![hub_client_update("1-250")]),
        block(HUB, 600, vec![hub_attempt("timeout_packet", 7), hub_attempt("send_packet", 8)]),
    ];
    for b in &blocks {
        pipeline.submit(b).await.unwrap();
    }
    pipeline.shutdown().await;

    assert_eq!(hops(&store).await, vec![(7, 1, 0), (8, 1, 1)]);
}

// ─── Statistics ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn incremental_statistics_match_a_rebuild() {
    let store = Arc::new(InMemoryStorage::new());
    let mut indexer = indexer(&store, osmosis_union());
    let aggregator = StatisticsAggregator::new(store.clone());
    let blocks = transfer_42();

    indexer.apply_block(&blocks[0], t(1_000)).await.unwrap();
    let first = aggregator.refresh().await.unwrap();
    assert_eq!(first.statistics.packets, 1);
    assert_eq!(first.statistics.in_flight, 1);

    for b in &blocks[1..] {
        indexer.apply_block(b, t(1_000)).await.unwrap();
    }
    let data = transfer_hex("osmo1sender", "union1other", "");
    indexer
        .apply_block(
            &block(OSMOSIS, 90_000, vec![packet_event("send_packet", 44, "channel-1", "channel-7", &data, "1-999999")]),
            t(1_000),
        )
        .await
        .unwrap();

    let incremental = aggregator.refresh().await.unwrap();
    assert_eq!(incremental.statistics.packets, 2);
    assert_eq!(incremental.statistics.transfers, 2);
    assert_eq!(incremental.statistics.acknowledged, 1);
    assert_eq!(incremental.statistics.sent, 1);
    assert_eq!(incremental.daily_packets.len(), 2);

    let full = aggregator.rebuild().await.unwrap();
    assert_eq!(incremental, full);
    assert_eq!(store.statistics().await.unwrap(), full);

    // Nothing new: a refresh is a fixed point.
    assert_eq!(aggregator.refresh().await.unwrap(), full);
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pipeline_matches_the_sequential_indexer() {
    let store = Arc::new(InMemoryStorage::new());
    let cancel = CancellationToken::new();
    let config = IndexerConfig {
        shards: 3,
        ..IndexerConfig::default()
    };
    let pipeline = Pipeline::spawn(store.clone(), osmosis_union(), &config, cancel.clone());
    assert_eq!(pipeline.shard_count(), 3);

    let mut blocks = transfer_42();
    blocks.push(block(
        OSMOSIS,
        102,
        vec![AbciEvent::new("recv_packet").attr("packet_sequence", "x")],
    ));
    for b in &blocks {
        pipeline.submit(b).await.unwrap();
    }
    pipeline.shutdown().await;

    let packet = store.get_packet(&key(42)).await.unwrap().unwrap();
    assert_eq!(packet.status, PacketStatus::Acknowledged);
    assert_eq!(store.packet_effects(&key(42)).await.unwrap().len(), 4);

    let anomalies = store.list_anomalies(None).await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::Decoding);
}

// ─── Health ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_lagging_chains() {
    let store = Arc::new(InMemoryStorage::new());
    let chains = vec![OSMOSIS.to_string(), UNION.to_string()];
    let policy = HealthPolicy {
        max_tip_age_secs: 120,
        anomaly_window_secs: 3_600,
    };
    let now = t(10_000);

    status::record_block(store.as_ref(), OSMOSIS, 100, "AA", t(9_990), WatcherState::Live, now)
        .await
        .unwrap();
    let report = status::health_check(store.clone(), &chains, policy, now).await.unwrap();
    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(report.lagging_chains, vec![UNION.to_string()]);
    assert_eq!(report.chains[0].tip_age_secs, Some(10));
    assert_eq!(report.chains[1].tip_age_secs, None);

    status::record_block(store.as_ref(), UNION, 200, "BB", t(9_950), WatcherState::Live, now)
        .await
        .unwrap();
    let report = status::health_check(store.clone(), &chains, policy, now).await.unwrap();
    assert_eq!(report.status, HealthStatus::Ok);
    assert_eq!(report.open_anomalies, 0);

    status::set_state(store.as_ref(), UNION, WatcherState::Failing, Some("rpc down".into()), now)
        .await
        .unwrap();
    let report = status::health_check(store.clone(), &chains, policy, now).await.unwrap();
    assert_eq!(report.status, HealthStatus::Degraded);
    assert!(report.lagging_chains.is_empty());
}
