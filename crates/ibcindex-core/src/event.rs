//! Raw chain input and the canonical event model.
//!
//! Chain adapters produce [`RawBlock`]s; the [`normalizer`](crate::normalizer)
//! turns each ABCI event in a block into exactly one [`CanonicalEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EventRef, Height, IbcVersion};

// ─── Raw input ───────────────────────────────────────────────────────────────

/// An ABCI event: a type string and an ordered attribute list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbciEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

impl AbciEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    /// Builder-style attribute push, handy for fixtures.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A transaction's events as delivered by the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTx {
    pub hash: String,
    pub index: u32,
    pub events: Vec<AbciEvent>,
}

/// A block with every event it emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    pub chain_id: String,
    pub height: u64,
    pub hash: String,
    pub time: DateTime<Utc>,
    pub txs: Vec<RawTx>,
    /// Begin/end/finalize-block events, emitted after all transactions.
    pub block_events: Vec<AbciEvent>,
}

// ─── Canonical events ────────────────────────────────────────────────────────

/// One canonical event per on-chain log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub chain_id: String,
    pub height: u64,
    pub block_hash: String,
    pub transaction_hash: Option<String>,
    pub transaction_index: Option<u32>,
    pub event_index: u32,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl CanonicalEvent {
    /// The on-chain location of this event.
    pub fn event_ref(&self) -> EventRef {
        EventRef {
            chain_id: self.chain_id.clone(),
            height: self.height,
            block_hash: self.block_hash.clone(),
            timestamp: self.timestamp,
            transaction_hash: self.transaction_hash.clone(),
            transaction_index: self.transaction_index,
            event_index: self.event_index,
        }
    }

    pub fn event_id(&self) -> String {
        self.event_ref().event_id()
    }

    /// Which consumer handles this event.
    pub fn route(&self) -> EventRoute {
        match &self.kind {
            EventKind::CreateClient(_)
            | EventKind::UpdateClient(_)
            | EventKind::RecoverClient(_)
            | EventKind::ClientMisbehaviour(_) => EventRoute::LightClient,
            EventKind::ConnectionHandshake(_) | EventKind::ChannelHandshake(_) => {
                EventRoute::Handshake
            }
            EventKind::SendPacket(p)
            | EventKind::RecvPacket(p)
            | EventKind::AcknowledgePacket(p)
            | EventKind::TimeoutPacket(p) => EventRoute::Packet(p.shard_hash()),
            EventKind::WriteAcknowledgement(w) => EventRoute::Packet(w.packet.shard_hash()),
            EventKind::Unrecognized { .. } => EventRoute::Anomaly,
            EventKind::Unrelated { .. } => EventRoute::Ignore,
        }
    }
}

/// Dispatch target for a canonical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRoute {
    Handshake,
    LightClient,
    /// Packet events carry a hash of the part of their correlation key that
    /// is identical on both chains, so send and recv land on the same shard.
    Packet(u64),
    Anomaly,
    Ignore,
}

/// The tagged kind + payload of a canonical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    CreateClient(CreateClient),
    UpdateClient(UpdateClient),
    RecoverClient(RecoverClient),
    ClientMisbehaviour(ClientMisbehaviour),
    ConnectionHandshake(ConnectionHandshake),
    ChannelHandshake(ChannelHandshake),
    SendPacket(PacketEvent),
    RecvPacket(PacketEvent),
    WriteAcknowledgement(WriteAcknowledgement),
    AcknowledgePacket(PacketEvent),
    TimeoutPacket(PacketEvent),
    /// A recognized IBC event whose payload could not be decoded.
    Unrecognized {
        event_type: String,
        reason: String,
        attributes: Vec<(String, String)>,
    },
    /// A non-IBC event; emitted so nothing is silently lost, ignored downstream.
    Unrelated { event_type: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateClient(_) => "CREATE_CLIENT",
            Self::UpdateClient(_) => "UPDATE_CLIENT",
            Self::RecoverClient(_) => "RECOVER_CLIENT",
            Self::ClientMisbehaviour(_) => "CLIENT_MISBEHAVIOUR",
            Self::ConnectionHandshake(_) => "CONNECTION_HANDSHAKE",
            Self::ChannelHandshake(_) => "CHANNEL_HANDSHAKE",
            Self::SendPacket(_) => "SEND_PACKET",
            Self::RecvPacket(_) => "RECV_PACKET",
            Self::WriteAcknowledgement(_) => "WRITE_ACK",
            Self::AcknowledgePacket(_) => "ACKNOWLEDGE_PACKET",
            Self::TimeoutPacket(_) => "TIMEOUT_PACKET",
            Self::Unrecognized { .. } => "UNRECOGNIZED",
            Self::Unrelated { .. } => "UNRELATED",
        }
    }
}

// ─── Payloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateClient {
    pub ibc: IbcVersion,
    pub client_id: String,
    pub client_type: String,
    pub consensus_height: Height,
    /// Present when the event names the tracked chain (union does).
    pub counterparty_chain_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateClient {
    pub ibc: IbcVersion,
    pub client_id: String,
    pub consensus_height: Height,
    /// Execution-layer height for rollup clients.
    pub execution_height: Option<u64>,
    /// Consensus timestamp of the counterparty at `consensus_height`, ns since epoch.
    pub consensus_timestamp: Option<u64>,
}

/// Client recovery, substitution or upgrade: allowed to move the tip backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverClient {
    pub ibc: IbcVersion,
    pub client_id: String,
    pub substitute_client_id: Option<String>,
    pub consensus_height: Option<Height>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMisbehaviour {
    pub ibc: IbcVersion,
    pub client_id: String,
}

/// The four handshake steps, plus channel closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStep {
    OpenInit,
    OpenTry,
    OpenAck,
    OpenConfirm,
    CloseInit,
    CloseConfirm,
}

impl HandshakeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenInit => "open_init",
            Self::OpenTry => "open_try",
            Self::OpenAck => "open_ack",
            Self::OpenConfirm => "open_confirm",
            Self::CloseInit => "close_init",
            Self::CloseConfirm => "close_confirm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandshake {
    pub ibc: IbcVersion,
    pub step: HandshakeStep,
    pub connection_id: String,
    pub client_id: String,
    pub counterparty_client_id: String,
    pub counterparty_connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHandshake {
    pub ibc: IbcVersion,
    pub step: HandshakeStep,
    pub port_id: String,
    pub channel_id: String,
    pub counterparty_port_id: String,
    pub counterparty_channel_id: Option<String>,
    pub connection_id: String,
    pub version: Option<String>,
}

/// Fields shared by every packet lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketEvent {
    pub ibc: IbcVersion,
    pub sequence: u64,
    pub source_port_id: String,
    pub source_channel_id: String,
    pub destination_port_id: String,
    pub destination_channel_id: String,
    pub timeout_height: Height,
    /// Nanoseconds since epoch; zero means no timestamp timeout.
    pub timeout_timestamp: u64,
    /// Hex-encoded packet data, when the event carries it.
    pub data_hex: Option<String>,
    /// Hex-encoded acknowledgement, for union acks that carry it inline.
    pub acknowledgement_hex: Option<String>,
}

impl PacketEvent {
    /// Hash of `(ibc, source_channel, source_port, sequence)`: the part of the
    /// correlation key visible on both ends of the packet.
    pub fn shard_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.ibc.hash(&mut hasher);
        self.source_channel_id.hash(&mut hasher);
        self.source_port_id.hash(&mut hasher);
        self.sequence.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAcknowledgement {
    pub packet: PacketEvent,
    pub acknowledgement_hex: String,
}
