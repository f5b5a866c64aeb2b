//! Shared identifier, key and status types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

// ─── IbcVersion ──────────────────────────────────────────────────────────────

/// Which IBC implementation emitted an event.
///
/// Both flavours are indexed side by side as independent instances of the
/// same model; every key carries the version so their rows never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IbcVersion {
    /// `ibc-go` style: string identifiers (`channel-1`, `connection-0`).
    Classic,
    /// IBC union: integer identifiers.
    Union,
}

impl IbcVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::Union => "union",
        }
    }
}

impl fmt::Display for IbcVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IbcVersion {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classic" => Ok(Self::Classic),
            "union" => Ok(Self::Union),
            other => Err(IndexerError::Decode(format!("unknown ibc version: {other}"))),
        }
    }
}

// ─── Height ──────────────────────────────────────────────────────────────────

/// An IBC height: `(revision_number, revision_height)`, ordered lexicographically.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Height {
    pub revision_number: u64,
    pub revision_height: u64,
}

impl Height {
    pub fn new(revision_number: u64, revision_height: u64) -> Self {
        Self {
            revision_number,
            revision_height,
        }
    }

    /// A zero height means "no height timeout".
    pub fn is_zero(&self) -> bool {
        self.revision_number == 0 && self.revision_height == 0
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.revision_number, self.revision_height)
    }
}

impl FromStr for Height {
    type Err = IndexerError;

    /// Parses `"1-999999"`; a bare `"999999"` is read as revision 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|e| IndexerError::Decode(format!("invalid height {s:?}: {e}")))
        };
        match s.split_once('-') {
            Some((rev, height)) => Ok(Self::new(parse(rev)?, parse(height)?)),
            None => Ok(Self::new(0, parse(s)?)),
        }
    }
}

// ─── Keys ────────────────────────────────────────────────────────────────────

/// `(ibc, chain_id, client_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientKey {
    pub ibc: IbcVersion,
    pub chain_id: String,
    pub client_id: String,
}

impl ClientKey {
    pub fn new(ibc: IbcVersion, chain_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            ibc,
            chain_id: chain_id.into(),
            client_id: client_id.into(),
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ibc, self.chain_id, self.client_id)
    }
}

/// One end of a connection: `(ibc, chain_id, connection_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub ibc: IbcVersion,
    pub chain_id: String,
    pub connection_id: String,
}

impl ConnectionKey {
    pub fn new(
        ibc: IbcVersion,
        chain_id: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            ibc,
            chain_id: chain_id.into(),
            connection_id: connection_id.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ibc, self.chain_id, self.connection_id)
    }
}

/// One end of a channel: `(ibc, chain_id, port_id, channel_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub ibc: IbcVersion,
    pub chain_id: String,
    pub port_id: String,
    pub channel_id: String,
}

impl ChannelKey {
    pub fn new(
        ibc: IbcVersion,
        chain_id: impl Into<String>,
        port_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            ibc,
            chain_id: chain_id.into(),
            port_id: port_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}",
            self.ibc, self.chain_id, self.port_id, self.channel_id
        )
    }
}

/// Natural key of a packet: `(ibc, source_chain, source_channel, source_port, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketKey {
    pub ibc: IbcVersion,
    pub source_chain_id: String,
    pub source_channel_id: String,
    pub source_port_id: String,
    pub sequence: u64,
}

impl PacketKey {
    pub fn new(
        ibc: IbcVersion,
        source_chain_id: impl Into<String>,
        source_channel_id: impl Into<String>,
        source_port_id: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            ibc,
            source_chain_id: source_chain_id.into(),
            source_channel_id: source_channel_id.into(),
            source_port_id: source_port_id.into(),
            sequence,
        }
    }

    /// The source channel end this packet departed from.
    pub fn source_channel(&self) -> ChannelKey {
        ChannelKey::new(
            self.ibc,
            self.source_chain_id.clone(),
            self.source_port_id.clone(),
            self.source_channel_id.clone(),
        )
    }
}

impl fmt::Display for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}/{}",
            self.ibc, self.source_chain_id, self.source_channel_id, self.source_port_id, self.sequence
        )
    }
}

// ─── Statuses ────────────────────────────────────────────────────────────────

/// Connection handshake state of one connection end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Init,
    Tryopen,
    Open,
}

/// Channel handshake state of one channel end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Init,
    Tryopen,
    Open,
    Closed,
}

/// Packet lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketStatus {
    Sent,
    Received,
    Acknowledged,
    TimedOut,
}

impl PacketStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::TimedOut)
    }
}

macro_rules! status_str {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = IndexerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(IndexerError::Decode(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

status_str!(ConnectionStatus { Init => "INIT", Tryopen => "TRYOPEN", Open => "OPEN" });
status_str!(ChannelStatus { Init => "INIT", Tryopen => "TRYOPEN", Open => "OPEN", Closed => "CLOSED" });
status_str!(PacketStatus {
    Sent => "SENT",
    Received => "RECEIVED",
    Acknowledged => "ACKNOWLEDGED",
    TimedOut => "TIMED_OUT",
});

// ─── EventRef ────────────────────────────────────────────────────────────────

/// Where an event happened on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub chain_id: String,
    pub height: u64,
    pub block_hash: String,
    pub timestamp: DateTime<Utc>,
    /// `None` for block-level (begin/end/finalize block) events.
    pub transaction_hash: Option<String>,
    pub transaction_index: Option<u32>,
    /// Position of the event within the block, counted across all transactions.
    pub event_index: u32,
}

impl EventRef {
    /// Unique identifier of the on-chain log entry.
    pub fn event_id(&self) -> String {
        match self.transaction_index {
            Some(tx) => format!("{}/{}/{}/{}", self.chain_id, self.height, tx, self.event_index),
            None => format!("{}/{}/-/{}", self.chain_id, self.height, self.event_index),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
