//! Event normalizer: maps chain-specific ABCI events to [`CanonicalEvent`]s.
//!
//! Two dialects are understood:
//! - **classic** (`ibc-go`): bare event types such as `send_packet`, string
//!   identifiers (`channel-1`), heights encoded as `"<rev>-<height>"`.
//! - **union**: `wasm-` prefixed event types such as `wasm-packet_send`,
//!   integer identifiers, plain integer heights.
//!
//! Every ABCI event yields exactly one canonical event. Non-IBC events become
//! [`EventKind::Unrelated`]; IBC events with a broken payload become
//! [`EventKind::Unrecognized`] so they can be surfaced rather than lost.

use crate::event::{
    AbciEvent, CanonicalEvent, ChannelHandshake, ClientMisbehaviour, ConnectionHandshake,
    CreateClient, EventKind, HandshakeStep, PacketEvent, RawBlock, RecoverClient, UpdateClient,
    WriteAcknowledgement,
};
use crate::types::{Height, IbcVersion};

/// Stateless ABCI → canonical event mapper.
#[derive(Debug, Default, Clone, Copy)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize every event in a block, transactions first, then block events.
    ///
    /// `event_index` counts across the whole block so that it is unique per
    /// `(chain_id, height)`.
    pub fn normalize_block(&self, block: &RawBlock) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        let mut event_index = 0u32;

        for tx in &block.txs {
            for ev in &tx.events {
                out.push(CanonicalEvent {
                    chain_id: block.chain_id.clone(),
                    height: block.height,
                    block_hash: block.hash.clone(),
                    transaction_hash: Some(tx.hash.clone()),
                    transaction_index: Some(tx.index),
                    event_index,
                    timestamp: block.time,
                    kind: self.normalize_event(ev),
                });
                event_index += 1;
            }
        }
        for ev in &block.block_events {
            out.push(CanonicalEvent {
                chain_id: block.chain_id.clone(),
                height: block.height,
                block_hash: block.hash.clone(),
                transaction_hash: None,
                transaction_index: None,
                event_index,
                timestamp: block.time,
                kind: self.normalize_event(ev),
            });
            event_index += 1;
        }
        out
    }

    /// Map a single ABCI event to its canonical kind.
    pub fn normalize_event(&self, ev: &AbciEvent) -> EventKind {
        let (ibc, name) = match ev.kind.strip_prefix("wasm-") {
            Some(rest) => (IbcVersion::Union, rest),
            None => (IbcVersion::Classic, ev.kind.as_str()),
        };
        let attrs = Attrs { ev, ibc };

        let decoded = match (ibc, name) {
            (_, "create_client") => attrs.create_client().map(EventKind::CreateClient),
            (_, "update_client") => attrs.update_client().map(EventKind::UpdateClient),
            (_, "upgrade_client") => attrs.upgrade_client().map(EventKind::RecoverClient),
            (_, "recover_client") => attrs.recover_client().map(EventKind::RecoverClient),
            (IbcVersion::Classic, "client_misbehaviour") | (IbcVersion::Union, "misbehaviour") => {
                attrs.misbehaviour().map(EventKind::ClientMisbehaviour)
            }
            (_, "connection_open_init") => attrs.connection(HandshakeStep::OpenInit),
            (_, "connection_open_try") => attrs.connection(HandshakeStep::OpenTry),
            (_, "connection_open_ack") => attrs.connection(HandshakeStep::OpenAck),
            (_, "connection_open_confirm") => attrs.connection(HandshakeStep::OpenConfirm),
            (_, "channel_open_init") => attrs.channel(HandshakeStep::OpenInit),
            (_, "channel_open_try") => attrs.channel(HandshakeStep::OpenTry),
            (_, "channel_open_ack") => attrs.channel(HandshakeStep::OpenAck),
            (_, "channel_open_confirm") => attrs.channel(HandshakeStep::OpenConfirm),
            (_, "channel_close_init") => attrs.channel(HandshakeStep::CloseInit),
            (_, "channel_close_confirm") => attrs.channel(HandshakeStep::CloseConfirm),
            (IbcVersion::Classic, "send_packet") | (IbcVersion::Union, "packet_send") => {
                attrs.packet().map(EventKind::SendPacket)
            }
            (IbcVersion::Classic, "recv_packet") | (IbcVersion::Union, "packet_recv") => {
                attrs.packet().map(EventKind::RecvPacket)
            }
            (IbcVersion::Classic, "write_acknowledgement") | (IbcVersion::Union, "write_ack") => {
                attrs.write_ack().map(EventKind::WriteAcknowledgement)
            }
            (IbcVersion::Classic, "acknowledge_packet") | (IbcVersion::Union, "packet_ack") => {
                attrs.packet().map(EventKind::AcknowledgePacket)
            }
            (IbcVersion::Classic, "timeout_packet") | (IbcVersion::Union, "packet_timeout") => {
                attrs.packet().map(EventKind::TimeoutPacket)
            }
            _ => {
                return EventKind::Unrelated {
                    event_type: ev.kind.clone(),
                }
            }
        };

        decoded.unwrap_or_else(|reason| EventKind::Unrecognized {
            event_type: ev.kind.clone(),
            reason,
            attributes: ev.attributes.clone(),
        })
    }
}

// ─── Attribute access ────────────────────────────────────────────────────────

type Decoded<T> = Result<T, String>;

struct Attrs<'a> {
    ev: &'a AbciEvent,
    ibc: IbcVersion,
}

impl<'a> Attrs<'a> {
    /// Attribute value; empty strings count as absent.
    fn optional(&self, key: &str) -> Option<&'a str> {
        self.ev.get(key).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Decoded<&'a str> {
        self.optional(key)
            .ok_or_else(|| format!("missing attribute '{key}'"))
    }

    fn u64(&self, key: &str) -> Decoded<u64> {
        let raw = self.required(key)?;
        raw.parse::<u64>()
            .map_err(|e| format!("attribute '{key}' is not an integer ({raw:?}): {e}"))
    }

    fn optional_u64(&self, key: &str) -> Decoded<Option<u64>> {
        self.optional(key)
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|e| format!("attribute '{key}' is not an integer ({raw:?}): {e}"))
            })
            .transpose()
    }

    /// An IBC identifier. Union identifiers must be integers.
    fn id(&self, key: &str) -> Decoded<String> {
        let raw = self.required(key)?;
        self.check_id(key, raw)
    }

    fn optional_id(&self, key: &str) -> Decoded<Option<String>> {
        self.optional(key)
            .map(|raw| self.check_id(key, raw))
            .transpose()
    }

    fn check_id(&self, key: &str, raw: &str) -> Decoded<String> {
        match self.ibc {
            IbcVersion::Classic => Ok(raw.to_string()),
            IbcVersion::Union => raw
                .parse::<u32>()
                .map(|n| n.to_string())
                .map_err(|e| format!("union identifier '{key}' must be an integer ({raw:?}): {e}")),
        }
    }

    /// Classic heights are `"<rev>-<height>"`; union heights are plain integers.
    fn height(&self, key: &str) -> Decoded<Height> {
        let raw = self.required(key)?;
        parse_height(raw).map_err(|e| format!("attribute '{key}': {e}"))
    }

    fn optional_height(&self, key: &str) -> Decoded<Option<Height>> {
        self.optional(key)
            .map(|raw| parse_height(raw).map_err(|e| format!("attribute '{key}': {e}")))
            .transpose()
    }

    fn hex(&self, key: &str) -> Decoded<Option<String>> {
        self.optional(key).map(normalize_hex).transpose()
    }

    // ─── Clients ─────────────────────────────────────────────────────────────

    fn create_client(&self) -> Decoded<CreateClient> {
        let height_key = match self.ibc {
            IbcVersion::Classic => "consensus_height",
            IbcVersion::Union => "counterparty_height",
        };
        Ok(CreateClient {
            ibc: self.ibc,
            client_id: self.id("client_id")?,
            client_type: self.required("client_type")?.to_string(),
            consensus_height: self.optional_height(height_key)?.unwrap_or_default(),
            counterparty_chain_id: self.optional("counterparty_chain_id").map(str::to_string),
        })
    }

    fn update_client(&self) -> Decoded<UpdateClient> {
        let consensus_height = match self.ibc {
            // `consensus_heights` lists every height a header batch produced.
            IbcVersion::Classic => match self.optional("consensus_heights") {
                Some(list) => list
                    .split(',')
                    .map(|h| parse_height(h.trim()))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| format!("attribute 'consensus_heights': {e}"))?
                    .into_iter()
                    .max()
                    .ok_or_else(|| "empty 'consensus_heights'".to_string())?,
                None => self.height("consensus_height")?,
            },
            IbcVersion::Union => self.height("counterparty_height")?,
        };
        let timestamp_key = match self.ibc {
            IbcVersion::Classic => "consensus_timestamp",
            IbcVersion::Union => "counterparty_timestamp",
        };
        Ok(UpdateClient {
            ibc: self.ibc,
            client_id: self.id("client_id")?,
            consensus_height,
            execution_height: self.optional_u64("execution_height")?,
            consensus_timestamp: self.optional_u64(timestamp_key)?,
        })
    }

    fn upgrade_client(&self) -> Decoded<RecoverClient> {
        let height_key = match self.ibc {
            IbcVersion::Classic => "consensus_height",
            IbcVersion::Union => "counterparty_height",
        };
        Ok(RecoverClient {
            ibc: self.ibc,
            client_id: self.id("client_id")?,
            substitute_client_id: None,
            consensus_height: self.optional_height(height_key)?,
        })
    }

    fn recover_client(&self) -> Decoded<RecoverClient> {
        let (subject_key, height_key) = match self.ibc {
            IbcVersion::Classic => ("subject_client_id", "consensus_height"),
            IbcVersion::Union => ("client_id", "counterparty_height"),
        };
        Ok(RecoverClient {
            ibc: self.ibc,
            client_id: self.id(subject_key)?,
            substitute_client_id: self.optional_id("substitute_client_id")?,
            consensus_height: self.optional_height(height_key)?,
        })
    }

    fn misbehaviour(&self) -> Decoded<ClientMisbehaviour> {
        Ok(ClientMisbehaviour {
            ibc: self.ibc,
            client_id: self.id("client_id")?,
        })
    }

    // ─── Handshakes ──────────────────────────────────────────────────────────

    fn connection(&self, step: HandshakeStep) -> Decoded<EventKind> {
        Ok(EventKind::ConnectionHandshake(ConnectionHandshake {
            ibc: self.ibc,
            step,
            connection_id: self.id("connection_id")?,
            client_id: self.id("client_id")?,
            counterparty_client_id: self.id("counterparty_client_id")?,
            counterparty_connection_id: self.optional_id("counterparty_connection_id")?,
        }))
    }

    fn channel(&self, step: HandshakeStep) -> Decoded<EventKind> {
        Ok(EventKind::ChannelHandshake(ChannelHandshake {
            ibc: self.ibc,
            step,
            port_id: self.required("port_id")?.to_string(),
            channel_id: self.id("channel_id")?,
            counterparty_port_id: self.required("counterparty_port_id")?.to_string(),
            counterparty_channel_id: self.optional_id("counterparty_channel_id")?,
            connection_id: self.id("connection_id")?,
            version: self.optional("version").map(str::to_string),
        }))
    }

    // ─── Packets ─────────────────────────────────────────────────────────────

    fn packet(&self) -> Decoded<PacketEvent> {
        let data_hex = match self.hex("packet_data_hex")? {
            Some(hex) => Some(hex),
            None => match self.ibc {
                // Classic nodes may only emit the raw UTF-8 data.
                IbcVersion::Classic => self.optional("packet_data").map(|s| hex::encode(s.as_bytes())),
                IbcVersion::Union => self.hex("packet_data")?,
            },
        };
        let (src_port, dst_port) = match self.ibc {
            IbcVersion::Classic => (
                self.required("packet_src_port")?.to_string(),
                self.required("packet_dst_port")?.to_string(),
            ),
            // Union packets are addressed by channel alone; ports are informative.
            IbcVersion::Union => (
                self.optional("packet_source_port").unwrap_or_default().to_string(),
                self.optional("packet_destination_port").unwrap_or_default().to_string(),
            ),
        };
        let (src_channel, dst_channel) = match self.ibc {
            IbcVersion::Classic => (
                self.id("packet_src_channel")?,
                self.id("packet_dst_channel")?,
            ),
            IbcVersion::Union => (
                self.id("packet_source_channel_id")?,
                self.id("packet_destination_channel_id")?,
            ),
        };
        Ok(PacketEvent {
            ibc: self.ibc,
            sequence: self.u64("packet_sequence")?,
            source_port_id: src_port,
            source_channel_id: src_channel,
            destination_port_id: dst_port,
            destination_channel_id: dst_channel,
            timeout_height: self.optional_height("packet_timeout_height")?.unwrap_or_default(),
            timeout_timestamp: self.optional_u64("packet_timeout_timestamp")?.unwrap_or(0),
            data_hex,
            acknowledgement_hex: self.hex("acknowledgement")?,
        })
    }

    fn write_ack(&self) -> Decoded<WriteAcknowledgement> {
        let packet = self.packet()?;
        let ack = match self.ibc {
            IbcVersion::Classic => match self.hex("packet_ack_hex")? {
                Some(hex) => hex,
                None => hex::encode(self.required("packet_ack")?.as_bytes()),
            },
            IbcVersion::Union => packet
                .acknowledgement_hex
                .clone()
                .ok_or_else(|| "missing attribute 'acknowledgement'".to_string())?,
        };
        Ok(WriteAcknowledgement {
            packet,
            acknowledgement_hex: ack,
        })
    }
}

fn parse_height(raw: &str) -> Result<Height, String> {
    raw.parse::<Height>().map_err(|e| e.to_string())
}

/// Lowercase, `0x`-stripped, validated hex.
fn normalize_hex(raw: &str) -> Decoded<String> {
    let stripped = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw)
        .to_ascii_lowercase();
    hex::decode(&stripped).map_err(|e| format!("invalid hex {raw:?}: {e}"))?;
    Ok(stripped)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
