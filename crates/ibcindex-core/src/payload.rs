//! Packet payload decoding.
//!
//! A packet's data is decoded into a tagged [`PacketPayload`]:
//!
//! - `Transfer`: ICS-20 fungible token packet data (JSON), with an optional
//!   packet-forward instruction parsed out of its memo.
//! - `FungibleAssetOrder`: the union token-order instruction (JSON).
//! - `Generic`: anything else; the raw bytes stay on the packet row.
//!
//! Acknowledgements are decoded per IBC version into an [`AckSummary`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::IbcVersion;

/// Acknowledgement fill type emitted when the protocol filled an order.
pub const FILL_TYPE_PROTOCOL: &str = "0xb0cad0";
/// Acknowledgement fill type emitted when a market maker filled an order.
pub const FILL_TYPE_MARKET_MAKER: &str = "0xd1cec45e";

/// Union instruction opcode for a fungible asset order.
const OP_FUNGIBLE_ASSET_ORDER: u64 = 3;

// ─── Payload variants ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PacketPayload {
    Generic,
    Transfer(TransferData),
    FungibleAssetOrder(FungibleAssetOrderData),
}

impl PacketPayload {
    /// Decode hex packet data. Never fails: undecodable data is `Generic`.
    pub fn decode(ibc: IbcVersion, data_hex: Option<&str>) -> Self {
        let Some(bytes) = data_hex.and_then(|h| hex::decode(h).ok()) else {
            return Self::Generic;
        };
        let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
            return Self::Generic;
        };

        if ibc == IbcVersion::Union {
            if let Some(order) = FungibleAssetOrderData::from_instruction(&value) {
                return Self::FungibleAssetOrder(order);
            }
        }
        match TransferData::from_json(value) {
            Some(transfer) => Self::Transfer(transfer),
            None => Self::Generic,
        }
    }

    pub fn as_transfer(&self) -> Option<&TransferData> {
        match self {
            Self::Transfer(t) => Some(t),
            _ => None,
        }
    }
}

/// ICS-20 fungible token packet data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferData {
    pub sender: String,
    pub receiver: String,
    pub denom: String,
    pub amount: String,
    pub memo: String,
    pub forward: Option<ForwardInstruction>,
    /// The decoded packet data as sent.
    pub packet_data: Value,
}

#[derive(Deserialize)]
struct Ics20Wire {
    denom: String,
    amount: Value,
    sender: String,
    receiver: String,
    #[serde(default)]
    memo: String,
}

impl TransferData {
    fn from_json(value: Value) -> Option<Self> {
        let wire: Ics20Wire = serde_json::from_value(value.clone()).ok()?;
        // Amount is a decimal string on the wire; some senders use a number.
        let amount = match wire.amount {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self {
            forward: ForwardInstruction::from_memo(&wire.memo),
            sender: wire.sender,
            receiver: wire.receiver,
            denom: wire.denom,
            amount,
            memo: wire.memo,
            packet_data: value,
        })
    }
}

// ─── Packet forwarding ───────────────────────────────────────────────────────

/// The `forward` object of a packet-forward-middleware memo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardInstruction {
    pub receiver: String,
    pub port: String,
    pub channel: String,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout: Option<Value>,
    /// Memo for the next hop; may itself carry a `forward`.
    #[serde(default)]
    pub next: Option<Value>,
}

impl ForwardInstruction {
    /// Parse `{"forward": {...}}` out of a transfer memo.
    pub fn from_memo(memo: &str) -> Option<Self> {
        if memo.trim().is_empty() {
            return None;
        }
        let mut value: Value = serde_json::from_str(memo).ok()?;
        let forward = value.get_mut("forward")?.take();
        serde_json::from_value(forward).ok()
    }

    /// The `next` memo as a JSON value. Nested memos are sometimes encoded
    /// as a JSON string rather than an object.
    fn next_value(&self) -> Option<Value> {
        match &self.next {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => serde_json::from_str(s).ok().or(Some(Value::String(s.clone()))),
            Some(other) => Some(other.clone()),
        }
    }

    /// Whether an outbound transfer memo is the one this instruction produces.
    ///
    /// Without `next` the forwarded transfer carries an empty memo.
    pub fn memo_matches(&self, memo: &str) -> bool {
        match self.next_value() {
            None => memo.trim().is_empty(),
            Some(expected) => match serde_json::from_str::<Value>(memo) {
                Ok(actual) => actual == expected,
                Err(_) => expected == Value::String(memo.to_string()),
            },
        }
    }
}

// ─── Fungible asset orders ───────────────────────────────────────────────────

/// A union fungible asset order: `base_amount` of `base_token` offered for
/// `quote_amount` of `quote_token` on the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FungibleAssetOrderData {
    pub sender: String,
    pub receiver: String,
    pub base_token: String,
    pub base_amount: String,
    pub base_token_symbol: Option<String>,
    pub base_token_name: Option<String>,
    pub base_token_decimals: Option<u8>,
    pub base_token_path: Option<String>,
    pub quote_token: String,
    pub quote_amount: String,
    pub instruction: Value,
}

#[derive(Deserialize)]
struct InstructionWire {
    opcode: u64,
    operand: Value,
}

#[derive(Deserialize)]
struct OrderWire {
    sender: String,
    receiver: String,
    base_token: String,
    base_amount: Value,
    #[serde(default)]
    base_token_symbol: Option<String>,
    #[serde(default)]
    base_token_name: Option<String>,
    #[serde(default)]
    base_token_decimals: Option<u8>,
    #[serde(default)]
    base_token_path: Option<Value>,
    quote_token: String,
    quote_amount: Value,
}

fn json_scalar(v: Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl FungibleAssetOrderData {
    fn from_instruction(value: &Value) -> Option<Self> {
        let ins: InstructionWire = serde_json::from_value(value.clone()).ok()?;
        if ins.opcode != OP_FUNGIBLE_ASSET_ORDER {
            return None;
        }
        let order: OrderWire = serde_json::from_value(ins.operand).ok()?;
        Some(Self {
            sender: order.sender,
            receiver: order.receiver,
            base_token: order.base_token,
            base_amount: json_scalar(order.base_amount)?,
            base_token_symbol: order.base_token_symbol,
            base_token_name: order.base_token_name,
            base_token_decimals: order.base_token_decimals,
            base_token_path: order.base_token_path.and_then(json_scalar),
            quote_token: order.quote_token,
            quote_amount: json_scalar(order.quote_amount)?,
            instruction: value.clone(),
        })
    }
}

// ─── Acknowledgements ────────────────────────────────────────────────────────

/// Who filled a fungible asset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillType {
    Protocol,
    MarketMaker,
}

impl FillType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            FILL_TYPE_PROTOCOL => Some(Self::Protocol),
            FILL_TYPE_MARKET_MAKER => Some(Self::MarketMaker),
            _ => None,
        }
    }
}

/// What an acknowledgement says about the packet's execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSummary {
    /// `None` when the acknowledgement format is not understood.
    pub success: Option<bool>,
    pub error: Option<String>,
    pub fill_type: Option<FillType>,
    pub market_maker: Option<String>,
}

impl AckSummary {
    pub fn decode(ibc: IbcVersion, ack_hex: &str) -> Self {
        let Some(value) = hex::decode(ack_hex)
            .ok()
            .and_then(|b| serde_json::from_slice::<Value>(&b).ok())
        else {
            return Self::default();
        };
        match ibc {
            IbcVersion::Classic => Self::decode_classic(&value),
            IbcVersion::Union => Self::decode_union(&value),
        }
    }

    /// `{"result": "<base64>"}` or `{"error": "<message>"}`.
    fn decode_classic(value: &Value) -> Self {
        if value.get("result").is_some() {
            return Self {
                success: Some(true),
                ..Self::default()
            };
        }
        match value.get("error") {
            Some(err) => Self {
                success: Some(false),
                error: Some(err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string())),
                ..Self::default()
            },
            None => Self::default(),
        }
    }

    /// `{"tag": 1, "inner_ack": {"fill_type": "0x…", "market_maker": "0x…"}}`;
    /// tag 1 is success, anything else failure.
    fn decode_union(value: &Value) -> Self {
        let Some(tag) = value.get("tag").and_then(Value::as_u64) else {
            return Self::default();
        };
        let inner = value.get("inner_ack");
        let fill_type = inner
            .and_then(|i| i.get("fill_type"))
            .and_then(Value::as_str)
            .and_then(FillType::from_tag);
        let market_maker = match fill_type {
            Some(FillType::MarketMaker) => inner
                .and_then(|i| i.get("market_maker"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        Self {
            success: Some(tag == 1),
            error: None,
            fill_type,
            market_maker,
        }
    }
}
