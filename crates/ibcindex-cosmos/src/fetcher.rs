//! CometBFT block fetcher.
//!
//! Uses the CometBFT RPC `status`, `block` and `block_results` endpoints to
//! assemble a [`RawBlock`]: every transaction with its ABCI events, followed
//! by the begin/end/finalize-block events.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use ibcindex_core::error::IndexerError;
use ibcindex_core::event::{AbciEvent, RawBlock, RawTx};

/// CometBFT's answer when asked for a block above its head.
const HEIGHT_NOT_AVAILABLE: &str = "must be less than or equal to the current blockchain height";

/// Trait for fetching blocks from a CometBFT node.
#[async_trait]
pub trait CometRpcClient: Send + Sync {
    /// Height of the latest committed block.
    async fn latest_height(&self) -> Result<u64, IndexerError>;
    /// The block at `height` with all its events, or `None` if the node does
    /// not have it yet.
    async fn block(&self, height: u64) -> Result<Option<RawBlock>, IndexerError>;
}

/// [`CometRpcClient`] over HTTP.
pub struct HttpCometClient {
    chain_id: String,
    url: String,
    http: reqwest::Client,
}

impl HttpCometClient {
    pub fn new(
        chain_id: impl Into<String>,
        url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| IndexerError::Rpc(format!("failed to build http client: {e}")))?;
        Ok(Self {
            chain_id: chain_id.into(),
            url: url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// GET `{url}/{method}` and unwrap the JSON-RPC envelope.
    async fn call(&self, method: &str, query: &[(&str, String)]) -> Result<Value, IndexerError> {
        let resp = self
            .http
            .get(format!("{}/{method}", self.url))
            .query(query)
            .send()
            .await
            .map_err(|e| IndexerError::Rpc(format!("{method}: {e}")))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| IndexerError::Rpc(format!("{method}: HTTP {status}: {e}")))?;

        if let Some(err) = body.get("error") {
            let detail = err
                .get("data")
                .and_then(Value::as_str)
                .or_else(|| err.get("message").and_then(Value::as_str))
                .unwrap_or_default();
            return Err(IndexerError::Rpc(format!("{method}: {detail}")));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| IndexerError::Rpc(format!("{method}: HTTP {status}: no result")))
    }
}

#[async_trait]
impl CometRpcClient for HttpCometClient {
    async fn latest_height(&self) -> Result<u64, IndexerError> {
        let status = self.call("status", &[]).await?;
        parse_latest_height(&status)
    }

    async fn block(&self, height: u64) -> Result<Option<RawBlock>, IndexerError> {
        let query = [("height", height.to_string())];
        let block = match self.call("block", &query).await {
            Ok(block) => block,
            Err(IndexerError::Rpc(msg)) if msg.contains(HEIGHT_NOT_AVAILABLE) => return Ok(None),
            Err(e) => return Err(e),
        };
        let results = self.call("block_results", &query).await?;
        let raw = assemble_block(&self.chain_id, &block, &results)?;
        tracing::trace!(chain = %self.chain_id, height, txs = raw.txs.len(), "block fetched");
        Ok(Some(raw))
    }
}

// ─── Response parsing ────────────────────────────────────────────────────────

fn decode_err(what: &str) -> IndexerError {
    IndexerError::Decode(format!("unexpected CometBFT response: missing {what}"))
}

/// CometBFT encodes 64-bit integers as JSON strings.
fn int(v: &Value) -> Option<u64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// `result.sync_info.latest_block_height` of `/status`.
pub fn parse_latest_height(status: &Value) -> Result<u64, IndexerError> {
    int(&status["sync_info"]["latest_block_height"])
        .ok_or_else(|| decode_err("sync_info.latest_block_height"))
}

/// Transaction hash as reported by explorers: upper-case hex SHA-256 of the tx bytes.
pub fn tx_hash(tx_base64: &str) -> Result<String, IndexerError> {
    let bytes = BASE64
        .decode(tx_base64)
        .map_err(|e| IndexerError::Decode(format!("tx is not base64: {e}")))?;
    Ok(hex::encode_upper(Sha256::digest(bytes)))
}

fn events(v: &Value) -> Vec<AbciEvent> {
    let Some(list) = v.as_array() else {
        return Vec::new();
    };
    list.iter()
        .map(|ev| AbciEvent {
            kind: ev["type"].as_str().unwrap_or_default().to_string(),
            attributes: ev["attributes"]
                .as_array()
                .map(|attrs| {
                    attrs
                        .iter()
                        .map(|a| {
                            (
                                a["key"].as_str().unwrap_or_default().to_string(),
                                a["value"].as_str().unwrap_or_default().to_string(),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect()
}

/// Build a [`RawBlock`] from `/block` and `/block_results` results.
///
/// Events of failed transactions (non-zero `code`) were reverted on chain
/// and are left out; the transaction keeps its index.
pub fn assemble_block(chain_id: &str, block: &Value, results: &Value) -> Result<RawBlock, IndexerError> {
    let header = &block["block"]["header"];
    let height = int(&header["height"]).ok_or_else(|| decode_err("block.header.height"))?;
    let time = header["time"]
        .as_str()
        .ok_or_else(|| decode_err("block.header.time"))?;
    let time: DateTime<Utc> = DateTime::parse_from_rfc3339(time)
        .map_err(|e| IndexerError::Decode(format!("block time {time:?}: {e}")))?
        .with_timezone(&Utc);
    let hash = block["block_id"]["hash"]
        .as_str()
        .ok_or_else(|| decode_err("block_id.hash"))?
        .to_string();

    let txs_data: Vec<&str> = block["block"]["data"]["txs"]
        .as_array()
        .map(|txs| txs.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let empty = Vec::new();
    let tx_results = results["txs_results"].as_array().unwrap_or(&empty);
    if tx_results.len() != txs_data.len() {
        return Err(IndexerError::Decode(format!(
            "block {height}: {} txs but {} tx results",
            txs_data.len(),
            tx_results.len()
        )));
    }

    let mut txs = Vec::with_capacity(txs_data.len());
    for (index, (data, result)) in txs_data.iter().zip(tx_results).enumerate() {
        let code = int(&result["code"]).unwrap_or(0);
        txs.push(RawTx {
            hash: tx_hash(data)?,
            index: index as u32,
            events: if code == 0 { events(&result["events"]) } else { Vec::new() },
        });
    }

    let mut block_events = events(&results["begin_block_events"]);
    block_events.extend(events(&results["end_block_events"]));
    block_events.extend(events(&results["finalize_block_events"]));

    Ok(RawBlock {
        chain_id: chain_id.to_string(),
        height,
        hash,
        time,
        txs,
        block_events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block_json(txs: Vec<&str>) -> Value {
        json!({
            "block_id": { "hash": "A1B2C3" },
            "block": {
                "header": { "chain_id": "osmosis-1", "height": "100", "time": "2024-03-01T12:00:00.5Z" },
                "data": { "txs": txs }
            }
        })
    }

    fn attr(key: &str, value: &str) -> Value {
        json!({ "key": key, "value": value, "index": true })
    }

    #[test]
    fn latest_height_from_status() {
        let status = json!({ "sync_info": { "latest_block_height": "12345", "catching_up": false } });
        assert_eq!(parse_latest_height(&status).unwrap(), 12345);
        assert!(parse_latest_height(&json!({})).is_err());
    }

    #[test]
    fn tx_hash_is_sha256_of_bytes() {
        // sha256 of the empty transaction.
        assert_eq!(
            tx_hash("").unwrap(),
            "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855"
        );
        assert!(tx_hash("not base64!").is_err());
    }

    #[test]
    fn assembles_txs_and_block_events() {
        let tx1 = BASE64.encode(b"tx-one");
        let tx2 = BASE64.encode(b"tx-two");
        let results = json!({
            "height": "100",
            "txs_results": [
                { "code": 0, "events": [
                    { "type": "send_packet", "attributes": [attr("packet_sequence", "42")] }
                ]},
                { "code": 5, "events": [
                    { "type": "recv_packet", "attributes": [attr("packet_sequence", "7")] }
                ]}
            ],
            "finalize_block_events": [
                { "type": "update_client", "attributes": [attr("client_id", "07-tendermint-0")] }
            ]
        });

        let raw = assemble_block("osmosis-1", &block_json(vec![&tx1, &tx2]), &results).unwrap();
        assert_eq!(raw.height, 100);
        assert_eq!(raw.hash, "A1B2C3");
        assert_eq!(raw.time.timestamp_millis(), 1_709_294_400_500);
        assert_eq!(raw.txs.len(), 2);
        assert_eq!(raw.txs[0].hash, hex::encode_upper(Sha256::digest(b"tx-one")));
        assert_eq!(raw.txs[0].events[0].get("packet_sequence"), Some("42"));
        assert!(raw.txs[1].events.is_empty());
        assert_eq!(raw.txs[1].index, 1);
        assert_eq!(raw.block_events.len(), 1);
        assert_eq!(raw.block_events[0].kind, "update_client");
    }

    #[test]
    fn mismatched_results_are_rejected() {
        let tx = BASE64.encode(b"tx");
        let results = json!({ "txs_results": null });
        assert!(assemble_block("osmosis-1", &block_json(vec![&tx]), &results).is_err());

        let empty = assemble_block("osmosis-1", &block_json(vec![]), &results).unwrap();
        assert!(empty.txs.is_empty());
    }
}
