//! Anomalies: protocol-level surprises recorded instead of raised.
//!
//! Ingestion never stops for a malformed payload, an out-of-order event or a
//! light-client regression. Each one becomes an [`Anomaly`] row, logged with
//! `tracing::warn!`, and surfaces through the health check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::ReadModelStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    /// A recognized IBC event whose payload could not be decoded.
    Decoding,
    /// A buffered event whose predecessor never arrived within the TTL.
    Ordering,
    /// Events that cannot belong together: conflicting terminal transitions,
    /// counterparty mismatches, forward cycles.
    Correlation,
    /// A light-client update below the recorded tip.
    LightClientRegression,
    /// A chain watcher exhausted its retries.
    WatcherFailure,
    /// A pending buffer was full and evicted its oldest item.
    BufferOverflow,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decoding => "DECODING",
            Self::Ordering => "ORDERING",
            Self::Correlation => "CORRELATION",
            Self::LightClientRegression => "LIGHT_CLIENT_REGRESSION",
            Self::WatcherFailure => "WATCHER_FAILURE",
            Self::BufferOverflow => "BUFFER_OVERFLOW",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Deduplication key; re-ingesting the same event does not record twice.
    pub id: String,
    pub kind: AnomalyKind,
    pub chain_id: String,
    /// What the anomaly is about (a packet key, a client key, an event id).
    pub subject: String,
    pub detail: String,
    pub observed_at: DateTime<Utc>,
}

impl Anomaly {
    /// Build an anomaly. `origin` distinguishes several anomalies about one
    /// subject, usually the id of the event that triggered it.
    pub fn new(
        kind: AnomalyKind,
        chain_id: impl Into<String>,
        subject: impl Into<String>,
        origin: &str,
        detail: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let chain_id = chain_id.into();
        let subject = subject.into();
        Self {
            id: format!("{kind}|{chain_id}|{subject}|{origin}"),
            kind,
            chain_id,
            subject,
            detail: detail.into(),
            observed_at,
        }
    }
}

/// Log and persist an anomaly. Returns `false` if it was already recorded.
pub async fn record(store: &dyn ReadModelStore, anomaly: Anomaly) -> Result<bool> {
    let inserted = store.insert_anomaly(anomaly.clone()).await?;
    if inserted {
        tracing::warn!(
            kind = %anomaly.kind,
            chain = %anomaly.chain_id,
            subject = %anomaly.subject,
            "{}",
            anomaly.detail
        );
    }
    Ok(inserted)
}
