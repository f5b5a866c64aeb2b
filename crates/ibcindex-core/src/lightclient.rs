//! Light-client update tracker.
//!
//! Keeps the per-client tip (highest applied consensus height) and an
//! append-only log of updates. Tips are the time oracle for packet timeouts.
//!
//! Rules:
//! - heights below the tip are rejected as `LIGHT_CLIENT_REGRESSION`, unless
//!   the update comes from a recovery/upgrade event for that client;
//! - an update at a height already in the log is a duplicate no-op;
//! - misbehaviour freezes the client.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::anomaly::{self, Anomaly, AnomalyKind};
use crate::error::Result;
use crate::event::{CanonicalEvent, EventKind};
use crate::model::{ClientRow, ClientTipRow, LightClientUpdateRow};
use crate::store::ReadModelStore;
use crate::types::{ClientKey, EventRef, Height};

/// What happened to a single update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Above the tip (or first update): tip advanced.
    Advanced,
    /// Below the tip, from a recovery: tip moved back.
    Recovered,
    /// Height already recorded.
    Duplicate,
    /// Below the tip without recovery: not applied.
    Regression,
}

/// Decide what an update at `height` does to a client whose tip is `tip`.
pub fn classify_update(tip: Option<Height>, height: Height, recovery: bool) -> UpdateOutcome {
    match tip {
        None => UpdateOutcome::Advanced,
        Some(tip) if height > tip => UpdateOutcome::Advanced,
        Some(tip) if height == tip => UpdateOutcome::Duplicate,
        Some(_) if recovery => UpdateOutcome::Recovered,
        Some(_) => UpdateOutcome::Regression,
    }
}

/// Input to [`LightClientTracker::record`].
#[derive(Debug, Clone)]
pub struct ClientUpdate {
    pub key: ClientKey,
    pub height: Height,
    pub execution_height: Option<u64>,
    pub timestamp_ns: Option<u64>,
    pub recovery: bool,
    pub event: EventRef,
}

pub struct LightClientTracker {
    store: Arc<dyn ReadModelStore>,
}

impl LightClientTracker {
    pub fn new(store: Arc<dyn ReadModelStore>) -> Self {
        Self { store }
    }

    /// Apply one client event. Non-client events are ignored.
    pub async fn apply(&self, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<()> {
        match &ev.kind {
            EventKind::CreateClient(c) => {
                let key = ClientKey::new(c.ibc, ev.chain_id.clone(), c.client_id.clone());
                if self.store.get_client(&key).await?.is_none() {
                    tracing::info!(client = %key, client_type = %c.client_type, "client created");
                    self.store
                        .upsert_client(ClientRow {
                            key: key.clone(),
                            client_type: c.client_type.clone(),
                            counterparty_chain_id: c.counterparty_chain_id.clone(),
                            initial_height: c.consensus_height,
                            created_at: ev.event_ref(),
                            frozen: false,
                            substituted_by: None,
                        })
                        .await?;
                }
                if !c.consensus_height.is_zero() {
                    self.record(
                        ClientUpdate {
                            key,
                            height: c.consensus_height,
                            execution_height: None,
                            timestamp_ns: None,
                            recovery: false,
                            event: ev.event_ref(),
                        },
                        now,
                    )
                    .await?;
                }
            }
            EventKind::UpdateClient(u) => {
                self.record(
                    ClientUpdate {
                        key: ClientKey::new(u.ibc, ev.chain_id.clone(), u.client_id.clone()),
                        height: u.consensus_height,
                        execution_height: u.execution_height,
                        timestamp_ns: u.consensus_timestamp,
                        recovery: false,
                        event: ev.event_ref(),
                    },
                    now,
                )
                .await?;
            }
            EventKind::RecoverClient(r) => {
                let key = ClientKey::new(r.ibc, ev.chain_id.clone(), r.client_id.clone());
                if let Some(mut client) = self.store.get_client(&key).await? {
                    if r.substitute_client_id.is_some() || client.frozen {
                        client.substituted_by = r.substitute_client_id.clone();
                        client.frozen = false;
                        self.store.upsert_client(client).await?;
                    }
                }
                if let Some(height) = r.consensus_height {
                    self.record(
                        ClientUpdate {
                            key,
                            height,
                            execution_height: None,
                            timestamp_ns: None,
                            recovery: true,
                            event: ev.event_ref(),
                        },
                        now,
                    )
                    .await?;
                }
            }
            EventKind::ClientMisbehaviour(m) => {
                let key = ClientKey::new(m.ibc, ev.chain_id.clone(), m.client_id.clone());
                match self.store.get_client(&key).await? {
                    Some(mut client) if !client.frozen => {
                        tracing::warn!(client = %key, "client frozen after misbehaviour");
                        client.frozen = true;
                        self.store.upsert_client(client).await?;
                    }
                    Some(_) => {}
                    None => tracing::debug!(client = %key, "misbehaviour for unknown client"),
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Record an update, advancing the tip when allowed.
    pub async fn record(&self, update: ClientUpdate, now: DateTime<Utc>) -> Result<UpdateOutcome> {
        if self
            .store
            .get_light_client_update(&update.key, update.height)
            .await?
            .is_some()
        {
            return Ok(UpdateOutcome::Duplicate);
        }

        let tip = self.store.get_client_tip(&update.key).await?;
        let outcome = classify_update(tip.as_ref().map(|t| t.height), update.height, update.recovery);

        match outcome {
            UpdateOutcome::Advanced | UpdateOutcome::Recovered => {
                self.store
                    .insert_light_client_update(LightClientUpdateRow {
                        key: update.key.clone(),
                        height: update.height,
                        revision_height: update.height.revision_height,
                        execution_height: update.execution_height,
                        timestamp_ns: update.timestamp_ns,
                        recovery: update.recovery,
                        event: update.event.clone(),
                    })
                    .await?;
                self.store
                    .put_client_tip(ClientTipRow {
                        key: update.key.clone(),
                        height: update.height,
                        timestamp_ns: update.timestamp_ns,
                        updated_at: update.event,
                    })
                    .await?;
                if outcome == UpdateOutcome::Recovered {
                    tracing::info!(client = %update.key, height = %update.height, "client tip reset by recovery");
                }
            }
            UpdateOutcome::Regression => {
                let tip_height = tip.map(|t| t.height).unwrap_or_default();
                anomaly::record(
                    self.store.as_ref(),
                    Anomaly::new(
                        AnomalyKind::LightClientRegression,
                        update.key.chain_id.clone(),
                        update.key.to_string(),
                        &update.event.event_id(),
                        format!(
                            "update to {} is below the recorded tip {}",
                            update.height, tip_height
                        ),
                        now,
                    ),
                )
                .await?;
            }
            UpdateOutcome::Duplicate => {}
        }
        Ok(outcome)
    }
}

/// Whether `tip` proves a packet timeout has elapsed.
///
/// Height timeouts compare the tip height; timestamp timeouts need the
/// tip's consensus time and stay unproven without it.
pub fn timeout_elapsed(tip: &ClientTipRow, timeout_height: Height, timeout_timestamp: u64) -> bool {
    let by_height = !timeout_height.is_zero() && tip.height >= timeout_height;
    let by_time = timeout_timestamp > 0
        && tip
            .timestamp_ns
            .map(|ts| ts >= timeout_timestamp)
            .unwrap_or(false);
    by_height || by_time
}

/// Consensus time of `tip`, in ns since the epoch.
///
/// `ibc-go` update events carry no consensus timestamp. A tendermint client
/// stores the header time of the tracked chain's block at the consensus
/// height, so when `tracked_chain` is indexed its own block time stands in.
/// `None` while that block has not been applied.
pub async fn consensus_time(
    store: &dyn ReadModelStore,
    tracked_chain: &str,
    tip: &ClientTipRow,
) -> Result<Option<u64>> {
    if tip.timestamp_ns.is_some() {
        return Ok(tip.timestamp_ns);
    }
    Ok(store
        .block_time(tracked_chain, tip.height.revision_height)
        .await?
        .and_then(unix_nanos))
}

fn unix_nanos(t: DateTime<Utc>) -> Option<u64> {
    u64::try_from(t.timestamp())
        .ok()?
        .checked_mul(1_000_000_000)?
        .checked_add(u64::from(t.timestamp_subsec_nanos()))
}
