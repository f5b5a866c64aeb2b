//! Index status bookkeeping and the health check.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::model::{ChainHealth, HealthCheck, HealthStatus, IndexStatusRow, WatcherState};
use crate::store::ReadModelStore;

/// Thresholds for [`health_check`].
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// A chain whose last indexed block is older than this is lagging.
    pub max_tip_age_secs: i64,
    /// Anomalies observed within this window count as open.
    pub anomaly_window_secs: i64,
}

/// Record that `chain_id` applied a block.
pub async fn record_block(
    store: &dyn ReadModelStore,
    chain_id: &str,
    height: u64,
    block_hash: &str,
    block_time: DateTime<Utc>,
    state: WatcherState,
    now: DateTime<Utc>,
) -> Result<()> {
    store
        .put_index_status(IndexStatusRow {
            chain_id: chain_id.to_string(),
            last_height: height,
            last_block_hash: block_hash.to_string(),
            last_block_time: block_time,
            updated_at: now,
            state,
            last_error: None,
        })
        .await
}

/// Change a chain's watcher state, keeping its last indexed block.
pub async fn set_state(
    store: &dyn ReadModelStore,
    chain_id: &str,
    state: WatcherState,
    error: Option<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    let row = match store.get_index_status(chain_id).await? {
        Some(mut row) => {
            row.state = state;
            row.last_error = error;
            row.updated_at = now;
            row
        }
        None => IndexStatusRow {
            chain_id: chain_id.to_string(),
            last_height: 0,
            last_block_hash: String::new(),
            last_block_time: DateTime::<Utc>::default(),
            updated_at: now,
            state,
            last_error: error,
        },
    };
    store.put_index_status(row).await
}

/// Derive the health of the enabled chains.
///
/// DEGRADED when any chain has indexed nothing yet, its tip is older than
/// the policy allows, its watcher is failing, or anomalies are open.
pub async fn health_check(
    store: Arc<dyn ReadModelStore>,
    chains: &[String],
    policy: HealthPolicy,
    now: DateTime<Utc>,
) -> Result<HealthCheck> {
    let mut report = Vec::with_capacity(chains.len());
    let mut lagging_chains = Vec::new();
    let mut failing = false;

    for chain_id in chains {
        let status = store.get_index_status(chain_id).await?;
        let tip_age_secs = status
            .as_ref()
            .filter(|s| s.last_height > 0)
            .map(|s| s.tip_age_secs(now));
        let state = status.as_ref().map(|s| s.state);
        let lagging = tip_age_secs.map_or(true, |age| age > policy.max_tip_age_secs);
        failing |= state == Some(WatcherState::Failing);
        if lagging {
            lagging_chains.push(chain_id.clone());
        }
        report.push(ChainHealth {
            chain_id: chain_id.clone(),
            tip_age_secs,
            state,
            lagging,
        });
    }

    let since = now - Duration::seconds(policy.anomaly_window_secs);
    let open_anomalies = store.list_anomalies(Some(since)).await?.len() as u64;

    let status = if lagging_chains.is_empty() && !failing && open_anomalies == 0 {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    };
    Ok(HealthCheck {
        status,
        chains: report,
        lagging_chains,
        open_anomalies,
        checked_at: now,
    })
}
