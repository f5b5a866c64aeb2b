//! Statistics aggregator: daily and per-address rollups over the read model.
//!
//! Every contribution a packet or transfer makes to the rollups is fixed when
//! the row is created (the UTC day of the send, the normalized sender and
//! receiver), so an incremental run only needs rows created after the last
//! watermark. Global status totals change with every transition and are
//! always recounted, over the same rows the daily counts cover.
//!
//! A full rebuild and any sequence of incremental runs over the same store
//! produce identical snapshots. Rows are sorted by day or address.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{
    DailyCountRow, PacketRow, StatisticsAddressRow, StatisticsRow, StatsSnapshot, StatusCounts,
    TransferRow,
};
use crate::store::ReadModelStore;

// ─── Rollup ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct AddressTotals {
    sent: u64,
    received: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl AddressTotals {
    fn touch(&mut self, at: DateTime<Utc>) {
        self.first_seen = self.first_seen.min(at);
        self.last_seen = self.last_seen.max(at);
    }
}

/// Accumulator for the additive parts of a [`StatsSnapshot`].
#[derive(Debug, Default)]
pub struct Rollup {
    daily_packets: BTreeMap<NaiveDate, u64>,
    daily_transfers: BTreeMap<NaiveDate, u64>,
    addresses: BTreeMap<String, AddressTotals>,
    transfers: u64,
    watermark: u64,
}

impl Rollup {
    /// Resume from a stored snapshot.
    pub fn from_snapshot(snapshot: &StatsSnapshot) -> Self {
        Self {
            daily_packets: snapshot
                .daily_packets
                .iter()
                .map(|r| (r.day, r.count))
                .collect(),
            daily_transfers: snapshot
                .daily_transfers
                .iter()
                .map(|r| (r.day, r.count))
                .collect(),
            addresses: snapshot
                .addresses
                .iter()
                .map(|a| {
                    (
                        a.address.clone(),
                        AddressTotals {
                            sent: a.transfers_sent,
                            received: a.transfers_received,
                            first_seen: a.first_seen,
                            last_seen: a.last_seen,
                        },
                    )
                })
                .collect(),
            transfers: snapshot.statistics.transfers,
            watermark: snapshot.watermark,
        }
    }

    pub fn add_packet(&mut self, packet: &PacketRow) {
        *self.daily_packets.entry(packet.day()).or_default() += 1;
    }

    pub fn add_transfer(&mut self, transfer: &TransferRow) {
        *self.daily_transfers.entry(transfer.day()).or_default() += 1;
        self.transfers += 1;
        self.address(&transfer.sender_normalized, transfer.timestamp, true);
        self.address(&transfer.receiver_normalized, transfer.timestamp, false);
    }

    fn address(&mut self, address: &str, at: DateTime<Utc>, sent: bool) {
        if address.is_empty() {
            return;
        }
        let totals = self
            .addresses
            .entry(address.to_string())
            .or_insert(AddressTotals {
                sent: 0,
                received: 0,
                first_seen: at,
                last_seen: at,
            });
        totals.touch(at);
        if sent {
            totals.sent += 1;
        } else {
            totals.received += 1;
        }
    }

    /// Produce the snapshot, with global totals taken from `counts`.
    pub fn finish(self, counts: StatusCounts, watermark: u64) -> StatsSnapshot {
        let daily = |m: BTreeMap<NaiveDate, u64>| {
            m.into_iter()
                .map(|(day, count)| DailyCountRow { day, count })
                .collect()
        };
        StatsSnapshot {
            daily_packets: daily(self.daily_packets),
            daily_transfers: daily(self.daily_transfers),
            statistics: StatisticsRow {
                packets: counts.total(),
                transfers: self.transfers,
                sent: counts.sent,
                received: counts.received,
                acknowledged: counts.acknowledged,
                timed_out: counts.timed_out,
                in_flight: counts.sent + counts.received,
            },
            addresses: self
                .addresses
                .into_iter()
                .map(|(address, t)| StatisticsAddressRow {
                    address,
                    transfers_sent: t.sent,
                    transfers_received: t.received,
                    first_seen: t.first_seen,
                    last_seen: t.last_seen,
                })
                .collect(),
            watermark: watermark.max(self.watermark),
        }
    }
}

/// Compute every rollup from scratch over rows created up to `bound`.
pub fn compute_full(packets: &[PacketRow], transfers: &[TransferRow], bound: u64) -> StatsSnapshot {
    let mut rollup = Rollup::default();
    let mut counts = StatusCounts::default();
    for p in packets.iter().filter(|p| p.created_seq <= bound) {
        rollup.add_packet(p);
        counts.add(p.status);
    }
    for t in transfers.iter().filter(|t| t.created_seq <= bound) {
        rollup.add_transfer(t);
    }
    rollup.finish(counts, bound)
}

// ─── Aggregator ──────────────────────────────────────────────────────────────

/// Reads a store snapshot and writes the rollups back.
pub struct StatisticsAggregator {
    store: Arc<dyn ReadModelStore>,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<dyn ReadModelStore>) -> Self {
        Self { store }
    }

    /// Recompute everything and replace the stored statistics.
    pub async fn rebuild(&self) -> Result<StatsSnapshot> {
        let bound = self.store.last_write_seq().await?;
        let packets = self.store.list_packets().await?;
        let transfers = self.store.list_transfers().await?;
        let snapshot = compute_full(&packets, &transfers, bound);
        self.store.replace_statistics(snapshot.clone()).await?;
        tracing::info!(
            packets = snapshot.statistics.packets,
            transfers = snapshot.statistics.transfers,
            watermark = snapshot.watermark,
            "statistics rebuilt"
        );
        Ok(snapshot)
    }

    /// Fold rows created since the stored watermark into the stored rollups.
    pub async fn refresh(&self) -> Result<StatsSnapshot> {
        // Read the bound first: rows written while we read must wait for the
        // next run instead of being skipped by a watermark past them.
        let bound = self.store.last_write_seq().await?;
        let previous = self.store.statistics().await?;
        let mut rollup = Rollup::from_snapshot(&previous);

        let packets = self.store.packets_created_since(previous.watermark).await?;
        let transfers = self.store.transfers_created_since(previous.watermark).await?;
        let mut folded = 0usize;
        for p in packets.iter().filter(|p| p.created_seq <= bound) {
            rollup.add_packet(p);
            folded += 1;
        }
        for t in transfers.iter().filter(|t| t.created_seq <= bound) {
            rollup.add_transfer(t);
            folded += 1;
        }

        // Same bound as the daily rows, so `packets` always equals their sum.
        let counts = self.store.packet_status_counts(bound).await?;
        let snapshot = rollup.finish(counts, bound);
        if snapshot != previous {
            self.store.replace_statistics(snapshot.clone()).await?;
        }
        tracing::debug!(folded, watermark = snapshot.watermark, "statistics refreshed");
        Ok(snapshot)
    }

    /// Refresh on `interval` until cancelled. Failures are logged and retried
    /// on the next tick.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::warn!(error = %e, "statistics refresh failed");
                    }
                }
            }
        }
        tracing::info!("statistics task stopped");
    }
}
