//! Packet lifecycle tracker.
//!
//! ```text
//! SENT ──(recv on destination)──▶ RECEIVED ──(ack on source)──▶ ACKNOWLEDGED
//!   └──(timeout on source, proven by the light client)──▶ TIMED_OUT
//! ```
//!
//! Packets are keyed by `(ibc, source chain, source channel, source port,
//! sequence)`. Destination-side events name only the destination channel;
//! their source chain is resolved through the channel's counterparty.
//!
//! Events that arrive before their predecessor are buffered by packet key
//! and replayed once the predecessor lands. Conflicting transitions (recv
//! after timeout, a second terminal transition) are recorded as
//! `CORRELATION` anomalies and not applied. Every write is a
//! compare-and-swap on the packet's revision. The packet row is written
//! before the rows derived from it, and a replay of the same event re-runs
//! those derived writes.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::address::normalize_address;
use crate::anomaly::{self, Anomaly, AnomalyKind};
use crate::error::{IndexerError, Result};
use crate::event::{CanonicalEvent, EventKind, PacketEvent, WriteAcknowledgement};
use crate::forward::ForwardCorrelator;
use crate::lightclient::{consensus_time, timeout_elapsed};
use crate::model::{
    EffectKind, FungibleAssetOrderRow, PacketEffectRow, PacketRow, PacketSource, TransferRow,
};
use crate::payload::{AckSummary, PacketPayload};
use crate::pending::{Pending, PendingQueue};
use crate::store::ReadModelStore;
use crate::topology::{Counterparty, Topology};
use crate::types::{ChannelKey, PacketKey, PacketStatus};

/// Attempts at a compare-and-swap before giving up.
const CAS_ATTEMPTS: usize = 5;

/// What a buffered packet event is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketWait {
    /// A state change of this packet.
    Packet(PacketKey),
    /// The source (or destination) chain to become resolvable.
    Topology,
    /// The light client to prove this packet's timeout.
    Proof(PacketKey),
}

enum Outcome {
    Applied(PacketKey),
    Noop,
    Blocked(PacketWait),
}

/// Where the source half of a destination-side event lives.
enum Source {
    Key(PacketKey),
    External,
    Unknown,
}

pub struct PacketTracker {
    store: Arc<dyn ReadModelStore>,
    topology: Topology,
    forwards: Arc<Mutex<ForwardCorrelator>>,
    pending: PendingQueue<PacketWait, CanonicalEvent>,
}

impl PacketTracker {
    pub fn new(
        store: Arc<dyn ReadModelStore>,
        topology: Topology,
        forwards: Arc<Mutex<ForwardCorrelator>>,
        capacity: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            topology,
            forwards,
            pending: PendingQueue::new(capacity, ttl),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Apply one packet event. Other events are ignored.
    pub async fn apply(&mut self, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<()> {
        if !matches!(
            ev.kind,
            EventKind::SendPacket(_)
                | EventKind::RecvPacket(_)
                | EventKind::WriteAcknowledgement(_)
                | EventKind::AcknowledgePacket(_)
                | EventKind::TimeoutPacket(_)
        ) {
            return Ok(());
        }
        let mut work = VecDeque::new();
        work.push_back(Pending {
            key: PacketWait::Topology,
            value: ev.clone(),
            enqueued_at: now,
        });
        self.run(work, now).await
    }

    /// Escalate expired events and retry the rest.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> Result<()> {
        let sweep = self.pending.sweep(now);
        for item in sweep.expired {
            let (kind, detail) = match (&item.key, &item.value.kind) {
                (PacketWait::Packet(_), EventKind::RecvPacket(_))
                | (PacketWait::Packet(_), EventKind::WriteAcknowledgement(_)) => (
                    AnomalyKind::Correlation,
                    "no matching send within retention".to_string(),
                ),
                (PacketWait::Proof(_), _) => (
                    AnomalyKind::Ordering,
                    "timeout never proven by the light client".to_string(),
                ),
                (wait, _) => (
                    AnomalyKind::Ordering,
                    format!("still waiting for {wait:?} after TTL"),
                ),
            };
            anomaly::record(
                self.store.as_ref(),
                Anomaly::new(
                    kind,
                    item.value.chain_id.clone(),
                    describe(&item.value),
                    &item.value.event_id(),
                    detail,
                    now,
                ),
            )
            .await?;
        }
        self.run(sweep.retry.into(), now).await
    }

    async fn run(
        &mut self,
        mut work: VecDeque<Pending<PacketWait, CanonicalEvent>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        while let Some(item) = work.pop_front() {
            match self.step(&item.value, now).await? {
                Outcome::Applied(key) => {
                    work.extend(self.pending.take(&PacketWait::Packet(key.clone())));
                    work.extend(self.pending.take(&PacketWait::Proof(key)));
                }
                Outcome::Noop => {}
                Outcome::Blocked(wait) => {
                    tracing::debug!(event = %describe(&item.value), wait = ?wait, "packet event buffered");
                    let evicted = self.pending.requeue(Pending {
                        key: wait,
                        value: item.value,
                        enqueued_at: item.enqueued_at,
                    });
                    if let Some(evicted) = evicted {
                        anomaly::record(
                            self.store.as_ref(),
                            Anomaly::new(
                                AnomalyKind::BufferOverflow,
                                evicted.value.chain_id.clone(),
                                describe(&evicted.value),
                                &evicted.value.event_id(),
                                "packet buffer full; oldest event evicted",
                                now,
                            ),
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn step(&self, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<Outcome> {
        match &ev.kind {
            EventKind::SendPacket(p) => self.on_send(ev, p, now).await,
            EventKind::RecvPacket(p) => self.on_recv(ev, p, now).await,
            EventKind::WriteAcknowledgement(w) => self.on_write_ack(ev, w, now).await,
            EventKind::AcknowledgePacket(p) => self.on_ack(ev, p, now).await,
            EventKind::TimeoutPacket(p) => self.on_timeout(ev, p, now).await,
            _ => Ok(Outcome::Noop),
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn source_key(ev: &CanonicalEvent, p: &PacketEvent) -> PacketKey {
        PacketKey::new(
            p.ibc,
            ev.chain_id.clone(),
            p.source_channel_id.clone(),
            p.source_port_id.clone(),
            p.sequence,
        )
    }

    /// Resolve the packet key of an event observed on the destination chain.
    async fn resolve_source(&self, ev: &CanonicalEvent, p: &PacketEvent) -> Result<Source> {
        let dest = ChannelKey::new(
            p.ibc,
            ev.chain_id.clone(),
            p.destination_port_id.clone(),
            p.destination_channel_id.clone(),
        );
        Ok(match self.topology.channel_counterparty(&dest, None).await? {
            Counterparty::Indexed(source_chain) => Source::Key(PacketKey::new(
                p.ibc,
                source_chain,
                p.source_channel_id.clone(),
                p.source_port_id.clone(),
                p.sequence,
            )),
            Counterparty::External(_) => Source::External,
            Counterparty::Unknown => Source::Unknown,
        })
    }

    /// Compare-and-swap write. `None` means another writer won the race.
    async fn save(&self, row: PacketRow, expected: Option<u64>) -> Result<Option<PacketRow>> {
        match self.store.put_packet(row, expected).await {
            Ok(stored) => Ok(Some(stored)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn exhausted(key: &PacketKey) -> IndexerError {
        IndexerError::Conflict {
            entity: format!("packet {key}"),
            expected: None,
            found: None,
        }
    }

    async fn effect(&self, key: &PacketKey, kind: EffectKind, ev: &CanonicalEvent) -> Result<()> {
        self.store
            .insert_packet_effect(PacketEffectRow {
                key: key.clone(),
                kind,
                event: ev.event_ref(),
            })
            .await?;
        Ok(())
    }

    async fn correlation(
        &self,
        ev: &CanonicalEvent,
        key: &PacketKey,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        anomaly::record(
            self.store.as_ref(),
            Anomaly::new(
                AnomalyKind::Correlation,
                ev.chain_id.clone(),
                key.to_string(),
                &ev.event_id(),
                detail,
                now,
            ),
        )
        .await?;
        Ok(Outcome::Noop)
    }

    // ─── Send ────────────────────────────────────────────────────────────────

    async fn on_send(
        &self,
        ev: &CanonicalEvent,
        p: &PacketEvent,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let key = Self::source_key(ev, p);
        let destination_chain_id = match self.store.get_packet(&key).await? {
            Some(existing) => existing.destination_chain_id,
            None => {
                let channel = key.source_channel();
                let destination = self
                    .topology
                    .channel_counterparty(&channel, None)
                    .await?
                    .chain_id()
                    .map(str::to_string);
                let row = PacketRow::sent(
                    key.clone(),
                    destination.clone(),
                    p.destination_port_id.clone(),
                    p.destination_channel_id.clone(),
                    PacketSource {
                        event: ev.event_ref(),
                        timeout_height: p.timeout_height,
                        timeout_timestamp: p.timeout_timestamp,
                        data_hex: p.data_hex.clone(),
                    },
                );
                if self.save(row, None).await?.is_some() {
                    tracing::debug!(packet = %key, "packet sent");
                }
                destination
            }
        };
        self.effect(&key, EffectKind::Send, ev).await?;

        match PacketPayload::decode(p.ibc, p.data_hex.as_deref()) {
            PacketPayload::Transfer(t) => {
                let stored = match self.store.get_transfer(&key).await? {
                    Some(existing) => existing,
                    None => {
                        self.store
                            .put_transfer(TransferRow {
                                key: key.clone(),
                                sender_normalized: normalize_address(&t.sender),
                                receiver_normalized: normalize_address(&t.receiver),
                                sender: t.sender,
                                receiver: t.receiver,
                                denom: t.denom,
                                amount: t.amount,
                                memo: t.memo,
                                packet_data: t.packet_data,
                                forward: t.forward,
                                hop: None,
                                destination_chain_id,
                                timestamp: ev.timestamp,
                                write_seq: 0,
                                created_seq: 0,
                            })
                            .await?
                    }
                };
                // Also on replay: the correlator may not have seen it yet.
                self.forwards.lock().await.on_send(&stored, now).await?;
            }
            PacketPayload::FungibleAssetOrder(o) => {
                if self.store.get_fungible_asset_order(&key).await?.is_none() {
                    self.store
                        .put_fungible_asset_order(FungibleAssetOrderRow {
                            key: key.clone(),
                            sender_normalized: normalize_address(&o.sender),
                            receiver_normalized: normalize_address(&o.receiver),
                            sender: o.sender,
                            receiver: o.receiver,
                            base_token: o.base_token,
                            base_amount: o.base_amount,
                            base_token_symbol: o.base_token_symbol,
                            base_token_name: o.base_token_name,
                            base_token_decimals: o.base_token_decimals,
                            base_token_path: o.base_token_path,
                            quote_token: o.quote_token,
                            quote_amount: o.quote_amount,
                            instruction: o.instruction,
                            ack_success: None,
                            ack_fill_type: None,
                            ack_market_maker: None,
                            timestamp: ev.timestamp,
                        })
                        .await?;
                }
            }
            PacketPayload::Generic => {}
        }
        Ok(Outcome::Applied(key))
    }

    // ─── Recv ────────────────────────────────────────────────────────────────

    async fn on_recv(
        &self,
        ev: &CanonicalEvent,
        p: &PacketEvent,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let key = match self.resolve_source(ev, p).await? {
            Source::Key(key) => key,
            Source::External => {
                tracing::trace!(chain = %ev.chain_id, seq = p.sequence, "recv from unindexed chain");
                return Ok(Outcome::Noop);
            }
            Source::Unknown => return Ok(Outcome::Blocked(PacketWait::Topology)),
        };

        for _ in 0..CAS_ATTEMPTS {
            let Some(row) = self.store.get_packet(&key).await? else {
                return Ok(Outcome::Blocked(PacketWait::Packet(key)));
            };
            if row.destination_channel_id != p.destination_channel_id
                || row.destination_port_id != p.destination_port_id
                || row
                    .destination_chain_id
                    .as_deref()
                    .map_or(false, |d| d != ev.chain_id)
            {
                return self
                    .correlation(
                        ev,
                        &key,
                        format!(
                            "recv on {}/{}/{} does not match the send's destination {:?}/{}/{}",
                            ev.chain_id,
                            p.destination_port_id,
                            p.destination_channel_id,
                            row.destination_chain_id,
                            row.destination_port_id,
                            row.destination_channel_id
                        ),
                        now,
                    )
                    .await;
            }
            if let Some(destination) = &row.destination {
                if destination.event_id() == ev.event_id() {
                    self.after_recv(&key, ev, now).await?;
                }
                return Ok(Outcome::Noop);
            }
            if row.status == PacketStatus::TimedOut {
                return self.correlation(ev, &key, "recv after timeout", now).await;
            }

            let revision = row.revision;
            let mut next = row;
            next.destination = Some(ev.event_ref());
            next.destination_chain_id = Some(ev.chain_id.clone());
            if next.status == PacketStatus::Sent {
                next.status = PacketStatus::Received;
            }
            if self.save(next, Some(revision)).await?.is_none() {
                continue;
            }
            tracing::debug!(packet = %key, chain = %ev.chain_id, "packet received");
            self.after_recv(&key, ev, now).await?;
            return Ok(Outcome::Applied(key));
        }
        Err(Self::exhausted(&key))
    }

    async fn after_recv(&self, key: &PacketKey, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<()> {
        self.effect(key, EffectKind::Recv, ev).await?;
        if let Some(mut transfer) = self.store.get_transfer(key).await? {
            if transfer.destination_chain_id.is_none() {
                transfer.destination_chain_id = Some(ev.chain_id.clone());
                self.store.put_transfer(transfer).await?;
            }
            self.forwards
                .lock()
                .await
                .on_recv(key, &ev.chain_id, now)
                .await?;
        }
        Ok(())
    }

    // ─── Write acknowledgement ───────────────────────────────────────────────

    async fn on_write_ack(
        &self,
        ev: &CanonicalEvent,
        w: &WriteAcknowledgement,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let key = match self.resolve_source(ev, &w.packet).await? {
            Source::Key(key) => key,
            Source::External => return Ok(Outcome::Noop),
            Source::Unknown => return Ok(Outcome::Blocked(PacketWait::Topology)),
        };

        for _ in 0..CAS_ATTEMPTS {
            let Some(row) = self.store.get_packet(&key).await? else {
                return Ok(Outcome::Blocked(PacketWait::Packet(key)));
            };
            if let Some(write_ack) = &row.write_ack {
                if write_ack.event_id() == ev.event_id() {
                    self.after_ack(&key, EffectKind::WriteAck, ev, row.ack.as_ref(), now)
                        .await?;
                }
                return Ok(Outcome::Noop);
            }
            if row.destination.is_none() {
                match row.status {
                    PacketStatus::TimedOut => {
                        return self.correlation(ev, &key, "write_ack after timeout", now).await
                    }
                    PacketStatus::Sent | PacketStatus::Received => {
                        return Ok(Outcome::Blocked(PacketWait::Packet(key)))
                    }
                    PacketStatus::Acknowledged => {}
                }
            }

            let summary = AckSummary::decode(key.ibc, &w.acknowledgement_hex);
            let revision = row.revision;
            let mut next = row;
            next.write_ack = Some(ev.event_ref());
            next.acknowledgement_hex = Some(w.acknowledgement_hex.clone());
            next.ack = Some(summary.clone());
            if self.save(next, Some(revision)).await?.is_none() {
                continue;
            }
            self.after_ack(&key, EffectKind::WriteAck, ev, Some(&summary), now)
                .await?;
            return Ok(Outcome::Applied(key));
        }
        Err(Self::exhausted(&key))
    }

    /// Effect row, order fill and, for an error ack, the retry check.
    async fn after_ack(
        &self,
        key: &PacketKey,
        kind: EffectKind,
        ev: &CanonicalEvent,
        ack: Option<&AckSummary>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.effect(key, kind, ev).await?;
        let Some(ack) = ack else {
            return Ok(());
        };
        self.record_order_ack(key, ack).await?;
        if ack.success == Some(false) {
            self.forwards
                .lock()
                .await
                .on_attempt_failed(key, now)
                .await?;
        }
        Ok(())
    }

    async fn record_order_ack(&self, key: &PacketKey, ack: &AckSummary) -> Result<()> {
        if let Some(mut order) = self.store.get_fungible_asset_order(key).await? {
            order.ack_success = ack.success;
            order.ack_fill_type = ack.fill_type;
            order.ack_market_maker = ack.market_maker.clone();
            self.store.put_fungible_asset_order(order).await?;
        }
        Ok(())
    }

    // ─── Acknowledge ─────────────────────────────────────────────────────────

    async fn on_ack(
        &self,
        ev: &CanonicalEvent,
        p: &PacketEvent,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let key = Self::source_key(ev, p);

        for _ in 0..CAS_ATTEMPTS {
            let Some(row) = self.store.get_packet(&key).await? else {
                return Ok(Outcome::Blocked(PacketWait::Packet(key)));
            };
            match row.status {
                PacketStatus::Acknowledged => {
                    let same = row
                        .resolution
                        .as_ref()
                        .map_or(false, |r| r.event_id() == ev.event_id());
                    if same {
                        self.after_ack(&key, EffectKind::Ack, ev, row.ack.as_ref(), now)
                            .await?;
                        return Ok(Outcome::Noop);
                    }
                    return self.correlation(ev, &key, "second acknowledgement", now).await;
                }
                PacketStatus::TimedOut => {
                    return self.correlation(ev, &key, "acknowledgement after timeout", now).await
                }
                PacketStatus::Received => {}
                PacketStatus::Sent => {
                    // Only skip the recv if it can never be observed.
                    let destination = match &row.destination_chain_id {
                        Some(chain) if !self.topology.is_indexed(chain) => {
                            Counterparty::External(chain.clone())
                        }
                        _ => {
                            self.topology
                                .channel_counterparty(&key.source_channel(), None)
                                .await?
                        }
                    };
                    match destination {
                        Counterparty::External(_) => {}
                        Counterparty::Indexed(_) => {
                            return Ok(Outcome::Blocked(PacketWait::Packet(key)))
                        }
                        Counterparty::Unknown => return Ok(Outcome::Blocked(PacketWait::Topology)),
                    }
                }
            }

            let revision = row.revision;
            let mut next = row;
            next.status = PacketStatus::Acknowledged;
            next.resolution = Some(ev.event_ref());
            if next.acknowledgement_hex.is_none() {
                if let Some(ack_hex) = &p.acknowledgement_hex {
                    next.acknowledgement_hex = Some(ack_hex.clone());
                    next.ack = Some(AckSummary::decode(key.ibc, ack_hex));
                }
            }
            let Some(saved) = self.save(next, Some(revision)).await? else {
                continue;
            };
            tracing::debug!(packet = %key, "packet acknowledged");
            self.after_ack(&key, EffectKind::Ack, ev, saved.ack.as_ref(), now)
                .await?;
            return Ok(Outcome::Applied(key));
        }
        Err(Self::exhausted(&key))
    }

    // ─── Timeout ─────────────────────────────────────────────────────────────

    async fn on_timeout(
        &self,
        ev: &CanonicalEvent,
        p: &PacketEvent,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let key = Self::source_key(ev, p);

        for _ in 0..CAS_ATTEMPTS {
            let Some(row) = self.store.get_packet(&key).await? else {
                return Ok(Outcome::Blocked(PacketWait::Packet(key)));
            };
            match row.status {
                PacketStatus::TimedOut => {
                    let same = row
                        .resolution
                        .as_ref()
                        .map_or(false, |r| r.event_id() == ev.event_id());
                    if same {
                        self.after_timeout(&key, ev, now).await?;
                        return Ok(Outcome::Noop);
                    }
                    return self.correlation(ev, &key, "second timeout", now).await;
                }
                PacketStatus::Acknowledged => {
                    return self.correlation(ev, &key, "timeout after acknowledgement", now).await
                }
                PacketStatus::Received => {
                    return self.correlation(ev, &key, "timeout after recv", now).await
                }
                PacketStatus::Sent => {}
            }

            // The source chain's client for the destination must show the
            // deadline has passed.
            let Some(client) = self.topology.channel_client(&key.source_channel()).await? else {
                return Ok(Outcome::Blocked(PacketWait::Topology));
            };
            let proven = match self.store.get_client_tip(&client).await? {
                Some(mut tip) => {
                    if tip.timestamp_ns.is_none() && row.source.timeout_timestamp > 0 {
                        if let Some(tracked) = self.topology.client_chain(&client).await? {
                            tip.timestamp_ns =
                                consensus_time(self.store.as_ref(), &tracked, &tip).await?;
                        }
                    }
                    timeout_elapsed(&tip, row.source.timeout_height, row.source.timeout_timestamp)
                }
                None => false,
            };
            if !proven {
                return Ok(Outcome::Blocked(PacketWait::Proof(key)));
            }

            let revision = row.revision;
            let mut next = row;
            next.status = PacketStatus::TimedOut;
            next.resolution = Some(ev.event_ref());
            if self.save(next, Some(revision)).await?.is_none() {
                continue;
            }
            tracing::debug!(packet = %key, "packet timed out");
            self.after_timeout(&key, ev, now).await?;
            return Ok(Outcome::Applied(key));
        }
        Err(Self::exhausted(&key))
    }

    async fn after_timeout(&self, key: &PacketKey, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<()> {
        self.effect(key, EffectKind::Timeout, ev).await?;
        self.forwards
            .lock()
            .await
            .on_attempt_failed(key, now)
            .await
    }
}

fn describe(ev: &CanonicalEvent) -> String {
    let packet = match &ev.kind {
        EventKind::SendPacket(p)
        | EventKind::RecvPacket(p)
        | EventKind::AcknowledgePacket(p)
        | EventKind::TimeoutPacket(p) => p,
        EventKind::WriteAcknowledgement(w) => &w.packet,
        other => return format!("{} {}", other.name(), ev.event_id()),
    };
    format!(
        "{} {}/{}/{}",
        ev.kind.name(),
        packet.source_channel_id,
        packet.source_port_id,
        packet.sequence
    )
}
