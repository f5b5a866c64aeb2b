//! Packet-forward correlator: links multi-hop transfers into a route tree.
//!
//! When a transfer whose memo carries `forward{receiver, port, channel, next}`
//! is received on an intermediate chain, the middleware there sends a new
//! transfer out of `channel`/`port` to `receiver`, with `next` as its memo.
//! Nothing on chain ties the two packets together, so they are matched here:
//!
//! - a recv with a forward instruction registers an [`Expectation`] on the
//!   receiving chain;
//! - each outbound transfer is checked against the expectations on its
//!   chain; unmatched sends are kept as candidates in case the expectation
//!   is registered later;
//! - a match writes a [`HopLink`] `{root, parent, hop_index, retries}` onto
//!   the outbound transfer. `forwards` is rebuilt by querying transfers by
//!   root; there are no back-pointers.
//!
//! A further send matching the same hop after the previous attempt failed is
//! a retry: same `(root, hop_index)`, `retries + 1`, up to the memo's
//! `retries`. The failure may be proven after the retry was sent, so a
//! failed attempt re-examines the candidates on its route. Links never form
//! cycles.
//!
//! One correlator is shared by all packet shards behind a mutex, because the
//! two packets of a hop live on different shards.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::anomaly::{self, Anomaly, AnomalyKind};
use crate::error::Result;
use crate::model::{HopLink, TransferRow};
use crate::payload::ForwardInstruction;
use crate::pending::PendingQueue;
use crate::store::ReadModelStore;
use crate::types::{IbcVersion, PacketKey, PacketStatus};

/// Guards ancestry walks against corrupted links.
const MAX_ROUTE_DEPTH: usize = 64;

/// Where a forwarded transfer leaves from and who it pays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey {
    pub ibc: IbcVersion,
    pub chain_id: String,
    pub port_id: String,
    pub channel_id: String,
    pub receiver: String,
}

impl RouteKey {
    fn of_transfer(t: &TransferRow) -> Self {
        Self {
            ibc: t.key.ibc,
            chain_id: t.key.source_chain_id.clone(),
            port_id: t.key.source_port_id.clone(),
            channel_id: t.key.source_channel_id.clone(),
            receiver: t.receiver.clone(),
        }
    }
}

/// A forward the middleware is expected to perform.
#[derive(Debug, Clone)]
pub struct Expectation {
    pub root: PacketKey,
    pub parent: PacketKey,
    pub hop_index: u32,
    pub forward: ForwardInstruction,
    pub matched: bool,
}

enum Link {
    Linked(HopLink),
    NotAMatch,
    Cycle,
}

pub struct ForwardCorrelator {
    store: Arc<dyn ReadModelStore>,
    expectations: PendingQueue<RouteKey, Expectation>,
    candidates: PendingQueue<RouteKey, PacketKey>,
}

impl ForwardCorrelator {
    pub fn new(store: Arc<dyn ReadModelStore>, capacity: usize, ttl: Duration) -> Self {
        Self {
            store,
            expectations: PendingQueue::new(capacity, ttl),
            candidates: PendingQueue::new(capacity, ttl),
        }
    }

    pub fn expectation_count(&self) -> usize {
        self.expectations.len()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// A transfer was received on `chain_id`. If its memo asks for a
    /// forward, expect the outbound hop and match any send already seen.
    pub async fn on_recv(
        &mut self,
        parent_key: &PacketKey,
        chain_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(parent) = self.store.get_transfer(parent_key).await? else {
            return Ok(());
        };
        let Some(forward) = parent.forward.clone() else {
            return Ok(());
        };
        let (root, hop_index) = match &parent.hop {
            Some(hop) => (hop.root.clone(), hop.hop_index + 1),
            None => (parent.key.clone(), 1),
        };
        let route = RouteKey {
            ibc: parent.key.ibc,
            chain_id: chain_id.to_string(),
            port_id: forward.port.clone(),
            channel_id: forward.channel.clone(),
            receiver: forward.receiver.clone(),
        };
        if self
            .expectations
            .iter()
            .any(|p| p.key == route && p.value.parent == parent.key)
        {
            return Ok(());
        }
        // Replayed after its hop was linked and the expectation expired.
        let linked = self.store.forwards(&root).await?.iter().any(|t| {
            t.hop
                .as_ref()
                .map_or(false, |h| h.parent == parent.key && h.hop_index == hop_index)
        });
        if linked {
            return Ok(());
        }

        let mut expectation = Expectation {
            root,
            parent: parent.key.clone(),
            hop_index,
            forward,
            matched: false,
        };
        // Sends observed before this recv.
        self.link_candidates(&route, &mut expectation, now).await?;

        tracing::debug!(parent = %expectation.parent, hop = expectation.hop_index, chain = chain_id, "forward expected");
        if let Some(evicted) = self.expectations.push(route, expectation, now) {
            if !evicted.value.matched {
                self.unmatched_anomaly(&evicted.key, &evicted.value, "evicted from full buffer", now)
                    .await?;
            }
        }
        Ok(())
    }

    /// A transfer was sent. Link it to a waiting expectation, or keep it as a
    /// candidate. Returns the link when one was made.
    pub async fn on_send(
        &mut self,
        transfer: &TransferRow,
        now: DateTime<Utc>,
    ) -> Result<Option<HopLink>> {
        if transfer.hop.is_some() {
            return Ok(None);
        }
        let route = RouteKey::of_transfer(transfer);
        let waiting: Vec<Expectation> = self
            .expectations
            .iter()
            .filter(|p| p.key == route)
            .map(|p| p.value.clone())
            .collect();

        for expectation in waiting {
            match self.try_link(&expectation, transfer).await? {
                Link::Linked(link) => {
                    for p in self.expectations.iter_mut() {
                        if p.key == route && p.value.parent == expectation.parent {
                            p.value.matched = true;
                        }
                    }
                    self.write_link(transfer.clone(), link.clone()).await?;
                    return Ok(Some(link));
                }
                Link::Cycle => {
                    self.cycle_anomaly(&expectation, transfer, now).await?;
                    return Ok(None);
                }
                Link::NotAMatch => {}
            }
        }

        if self.candidates.iter().any(|p| p.value == transfer.key) {
            return Ok(None);
        }
        if let Some(evicted) = self.candidates.push(route, transfer.key.clone(), now) {
            tracing::debug!(transfer = %evicted.value, "forward candidate evicted");
        }
        Ok(None)
    }

    /// A linked hop timed out or was acknowledged with an error. A send held
    /// back because this attempt had not failed yet may now link as its retry.
    pub async fn on_attempt_failed(&mut self, key: &PacketKey, now: DateTime<Utc>) -> Result<()> {
        let Some(failed) = self.store.get_transfer(key).await? else {
            return Ok(());
        };
        let Some(hop) = failed.hop.clone() else {
            return Ok(());
        };
        let Some(forward) = self
            .store
            .get_transfer(&hop.parent)
            .await?
            .and_then(|parent| parent.forward)
        else {
            return Ok(());
        };
        tracing::debug!(attempt = %key, root = %hop.root, retries = hop.retries, "forward attempt failed");
        let route = RouteKey::of_transfer(&failed);
        let mut expectation = Expectation {
            root: hop.root,
            parent: hop.parent,
            hop_index: hop.hop_index,
            forward,
            matched: true,
        };
        self.link_candidates(&route, &mut expectation, now).await
    }

    /// Link the sends held as candidates on `route`, oldest first.
    async fn link_candidates(
        &mut self,
        route: &RouteKey,
        expectation: &mut Expectation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for candidate in self.candidates.take(route) {
            let Some(transfer) = self.store.get_transfer(&candidate.value).await? else {
                continue;
            };
            match self.try_link(expectation, &transfer).await? {
                Link::Linked(link) => {
                    self.write_link(transfer, link).await?;
                    expectation.matched = true;
                }
                Link::Cycle => self.cycle_anomaly(expectation, &transfer, now).await?,
                Link::NotAMatch => {
                    self.candidates.requeue(candidate);
                }
            }
        }
        Ok(())
    }

    /// Drop expired candidates; report expectations that never matched.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> Result<()> {
        let candidates = self.candidates.sweep(now);
        for item in candidates.retry {
            self.candidates.requeue(item);
        }

        let expectations = self.expectations.sweep(now);
        for item in expectations.retry {
            self.expectations.requeue(item);
        }
        for item in expectations.expired {
            if !item.value.matched {
                self.unmatched_anomaly(&item.key, &item.value, "no matching send within retention", now)
                    .await?;
            }
        }
        Ok(())
    }

    async fn try_link(&self, expectation: &Expectation, transfer: &TransferRow) -> Result<Link> {
        if transfer.hop.is_some() || !expectation.forward.memo_matches(&transfer.memo) {
            return Ok(Link::NotAMatch);
        }
        if self.is_ancestor(&transfer.key, expectation).await? {
            return Ok(Link::Cycle);
        }

        let attempts: Vec<TransferRow> = self
            .store
            .forwards(&expectation.root)
            .await?
            .into_iter()
            .filter(|t| {
                t.hop.as_ref().map_or(false, |h| {
                    h.hop_index == expectation.hop_index && h.parent == expectation.parent
                })
            })
            .collect();

        let retries = match attempts
            .iter()
            .filter_map(|t| t.hop.as_ref().map(|h| (h.retries, &t.key)))
            .max_by_key(|(retries, _)| *retries)
        {
            None => 0,
            Some((retries, last_key)) => {
                // A re-send only counts as a retry once the previous attempt failed.
                if !self.attempt_failed(last_key).await? {
                    return Ok(Link::NotAMatch);
                }
                retries + 1
            }
        };
        if expectation.forward.retries.map_or(false, |max| retries > max) {
            return Ok(Link::NotAMatch);
        }

        Ok(Link::Linked(HopLink {
            root: expectation.root.clone(),
            parent: expectation.parent.clone(),
            hop_index: expectation.hop_index,
            retries,
        }))
    }

    async fn attempt_failed(&self, key: &PacketKey) -> Result<bool> {
        Ok(match self.store.get_packet(key).await? {
            Some(p) => {
                p.status == PacketStatus::TimedOut
                    || p.ack.as_ref().and_then(|a| a.success) == Some(false)
            }
            None => false,
        })
    }

    /// Whether `key` already appears on the path from the expectation's parent to its root.
    async fn is_ancestor(&self, key: &PacketKey, expectation: &Expectation) -> Result<bool> {
        if key == &expectation.root {
            return Ok(true);
        }
        let mut current = expectation.parent.clone();
        for _ in 0..MAX_ROUTE_DEPTH {
            if &current == key {
                return Ok(true);
            }
            match self.store.get_transfer(&current).await?.and_then(|t| t.hop) {
                Some(hop) => current = hop.parent,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn write_link(&mut self, mut transfer: TransferRow, link: HopLink) -> Result<()> {
        tracing::info!(
            transfer = %transfer.key,
            root = %link.root,
            hop = link.hop_index,
            retries = link.retries,
            "forward hop linked"
        );
        let key = transfer.key.clone();
        transfer.hop = Some(link.clone());
        self.store.put_transfer(transfer).await?;
        self.reroot(&key, &link).await
    }

    /// `key` was linked after its own descendants: move them under the real root.
    async fn reroot(&mut self, key: &PacketKey, link: &HopLink) -> Result<()> {
        for mut descendant in self.store.forwards(key).await? {
            if let Some(hop) = descendant.hop.as_mut() {
                hop.root = link.root.clone();
                hop.hop_index += link.hop_index;
            }
            self.store.put_transfer(descendant).await?;
        }
        for p in self.expectations.iter_mut() {
            if &p.value.root == key {
                p.value.root = link.root.clone();
                p.value.hop_index += link.hop_index;
            }
        }
        Ok(())
    }

    async fn cycle_anomaly(
        &self,
        expectation: &Expectation,
        transfer: &TransferRow,
        now: DateTime<Utc>,
    ) -> Result<()> {
        anomaly::record(
            self.store.as_ref(),
            Anomaly::new(
                AnomalyKind::Correlation,
                transfer.key.source_chain_id.clone(),
                transfer.key.to_string(),
                &expectation.parent.to_string(),
                format!(
                    "linking as hop {} of {} would create a cycle",
                    expectation.hop_index, expectation.root
                ),
                now,
            ),
        )
        .await?;
        Ok(())
    }

    async fn unmatched_anomaly(
        &self,
        route: &RouteKey,
        expectation: &Expectation,
        why: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        anomaly::record(
            self.store.as_ref(),
            Anomaly::new(
                AnomalyKind::Correlation,
                route.chain_id.clone(),
                expectation.parent.to_string(),
                "forward",
                format!(
                    "forward to {} via {}/{}: {why}",
                    route.receiver, route.port_id, route.channel_id
                ),
                now,
            ),
        )
        .await?;
        Ok(())
    }
}
