//! The sequential indexer: one consumer applying blocks in submission order.
//!
//! [`Indexer`] owns every tracker and applies each canonical event in turn.
//! It is the reference behaviour the sharded [`Pipeline`](crate::pipeline::Pipeline)
//! must reproduce, and the simplest [`EventSink`] for tests and small
//! deployments.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::anomaly::{self, Anomaly, AnomalyKind};
use crate::config::IndexerConfig;
use crate::error::Result;
use crate::event::{CanonicalEvent, EventKind, EventRoute, RawBlock};
use crate::forward::ForwardCorrelator;
use crate::handshake::HandshakeTracker;
use crate::lightclient::LightClientTracker;
use crate::normalizer::Normalizer;
use crate::packet::PacketTracker;
use crate::store::ReadModelStore;
use crate::topology::{Topology, TopologyOverrides};

/// Where chain watchers hand their blocks.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Apply every event of `block`. Returns once all of them are stored,
    /// so the caller may checkpoint the block afterwards.
    async fn submit(&self, block: &RawBlock) -> Result<()>;
}

/// Buffer sizing shared by all trackers.
#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    pub pending_capacity: usize,
    pub pending_ttl: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from(&IndexerConfig::default())
    }
}

impl From<&IndexerConfig> for TrackerSettings {
    fn from(config: &IndexerConfig) -> Self {
        Self {
            pending_capacity: config.pending_capacity,
            pending_ttl: config.pending_ttl(),
        }
    }
}

/// Buffered items across all trackers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub handshake: usize,
    pub packet: usize,
    pub forward_expectations: usize,
    pub forward_candidates: usize,
}

pub struct Indexer {
    normalizer: Normalizer,
    store: Arc<dyn ReadModelStore>,
    lightclient: LightClientTracker,
    handshakes: HandshakeTracker,
    packets: PacketTracker,
    forwards: Arc<Mutex<ForwardCorrelator>>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn ReadModelStore>,
        overrides: TopologyOverrides,
        settings: TrackerSettings,
    ) -> Self {
        let topology = Topology::new(store.clone(), overrides);
        let forwards = Arc::new(Mutex::new(ForwardCorrelator::new(
            store.clone(),
            settings.pending_capacity,
            settings.pending_ttl,
        )));
        Self {
            normalizer: Normalizer::new(),
            lightclient: LightClientTracker::new(store.clone()),
            handshakes: HandshakeTracker::new(
                store.clone(),
                topology.clone(),
                settings.pending_capacity,
                settings.pending_ttl,
            ),
            packets: PacketTracker::new(
                store.clone(),
                topology,
                forwards.clone(),
                settings.pending_capacity,
                settings.pending_ttl,
            ),
            forwards,
            store,
        }
    }

    /// Normalize and apply a block. Returns the number of canonical events.
    pub async fn apply_block(&mut self, block: &RawBlock, now: DateTime<Utc>) -> Result<usize> {
        self.store
            .put_block_time(&block.chain_id, block.height, block.time)
            .await?;
        let events = self.normalizer.normalize_block(block);
        for ev in &events {
            self.apply(ev, now).await?;
        }
        tracing::debug!(chain = %block.chain_id, height = block.height, events = events.len(), "block applied");
        Ok(events.len())
    }

    pub async fn apply(&mut self, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<()> {
        match ev.route() {
            EventRoute::LightClient => self.lightclient.apply(ev, now).await,
            EventRoute::Handshake => self.handshakes.apply(ev, now).await,
            EventRoute::Packet(_) => self.packets.apply(ev, now).await,
            EventRoute::Anomaly => record_decoding(self.store.as_ref(), ev, now).await,
            EventRoute::Ignore => Ok(()),
        }
    }

    /// Retry buffered events and escalate the expired ones.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.handshakes.sweep(now).await?;
        self.packets.sweep(now).await?;
        self.forwards.lock().await.sweep(now).await
    }

    pub async fn pending(&self) -> PendingCounts {
        let forwards = self.forwards.lock().await;
        PendingCounts {
            handshake: self.handshakes.pending_len(),
            packet: self.packets.pending_len(),
            forward_expectations: forwards.expectation_count(),
            forward_candidates: forwards.candidate_count(),
        }
    }
}

/// Record an undecodable IBC event as a `DECODING` anomaly.
pub async fn record_decoding(
    store: &dyn ReadModelStore,
    ev: &CanonicalEvent,
    now: DateTime<Utc>,
) -> Result<()> {
    if let EventKind::Unrecognized { event_type, reason, .. } = &ev.kind {
        anomaly::record(
            store,
            Anomaly::new(
                AnomalyKind::Decoding,
                ev.chain_id.clone(),
                ev.event_id(),
                event_type,
                format!("{event_type}: {reason}"),
                now,
            ),
        )
        .await?;
    }
    Ok(())
}

/// An [`Indexer`] behind a mutex, usable as an [`EventSink`] by several watchers.
pub struct SharedIndexer {
    inner: Mutex<Indexer>,
}

impl SharedIndexer {
    pub fn new(indexer: Indexer) -> Self {
        Self {
            inner: Mutex::new(indexer),
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<()> {
        self.inner.lock().await.sweep(now).await
    }

    pub async fn pending(&self) -> PendingCounts {
        self.inner.lock().await.pending().await
    }
}

#[async_trait]
impl EventSink for SharedIndexer {
    async fn submit(&self, block: &RawBlock) -> Result<()> {
        self.inner
            .lock()
            .await
            .apply_block(block, Utc::now())
            .await
            .map(|_| ())
    }
}
