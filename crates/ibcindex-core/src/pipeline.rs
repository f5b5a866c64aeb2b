//! The sharded pipeline.
//!
//! ```text
//!                      ┌──▶ light-client worker
//! submit(block) ──▶ normalize ──▶ handshake worker
//!                      └──▶ packet shard 0..N   (hash of source channel/port/sequence)
//! ```
//!
//! Each worker is a tokio task owning its tracker, so every key has a single
//! writer. A block's shares are applied in stages: client events first, then
//! handshakes, then all packet shards in parallel, which keeps a channel
//! opened earlier in a block visible to packets later in it. `submit`
//! returns after every worker acknowledged its share.
//!
//! Workers sweep their pending buffers on a tick. Shard 0 also sweeps the
//! shared forward correlator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::IndexerConfig;
use crate::error::{IndexerError, Result};
use crate::event::{CanonicalEvent, EventRoute, RawBlock};
use crate::forward::ForwardCorrelator;
use crate::handshake::HandshakeTracker;
use crate::indexer::{record_decoding, EventSink, TrackerSettings};
use crate::lightclient::LightClientTracker;
use crate::normalizer::Normalizer;
use crate::packet::PacketTracker;
use crate::store::ReadModelStore;
use crate::topology::{Topology, TopologyOverrides};

/// Jobs queued per worker before `submit` waits.
const WORKER_QUEUE: usize = 64;

struct Job {
    events: Vec<CanonicalEvent>,
    ack: oneshot::Sender<Result<()>>,
}

/// What a worker drives.
#[async_trait]
trait Stage: Send + 'static {
    async fn apply(&mut self, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<()>;
    async fn sweep(&mut self, now: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
impl Stage for LightClientTracker {
    async fn apply(&mut self, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<()> {
        LightClientTracker::apply(self, ev, now).await
    }

    async fn sweep(&mut self, _now: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Stage for HandshakeTracker {
    async fn apply(&mut self, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<()> {
        HandshakeTracker::apply(self, ev, now).await
    }

    async fn sweep(&mut self, now: DateTime<Utc>) -> Result<()> {
        HandshakeTracker::sweep(self, now).await
    }
}

struct PacketStage {
    tracker: PacketTracker,
    /// Set on the one shard that sweeps the correlator.
    forwards: Option<Arc<Mutex<ForwardCorrelator>>>,
}

#[async_trait]
impl Stage for PacketStage {
    async fn apply(&mut self, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<()> {
        self.tracker.apply(ev, now).await
    }

    async fn sweep(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.tracker.sweep(now).await?;
        if let Some(forwards) = &self.forwards {
            forwards.lock().await.sweep(now).await?;
        }
        Ok(())
    }
}

async fn worker<S: Stage>(
    name: String,
    mut stage: S,
    mut jobs: mpsc::Receiver<Job>,
    sweep_every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sweep_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => {
                let Some(job) = job else { break };
                let now = Utc::now();
                let mut result = Ok(());
                for ev in &job.events {
                    if let Err(e) = stage.apply(ev, now).await {
                        tracing::error!(worker = %name, event = %ev.event_id(), error = %e, "apply failed");
                        result = Err(e);
                        break;
                    }
                }
                // The submitter may have given up; nothing to do then.
                let _ = job.ack.send(result);
            }
            _ = ticker.tick() => {
                if let Err(e) = stage.sweep(Utc::now()).await {
                    tracing::warn!(worker = %name, error = %e, "sweep failed");
                }
            }
        }
    }
    tracing::debug!(worker = %name, "worker stopped");
}

pub struct Pipeline {
    normalizer: Normalizer,
    store: Arc<dyn ReadModelStore>,
    lightclient: mpsc::Sender<Job>,
    handshake: mpsc::Sender<Job>,
    shards: Vec<mpsc::Sender<Job>>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn the workers. They stop when `cancel` fires or on [`shutdown`](Self::shutdown).
    pub fn spawn(
        store: Arc<dyn ReadModelStore>,
        overrides: TopologyOverrides,
        config: &IndexerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let settings = TrackerSettings::from(config);
        let sweep_every = Duration::from_millis(config.sweep_interval_ms.max(1));
        let topology = Topology::new(store.clone(), overrides);
        let forwards = Arc::new(Mutex::new(ForwardCorrelator::new(
            store.clone(),
            settings.pending_capacity,
            settings.pending_ttl,
        )));
        let mut handles = Vec::new();

        let (lightclient, rx) = mpsc::channel(WORKER_QUEUE);
        handles.push(tokio::spawn(worker(
            "lightclient".into(),
            LightClientTracker::new(store.clone()),
            rx,
            sweep_every,
            cancel.clone(),
        )));

        let (handshake, rx) = mpsc::channel(WORKER_QUEUE);
        handles.push(tokio::spawn(worker(
            "handshake".into(),
            HandshakeTracker::new(
                store.clone(),
                topology.clone(),
                settings.pending_capacity,
                settings.pending_ttl,
            ),
            rx,
            sweep_every,
            cancel.clone(),
        )));

        let shard_count = config.shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for i in 0..shard_count {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            let stage = PacketStage {
                tracker: PacketTracker::new(
                    store.clone(),
                    topology.clone(),
                    forwards.clone(),
                    settings.pending_capacity,
                    settings.pending_ttl,
                ),
                forwards: (i == 0).then(|| forwards.clone()),
            };
            handles.push(tokio::spawn(worker(
                format!("packet-{i}"),
                stage,
                rx,
                sweep_every,
                cancel.clone(),
            )));
            shards.push(tx);
        }

        tracing::info!(shards = shard_count, "pipeline started");
        Self {
            normalizer: Normalizer::new(),
            store,
            lightclient,
            handshake,
            shards,
            cancel,
            handles,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Stop every worker and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "pipeline worker panicked");
            }
        }
    }
}

async fn dispatch(worker: &mpsc::Sender<Job>, events: Vec<CanonicalEvent>) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let (ack, done) = oneshot::channel();
    worker
        .send(Job { events, ack })
        .await
        .map_err(|_| IndexerError::Aborted {
            reason: "pipeline worker stopped".into(),
        })?;
    done.await.map_err(|_| IndexerError::Aborted {
        reason: "pipeline worker dropped the block".into(),
    })?
}

#[async_trait]
impl EventSink for Pipeline {
    async fn submit(&self, block: &RawBlock) -> Result<()> {
        let now = Utc::now();
        self.store
            .put_block_time(&block.chain_id, block.height, block.time)
            .await?;
        let mut lightclient = Vec::new();
        let mut handshake = Vec::new();
        let mut shards: Vec<Vec<CanonicalEvent>> = vec![Vec::new(); self.shards.len()];

        for ev in self.normalizer.normalize_block(block) {
            match ev.route() {
                EventRoute::LightClient => lightclient.push(ev),
                EventRoute::Handshake => handshake.push(ev),
                EventRoute::Packet(hash) => {
                    let shard = (hash % self.shards.len() as u64) as usize;
                    shards[shard].push(ev);
                }
                EventRoute::Anomaly => record_decoding(self.store.as_ref(), &ev, now).await?,
                EventRoute::Ignore => {}
            }
        }

        dispatch(&self.lightclient, lightclient).await?;
        dispatch(&self.handshake, handshake).await?;
        let acks = shards
            .into_iter()
            .zip(&self.shards)
            .map(|(events, worker)| dispatch(worker, events));
        for result in join_all(acks).await {
            result?;
        }
        Ok(())
    }
}
