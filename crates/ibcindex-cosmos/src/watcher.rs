//! Per-chain watcher: follows one chain block by block and feeds the sink.
//!
//! # Backfill
//! From the checkpoint (or `start_height`) up to `head - confirmations`, one
//! block at a time. The status row is marked `BACKFILLING` while behind.
//!
//! # Live
//! Once caught up, poll the head every `poll_interval_ms`.
//!
//! A block is checkpointed only after the sink has stored all of its events,
//! so a restart re-delivers at most the blocks since the last checkpoint;
//! the trackers are idempotent under replay.
//!
//! RPC and storage failures are retried with exponential backoff. When the
//! retries are exhausted the watcher records a `WATCHER_FAILURE` anomaly,
//! marks the chain `FAILING` and keeps polling at the maximum backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use ibcindex_core::anomaly::{self, Anomaly, AnomalyKind};
use ibcindex_core::checkpoint::{CheckpointManager, CheckpointStore};
use ibcindex_core::config::{ChainConfig, IndexerConfig};
use ibcindex_core::error::IndexerError;
use ibcindex_core::indexer::EventSink;
use ibcindex_core::model::WatcherState;
use ibcindex_core::status;
use ibcindex_core::store::ReadModelStore;

use crate::fetcher::CometRpcClient;
use crate::retry::RetryPolicy;

/// Outcome of one [`ChainWatcher::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The block at this height was applied and recorded.
    Applied(u64),
    /// Nothing to do until the chain produces another confirmed block.
    CaughtUp,
}

pub struct ChainWatcher<C: CometRpcClient> {
    chain: ChainConfig,
    client: C,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn ReadModelStore>,
    checkpoint: CheckpointManager,
    retry: RetryPolicy,
    /// Next height to fetch.
    next: u64,
    /// Highest confirmed height seen on the last head query.
    target: u64,
    /// Height and hash of the last applied block.
    last: Option<(u64, String)>,
}

impl<C: CometRpcClient> ChainWatcher<C> {
    pub fn new(
        chain: ChainConfig,
        client: C,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn ReadModelStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        indexer: &IndexerConfig,
    ) -> Self {
        let checkpoint = CheckpointManager::new(
            checkpoints,
            &chain.chain_id,
            &indexer.id,
            indexer.checkpoint_interval,
        );
        Self {
            retry: RetryPolicy::new(&chain.retry),
            next: chain.start_height,
            target: 0,
            last: None,
            chain,
            client,
            sink,
            store,
            checkpoint,
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain.chain_id
    }

    /// Height of the next block to fetch.
    pub fn next_height(&self) -> u64 {
        self.next
    }

    /// Position the watcher after the saved checkpoint, or at `start_height`
    /// if there is none. Returns the next height to fetch.
    pub async fn resume(&mut self) -> Result<u64, IndexerError> {
        match self.checkpoint.load().await? {
            Some(cp) => {
                tracing::info!(
                    chain = %self.chain.chain_id,
                    height = cp.height,
                    hash = %cp.block_hash,
                    "resuming from checkpoint"
                );
                self.next = cp.resume_height();
                self.last = Some((cp.height, cp.block_hash));
            }
            None => {
                tracing::info!(
                    chain = %self.chain.chain_id,
                    start_height = self.chain.start_height,
                    "no checkpoint, starting from configured height"
                );
                self.next = self.chain.start_height;
                self.last = None;
            }
        }
        Ok(self.next)
    }

    /// Fetch, apply and record the next block if it is confirmed.
    pub async fn step(&mut self) -> Result<Step, IndexerError> {
        if self.next > self.target {
            let head = self.client.latest_height().await?;
            self.target = head.saturating_sub(self.chain.confirmations);
            if self.next > self.target {
                return Ok(Step::CaughtUp);
            }
        }

        let Some(block) = self.client.block(self.next).await? else {
            return Ok(Step::CaughtUp);
        };
        if block.height != self.next {
            return Err(IndexerError::Rpc(format!(
                "asked for block {} but received {}",
                self.next, block.height
            )));
        }

        self.sink.submit(&block).await?;

        let state = if block.height < self.target {
            WatcherState::Backfilling
        } else {
            WatcherState::Live
        };
        status::record_block(
            self.store.as_ref(),
            &self.chain.chain_id,
            block.height,
            &block.hash,
            block.time,
            state,
            Utc::now(),
        )
        .await?;
        self.checkpoint.maybe_save(block.height, &block.hash).await?;

        tracing::debug!(
            chain = %self.chain.chain_id,
            height = block.height,
            target = self.target,
            txs = block.txs.len(),
            "block indexed"
        );
        self.next = block.height + 1;
        self.last = Some((block.height, block.hash));
        Ok(Step::Applied(self.next - 1))
    }

    /// Follow the chain until `cancel` fires.
    ///
    /// Only a failure to read the checkpoint on startup is returned; every
    /// later error is retried in place.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), IndexerError> {
        self.resume().await?;
        let poll_interval = Duration::from_millis(self.chain.poll_interval_ms);
        let mut failures: u32 = 0;

        while !cancel.is_cancelled() {
            let delay = match self.step().await {
                Ok(Step::Applied(_)) => {
                    if failures > 0 {
                        tracing::info!(chain = %self.chain.chain_id, failures, "chain recovered");
                        failures = 0;
                    }
                    continue;
                }
                Ok(Step::CaughtUp) => {
                    failures = 0;
                    poll_interval
                }
                Err(e) => {
                    failures += 1;
                    self.on_failure(failures, &e).await
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.stop().await;
        Ok(())
    }

    async fn on_failure(&self, failures: u32, error: &IndexerError) -> Duration {
        if let Some(delay) = self.retry.next_delay(failures) {
            tracing::warn!(
                chain = %self.chain.chain_id,
                height = self.next,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying block"
            );
            return delay;
        }

        if !self.retry.should_retry(failures - 1) {
            // Already reported on the first exhausted attempt.
            tracing::debug!(chain = %self.chain.chain_id, attempt = failures, error = %error, "still failing");
            return self.retry.exhausted_delay();
        }

        tracing::error!(
            chain = %self.chain.chain_id,
            height = self.next,
            attempts = failures,
            error = %error,
            "retries exhausted"
        );
        let now = Utc::now();
        let failure = Anomaly::new(
            AnomalyKind::WatcherFailure,
            &self.chain.chain_id,
            &self.chain.chain_id,
            &self.next.to_string(),
            format!("block {}: {error}", self.next),
            now,
        );
        if let Err(e) = anomaly::record(self.store.as_ref(), failure).await {
            tracing::warn!(chain = %self.chain.chain_id, error = %e, "failed to record anomaly");
        }
        if let Err(e) = status::set_state(
            self.store.as_ref(),
            &self.chain.chain_id,
            WatcherState::Failing,
            Some(error.to_string()),
            now,
        )
        .await
        {
            tracing::warn!(chain = %self.chain.chain_id, error = %e, "failed to update status");
        }
        self.retry.exhausted_delay()
    }

    /// Persist the final position and mark the chain stopped.
    async fn stop(&self) {
        let unsaved = self.checkpoint.unsaved() > 0;
        if let Some((height, hash)) = self.last.as_ref().filter(|_| unsaved) {
            if let Err(e) = self.checkpoint.force_save(*height, hash).await {
                tracing::warn!(chain = %self.chain.chain_id, error = %e, "final checkpoint failed");
            }
        }
        if let Err(e) = status::set_state(
            self.store.as_ref(),
            &self.chain.chain_id,
            WatcherState::Stopped,
            None,
            Utc::now(),
        )
        .await
        {
            tracing::warn!(chain = %self.chain.chain_id, error = %e, "failed to update status");
        }
        tracing::info!(chain = %self.chain.chain_id, next = self.next, "watcher stopped");
    }
}
