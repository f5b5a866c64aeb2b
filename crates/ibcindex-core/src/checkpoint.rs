//! Watcher positions.
//!
//! A checkpoint names the last block of a chain whose events the sink has
//! fully stored. A restarted watcher continues at the height after it; blocks
//! applied after the last write are delivered again and replay as no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chain_id: String,
    /// Several indexers may follow the same chain into different stores.
    pub indexer_id: String,
    pub height: u64,
    pub block_hash: String,
    /// Unix seconds of the write.
    pub updated_at: i64,
}

impl Checkpoint {
    /// Height the watcher fetches next.
    pub fn resume_height(&self) -> u64 {
        self.height + 1
    }
}

/// Persistence for checkpoints, keyed by `(chain_id, indexer_id)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(
        &self,
        chain_id: &str,
        indexer_id: &str,
    ) -> Result<Option<Checkpoint>, IndexerError>;

    /// Insert or replace.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError>;

    async fn delete(&self, chain_id: &str, indexer_id: &str) -> Result<(), IndexerError>;
}

/// Throttled checkpoint writes for one chain.
///
/// The watcher reports every block it applied; a write happens on every
/// `every`-th block and on [`force_save`](Self::force_save).
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    chain_id: String,
    indexer_id: String,
    every: u64,
    unsaved: u64,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        chain_id: impl Into<String>,
        indexer_id: impl Into<String>,
        every: u64,
    ) -> Self {
        Self {
            store,
            chain_id: chain_id.into(),
            indexer_id: indexer_id.into(),
            every: every.max(1),
            unsaved: 0,
        }
    }

    pub async fn load(&self) -> Result<Option<Checkpoint>, IndexerError> {
        self.store.load(&self.chain_id, &self.indexer_id).await
    }

    /// Report an applied block. Must only be called once the sink stored it.
    /// Returns `true` if the checkpoint was written.
    pub async fn maybe_save(&mut self, height: u64, block_hash: &str) -> Result<bool, IndexerError> {
        self.unsaved += 1;
        if self.unsaved < self.every {
            return Ok(false);
        }
        self.force_save(height, block_hash).await?;
        self.unsaved = 0;
        Ok(true)
    }

    /// Blocks applied since the last write.
    pub fn unsaved(&self) -> u64 {
        self.unsaved
    }

    pub async fn force_save(&self, height: u64, block_hash: &str) -> Result<(), IndexerError> {
        tracing::debug!(chain = %self.chain_id, height, "checkpoint");
        self.store
            .save(Checkpoint {
                chain_id: self.chain_id.clone(),
                indexer_id: self.indexer_id.clone(),
                height,
                block_hash: block_hash.to_string(),
                updated_at: Utc::now().timestamp(),
            })
            .await
    }

    /// Drop the checkpoint; the next start begins at the configured height.
    pub async fn reset(&self) -> Result<(), IndexerError> {
        tracing::info!(chain = %self.chain_id, indexer = %self.indexer_id, "checkpoint reset");
        self.store.delete(&self.chain_id, &self.indexer_id).await
    }
}
