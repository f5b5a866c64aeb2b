//! Runs one [`ChainWatcher`] task per enabled chain.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ibcindex_core::checkpoint::CheckpointStore;
use ibcindex_core::config::{ChainConfig, IbcIndexConfig};
use ibcindex_core::error::IndexerError;
use ibcindex_core::indexer::EventSink;
use ibcindex_core::model::WatcherState;
use ibcindex_core::status;
use ibcindex_core::store::ReadModelStore;

use crate::fetcher::{CometRpcClient, HttpCometClient};
use crate::watcher::ChainWatcher;

/// Per-request timeout for CometBFT RPC calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause before a watcher that failed to start is started again.
const RESTART_DELAY: Duration = Duration::from_secs(5);

pub struct Supervisor {
    tasks: Vec<(String, JoinHandle<()>)>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Start a watcher over HTTP for every enabled chain.
    pub fn spawn_http(
        config: &IbcIndexConfig,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn ReadModelStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        cancel: CancellationToken,
    ) -> Result<Self, IndexerError> {
        Self::spawn_with(config, sink, store, checkpoints, cancel, |chain| {
            HttpCometClient::new(&chain.chain_id, &chain.rpc_url, REQUEST_TIMEOUT)
        })
    }

    /// Start a watcher for every enabled chain with clients from `make_client`.
    pub fn spawn_with<C, F>(
        config: &IbcIndexConfig,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn ReadModelStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        cancel: CancellationToken,
        make_client: F,
    ) -> Result<Self, IndexerError>
    where
        C: CometRpcClient + 'static,
        F: Fn(&ChainConfig) -> Result<C, IndexerError>,
    {
        let mut tasks = Vec::new();
        for chain in config.enabled_chains() {
            let client = make_client(chain)?;
            let watcher = ChainWatcher::new(
                chain.clone(),
                client,
                sink.clone(),
                store.clone(),
                checkpoints.clone(),
                &config.indexer,
            );
            let handle = tokio::spawn(supervise(watcher, store.clone(), cancel.clone()));
            tasks.push((chain.chain_id.clone(), handle));
        }
        tracing::info!(chains = tasks.len(), "watchers started");
        Ok(Self { tasks, cancel })
    }

    pub fn chain_ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Cancel every watcher and wait for them to save their checkpoints.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (chain_id, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::error!(chain = %chain_id, error = %e, "watcher task panicked");
            }
        }
    }
}

async fn supervise<C: CometRpcClient>(
    mut watcher: ChainWatcher<C>,
    store: Arc<dyn ReadModelStore>,
    cancel: CancellationToken,
) {
    loop {
        match watcher.run(cancel.clone()).await {
            Ok(()) => return,
            Err(e) => {
                tracing::error!(chain = %watcher.chain_id(), error = %e, "watcher failed, restarting");
                if let Err(e) = status::set_state(
                    store.as_ref(),
                    watcher.chain_id(),
                    WatcherState::Failing,
                    Some(e.to_string()),
                    Utc::now(),
                )
                .await
                {
                    tracing::warn!(chain = %watcher.chain_id(), error = %e, "failed to update status");
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }
    }
}
