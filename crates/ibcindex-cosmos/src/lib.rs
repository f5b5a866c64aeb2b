//! ibcindex-cosmos: CometBFT event source for ibcindex.
//!
//! Fetches blocks with their ABCI events over the CometBFT RPC and drives one
//! [`ChainWatcher`] per configured chain into an
//! [`EventSink`](ibcindex_core::indexer::EventSink).

pub mod fetcher;
pub mod retry;
pub mod supervisor;
pub mod watcher;

pub use fetcher::{CometRpcClient, HttpCometClient};
pub use retry::RetryPolicy;
pub use supervisor::Supervisor;
pub use watcher::{ChainWatcher, Step};
