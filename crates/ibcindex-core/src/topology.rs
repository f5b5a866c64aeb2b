//! Topology resolution: which chain sits at the other end of a client,
//! connection or channel.
//!
//! The chain is only ever named by the light client:
//! `channel → connection → client → client.counterparty_chain_id`.
//! Configuration may pin clients or channels whose creation predates the
//! indexed range.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::model::ChannelRow;
use crate::store::ReadModelStore;
use crate::types::{ChannelKey, ClientKey, ConnectionKey};

/// Where the counterparty of an entity lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Counterparty {
    /// Not resolvable yet.
    Unknown,
    /// A chain this indexer watches.
    Indexed(String),
    /// A known chain that is not watched; steps on it are never observed.
    External(String),
}

impl Counterparty {
    pub fn chain_id(&self) -> Option<&str> {
        match self {
            Self::Unknown => None,
            Self::Indexed(c) | Self::External(c) => Some(c),
        }
    }
}

/// Configured topology facts.
#[derive(Debug, Clone, Default)]
pub struct TopologyOverrides {
    pub indexed_chains: HashSet<String>,
    /// `(host chain, client id)` → counterparty chain.
    pub clients: HashMap<(String, String), String>,
    /// `(host chain, port id, channel id)` → counterparty chain.
    pub channels: HashMap<(String, String, String), String>,
}

#[derive(Clone)]
pub struct Topology {
    store: Arc<dyn ReadModelStore>,
    overrides: Arc<TopologyOverrides>,
}

impl Topology {
    pub fn new(store: Arc<dyn ReadModelStore>, overrides: TopologyOverrides) -> Self {
        Self {
            store,
            overrides: Arc::new(overrides),
        }
    }

    pub fn is_indexed(&self, chain_id: &str) -> bool {
        self.overrides.indexed_chains.contains(chain_id)
    }

    fn classify(&self, chain: Option<String>) -> Counterparty {
        match chain {
            None => Counterparty::Unknown,
            Some(c) if self.is_indexed(&c) => Counterparty::Indexed(c),
            Some(c) => Counterparty::External(c),
        }
    }

    /// The chain a client tracks.
    pub async fn client_chain(&self, key: &ClientKey) -> Result<Option<String>> {
        let pinned = self
            .overrides
            .clients
            .get(&(key.chain_id.clone(), key.client_id.clone()));
        if let Some(chain) = pinned {
            return Ok(Some(chain.clone()));
        }
        Ok(self
            .store
            .get_client(key)
            .await?
            .and_then(|c| c.counterparty_chain_id))
    }

    pub async fn client_counterparty(&self, key: &ClientKey) -> Result<Counterparty> {
        Ok(self.classify(self.client_chain(key).await?))
    }

    /// Resolve through a connection's client. `client_id` is used when the
    /// connection row does not exist yet.
    pub async fn connection_counterparty(
        &self,
        key: &ConnectionKey,
        client_id: Option<&str>,
    ) -> Result<Counterparty> {
        let client_id = match self.store.get_connection(key).await? {
            Some(row) => row.client_id,
            None => match client_id {
                Some(id) => id.to_string(),
                None => return Ok(Counterparty::Unknown),
            },
        };
        let client = ClientKey::new(key.ibc, key.chain_id.clone(), client_id);
        self.client_counterparty(&client).await
    }

    /// Resolve through a channel's connection. `connection_id` is used when
    /// the channel row does not exist yet.
    pub async fn channel_counterparty(
        &self,
        key: &ChannelKey,
        connection_id: Option<&str>,
    ) -> Result<Counterparty> {
        let pinned = self.overrides.channels.get(&(
            key.chain_id.clone(),
            key.port_id.clone(),
            key.channel_id.clone(),
        ));
        if let Some(chain) = pinned {
            return Ok(self.classify(Some(chain.clone())));
        }
        let connection_id = match self.channel_row(key).await? {
            Some(row) => row.connection_id,
            None => match connection_id {
                Some(id) => id.to_string(),
                None => return Ok(Counterparty::Unknown),
            },
        };
        let conn = ConnectionKey::new(key.ibc, key.chain_id.clone(), connection_id);
        self.connection_counterparty(&conn, None).await
    }

    /// A channel row; keys without a port (union packets) match by channel id.
    pub async fn channel_row(&self, key: &ChannelKey) -> Result<Option<ChannelRow>> {
        if key.port_id.is_empty() {
            return self
                .store
                .find_channel(key.ibc, &key.chain_id, &key.channel_id)
                .await;
        }
        self.store.get_channel(key).await
    }

    /// The client on `key.chain_id` that tracks the channel's counterparty.
    pub async fn channel_client(&self, key: &ChannelKey) -> Result<Option<ClientKey>> {
        let Some(channel) = self.channel_row(key).await? else {
            return Ok(None);
        };
        let Some(conn) = self.store.get_connection(&channel.connection_key()).await? else {
            return Ok(None);
        };
        Ok(Some(ClientKey::new(key.ibc, key.chain_id.clone(), conn.client_id)))
    }
}
