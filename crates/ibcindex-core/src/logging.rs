//! Subscriber setup for the `log:` section of the configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{IndexerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Level for everything not listed in `components`.
    #[serde(default = "default_level")]
    pub level: String,
    /// `ibcindex-cosmos: trace`, `ibcindex_core::packet: debug`, ...
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// One JSON object per line instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` syntax; crate names use underscores.
    pub fn directives(&self) -> String {
        self.components
            .iter()
            .fold(self.level.clone(), |mut acc, (target, level)| {
                acc.push_str(&format!(",{}={level}", target.replace('-', "_")));
                acc
            })
    }

    /// The filter these settings describe.
    pub fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(self.directives())
            .map_err(|e| IndexerError::Config(format!("log: {e}")))
    }
}

/// Install the global subscriber; `RUST_LOG` takes precedence over `config`.
/// Fails if a subscriber is already installed or the levels do not parse.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.filter()?,
    };
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    installed.map_err(|e| IndexerError::Config(format!("tracing already initialised: {e}")))
}
