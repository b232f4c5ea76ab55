//! Node configuration, read from TOML.
//!
//! ```toml
//! [engine]
//! block_poll_interval_ms = 1000
//! auto_approve = false
//!
//! [chain]
//! confirmation_depth = 0
//! ```

use std::{path::Path, time::Duration};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub engine: EngineConfig,
    pub chain: ChainConfig,
}

impl NodeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub block_poll_interval_ms: u64,
    /// Capacity of the bounded request and message inputs.
    pub request_buffer: usize,
    /// Approve objectives started by counterparties.
    pub auto_approve: bool,
}

impl EngineConfig {
    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_interval_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_poll_interval_ms: 15_000,
            request_buffer: 100,
            auto_approve: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Blocks an event must be buried under before it is released.
    pub confirmation_depth: u64,
    /// Capacity of the pending event buffer.
    pub event_buffer: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            confirmation_depth: 2,
            event_buffer: 1024,
        }
    }
}
