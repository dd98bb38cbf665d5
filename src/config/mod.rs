//! Configuration management for key-value connections.
//!
//! Topology shapes are plain serde structures; they can be built in code,
//! loaded one at a time with [`TopologyConfig::load`], or loaded as sections of
//! a single file with [`Settings::load`]. Sources are layered with priority:
//! 1. Default values (hardcoded)
//! 2. Config file (YAML or TOML, chosen by extension)
//! 3. Environment variables prefixed `KEYVAL__` (highest priority)

mod client;
mod tls;
mod topology;
mod watch;
pub use client::*;
pub use tls::*;
pub use topology::*;
pub use watch::*;

#[cfg(test)]
mod config_test;

//---
use std::path::Path;
use std::time::Duration;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;

use crate::constants::ENV_PREFIX;
use crate::Result;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Standalone node topology
    #[serde(default)]
    pub node: Option<NodeConfig>,
    /// Cluster topology
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    /// Sentinel topology
    #[serde(default)]
    pub sentinel: Option<SentinelConfig>,
    /// Watcher delivery tuning
    #[serde(default)]
    pub watch: WatchConfig,
    /// Deadline for every broker and transaction call, in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_in_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node: None,
            cluster: None,
            sentinel: None,
            watch: WatchConfig::default(),
            request_timeout_in_ms: default_request_timeout(),
        }
    }
}

impl Settings {
    /// Load a sectioned configuration file, overlaid with environment variables
    ///
    /// # Arguments
    /// * `path` - Optional config file; when absent only the environment is read
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Config::builder();

        if let Some(path) = path {
            config = config.add_source(File::from(path).required(true));
        }

        config = config.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Settings = config.build()?.try_deserialize()?;
        settings.watch.validate()?;
        Ok(settings)
    }

    /// Resolve the single configured topology
    pub fn topology(&self) -> Result<TopologyConfig> {
        TopologyConfig::resolve(self.node.clone(), self.cluster.clone(), self.sentinel.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_in_ms)
    }
}

fn default_request_timeout() -> u64 {
    5000
}
