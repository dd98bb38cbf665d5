use std::fmt;
use std::path::Path;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use super::ClientConfig;
use super::TlsConfig;
use crate::constants::ENV_PREFIX;
use crate::Error;
use crate::Result;

/// Standalone node
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// `host:port` of the node
    pub endpoint: String,

    /// Logical database index selected on every connection
    #[serde(default)]
    pub db: u32,

    /// Allow read-only queries against a replica node
    #[serde(default)]
    pub allow_read_from_replica: bool,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

/// Sharded cluster
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Seed endpoints used to discover the slot layout
    pub endpoints: Vec<String>,

    /// Route read-only queries to replicas
    #[serde(default)]
    pub allow_read_from_replica: bool,

    /// Maximum MOVED/ASK redirects followed per command
    /// Default: 3 (0 means default)
    #[serde(default)]
    pub max_redirects: usize,

    /// Route read-only queries to the lowest latency node
    #[serde(default)]
    pub route_by_latency: bool,

    #[serde(default)]
    pub client: ClientConfig,
}

/// Sentinel-managed failover group
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SentinelConfig {
    /// Sentinel endpoints
    pub endpoints: Vec<String>,

    /// Name of the monitored master group
    pub master_name: String,

    /// Logical database index selected on every connection
    #[serde(default)]
    pub db: u32,

    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    Node,
    Cluster,
    Sentinel,
}

impl fmt::Display for TopologyKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            TopologyKind::Node => write!(f, "node"),
            TopologyKind::Cluster => write!(f, "cluster"),
            TopologyKind::Sentinel => write!(f, "sentinel"),
        }
    }
}

/// The deployment shape of the backing store; exactly one is selected
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TopologyConfig {
    Node(NodeConfig),
    Cluster(ClusterConfig),
    Sentinel(SentinelConfig),
}

impl ClusterConfig {
    pub fn max_redirects(&self) -> usize {
        if self.max_redirects == 0 {
            3
        } else {
            self.max_redirects
        }
    }
}

impl TopologyConfig {
    pub fn kind(&self) -> TopologyKind {
        match self {
            TopologyConfig::Node(_) => TopologyKind::Node,
            TopologyConfig::Cluster(_) => TopologyKind::Cluster,
            TopologyConfig::Sentinel(_) => TopologyKind::Sentinel,
        }
    }

    pub fn client(&self) -> &ClientConfig {
        match self {
            TopologyConfig::Node(c) => &c.client,
            TopologyConfig::Cluster(c) => &c.client,
            TopologyConfig::Sentinel(c) => &c.client,
        }
    }

    /// Picks the single configured topology out of optional sections.
    ///
    /// # Errors
    /// `Error::Config` when no section or more than one section is present
    pub fn resolve(
        node: Option<NodeConfig>,
        cluster: Option<ClusterConfig>,
        sentinel: Option<SentinelConfig>,
    ) -> Result<Self> {
        let mut selected: Vec<TopologyConfig> = Vec::with_capacity(1);
        if let Some(c) = node {
            selected.push(TopologyConfig::Node(c));
        }
        if let Some(c) = cluster {
            selected.push(TopologyConfig::Cluster(c));
        }
        if let Some(c) = sentinel {
            selected.push(TopologyConfig::Sentinel(c));
        }

        match selected.len() {
            1 => {
                let topology = selected.remove(0);
                topology.validate()?;
                Ok(topology)
            }
            0 => Err(Error::Config(ConfigError::Message(
                "no topology configured: expected one of node, cluster or sentinel".into(),
            ))),
            n => Err(Error::Config(ConfigError::Message(format!(
                "ambiguous topology: {n} of node, cluster and sentinel are configured"
            )))),
        }
    }

    /// Loads a single topology shape from a YAML or TOML file, with
    /// `KEYVAL__...` environment variables taking priority.
    pub fn load(
        kind: TopologyKind,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?;

        let topology = match kind {
            TopologyKind::Node => TopologyConfig::Node(config.try_deserialize()?),
            TopologyKind::Cluster => TopologyConfig::Cluster(config.try_deserialize()?),
            TopologyKind::Sentinel => TopologyConfig::Sentinel(config.try_deserialize()?),
        };
        topology.validate()?;
        Ok(topology)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TopologyConfig::Node(c) => {
                validate_endpoint(&c.endpoint, "node.endpoint")?;
                c.tls.validate()?;
                c.client.validate()
            }
            TopologyConfig::Cluster(c) => {
                validate_endpoints(&c.endpoints, "cluster.endpoints")?;
                c.client.validate()
            }
            TopologyConfig::Sentinel(c) => {
                validate_endpoints(&c.endpoints, "sentinel.endpoints")?;
                if c.master_name.trim().is_empty() {
                    return Err(Error::Config(ConfigError::Message(
                        "sentinel.master_name cannot be empty".into(),
                    )));
                }
                c.client.validate()
            }
        }
    }
}

fn validate_endpoints(
    endpoints: &[String],
    field: &str,
) -> Result<()> {
    if endpoints.is_empty() {
        return Err(Error::Config(ConfigError::Message(format!(
            "{field} must contain at least one endpoint"
        ))));
    }
    for endpoint in endpoints {
        validate_endpoint(endpoint, field)?;
    }
    Ok(())
}

fn validate_endpoint(
    endpoint: &str,
    field: &str,
) -> Result<()> {
    let valid = match endpoint.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if !valid {
        return Err(Error::Config(ConfigError::Message(format!(
            "{field}: invalid endpoint {endpoint:?}, expected host:port"
        ))));
    }
    Ok(())
}
