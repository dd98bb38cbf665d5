//! RESP2 transport to a remote in-memory store.
//!
//! [`open`] turns a [`TopologyConfig`] into the matching client once; nothing
//! above this module branches on the topology again.

mod cluster;
mod codec;
pub(crate) mod command;
mod connection;
mod node;
mod pool;
mod pubsub;
mod sentinel;
mod tls;
mod value;

pub use cluster::ClusterClient;
pub use codec::RespCodec;
pub use node::NodeClient;
pub use sentinel::SentinelClient;
pub use value::RespValue;

#[cfg(test)]
mod resp_test;

use std::sync::Arc;

use crate::config::TopologyConfig;
use crate::config::WatchConfig;
use crate::store::StoreClient;
use crate::Result;

/// Validates `topology` and connects the client for it
pub async fn open(
    topology: &TopologyConfig,
    watch: &WatchConfig,
) -> Result<Arc<dyn StoreClient>> {
    topology.validate()?;
    watch.validate()?;

    let client: Arc<dyn StoreClient> = match topology {
        TopologyConfig::Node(config) => Arc::new(NodeClient::connect(config, watch).await?),
        TopologyConfig::Cluster(config) => Arc::new(ClusterClient::connect(config, watch).await?),
        TopologyConfig::Sentinel(config) => Arc::new(SentinelClient::connect(config, watch).await?),
    };
    Ok(client)
}
