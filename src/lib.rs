//! # d-keyval
//!
//! Byte-oriented key-value access over a remote in-memory store deployed as a
//! standalone node, a sharded cluster or a sentinel-managed failover group.
//!
//! ## Quick start
//!
//! ```ignore
//! use d_keyval::{with_ttl, Connection, TopologyConfig, TopologyKind};
//!
//! let topology = TopologyConfig::load(TopologyKind::Node, "config/node-client.yaml")?;
//! let conn = Connection::open(topology).await?;
//! let broker = conn.new_broker("");
//! broker.put("key1", "val 1", &[with_ttl(Duration::from_secs(1))]).await?;
//! let entry = broker.get_value("key1").await?;
//! conn.close().await;
//! ```
//!
//! ## Modules
//!
//! - [`keyval`]: connection, broker, transaction, watcher and iterators
//! - [`store`]: the store capability trait, the in-process store and the RESP transport
//! - [`config`]: topology shapes plus file and environment loading

pub mod config;
pub mod keyval;
pub mod store;

mod constants;
mod errors;
mod utils;

pub use config::*;
pub use errors::*;
pub use keyval::*;
pub use store::MemoryStore;
pub use store::MemoryStoreConfig;
pub use store::Revision;
pub use store::StoreClient;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
