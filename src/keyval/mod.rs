//! Key-value access core.
//!
//! A [`Connection`] wraps one store client resolved from a topology. Brokers
//! read and write through it, transactions batch writes into a single atomic
//! store call, and watchers turn keyspace notifications into [`WatchEvent`]s.
//!
//! ```ignore
//! let conn = Connection::open(topology).await?;
//! let broker = conn.new_broker("");
//! let watcher = conn.new_watcher("");
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! watcher.watch(tx, ["key"]).await?;
//!
//! broker.put("key1", "val 1", &[with_ttl(Duration::from_secs(1))]).await?;
//! while let Some(event) = rx.recv().await { /* ... */ }
//! ```

mod broker;
mod connection;
mod iterator;
mod namespace;
mod txn;
mod watcher;

pub use broker::*;
pub use connection::*;
pub use iterator::*;
pub use txn::*;
pub use watcher::*;

pub(crate) use namespace::Namespace;

#[cfg(test)]
mod iterator_test;

use std::time::Duration;

use bytes::Bytes;

use crate::store::Revision;
use crate::Error;
use crate::Result;

/// Entry returned by reads; `key` is relative to the broker's namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
    pub revision: Revision,
}

/// Options recognised by [`Broker::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PutOption {
    /// Value becomes absent once the duration elapses
    Ttl(Duration),
}

pub fn with_ttl(ttl: Duration) -> PutOption {
    PutOption::Ttl(ttl)
}

/// Folds put options into the expiry of the write; the last TTL wins
pub(crate) fn resolve_ttl(options: &[PutOption]) -> Result<Option<Duration>> {
    let mut ttl = None;
    for option in options {
        match option {
            PutOption::Ttl(duration) if duration.is_zero() => {
                return Err(Error::InvalidOption("ttl must be greater than zero".into()));
            }
            PutOption::Ttl(duration) => ttl = Some(*duration),
        }
    }
    Ok(ttl)
}

/// Owned copy of a caller key or value
pub(crate) fn to_bytes(data: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(data.as_ref())
}
