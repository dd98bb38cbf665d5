//! Store capability interface
//!
//! Every topology is resolved once, at open time, into a [`StoreClient`]. The
//! key-value core only ever talks to this trait, so it never branches on the
//! deployment shape after construction.
//!
//! # Implementations
//!
//! - [`MemoryStore`]: in-process store with native expiry and notifications
//! - [`resp::NodeClient`], [`resp::ClusterClient`], [`resp::SentinelClient`]:
//!   remote store spoken to over RESP2

pub mod memory;
pub mod resp;

pub use memory::MemoryStore;
pub use memory::MemoryStoreConfig;

use std::time::Duration;

use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;

use crate::Result;

/// Opaque version marker returned with reads
pub type Revision = i64;

/// Value plus the revision it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: Bytes,
    pub revision: Revision,
}

/// One buffered operation of an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

impl StoreOp {
    pub fn key(&self) -> &Bytes {
        match self {
            StoreOp::Put { key, .. } => key,
            StoreOp::Delete { key } => key,
        }
    }
}

/// Resume point of a prefix scan.
///
/// `shard` selects the node for sharded stores; `position` is the store's own
/// cursor (a numeric cursor for RESP stores, the last returned key for the
/// memory store). The default value starts a new scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanCursor {
    pub shard: usize,
    pub position: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedKey {
    pub key: Bytes,
    pub revision: Revision,
}

/// One page of a prefix scan; `next` is `None` once the scan is complete
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub keys: Vec<ScannedKey>,
    pub next: Option<ScanCursor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// Key was written. Stores that cannot ship the value leave it `None`
    Set { value: Option<Bytes> },
    /// Key was deleted
    Del,
    /// Key expired or was evicted
    Expired,
}

/// Change notification for a single key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceNotification {
    pub key: Bytes,
    pub kind: NotificationKind,
}

/// Live keyspace subscription.
///
/// Notifications for one key arrive in the order the store applied the
/// mutations. Dropping the subscription cancels the background reader.
pub struct Subscription {
    receiver: mpsc::Receiver<Result<KeyspaceNotification>>,
    _guard: DropGuard,
}

impl Subscription {
    pub fn new(
        receiver: mpsc::Receiver<Result<KeyspaceNotification>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            _guard: cancel.drop_guard(),
        }
    }

    /// Next notification; `None` once the subscription ended
    pub async fn recv(&mut self) -> Option<Result<KeyspaceNotification>> {
        self.receiver.recv().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Primitives the key-value core needs from a store client.
///
/// Implementations must be safe for concurrent use by many brokers and
/// watchers; the core adds no locking of its own.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Reads a live (non-expired) value
    async fn get(
        &self,
        key: Bytes,
    ) -> Result<Option<StoredValue>>;

    /// Writes a value, replacing value, revision and expiry in one call.
    /// `ttl = None` writes a non-expiring value.
    async fn set(
        &self,
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Deletes keys, returning how many live keys were removed
    async fn del(
        &self,
        keys: Vec<Bytes>,
    ) -> Result<u64>;

    /// Returns one page of live keys starting with `prefix`
    async fn scan(
        &self,
        prefix: Bytes,
        cursor: ScanCursor,
        count: usize,
    ) -> Result<ScanPage>;

    /// Applies every operation in order as one all-or-nothing unit
    async fn exec(
        &self,
        ops: Vec<StoreOp>,
    ) -> Result<()>;

    /// Subscribes to change notifications for keys starting with any prefix
    async fn subscribe(
        &self,
        prefixes: Vec<Bytes>,
    ) -> Result<Subscription>;

    /// Releases the client. Idempotent.
    async fn close(&self);
}

/// Whether `key` starts with any of `prefixes`
pub(crate) fn matches_any(
    key: &[u8],
    prefixes: &[Bytes],
) -> bool {
    prefixes.iter().any(|p| key.starts_with(p))
}
