use tracing::debug;
use tracing::Instrument;

use super::resolve_ttl;
use super::to_bytes;
use super::Connection;
use super::KeyIterator;
use super::KeyValIterator;
use super::KeyValue;
use super::Namespace;
use super::PutOption;
use super::ScanPager;
use super::Txn;
use crate::utils::scoped_timer::ScopedTimer;
use crate::Result;

/// Point reads, writes, listing and deletion under one key namespace.
///
/// Holds no state of its own beyond the namespace, so clones are cheap and may
/// be used concurrently. Every call fails with `ConnectionError::Closed` once
/// the owning [`Connection`] is closed.
#[derive(Debug, Clone)]
pub struct Broker {
    conn: Connection,
    namespace: Namespace,
}

impl Broker {
    pub(crate) fn new(
        conn: Connection,
        namespace: &[u8],
    ) -> Self {
        Self {
            conn,
            namespace: Namespace::new(namespace),
        }
    }

    pub fn namespace(&self) -> &[u8] {
        self.namespace.as_bytes()
    }

    /// Writes a value, replacing any previous value, revision and expiry
    ///
    /// # Errors
    /// - [`crate::Error::MalformedKey`] for an empty key
    /// - [`crate::Error::InvalidOption`] for a zero TTL
    /// - [`crate::ConnectionError::Closed`] after the connection was closed
    /// - [`crate::Error::Timeout`] when the store does not answer in time
    pub async fn put(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        options: &[PutOption],
    ) -> Result<()> {
        let _timer = ScopedTimer::new("broker::put");

        let ttl = resolve_ttl(options)?;
        let key = self.namespace.key(key.as_ref())?;
        let value = to_bytes(value);

        async {
            debug!(?key, ?ttl, "put");
            self.conn.call("put", self.conn.client().set(key, value, ttl)).await
        }
        .instrument(self.conn.span().clone())
        .await
    }

    /// Reads the live value of `key`.
    ///
    /// Absent and expired keys are `Ok(None)`; only connectivity and protocol
    /// failures are errors.
    pub async fn get_value(
        &self,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<KeyValue>> {
        let _timer = ScopedTimer::new("broker::get_value");

        let relative = to_bytes(key);
        let key = self.namespace.key(&relative)?;

        let stored = self.conn.call("get_value", self.conn.client().get(key)).await?;
        Ok(stored.map(|stored| KeyValue {
            key: relative,
            value: stored.value,
            revision: stored.revision,
        }))
    }

    /// Lists `(key, revision)` of every live key starting with `prefix`
    pub async fn list_keys(
        &self,
        prefix: impl AsRef<[u8]>,
    ) -> Result<KeyIterator> {
        let _timer = ScopedTimer::new("broker::list_keys");
        Ok(KeyIterator::new(self.pager(prefix.as_ref()).await?))
    }

    /// Lists every live entry whose key starts with `prefix`
    pub async fn list_values(
        &self,
        prefix: impl AsRef<[u8]>,
    ) -> Result<KeyValIterator> {
        let _timer = ScopedTimer::new("broker::list_values");
        Ok(KeyValIterator::new(self.pager(prefix.as_ref()).await?))
    }

    /// Deletes `key` and every key it prefixes.
    ///
    /// Matching keys are collected first and removed with a single store call.
    /// Returns whether anything was removed.
    pub async fn delete(
        &self,
        key_or_prefix: impl AsRef<[u8]>,
    ) -> Result<bool> {
        let _timer = ScopedTimer::new("broker::delete");

        let prefix = self.namespace.key(key_or_prefix.as_ref())?;
        let mut pager = ScanPager::start(self.conn.clone(), self.namespace.clone(), prefix.clone()).await?;

        let mut keys = Vec::new();
        while let Some(scanned) = pager.next_key().await? {
            keys.push(scanned.key);
        }
        if keys.is_empty() {
            debug!(?prefix, "delete matched nothing");
            return Ok(false);
        }

        let matched = keys.len();
        let removed = self.conn.call("delete", self.conn.client().del(keys)).await?;
        self.conn
            .span()
            .in_scope(|| debug!(?prefix, matched, removed, "delete"));
        Ok(removed > 0)
    }

    /// Starts an empty transaction bound to this broker's namespace
    pub fn new_txn(&self) -> Txn {
        Txn::new(self.conn.clone(), self.namespace.clone())
    }

    async fn pager(
        &self,
        prefix: &[u8],
    ) -> Result<ScanPager> {
        let prefix = self.namespace.prefix(prefix);
        ScanPager::start(self.conn.clone(), self.namespace.clone(), prefix).await
    }
}
