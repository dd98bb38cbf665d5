//! Lazy listing iterators.
//!
//! Both iterators page through the store with a resumable scan cursor. Keys
//! already yielded are remembered, so a store that returns a key on two pages
//! (RESP `SCAN` may) never yields it twice.

use std::collections::HashSet;
use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream;
use futures::Stream;
use tracing::trace;

use super::Connection;
use super::KeyValue;
use super::Namespace;
use crate::constants::SCAN_PAGE_SIZE;
use crate::store::Revision;
use crate::store::ScanCursor;
use crate::store::ScannedKey;
use crate::Result;

pub(crate) struct ScanPager {
    conn: Connection,
    namespace: Namespace,
    prefix: Bytes,
    cursor: Option<ScanCursor>,
    buffer: VecDeque<ScannedKey>,
    seen: HashSet<Bytes>,
}

impl ScanPager {
    /// Starts a scan and fetches the first page
    pub(crate) async fn start(
        conn: Connection,
        namespace: Namespace,
        prefix: Bytes,
    ) -> Result<Self> {
        let mut pager = Self {
            conn,
            namespace,
            prefix,
            cursor: None,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
        };
        pager.fetch(ScanCursor::default()).await?;
        Ok(pager)
    }

    /// Next store key; the cursor is kept on failure so the call can be repeated
    pub(crate) async fn next_key(&mut self) -> Result<Option<ScannedKey>> {
        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Ok(Some(key));
            }
            let Some(cursor) = self.cursor.take() else {
                return Ok(None);
            };
            if let Err(e) = self.fetch(cursor.clone()).await {
                self.cursor = Some(cursor);
                return Err(e);
            }
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Caller key of a store key
    pub(crate) fn relative(
        &self,
        key: &Bytes,
    ) -> Option<Bytes> {
        self.namespace.strip(key)
    }

    async fn fetch(
        &mut self,
        cursor: ScanCursor,
    ) -> Result<()> {
        let page = self
            .conn
            .call(
                "scan",
                self.conn.client().scan(self.prefix.clone(), cursor, SCAN_PAGE_SIZE),
            )
            .await?;

        trace!(keys = page.keys.len(), more = page.next.is_some(), "Scan page");
        for key in page.keys {
            if self.seen.insert(key.key.clone()) {
                self.buffer.push_back(key);
            }
        }
        self.cursor = page.next;
        Ok(())
    }
}

/// One-pass sequence of `(key, revision)` pairs under a prefix
pub struct KeyIterator {
    pager: ScanPager,
}

impl KeyIterator {
    pub(crate) fn new(pager: ScanPager) -> Self {
        Self { pager }
    }

    pub async fn next(&mut self) -> Result<Option<(Bytes, Revision)>> {
        while let Some(scanned) = self.pager.next_key().await? {
            if let Some(key) = self.pager.relative(&scanned.key) {
                return Ok(Some((key, scanned.revision)));
            }
        }
        Ok(None)
    }

    /// Drains the iterator
    pub async fn collect_all(mut self) -> Result<Vec<(Bytes, Revision)>> {
        let mut keys = Vec::new();
        while let Some(item) = self.next().await? {
            keys.push(item);
        }
        Ok(keys)
    }

    /// Adapts the iterator to a [`Stream`] that ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<(Bytes, Revision)>> {
        stream::unfold(Some(self), |state| async move {
            let mut iter = state?;
            match iter.next().await {
                Ok(Some(item)) => Some((Ok(item), Some(iter))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// One-pass sequence of entries under a prefix.
///
/// Values are read as the iterator advances; a key deleted or expired after it
/// was scanned is skipped.
pub struct KeyValIterator {
    pager: ScanPager,
}

impl KeyValIterator {
    pub(crate) fn new(pager: ScanPager) -> Self {
        Self { pager }
    }

    pub async fn next(&mut self) -> Result<Option<KeyValue>> {
        while let Some(scanned) = self.pager.next_key().await? {
            let Some(key) = self.pager.relative(&scanned.key) else {
                continue;
            };
            let conn = self.pager.connection();
            let stored = conn.call("get", conn.client().get(scanned.key.clone())).await?;
            match stored {
                Some(stored) => {
                    return Ok(Some(KeyValue {
                        key,
                        value: stored.value,
                        revision: stored.revision,
                    }));
                }
                None => trace!(key = ?scanned.key, "Listed key vanished before read"),
            }
        }
        Ok(None)
    }

    pub async fn collect_all(mut self) -> Result<Vec<KeyValue>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<KeyValue>> {
        stream::unfold(Some(self), |state| async move {
            let mut iter = state?;
            match iter.next().await {
                Ok(Some(entry)) => Some((Ok(entry), Some(iter))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl std::fmt::Debug for KeyIterator {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KeyIterator")
            .field("prefix", &self.pager.prefix)
            .field("buffered", &self.pager.buffer.len())
            .finish()
    }
}

impl std::fmt::Debug for KeyValIterator {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KeyValIterator")
            .field("prefix", &self.pager.prefix)
            .field("buffered", &self.pager.buffer.len())
            .finish()
    }
}
