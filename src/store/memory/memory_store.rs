//! In-process store with native expiry and keyspace notifications.
//!
//! # Expiry policy
//!
//! Every item carries its own deadline. Reads, scans and deletes treat an
//! elapsed item as absent the moment its deadline passes (lazy eviction), and
//! a background sweeper removes elapsed items and publishes `Expired`
//! notifications. Listing therefore never returns stale keys.
//!
//! # Ordering
//!
//! Notifications are published while the write lock is held, so all
//! subscribers observe mutations in the order they were applied.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::store::matches_any;
use crate::store::KeyspaceNotification;
use crate::store::NotificationKind;
use crate::store::Revision;
use crate::store::ScanCursor;
use crate::store::ScanPage;
use crate::store::ScannedKey;
use crate::store::StoreClient;
use crate::store::StoreOp;
use crate::store::StoredValue;
use crate::store::Subscription;
use crate::ConnectionError;
use crate::Result;
use crate::WatchError;

#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Interval of the expired-item sweeper
    /// Default: 100ms
    pub sweep_interval: Duration,

    /// Capacity of the notification broadcast queue
    /// Default: 4096
    pub notification_capacity: usize,

    /// Per-subscription buffer
    /// Default: 1024
    pub subscription_buffer_size: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(100),
            notification_capacity: 4096,
            subscription_buffer_size: 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct Item {
    value: Bytes,
    revision: Revision,
    expires_at: Option<Instant>,
}

impl Item {
    fn is_expired(
        &self,
        now: Instant,
    ) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

#[derive(Debug)]
struct MemoryInner {
    data: RwLock<BTreeMap<Bytes, Item>>,
    revision: AtomicI64,
    notifier: broadcast::Sender<KeyspaceNotification>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    config: MemoryStoreConfig,
}

/// Process-local [`StoreClient`].
///
/// Cloning shares the same keyspace, so several connections opened over
/// clones observe each other's writes and notifications.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Creates a store and, when a tokio runtime is available, starts the
    /// expired-item sweeper.
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        let (notifier, _) = broadcast::channel(config.notification_capacity.max(1));
        let inner = Arc::new(MemoryInner {
            data: RwLock::new(BTreeMap::new()),
            revision: AtomicI64::new(0),
            notifier,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            config,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(sweep_expired(Arc::downgrade(&inner)));
            }
            Err(_) => {
                warn!("No tokio runtime, memory store runs without expiry sweeper");
            }
        }

        Self { inner }
    }

    /// Number of stored items, including elapsed items not yet swept
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every elapsed item, returning how many were evicted
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed.into());
        }
        Ok(())
    }
}

impl MemoryInner {
    fn next_revision(&self) -> Revision {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(
        &self,
        key: Bytes,
        kind: NotificationKind,
    ) {
        // No receivers is not an error
        let _ = self.notifier.send(KeyspaceNotification { key, kind });
    }

    fn put_locked(
        &self,
        data: &mut BTreeMap<Bytes, Item>,
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    ) {
        let item = Item {
            value: value.clone(),
            revision: self.next_revision(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        data.insert(key.clone(), item);
        self.publish(key, NotificationKind::Set { value: Some(value) });
    }

    /// Returns whether a live item was removed
    fn delete_locked(
        &self,
        data: &mut BTreeMap<Bytes, Item>,
        key: &Bytes,
        now: Instant,
    ) -> bool {
        match data.remove(key) {
            Some(item) if item.is_expired(now) => {
                self.publish(key.clone(), NotificationKind::Expired);
                false
            }
            Some(_) => {
                self.publish(key.clone(), NotificationKind::Del);
                true
            }
            None => false,
        }
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.write();
        let expired: Vec<Bytes> = data
            .iter()
            .filter(|(_, item)| item.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            data.remove(key);
            self.publish(key.clone(), NotificationKind::Expired);
        }

        if !expired.is_empty() {
            trace!(count = expired.len(), "Swept expired items");
        }
        expired.len()
    }
}

async fn sweep_expired(inner: Weak<MemoryInner>) {
    let (interval, shutdown) = match inner.upgrade() {
        Some(inner) => (inner.config.sweep_interval, inner.shutdown.clone()),
        None => return,
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                match inner.upgrade() {
                    Some(inner) => {
                        inner.sweep();
                    }
                    None => break,
                }
            }
        }
    }
    debug!("Memory store sweeper stopped");
}

#[async_trait::async_trait]
impl StoreClient for MemoryStore {
    async fn get(
        &self,
        key: Bytes,
    ) -> Result<Option<StoredValue>> {
        self.ensure_open()?;
        let now = Instant::now();

        {
            let data = self.inner.data.read();
            match data.get(&key) {
                None => return Ok(None),
                Some(item) if !item.is_expired(now) => {
                    return Ok(Some(StoredValue {
                        value: item.value.clone(),
                        revision: item.revision,
                    }));
                }
                Some(_) => {}
            }
        }

        // Lazy eviction of the elapsed item
        let mut data = self.inner.data.write();
        if matches!(data.get(&key), Some(item) if item.is_expired(Instant::now())) {
            data.remove(&key);
            self.inner.publish(key, NotificationKind::Expired);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut data = self.inner.data.write();
        self.inner.put_locked(&mut data, key, value, ttl);
        Ok(())
    }

    async fn del(
        &self,
        keys: Vec<Bytes>,
    ) -> Result<u64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut data = self.inner.data.write();
        let removed = keys
            .iter()
            .filter(|key| self.inner.delete_locked(&mut data, key, now))
            .count();
        Ok(removed as u64)
    }

    async fn scan(
        &self,
        prefix: Bytes,
        cursor: ScanCursor,
        count: usize,
    ) -> Result<ScanPage> {
        self.ensure_open()?;
        let now = Instant::now();
        let count = count.max(1);

        let start = if cursor.position.is_empty() {
            Bound::Included(prefix.clone())
        } else {
            Bound::Excluded(cursor.position)
        };

        let data = self.inner.data.read();
        let mut keys: Vec<ScannedKey> = data
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(_, item)| !item.is_expired(now))
            .take(count + 1)
            .map(|(key, item)| ScannedKey {
                key: key.clone(),
                revision: item.revision,
            })
            .collect();

        let next = if keys.len() > count {
            keys.truncate(count);
            keys.last().map(|last| ScanCursor {
                shard: 0,
                position: last.key.clone(),
            })
        } else {
            None
        };

        Ok(ScanPage { keys, next })
    }

    async fn exec(
        &self,
        ops: Vec<StoreOp>,
    ) -> Result<()> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut data = self.inner.data.write();
        for op in ops {
            match op {
                StoreOp::Put { key, value } => self.inner.put_locked(&mut data, key, value, None),
                StoreOp::Delete { key } => {
                    self.inner.delete_locked(&mut data, &key, now);
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        prefixes: Vec<Bytes>,
    ) -> Result<Subscription> {
        self.ensure_open()?;

        let mut notifications = self.inner.notifier.subscribe();
        let (tx, rx) = mpsc::channel(self.inner.config.subscription_buffer_size.max(1));
        let cancel = self.inner.shutdown.child_token();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    received = notifications.recv() => received,
                };

                let forwarded = match received {
                    Ok(notification) => {
                        if !matches_any(&notification.key, &prefixes) {
                            continue;
                        }
                        tx.send(Ok(notification)).await
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory store subscription lagged");
                        tx.send(Err(WatchError::Lagged(skipped).into())).await
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if forwarded.is_err() {
                    break;
                }
            }
            trace!("Memory store subscription ended");
        });

        Ok(Subscription::new(rx, cancel))
    }

    async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.shutdown.cancel();
            debug!("Memory store closed");
        }
    }
}
