//! Change notification delivery.
//!
//! # Delivery model
//!
//! Each [`Watcher::watch`] call opens one store subscription and spawns one
//! delivery task. The task turns notifications into [`WatchEvent`]s in the
//! order the subscription yields them, so events for a single key keep the
//! store's mutation order.
//!
//! The sink is a bounded `mpsc` channel owned by the caller. When it stays
//! full for longer than `watch.delivery_timeout_in_ms` the event is dropped
//! and counted (see [`Watcher::dropped_events`]); the subscription is never
//! blocked indefinitely. Closing the owning connection delivers a final
//! `Err(WatchError::Closed)` and ends the task, which drops its sender.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use tracing::Instrument;

use super::Connection;
use super::Namespace;
use crate::store::matches_any;
use crate::store::KeyspaceNotification;
use crate::store::NotificationKind;
use crate::store::Subscription;
use crate::ConnectionError;
use crate::Error;
use crate::Result;
use crate::WatchError;

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// What happened to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// Key was written
    Put,
    /// Key was deleted or expired
    Delete,
}

/// Change of a single key, relative to the watcher's namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub change_type: ChangeType,
    pub key: Bytes,
    /// Value written by a put. `None` for deletes, and for puts whose key was
    /// already gone again by the time its value was read
    pub value: Option<Bytes>,
}

pub type WatchResponse = std::result::Result<WatchEvent, WatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Unwatched,
    Watching,
    Closed,
}

/// Subscribes to key changes under one namespace
#[derive(Debug, Clone)]
pub struct Watcher {
    id: u64,
    conn: Connection,
    namespace: Namespace,
    watching: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl Watcher {
    pub(crate) fn new(
        conn: Connection,
        namespace: &[u8],
    ) -> Self {
        Self {
            id: NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed),
            conn,
            namespace: Namespace::new(namespace),
            watching: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> WatcherState {
        if self.conn.is_closed() {
            WatcherState::Closed
        } else if self.watching.load(Ordering::Acquire) {
            WatcherState::Watching
        } else {
            WatcherState::Unwatched
        }
    }

    /// Events dropped because the sink stayed full
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Starts delivering changes of keys under any of `prefixes` to `sink`.
    ///
    /// Returns once the store subscription is established, so every mutation
    /// applied after this call is observed. May be called again to add another
    /// sink or prefix set.
    ///
    /// # Errors
    /// - [`WatchError::NoPrefixes`] when `prefixes` is empty
    /// - [`ConnectionError::Closed`] after the connection was closed
    /// - subscription failures from the store
    pub async fn watch<I, P>(
        &self,
        sink: mpsc::Sender<WatchResponse>,
        prefixes: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        if self.conn.is_closed() {
            return Err(ConnectionError::Closed.into());
        }

        let prefixes: Vec<Bytes> = prefixes
            .into_iter()
            .map(|prefix| self.namespace.prefix(prefix.as_ref()))
            .collect();
        if prefixes.is_empty() {
            return Err(WatchError::NoPrefixes.into());
        }

        let subscription = self
            .conn
            .call("watch", self.conn.client().subscribe(prefixes.clone()))
            .await?;
        self.watching.store(true, Ordering::Release);

        let task = DeliveryTask {
            watcher_id: self.id,
            conn: self.conn.clone(),
            namespace: self.namespace.clone(),
            prefixes,
            sink,
            delivery_timeout: self.conn.watch_config().delivery_timeout(),
            dropped: self.dropped.clone(),
        };
        self.conn
            .span()
            .in_scope(|| debug!(watcher_id = self.id, prefixes = ?task.prefixes, "Watching"));
        tokio::spawn(task.run(subscription).instrument(self.conn.span().clone()));
        Ok(())
    }
}

enum Step {
    Deliver(WatchResponse),
    Skip,
}

struct DeliveryTask {
    watcher_id: u64,
    conn: Connection,
    namespace: Namespace,
    prefixes: Vec<Bytes>,
    sink: mpsc::Sender<WatchResponse>,
    delivery_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl DeliveryTask {
    async fn run(
        self,
        mut subscription: Subscription,
    ) {
        let closed = self.conn.closed_token();

        loop {
            let received = tokio::select! {
                biased;
                _ = closed.cancelled() => {
                    self.finish(WatchError::Closed).await;
                    break;
                }
                _ = self.sink.closed() => {
                    debug!(watcher_id = self.watcher_id, "Sink dropped, stop watching");
                    break;
                }
                received = subscription.recv() => received,
            };

            let step = match received {
                Some(Ok(notification)) => self.on_notification(notification).await,
                Some(Err(Error::Watch(WatchError::Lagged(skipped)))) => {
                    warn!(watcher_id = self.watcher_id, skipped, "Watcher lagged");
                    Step::Deliver(Err(WatchError::Lagged(skipped)))
                }
                // Ends on the next turn through the closed branch
                Some(Err(e)) if e.is_closed() => continue,
                Some(Err(e)) => {
                    warn!(watcher_id = self.watcher_id, error = %e, "Subscription failed");
                    self.finish(WatchError::SubscriptionLost(e.to_string())).await;
                    break;
                }
                None if closed.is_cancelled() => continue,
                None => {
                    warn!(watcher_id = self.watcher_id, "Subscription ended");
                    self.finish(WatchError::SubscriptionLost("subscription ended".into()))
                        .await;
                    break;
                }
            };

            if let Step::Deliver(response) = step {
                if !self.deliver(response).await {
                    break;
                }
            }
        }
        trace!(watcher_id = self.watcher_id, "Delivery task stopped");
    }

    async fn on_notification(
        &self,
        notification: KeyspaceNotification,
    ) -> Step {
        if !matches_any(&notification.key, &self.prefixes) {
            return Step::Skip;
        }
        let Some(key) = self.namespace.strip(&notification.key) else {
            return Step::Skip;
        };

        let event = match notification.kind {
            NotificationKind::Set { value: Some(value) } => WatchEvent {
                change_type: ChangeType::Put,
                key,
                value: Some(value),
            },
            NotificationKind::Set { value: None } => {
                let read = self
                    .conn
                    .call("watch_get", self.conn.client().get(notification.key.clone()))
                    .await;
                match read {
                    Ok(stored) => WatchEvent {
                        change_type: ChangeType::Put,
                        key,
                        value: stored.map(|stored| stored.value),
                    },
                    Err(e) if e.is_closed() => return Step::Skip,
                    Err(e) => {
                        warn!(watcher_id = self.watcher_id, ?key, error = %e, "Value read failed");
                        return Step::Deliver(Err(WatchError::ValueUnavailable(e.to_string())));
                    }
                }
            }
            NotificationKind::Del | NotificationKind::Expired => WatchEvent {
                change_type: ChangeType::Delete,
                key,
                value: None,
            },
        };

        trace!(watcher_id = self.watcher_id, event = ?event, "Change");
        Step::Deliver(Ok(event))
    }

    /// Returns false once the sink is gone
    async fn deliver(
        &self,
        response: WatchResponse,
    ) -> bool {
        match self.sink.send_timeout(response, self.delivery_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(watcher_id = self.watcher_id, dropped, "Sink full, event dropped");
                true
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Best-effort terminal notice
    async fn finish(
        &self,
        reason: WatchError,
    ) {
        debug!(watcher_id = self.watcher_id, %reason, "Watcher finished");
        let _ = self.deliver(Err(reason)).await;
    }
}
