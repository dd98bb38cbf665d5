//! Keyspace notifications over `PSUBSCRIBE`.
//!
//! Every prefix becomes the pattern `__keyspace@<db>__:<escaped prefix>*`.
//! Keyspace events only name the command, so `Set` notifications carry no
//! value.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::command;
use super::connection::Dialer;
use super::connection::RespConnection;
use super::RespValue;
use crate::config::WatchConfig;
use crate::constants::KEYSPACE_CHANNEL_PREFIX;
use crate::constants::KEYSPACE_EVENTS;
use crate::store::KeyspaceNotification;
use crate::store::NotificationKind;
use crate::utils::glob::prefix_pattern;
use crate::Result;
use crate::WatchError;

/// `__keyspace@<db>__:`
pub(crate) fn channel_prefix(db: u32) -> Bytes {
    Bytes::from(format!("{KEYSPACE_CHANNEL_PREFIX}{db}__:"))
}

/// Maps a keyspace event name onto the notification it stands for
pub(crate) fn notification_kind(event: &[u8]) -> Option<NotificationKind> {
    match event {
        b"set" | b"setrange" | b"append" | b"incrby" | b"incrbyfloat" | b"rename_to" => {
            Some(NotificationKind::Set { value: None })
        }
        b"del" | b"rename_from" => Some(NotificationKind::Del),
        b"expired" | b"evicted" => Some(NotificationKind::Expired),
        _ => None,
    }
}

/// Decodes a `pmessage` push; anything else yields `None`
pub(crate) fn parse_push(
    frame: &RespValue,
    channel_prefix: &[u8],
) -> Option<KeyspaceNotification> {
    let RespValue::Array(items) = frame else {
        return None;
    };
    match items.as_slice() {
        [RespValue::Bulk(kind), _pattern, RespValue::Bulk(channel), RespValue::Bulk(event)]
            if kind.as_ref() == b"pmessage" && channel.starts_with(channel_prefix) =>
        {
            let kind = notification_kind(event)?;
            Some(KeyspaceNotification {
                key: channel.slice(channel_prefix.len()..),
                kind,
            })
        }
        _ => None,
    }
}

/// Opens a dedicated connection and subscribes it to every prefix
pub(crate) async fn open(
    dialer: &Dialer,
    endpoint: &str,
    prefixes: &[Bytes],
    watch: &WatchConfig,
) -> Result<RespConnection> {
    let mut conn = dialer.dial(endpoint).await?;

    if watch.configure_keyspace_events {
        let reply = conn.call(command::config_set_keyspace_events(KEYSPACE_EVENTS)).await?;
        if let Err(e) = reply.expect_ok("CONFIG SET") {
            warn!(%endpoint, "Could not enable keyspace notifications: {e}");
        }
    }

    let channel_prefix = channel_prefix(dialer.selected_db());
    let commands = prefixes
        .iter()
        .map(|prefix| {
            let mut pattern = channel_prefix.to_vec();
            pattern.extend_from_slice(&prefix_pattern(prefix));
            command::psubscribe(vec![Bytes::from(pattern)])
        })
        .collect();

    for reply in conn.pipeline(commands).await? {
        match reply.into_result() {
            Ok(RespValue::Array(items)) if matches!(items.first(), Some(RespValue::Bulk(k)) if k.as_ref() == b"psubscribe") => {}
            Ok(other) => {
                return Err(WatchError::SubscriptionLost(format!("unexpected PSUBSCRIBE reply {other:?}")).into());
            }
            Err(e) => return Err(WatchError::SubscriptionLost(e.to_string()).into()),
        }
    }

    debug!(%endpoint, prefixes = prefixes.len(), "Subscribed to keyspace notifications");
    Ok(conn)
}

/// Forwards notifications from `conn` until cancelled, the receiver goes
/// away or the connection fails. A failure is surfaced as
/// `WatchError::SubscriptionLost`.
pub(crate) async fn forward(
    mut conn: RespConnection,
    db: u32,
    tx: mpsc::Sender<Result<KeyspaceNotification>>,
    cancel: CancellationToken,
) {
    let channel_prefix = channel_prefix(db);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            frame = conn.read_push() => frame,
        };

        match frame {
            Ok(frame) => {
                let Some(notification) = parse_push(&frame, &channel_prefix) else {
                    trace!(?frame, "Ignoring push frame");
                    continue;
                };
                if tx.send(Ok(notification)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    warn!(endpoint = conn.endpoint(), "Keyspace subscription lost: {e}");
                    let _ = tx.send(Err(WatchError::SubscriptionLost(e.to_string()).into())).await;
                }
                break;
            }
        }
    }
    trace!(endpoint = conn.endpoint(), "Keyspace subscription ended");
}
