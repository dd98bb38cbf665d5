use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::command;
use super::command::Command;
use super::connection::Dialer;
use super::pool::ConnectionPool;
use super::pubsub;
use super::tls;
use super::value::parse_redirect;
use super::RespValue;
use crate::config::ClientConfig;
use crate::config::NodeConfig;
use crate::config::WatchConfig;
use crate::store::ScanCursor;
use crate::store::ScanPage;
use crate::store::ScannedKey;
use crate::store::StoreClient;
use crate::store::StoreOp;
use crate::store::StoredValue;
use crate::store::Subscription;
use crate::utils::glob::prefix_pattern;
use crate::ConnectionError;
use crate::ProtocolError;
use crate::Result;
use crate::TxnError;

/// Client of a standalone node
#[derive(Debug)]
pub struct NodeClient {
    pool: ConnectionPool,
    watch: WatchConfig,
    closed: CancellationToken,
}

impl NodeClient {
    /// Connects and verifies the node answers `PING`
    pub async fn connect(
        config: &NodeConfig,
        watch: &WatchConfig,
    ) -> Result<Self> {
        let connector = if config.tls.enabled {
            Some(tls::connector(&config.tls)?)
        } else {
            None
        };
        // Replica reads need no handshake on a standalone node; the flag only
        // permits pointing the endpoint at a replica.
        let dialer = Dialer::new(&config.client).db(config.db).tls(connector);

        let client = Self::from_dialer(&config.endpoint, dialer, &config.client, watch).await?;
        info!(
            endpoint = %config.endpoint,
            db = config.db,
            replica_reads = config.allow_read_from_replica,
            "Connected to node"
        );
        Ok(client)
    }

    /// Builds a client over an already prepared dialer
    pub(crate) async fn from_dialer(
        endpoint: &str,
        dialer: Dialer,
        client: &ClientConfig,
        watch: &WatchConfig,
    ) -> Result<Self> {
        let node = Self {
            pool: ConnectionPool::new(endpoint, dialer, client),
            watch: watch.clone(),
            closed: CancellationToken::new(),
        };
        node.ping().await?;
        Ok(node)
    }

    pub fn endpoint(&self) -> &str {
        self.pool.endpoint()
    }

    pub(crate) async fn ping(&self) -> Result<()> {
        match self.call(command::ping()).await? {
            RespValue::Simple(s) if s == "PONG" => Ok(()),
            other => Err(other.unexpected("PING")),
        }
    }

    async fn call(
        &self,
        command: Command,
    ) -> Result<RespValue> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }
        self.pool.call(command).await?.into_result()
    }
}

/// Runs `ops` inside `MULTI`/`EXEC` on one connection
pub(crate) async fn exec_on(
    pool: &ConnectionPool,
    ops: Vec<StoreOp>,
) -> Result<()> {
    let mut commands = Vec::with_capacity(ops.len() + 2);
    commands.push(command::multi());
    commands.extend(ops.into_iter().map(|op| match op {
        StoreOp::Put { key, value } => command::set(key, value, None),
        StoreOp::Delete { key } => command::del(vec![key]),
    }));
    commands.push(command::exec());

    let mut replies = pool.pipeline(commands).await?;
    let exec_reply = replies.pop().unwrap_or(RespValue::Nil);

    // Queueing errors abort the whole transaction with EXECABORT. Redirects
    // are surfaced as-is so a cluster client can refresh its slot table.
    if let Some(RespValue::Error(message)) = replies.iter().find(|r| matches!(r, RespValue::Error(_))) {
        if parse_redirect(message).is_some() {
            return Err(ProtocolError::Server(message.clone()).into());
        }
        debug!(%message, "Transaction rejected while queueing");
        return Err(TxnError::Aborted.into());
    }

    match exec_reply {
        RespValue::Array(results) => {
            if let Some(failed) = results.into_iter().find(|r| matches!(r, RespValue::Error(_))) {
                return Err(failed.into_result().err().unwrap_or_else(|| TxnError::Aborted.into()));
            }
            Ok(())
        }
        RespValue::Nil => Err(TxnError::Aborted.into()),
        RespValue::Error(message) => {
            debug!(%message, "EXEC failed");
            Err(TxnError::Aborted.into())
        }
        other => Err(other.unexpected("EXEC")),
    }
}

/// Decodes a `SCAN` reply into the next numeric cursor and the keys
pub(crate) fn parse_scan_reply(reply: RespValue) -> Result<(Bytes, Vec<Bytes>)> {
    let mut items = reply.into_array("SCAN")?.into_iter();
    let (Some(cursor), Some(keys)) = (items.next(), items.next()) else {
        return Err(RespValue::Nil.unexpected("SCAN"));
    };
    let cursor = cursor.into_bytes("SCAN")?;
    let keys = keys
        .into_array("SCAN")?
        .into_iter()
        .map(|k| k.into_bytes("SCAN"))
        .collect::<Result<Vec<_>>>()?;
    Ok((cursor, keys))
}

/// One `SCAN` round trip against `pool`, keeping only keys under `prefix`
pub(crate) async fn scan_on(
    pool: &ConnectionPool,
    prefix: &Bytes,
    position: Bytes,
    count: usize,
) -> Result<(Vec<ScannedKey>, Option<Bytes>)> {
    let position = if position.is_empty() {
        Bytes::from_static(b"0")
    } else {
        position
    };
    let reply = pool
        .call(command::scan(position, prefix_pattern(prefix), count))
        .await?
        .into_result()?;
    let (cursor, keys) = parse_scan_reply(reply)?;

    let keys = keys
        .into_iter()
        .filter(|k| k.starts_with(prefix))
        .map(|key| ScannedKey { key, revision: 0 })
        .collect();
    let next = if cursor.as_ref() == b"0" { None } else { Some(cursor) };
    Ok((keys, next))
}

#[async_trait::async_trait]
impl StoreClient for NodeClient {
    async fn get(
        &self,
        key: Bytes,
    ) -> Result<Option<StoredValue>> {
        let value = self.call(command::get(key)).await?.into_optional_bytes("GET")?;
        Ok(value.map(|value| StoredValue { value, revision: 0 }))
    }

    async fn set(
        &self,
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.call(command::set(key, value, ttl)).await?.expect_ok("SET")
    }

    async fn del(
        &self,
        keys: Vec<Bytes>,
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.call(command::del(keys)).await?.into_integer("DEL")?;
        Ok(removed.max(0) as u64)
    }

    async fn scan(
        &self,
        prefix: Bytes,
        cursor: ScanCursor,
        count: usize,
    ) -> Result<ScanPage> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }
        let (keys, next) = scan_on(&self.pool, &prefix, cursor.position, count).await?;
        Ok(ScanPage {
            keys,
            next: next.map(|position| ScanCursor { shard: 0, position }),
        })
    }

    async fn exec(
        &self,
        ops: Vec<StoreOp>,
    ) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }
        if ops.is_empty() {
            return Ok(());
        }
        exec_on(&self.pool, ops).await
    }

    async fn subscribe(
        &self,
        prefixes: Vec<Bytes>,
    ) -> Result<Subscription> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }
        let dialer = self.pool.dialer();
        let conn = pubsub::open(dialer, self.pool.endpoint(), &prefixes, &self.watch).await?;

        let (tx, rx) = mpsc::channel(self.watch.subscription_buffer_size.max(1));
        let cancel = self.closed.child_token();
        tokio::spawn(pubsub::forward(conn, dialer.selected_db(), tx, cancel.clone()));
        Ok(Subscription::new(rx, cancel))
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.pool.close();
            debug!(endpoint = %self.pool.endpoint(), "Node client closed");
        }
    }
}
