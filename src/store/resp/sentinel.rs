//! Sentinel-managed failover group.
//!
//! The master is resolved through `SENTINEL get-master-addr-by-name` at
//! connect time and again whenever a call fails with a connection-level
//! error. Re-resolution runs on a spawned task: the failing call reports its
//! error right away and callers retry.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::command;
use super::connection::Dialer;
use super::node::NodeClient;
use super::RespValue;
use crate::config::SentinelConfig;
use crate::config::WatchConfig;
use crate::store::ScanCursor;
use crate::store::ScanPage;
use crate::store::StoreClient;
use crate::store::StoreOp;
use crate::store::StoredValue;
use crate::store::Subscription;
use crate::ConnectionError;
use crate::Error;
use crate::Result;

/// Client of the current master of a sentinel-monitored group
pub struct SentinelClient {
    shared: Arc<Shared>,
    failover: Arc<Mutex<()>>,
}

/// State the failover task shares with the client
struct Shared {
    config: SentinelConfig,
    watch: WatchConfig,
    master: ArcSwap<NodeClient>,
    closed: CancellationToken,
}

impl std::fmt::Debug for SentinelClient {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SentinelClient")
            .field("master_name", &self.shared.config.master_name)
            .field("master", &self.shared.master.load().endpoint())
            .finish_non_exhaustive()
    }
}

/// Parses a `get-master-addr-by-name` reply; nil means the group is unknown
pub(crate) fn parse_master_addr(reply: RespValue) -> Result<Option<String>> {
    let items = match reply.into_result()? {
        RespValue::Nil => return Ok(None),
        other => other.into_array("SENTINEL")?,
    };
    let mut items = items.into_iter();
    let (Some(host), Some(port)) = (items.next(), items.next()) else {
        return Ok(None);
    };
    let host = host.into_string("SENTINEL")?;
    let port = port.into_string("SENTINEL")?;
    Ok(Some(format!("{host}:{port}")))
}

impl SentinelClient {
    pub async fn connect(
        config: &SentinelConfig,
        watch: &WatchConfig,
    ) -> Result<Self> {
        let master = Self::connect_master(config, watch).await?;
        info!(
            master_name = %config.master_name,
            master = %master.endpoint(),
            "Connected to sentinel-managed master"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config: config.clone(),
                watch: watch.clone(),
                master: ArcSwap::from_pointee(master),
                closed: CancellationToken::new(),
            }),
            failover: Arc::new(Mutex::new(())),
        })
    }

    async fn connect_master(
        config: &SentinelConfig,
        watch: &WatchConfig,
    ) -> Result<NodeClient> {
        let endpoint = Self::resolve_master(config).await?;
        let dialer = Dialer::new(&config.client).db(config.db);
        NodeClient::from_dialer(&endpoint, dialer, &config.client, watch).await
    }

    /// Asks each sentinel in turn for the current master address
    async fn resolve_master(config: &SentinelConfig) -> Result<String> {
        // Sentinels are not protected by the data password
        let dialer = Dialer::new(&config.client).password(String::new());

        for sentinel in &config.endpoints {
            let reply = match dialer.dial(sentinel).await {
                Ok(mut conn) => conn.call(command::sentinel_master_addr(&config.master_name)).await,
                Err(e) => Err(e),
            };
            match reply.and_then(parse_master_addr) {
                Ok(Some(endpoint)) => {
                    debug!(%sentinel, master = %endpoint, "Resolved master");
                    return Ok(endpoint);
                }
                Ok(None) => debug!(%sentinel, master_name = %config.master_name, "Sentinel does not know the group"),
                Err(e) => warn!(%sentinel, "Sentinel query failed: {e}"),
            }
        }

        Err(ConnectionError::MasterNotFound {
            master_name: config.master_name.clone(),
        }
        .into())
    }

    fn current(&self) -> Result<Arc<NodeClient>> {
        if self.shared.closed.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }
        Ok(self.shared.master.load_full())
    }

    /// Starts a master re-resolution after a connection-level failure
    fn recover(
        &self,
        error: &Error,
    ) {
        if !is_connection_failure(error) || self.shared.closed.is_cancelled() {
            return;
        }

        // A failover already in progress serves this failure as well
        let Ok(guard) = self.failover.clone().try_lock_owned() else {
            return;
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let _guard = guard;
            shared.reresolve().await;
        });
    }

    fn observe<T>(
        &self,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(e) = &result {
            self.recover(e);
        }
        result
    }
}

fn is_connection_failure(error: &Error) -> bool {
    matches!(
        error,
        Error::Timeout { .. }
            | Error::Connection(
                ConnectionError::Lost(_) | ConnectionError::Unreachable { .. } | ConnectionError::PoolTimeout(_)
            )
    )
}

impl Shared {
    async fn reresolve(&self) {
        let current = self.master.load_full();
        let endpoint = match SentinelClient::resolve_master(&self.config).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("Master re-resolution failed: {e}");
                return;
            }
        };
        if endpoint == current.endpoint() {
            debug!(master = %endpoint, "Master unchanged");
            return;
        }

        let dialer = Dialer::new(&self.config.client).db(self.config.db);
        let node = match NodeClient::from_dialer(&endpoint, dialer, &self.config.client, &self.watch).await {
            Ok(node) => node,
            Err(e) => {
                warn!(master = %endpoint, "Could not connect to new master: {e}");
                return;
            }
        };

        if self.closed.is_cancelled() {
            node.close().await;
            return;
        }
        info!(old = %current.endpoint(), new = %endpoint, "Switched to new master");
        self.master.store(Arc::new(node));
        current.close().await;
    }
}

#[async_trait::async_trait]
impl StoreClient for SentinelClient {
    async fn get(
        &self,
        key: Bytes,
    ) -> Result<Option<StoredValue>> {
        let result = self.current()?.get(key).await;
        self.observe(result)
    }

    async fn set(
        &self,
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let result = self.current()?.set(key, value, ttl).await;
        self.observe(result)
    }

    async fn del(
        &self,
        keys: Vec<Bytes>,
    ) -> Result<u64> {
        let result = self.current()?.del(keys).await;
        self.observe(result)
    }

    async fn scan(
        &self,
        prefix: Bytes,
        cursor: ScanCursor,
        count: usize,
    ) -> Result<ScanPage> {
        let result = self.current()?.scan(prefix, cursor, count).await;
        self.observe(result)
    }

    async fn exec(
        &self,
        ops: Vec<StoreOp>,
    ) -> Result<()> {
        let result = self.current()?.exec(ops).await;
        self.observe(result)
    }

    async fn subscribe(
        &self,
        prefixes: Vec<Bytes>,
    ) -> Result<Subscription> {
        let result = self.current()?.subscribe(prefixes).await;
        self.observe(result)
    }

    async fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            self.shared.closed.cancel();
            self.shared.master.load_full().close().await;
            debug!(master_name = %self.shared.config.master_name, "Sentinel client closed");
        }
    }
}
