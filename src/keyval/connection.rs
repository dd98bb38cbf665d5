//! Connection lifecycle.
//!
//! A [`Connection`] owns one store client. Brokers and watchers derived from
//! it share the client and the connection's close signal: once
//! [`Connection::close`] runs, every in-flight or later call fails with
//! `ConnectionError::Closed`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use config::ConfigError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use tracing::Instrument;
use tracing::Span;

use super::Broker;
use super::Watcher;
use crate::config::Settings;
use crate::config::TopologyConfig;
use crate::config::TopologyKind;
use crate::config::WatchConfig;
use crate::store::resp;
use crate::store::StoreClient;
use crate::ConnectionError;
use crate::Error;
use crate::Result;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct ConnectionInner {
    client: Arc<dyn StoreClient>,
    topology: Option<TopologyKind>,
    request_timeout: Duration,
    watch: WatchConfig,
    span: Span,
    closed: CancellationToken,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // Wakes any watcher still bound to this connection
        self.closed.cancel();
    }
}

/// Handle to an open store client; cheap to clone
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("topology", &self.inner.topology)
            .field("request_timeout", &self.inner.request_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Opens the store client for `topology` with default settings
    pub async fn open(topology: TopologyConfig) -> Result<Self> {
        ConnectionBuilder::new().topology(topology).build().await
    }

    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Broker whose keys all live under `namespace` (empty = whole keyspace)
    pub fn new_broker(
        &self,
        namespace: impl AsRef<[u8]>,
    ) -> Broker {
        Broker::new(self.clone(), namespace.as_ref())
    }

    /// Watcher whose prefixes all live under `namespace`
    pub fn new_watcher(
        &self,
        namespace: impl AsRef<[u8]>,
    ) -> Watcher {
        Watcher::new(self.clone(), namespace.as_ref())
    }

    /// Releases the store client. Idempotent.
    ///
    /// Blocked broker calls return `ConnectionError::Closed` and watchers
    /// deliver `WatchError::Closed` before their delivery stops.
    pub async fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        self.inner.client.close().instrument(self.inner.span.clone()).await;
        self.inner.span.in_scope(|| info!("Connection closed"));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Topology this connection was opened for; `None` for a supplied client
    pub fn topology(&self) -> Option<TopologyKind> {
        self.inner.topology
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    pub(crate) fn client(&self) -> &Arc<dyn StoreClient> {
        &self.inner.client
    }

    pub(crate) fn watch_config(&self) -> &WatchConfig {
        &self.inner.watch
    }

    pub(crate) fn span(&self) -> &Span {
        &self.inner.span
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Runs one store call under the connection's deadline and close signal
    pub(crate) async fn call<T, F>(
        &self,
        operation: &'static str,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }

        let duration = self.inner.request_timeout;
        let guarded = async {
            tokio::select! {
                biased;
                _ = self.inner.closed.cancelled() => Err(ConnectionError::Closed.into()),
                result = timeout(duration, fut) => match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout { operation, duration }),
                },
            }
        };
        guarded.instrument(self.inner.span.clone()).await
    }
}

/// Builder for [`Connection`]
pub struct ConnectionBuilder {
    topology: Option<TopologyConfig>,
    request_timeout: Duration,
    watch: WatchConfig,
    span: Option<Span>,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            topology: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            watch: WatchConfig::default(),
            span: None,
        }
    }

    /// Starts from a loaded [`Settings`]; fails when no single topology is configured
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new()
            .topology(settings.topology()?)
            .request_timeout(settings.request_timeout())
            .watch_config(settings.watch.clone()))
    }

    pub fn topology(
        mut self,
        topology: TopologyConfig,
    ) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Deadline of every broker, transaction and watcher store call
    /// (default: 5s; zero keeps the default)
    pub fn request_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        if !timeout.is_zero() {
            self.request_timeout = timeout;
        }
        self
    }

    pub fn watch_config(
        mut self,
        watch: WatchConfig,
    ) -> Self {
        self.watch = watch;
        self
    }

    /// Span every event of the connection is recorded under
    pub fn span(
        mut self,
        span: Span,
    ) -> Self {
        self.span = Some(span);
        self
    }

    /// Validates the topology and connects the RESP client for it
    pub async fn build(self) -> Result<Connection> {
        let topology = self.topology.clone().ok_or_else(|| {
            Error::Config(ConfigError::Message(
                "no topology configured: expected one of node, cluster or sentinel".into(),
            ))
        })?;
        topology.validate()?;
        self.watch.validate()?;

        let span = self.span.clone().unwrap_or_else(|| default_span(Some(topology.kind())));
        let client = resp::open(&topology, &self.watch).instrument(span.clone()).await?;
        Ok(self.span(span).assemble(client, Some(topology.kind())))
    }

    /// Wraps an already connected client
    pub fn with_client(
        self,
        client: Arc<dyn StoreClient>,
    ) -> Connection {
        let kind = self.topology.as_ref().map(TopologyConfig::kind);
        self.assemble(client, kind)
    }

    fn assemble(
        self,
        client: Arc<dyn StoreClient>,
        topology: Option<TopologyKind>,
    ) -> Connection {
        let span = self.span.unwrap_or_else(|| default_span(topology));
        span.in_scope(|| debug!(request_timeout = ?self.request_timeout, "Connection ready"));
        Connection {
            inner: Arc::new(ConnectionInner {
                client,
                topology,
                request_timeout: self.request_timeout,
                watch: self.watch,
                span,
                closed: CancellationToken::new(),
            }),
        }
    }
}

fn default_span(topology: Option<TopologyKind>) -> Span {
    match topology {
        Some(kind) => info_span!("keyval", topology = %kind),
        None => info_span!("keyval", topology = "custom"),
    }
}
