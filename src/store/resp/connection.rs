//! Single RESP2 connection over TCP or TLS.

use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::debug;
use tracing::trace;

use super::command;
use super::command::Command;
use super::tls;
use super::RespCodec;
use super::RespValue;
use crate::config::ClientConfig;
use crate::ConnectionError;
use crate::Error;
use crate::Result;

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Everything needed to open and prepare a connection to one endpoint
#[derive(Clone)]
pub(crate) struct Dialer {
    password: String,
    db: u32,
    readonly: bool,
    tls: Option<TlsConnector>,
    dial_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl std::fmt::Debug for Dialer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("db", &self.db)
            .field("readonly", &self.readonly)
            .field("tls", &self.tls.is_some())
            .field("dial_timeout", &self.dial_timeout)
            .finish_non_exhaustive()
    }
}

impl Dialer {
    pub(crate) fn new(client: &ClientConfig) -> Self {
        Self {
            password: client.password.clone(),
            db: 0,
            readonly: false,
            tls: None,
            dial_timeout: client.dial_timeout(),
            read_timeout: client.read_timeout(),
            write_timeout: client.write_timeout(),
        }
    }

    pub(crate) fn password(
        mut self,
        password: impl Into<String>,
    ) -> Self {
        self.password = password.into();
        self
    }

    pub(crate) fn db(
        mut self,
        db: u32,
    ) -> Self {
        self.db = db;
        self
    }

    /// Issue `READONLY` after connecting (cluster replica reads)
    pub(crate) fn readonly(
        mut self,
        readonly: bool,
    ) -> Self {
        self.readonly = readonly;
        self
    }

    pub(crate) fn tls(
        mut self,
        connector: Option<TlsConnector>,
    ) -> Self {
        self.tls = connector;
        self
    }

    pub(crate) fn selected_db(&self) -> u32 {
        self.db
    }

    /// Opens, authenticates and prepares a connection
    pub(crate) async fn dial(
        &self,
        endpoint: &str,
    ) -> Result<RespConnection> {
        let tcp = timeout(self.dial_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::Timeout {
                operation: "connect",
                duration: self.dial_timeout,
            })?
            .map_err(|source| ConnectionError::Unreachable {
                endpoint: endpoint.to_string(),
                source,
            })?;
        tcp.set_nodelay(true)?;

        let stream: Box<dyn AsyncStream> = match &self.tls {
            Some(connector) => {
                let server_name = tls::server_name(endpoint)?;
                let stream = timeout(self.dial_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| Error::Timeout {
                        operation: "tls handshake",
                        duration: self.dial_timeout,
                    })?
                    .map_err(|e| ConnectionError::Tls(format!("handshake with {endpoint} failed: {e}")))?;
                Box::new(stream)
            }
            None => Box::new(tcp),
        };

        let mut conn = RespConnection {
            endpoint: endpoint.to_string(),
            framed: Framed::new(stream, RespCodec),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            last_used: Instant::now(),
            broken: false,
        };

        if !self.password.is_empty() {
            conn.call(command::auth(&self.password)).await?.expect_ok("AUTH")?;
        }
        if self.db != 0 {
            conn.call(command::select(self.db)).await?.expect_ok("SELECT")?;
        }
        if self.readonly {
            conn.call(command::readonly()).await?.expect_ok("READONLY")?;
        }

        debug!(%endpoint, db = self.db, tls = self.tls.is_some(), "Connected");
        Ok(conn)
    }
}

pub(crate) struct RespConnection {
    endpoint: String,
    framed: Framed<Box<dyn AsyncStream>, RespCodec>,
    read_timeout: Duration,
    write_timeout: Duration,
    last_used: Instant,
    broken: bool,
}

impl RespConnection {
    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// A connection that failed mid-exchange cannot be reused
    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Sends one command and reads its reply. Error replies are returned as
    /// [`RespValue::Error`] so callers can inspect redirects.
    pub(crate) async fn call(
        &mut self,
        command: Command,
    ) -> Result<RespValue> {
        let mut replies = self.pipeline(vec![command]).await?;
        replies
            .pop()
            .ok_or_else(|| ConnectionError::Lost("empty pipeline reply".into()).into())
    }

    /// Writes every command with one flush, then reads one reply per command.
    ///
    /// The connection stays marked broken until every reply has been read, so
    /// an exchange abandoned mid-flight never goes back to a pool with replies
    /// still pending on the socket.
    pub(crate) async fn pipeline(
        &mut self,
        commands: Vec<Command>,
    ) -> Result<Vec<RespValue>> {
        self.broken = true;
        let result = self.exchange(commands).await;
        self.broken = result.is_err();
        self.last_used = Instant::now();
        result
    }

    async fn exchange(
        &mut self,
        commands: Vec<Command>,
    ) -> Result<Vec<RespValue>> {
        let count = commands.len();
        trace!(endpoint = %self.endpoint, count, first = ?commands.first().map(|c| c.name()), "Sending");

        let (write_timeout, read_timeout) = (self.write_timeout, self.read_timeout);
        let framed = &mut self.framed;
        let write = async move {
            for command in commands {
                framed.feed(command.into_args()).await?;
            }
            SinkExt::<Vec<Bytes>>::flush(framed).await
        };
        timeout(write_timeout, write).await.map_err(|_| Error::Timeout {
            operation: "write",
            duration: write_timeout,
        })??;

        let mut replies = Vec::with_capacity(count);
        for _ in 0..count {
            let reply = timeout(read_timeout, self.next_frame()).await.map_err(|_| Error::Timeout {
                operation: "read",
                duration: read_timeout,
            })??;
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Next pushed frame; waits without a deadline
    pub(crate) async fn read_push(&mut self) -> Result<RespValue> {
        let result = self.next_frame().await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn next_frame(&mut self) -> Result<RespValue> {
        match self.framed.next().await {
            Some(frame) => frame,
            None => Err(ConnectionError::Lost(format!("{} closed the connection", self.endpoint)).into()),
        }
    }
}
