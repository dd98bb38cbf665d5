//! Bounded pool of connections to one endpoint
//!
//! A semaphore caps the number of live connections at `pool_size`; callers
//! wait at most `pool_timeout` for a permit. Released connections go back to
//! an idle list that a reaper task trims every `idle_check_frequency`.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::command::Command;
use super::connection::Dialer;
use super::connection::RespConnection;
use super::RespValue;
use crate::config::ClientConfig;
use crate::ConnectionError;
use crate::Result;

struct PoolInner {
    endpoint: String,
    dialer: Dialer,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<RespConnection>>,
    pool_timeout: Duration,
    idle_timeout: Duration,
    closed: CancellationToken,
}

#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.endpoint)
            .field("idle", &self.inner.idle.lock().len())
            .finish()
    }
}

impl ConnectionPool {
    pub(crate) fn new(
        endpoint: impl Into<String>,
        dialer: Dialer,
        client: &ClientConfig,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            endpoint: endpoint.into(),
            dialer,
            permits: Arc::new(Semaphore::new(client.pool_size())),
            idle: Mutex::new(Vec::new()),
            pool_timeout: client.pool_timeout(),
            idle_timeout: client.idle_timeout(),
            closed: CancellationToken::new(),
        });

        tokio::spawn(reap_idle(Arc::downgrade(&inner), client.idle_check_frequency()));
        Self { inner }
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub(crate) fn dialer(&self) -> &Dialer {
        &self.inner.dialer
    }

    /// Checks out a connection, reusing an idle one when possible
    pub(crate) async fn get(&self) -> Result<PooledConnection> {
        if self.inner.closed.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }

        let permit = timeout(self.inner.pool_timeout, self.inner.permits.clone().acquire_owned())
            .await
            .map_err(|_| ConnectionError::PoolTimeout(self.inner.pool_timeout))?
            .map_err(|_| ConnectionError::Closed)?;

        let reused = {
            let mut idle = self.inner.idle.lock();
            let mut found = None;
            while let Some(conn) = idle.pop() {
                if conn.idle_for() < self.inner.idle_timeout {
                    found = Some(conn);
                    break;
                }
            }
            found
        };

        let conn = match reused {
            Some(conn) => conn,
            None => self.inner.dialer.dial(&self.inner.endpoint).await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::downgrade(&self.inner),
            _permit: permit,
        })
    }

    /// One command on a pooled connection
    pub(crate) async fn call(
        &self,
        command: Command,
    ) -> Result<RespValue> {
        self.get().await?.call(command).await
    }

    pub(crate) async fn pipeline(
        &self,
        commands: Vec<Command>,
    ) -> Result<Vec<RespValue>> {
        self.get().await?.pipeline(commands).await
    }

    /// Closes the pool: waiting callers fail and idle connections are dropped
    pub(crate) fn close(&self) {
        if !self.inner.closed.is_cancelled() {
            self.inner.closed.cancel();
            self.inner.permits.close();
            self.inner.idle.lock().clear();
            debug!(endpoint = %self.inner.endpoint, "Connection pool closed");
        }
    }
}

/// Connection checked out of a [`ConnectionPool`]; returned on drop unless
/// it broke mid-exchange
pub(crate) struct PooledConnection {
    conn: Option<RespConnection>,
    pool: Weak<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub(crate) async fn call(
        &mut self,
        command: Command,
    ) -> Result<RespValue> {
        match self.conn.as_mut() {
            Some(conn) => conn.call(command).await,
            None => Err(ConnectionError::Closed.into()),
        }
    }

    pub(crate) async fn pipeline(
        &mut self,
        commands: Vec<Command>,
    ) -> Result<Vec<RespValue>> {
        match self.conn.as_mut() {
            Some(conn) => conn.pipeline(commands).await,
            None => Err(ConnectionError::Closed.into()),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if conn.is_broken() {
            trace!(endpoint = conn.endpoint(), "Discarding broken connection");
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            if !pool.closed.is_cancelled() {
                pool.idle.lock().push(conn);
            }
        }
    }
}

async fn reap_idle(
    pool: Weak<PoolInner>,
    every: Duration,
) {
    let closed = match pool.upgrade() {
        Some(pool) => pool.closed.clone(),
        None => return,
    };

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = tokio::time::sleep(every) => {
                let Some(pool) = pool.upgrade() else { break };
                let mut idle = pool.idle.lock();
                let before = idle.len();
                idle.retain(|conn| conn.idle_for() < pool.idle_timeout);
                if idle.len() != before {
                    trace!(endpoint = %pool.endpoint, reaped = before - idle.len(), "Reaped idle connections");
                }
            }
        }
    }
}
