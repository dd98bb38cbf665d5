//! Shared fixtures for unit tests

mod resp_server;
pub(crate) use resp_server::*;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::keyval::Connection;
use crate::keyval::ConnectionBuilder;
use crate::keyval::WatchResponse;
use crate::store::MemoryStore;
use crate::store::ScanCursor;
use crate::store::ScanPage;
use crate::store::StoreClient;
use crate::store::StoreOp;
use crate::store::StoredValue;
use crate::store::Subscription;
use crate::Result;

/// Connection over a fresh memory store, plus the store for direct inspection
pub(crate) fn memory_connection() -> (Connection, MemoryStore) {
    let store = MemoryStore::new();
    let conn = ConnectionBuilder::new().with_client(Arc::new(store.clone()));
    (conn, store)
}

pub(crate) fn connection_with(
    client: impl StoreClient,
    request_timeout: Duration,
) -> Connection {
    ConnectionBuilder::new()
        .request_timeout(request_timeout)
        .with_client(Arc::new(client))
}

/// Receives `n` responses, failing the test if they do not arrive within a
/// (virtual) second each
pub(crate) async fn recv_n(
    rx: &mut mpsc::Receiver<WatchResponse>,
    n: usize,
) -> Vec<WatchResponse> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let response = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("watch response not delivered in time")
            .expect("sink closed early");
        out.push(response);
    }
    out
}

/// Store whose calls never complete; exercises deadlines and close
pub(crate) struct StallingStore;

#[async_trait::async_trait]
impl StoreClient for StallingStore {
    async fn get(
        &self,
        _key: Bytes,
    ) -> Result<Option<StoredValue>> {
        std::future::pending().await
    }

    async fn set(
        &self,
        _key: Bytes,
        _value: Bytes,
        _ttl: Option<Duration>,
    ) -> Result<()> {
        std::future::pending().await
    }

    async fn del(
        &self,
        _keys: Vec<Bytes>,
    ) -> Result<u64> {
        std::future::pending().await
    }

    async fn scan(
        &self,
        _prefix: Bytes,
        _cursor: ScanCursor,
        _count: usize,
    ) -> Result<ScanPage> {
        std::future::pending().await
    }

    async fn exec(
        &self,
        _ops: Vec<StoreOp>,
    ) -> Result<()> {
        std::future::pending().await
    }

    async fn subscribe(
        &self,
        _prefixes: Vec<Bytes>,
    ) -> Result<Subscription> {
        std::future::pending().await
    }

    async fn close(&self) {}
}
