use bytes::Bytes;
use tracing::debug;

use super::to_bytes;
use super::Connection;
use super::Namespace;
use crate::store::StoreOp;
use crate::utils::scoped_timer::ScopedTimer;
use crate::Error;
use crate::Result;
use crate::TxnError;

/// Ordered batch of puts and deletes committed as one unit.
///
/// Operations only buffer locally; [`Txn::commit`] hands the whole batch to the
/// store's transaction primitive, so either every operation is applied in
/// append order or none is. A transaction is single-use.
pub struct Txn {
    conn: Connection,
    namespace: Namespace,
    ops: Vec<StoreOp>,
    rejected: Option<String>,
    committed: bool,
}

impl Txn {
    pub(crate) fn new(
        conn: Connection,
        namespace: Namespace,
    ) -> Self {
        Self {
            conn,
            namespace,
            ops: Vec::new(),
            rejected: None,
            committed: false,
        }
    }

    /// Buffers a write of `value` under `key`
    ///
    /// # Panics
    /// If the transaction was already committed.
    pub fn put(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> &mut Self {
        if let Some(key) = self.accept(key.as_ref()) {
            self.ops.push(StoreOp::Put {
                key,
                value: to_bytes(value),
            });
        }
        self
    }

    /// Buffers the removal of exactly `key`
    ///
    /// # Panics
    /// If the transaction was already committed.
    pub fn delete(
        &mut self,
        key: impl AsRef<[u8]>,
    ) -> &mut Self {
        if let Some(key) = self.accept(key.as_ref()) {
            self.ops.push(StoreOp::Delete { key });
        }
        self
    }

    /// Applies the buffered operations.
    ///
    /// # Errors
    /// - [`TxnError::AlreadyCommitted`] on a second commit
    /// - [`Error::MalformedKey`] if an operation was buffered with an empty key;
    ///   nothing is sent to the store
    /// - [`TxnError::Aborted`] / [`TxnError::CrossSlot`] when the store refuses
    ///   the batch
    pub async fn commit(&mut self) -> Result<()> {
        let _timer = ScopedTimer::new("txn::commit");

        if self.committed {
            return Err(TxnError::AlreadyCommitted.into());
        }
        self.committed = true;

        if let Some(reason) = self.rejected.take() {
            self.ops.clear();
            return Err(Error::MalformedKey(reason));
        }
        if self.ops.is_empty() {
            return Ok(());
        }

        let ops = std::mem::take(&mut self.ops);
        let count = ops.len();
        self.conn.call("txn_commit", self.conn.client().exec(ops)).await?;
        self.conn.span().in_scope(|| debug!(ops = count, "Transaction committed"));
        Ok(())
    }

    /// Number of buffered operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn accept(
        &mut self,
        key: &[u8],
    ) -> Option<Bytes> {
        assert!(!self.committed, "transaction already committed; start a new one with Broker::new_txn");
        match self.namespace.key(key) {
            Ok(key) => Some(key),
            Err(e) => {
                let reason = match e {
                    Error::MalformedKey(reason) => reason,
                    other => other.to_string(),
                };
                self.rejected.get_or_insert(reason);
                None
            }
        }
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("ops", &self.ops.len())
            .field("committed", &self.committed)
            .finish()
    }
}
