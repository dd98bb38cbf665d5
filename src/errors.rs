//! Key-Value Access Layer Error Hierarchy
//!
//! Defines the error types surfaced by connections, brokers, transactions and
//! watchers, categorized by the layer that produced them. Absence of a key is
//! never an error: reads report it as `Ok(None)`.

use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or ambiguous topology configuration, raised before any connect attempt
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Client could not be established, was lost, or was closed by the caller
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Operation exceeded its configured deadline
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: &'static str,
        duration: Duration,
    },

    /// Transaction commit failures (never partially applied)
    #[error(transparent)]
    Txn(#[from] TxnError),

    /// Subscription failures
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Malformed or unexpected replies from the store
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Key rejected before reaching the store (e.g. empty key on put)
    #[error("Malformed key: {0}")]
    MalformedKey(String),

    /// Put option the store cannot honour
    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The owning connection has been closed
    #[error("connection closed")]
    Closed,

    /// Endpoint refused or could not be reached
    #[error("Endpoint {endpoint} unreachable: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// An established connection broke mid-operation
    #[error("Connection lost: {0}")]
    Lost(String),

    /// No pooled connection became available in time
    #[error("Connection pool exhausted after {0:?}")]
    PoolTimeout(Duration),

    /// TLS configuration or handshake failures
    #[error("TLS failure: {0}")]
    Tls(String),

    /// No sentinel knew the requested master group
    #[error("No sentinel reported a master for group {master_name}")]
    MasterNotFound { master_name: String },

    /// Cluster kept redirecting the request
    #[error("Too many cluster redirects (max {0})")]
    TooManyRedirects(usize),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TxnError {
    /// Commit invoked on a transaction that was already committed
    #[error("Transaction already committed")]
    AlreadyCommitted,

    /// Store discarded the transaction; nothing was applied
    #[error("Transaction aborted by the store")]
    Aborted,

    /// Cluster transactions must keep every key in one hash slot
    #[error("Transaction keys span multiple hash slots")]
    CrossSlot,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// The owning connection has been closed; no more events follow
    #[error("watcher closed")]
    Closed,

    /// Subscription could not be established or broke
    #[error("Subscription lost: {0}")]
    SubscriptionLost(String),

    /// Subscription fell behind and skipped notifications
    #[error("Subscription lagged, {0} notifications skipped")]
    Lagged(u64),

    /// Watch requires at least one prefix
    #[error("Watch requires at least one prefix")]
    NoPrefixes,

    /// Value of a changed key could not be fetched
    #[error("Value unavailable: {0}")]
    ValueUnavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Reply had an unexpected shape for the command
    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: &'static str, reply: String },

    /// Store answered with an error reply
    #[error("Store error: {0}")]
    Server(String),
}

impl Error {
    /// Whether the caller may reasonably retry the failed operation
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Txn(TxnError::Aborted) => true,
            Error::Connection(e) => matches!(
                e,
                ConnectionError::Lost(_)
                    | ConnectionError::Unreachable { .. }
                    | ConnectionError::PoolTimeout(_)
                    | ConnectionError::TooManyRedirects(_)
            ),
            _ => false,
        }
    }

    /// Whether the error reports a closed connection
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::Closed))
    }
}

// ============== Conversion Implementations ============== //
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Lost(e.to_string()).into()
    }
}
