//! backend
//!
//! The coordination protocol served from a flat, range-scannable keyspace.
//!
//! # Architecture
//!
//! [`KvStore`] is the narrow contract this crate needs from the keyspace:
//! atomic multi-key reads, range scans, compare-and-swap transactions and
//! revision-ordered watches. Two stores implement it:
//!
//! - [`EtcdGateway`]: an etcd v3 cluster through its JSON gateway
//! - [`MemStore`]: an in-process keyspace for tests and `mem://` endpoints
//!
//! On top of any store, [`KvAuth`] and [`KvHandlerFactory`] provide the
//! personality capabilities, mapping each node onto keys produced by
//! [`crate::core::path`].
//!
//! # Modules
//!
//! - `etcd`: gateway client
//! - `memory`: in-process store
//! - `session`: session admission over a store
//! - `handler`: request semantics over a store
//! - `record`: stored node and child records

pub mod etcd;
mod handler;
pub mod memory;
mod record;
mod session;

pub use etcd::{EtcdGateway, TlsFiles};
pub use handler::{ensure_root, KvHandler, KvHandlerFactory};
pub use memory::MemStore;
pub use session::{KvAuth, SessionLimits};

use async_trait::async_trait;
use thiserror::Error;

use crate::proto::ZkError;

/// Errors from the flat keyspace.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish in time.
    #[error("store request timed out")]
    Timeout,

    /// The store answered with something unusable.
    #[error("store protocol error: {0}")]
    Protocol(String),

    /// The requested revision has been compacted away.
    #[error("revision {0} has been compacted")]
    Compacted(i64),

    /// The calling scope was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl From<KvError> for ZkError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Unavailable(_) | KvError::Cancelled => ZkError::ConnectionLoss,
            KvError::Timeout => ZkError::OperationTimeout,
            KvError::Protocol(_) | KvError::Compacted(_) => ZkError::SystemError,
        }
    }
}

/// One stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Revision of the transaction that created the key.
    pub create_revision: i64,
    /// Revision of the transaction that last wrote the key.
    pub mod_revision: i64,
}

/// Entries of a read plus the store revision it observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResult {
    pub entries: Vec<KvEntry>,
    pub revision: i64,
}

/// Results of an atomic multi-key read, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiGet {
    pub entries: Vec<Option<KvEntry>>,
    pub revision: i64,
}

/// Guard of a transaction: the key's mod revision must equal `mod_revision`.
/// A revision of 0 asserts that the key does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: Vec<u8>,
    pub mod_revision: i64,
}

impl Compare {
    pub fn absent(key: Vec<u8>) -> Self {
        Self {
            key,
            mod_revision: 0,
        }
    }

    pub fn unchanged(entry: &KvEntry) -> Self {
        Self {
            key: entry.key.clone(),
            mod_revision: entry.mod_revision,
        }
    }
}

/// Write performed when every compare holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Compare-and-swap transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub ops: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn put(mut self, key: Vec<u8>, value: Vec<u8>) -> Self {
        self.ops.push(TxnOp::Put { key, value });
        self
    }

    pub fn delete(mut self, key: Vec<u8>) -> Self {
        self.ops.push(TxnOp::Delete { key });
        self
    }
}

/// Outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResult {
    pub succeeded: bool,
    /// Store revision after the transaction (unchanged when it failed).
    pub revision: i64,
}

/// Kind of change a watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

/// One change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: Vec<u8>,
    /// For puts, the key's create revision; 0 for deletes.
    pub create_revision: i64,
    /// Revision at which the change happened.
    pub mod_revision: i64,
}

impl KvEvent {
    /// Whether this put created the key.
    pub fn is_create(&self) -> bool {
        self.kind == KvEventKind::Put && self.create_revision == self.mod_revision
    }
}

/// Flat keyspace with ordered keys, revisions and watches.
///
/// # Thread Safety
///
/// One store is shared by every session of a personality, so implementations
/// must be `Send + Sync`.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// Store name for logs (e.g., "etcd", "memory").
    fn name(&self) -> &'static str;

    /// Read several keys atomically.
    async fn get_many(&self, keys: &[Vec<u8>]) -> Result<MultiGet, KvError>;

    /// Read every key in `[start, end)`, in key order.
    async fn range(&self, start: &[u8], end: &[u8]) -> Result<RangeResult, KvError>;

    /// Apply `txn.ops` atomically if every compare holds.
    async fn txn(&self, txn: Txn) -> Result<TxnResult, KvError>;

    /// Wait for changes to keys in `[start, end)` at or after `from_revision`.
    ///
    /// Returns as soon as at least one change is available. An empty `end`
    /// watches the single key `start`.
    async fn watch(
        &self,
        start: &[u8],
        end: &[u8],
        from_revision: i64,
    ) -> Result<Vec<KvEvent>, KvError>;
}

/// Whether `key` falls in the watch/range bounds `[start, end)`; an empty
/// `end` selects `start` alone.
pub(crate) fn in_bounds(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    if end.is_empty() {
        key == start
    } else {
        key >= start && key < end
    }
}
