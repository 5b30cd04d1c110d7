//! backend::memory
//!
//! In-process keyspace implementing [`KvStore`].
//!
//! # Design
//!
//! Keys live in a `BTreeMap` so range scans come out in key order, and every
//! change is appended to a history so watches can resume from any revision.
//! Watchers sleep on a `tokio::sync::watch` channel carrying the latest
//! revision. Selected with the `mem://` endpoint and used throughout the
//! tests.
//!
//! # Example
//!
//! ```
//! use zetcd::backend::{KvStore, MemStore, Txn, Compare};
//!
//! # tokio_test::block_on(async {
//! let store = MemStore::new();
//! let txn = Txn::new()
//!     .when(Compare::absent(b"k".to_vec()))
//!     .put(b"k".to_vec(), b"v".to_vec());
//! assert!(store.txn(txn).await.unwrap().succeeded);
//!
//! let read = store.get_many(&[b"k".to_vec()]).await.unwrap();
//! assert_eq!(read.entries[0].as_ref().unwrap().value, b"v");
//! # });
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;

use super::{
    in_bounds, KvError, KvEntry, KvEvent, KvEventKind, KvStore, MultiGet, RangeResult, Txn,
    TxnOp, TxnResult,
};

/// In-memory store. Clones share state.
#[derive(Debug, Clone)]
pub struct MemStore {
    inner: Arc<Mutex<MemInner>>,
    revision: Arc<watch::Sender<i64>>,
}

#[derive(Debug)]
struct MemInner {
    keys: BTreeMap<Vec<u8>, KvEntry>,
    revision: i64,
    history: Vec<KvEvent>,
    /// Error returned by the next call, for exercising failure paths.
    fail_next: Option<KvError>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// An empty store at revision 1.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(1);
        Self {
            inner: Arc::new(Mutex::new(MemInner {
                keys: BTreeMap::new(),
                revision: 1,
                history: Vec::new(),
                fail_next: None,
            })),
            revision: Arc::new(tx),
        }
    }

    /// Make the next store call fail with `err`.
    pub fn fail_next(&self, err: KvError) {
        self.lock().fail_next = Some(err);
    }

    /// Current store revision.
    pub fn current_revision(&self) -> i64 {
        self.lock().revision
    }

    fn lock(&self) -> MutexGuard<'_, MemInner> {
        // A poisoned lock only means a test panicked mid-call; the map itself
        // is never left half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_failure(&self) -> Result<(), KvError> {
        match self.lock().fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl KvStore for MemStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_many(&self, keys: &[Vec<u8>]) -> Result<MultiGet, KvError> {
        self.check_failure()?;
        let inner = self.lock();
        Ok(MultiGet {
            entries: keys.iter().map(|k| inner.keys.get(k).cloned()).collect(),
            revision: inner.revision,
        })
    }

    async fn range(&self, start: &[u8], end: &[u8]) -> Result<RangeResult, KvError> {
        self.check_failure()?;
        let inner = self.lock();
        let entries = if end <= start {
            Vec::new()
        } else {
            inner
                .keys
                .range(start.to_vec()..end.to_vec())
                .map(|(_, v)| v.clone())
                .collect()
        };
        Ok(RangeResult {
            entries,
            revision: inner.revision,
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult, KvError> {
        self.check_failure()?;
        let mut inner = self.lock();

        let holds = txn.compares.iter().all(|c| {
            let current = inner.keys.get(&c.key).map_or(0, |e| e.mod_revision);
            current == c.mod_revision
        });
        if !holds || txn.ops.is_empty() {
            return Ok(TxnResult {
                succeeded: holds,
                revision: inner.revision,
            });
        }

        inner.revision += 1;
        let rev = inner.revision;
        for op in txn.ops {
            match op {
                TxnOp::Put { key, value } => {
                    let create_revision = inner.keys.get(&key).map_or(rev, |e| e.create_revision);
                    inner.history.push(KvEvent {
                        kind: KvEventKind::Put,
                        key: key.clone(),
                        create_revision,
                        mod_revision: rev,
                    });
                    inner.keys.insert(
                        key.clone(),
                        KvEntry {
                            key,
                            value,
                            create_revision,
                            mod_revision: rev,
                        },
                    );
                }
                TxnOp::Delete { key } => {
                    if inner.keys.remove(&key).is_some() {
                        inner.history.push(KvEvent {
                            kind: KvEventKind::Delete,
                            key,
                            create_revision: 0,
                            mod_revision: rev,
                        });
                    }
                }
            }
        }
        drop(inner);
        self.revision.send_replace(rev);
        Ok(TxnResult {
            succeeded: true,
            revision: rev,
        })
    }

    async fn watch(
        &self,
        start: &[u8],
        end: &[u8],
        from_revision: i64,
    ) -> Result<Vec<KvEvent>, KvError> {
        self.check_failure()?;
        let mut rx = self.revision.subscribe();
        loop {
            {
                let inner = self.lock();
                let events: Vec<KvEvent> = inner
                    .history
                    .iter()
                    .filter(|e| e.mod_revision >= from_revision && in_bounds(&e.key, start, end))
                    .cloned()
                    .collect();
                if !events.is_empty() {
                    return Ok(events);
                }
            }
            rx.changed().await.map_err(|_| KvError::Cancelled)?;
        }
    }
}
