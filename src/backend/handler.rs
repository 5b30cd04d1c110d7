//! backend::handler
//!
//! Request semantics of the coordination protocol over a [`KvStore`].
//!
//! # Design
//!
//! Every mutation is one compare-and-swap transaction that guards the keys it
//! read. Creating or deleting a node also rewrites the parent's child record
//! in the same transaction, so `cversion`, the child count and the sequence
//! counter can never drift from the children actually present. A lost race
//! re-reads and retries.
//!
//! Watches are one-shot tasks waiting on the store: data watches on the
//! node key, child watches on the node's [`child_range`](path::child_range).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::record::{self, ChildRecord, NodeRecord};
use super::{Compare, KvEntry, KvError, KvEvent, KvEventKind, KvStore, Txn};
use crate::core::path::{self, PathError};
use crate::personality::{HandlerFactory, RequestContext, RequestHandler, Session, WatchSink};
use crate::proto::{
    Acl, CreateMode, EventType, Reply, Request, Response, Stat, WatcherEvent, ZkError,
};

/// Attempts at a contended transaction before giving up.
const MAX_TXN_ATTEMPTS: usize = 16;

/// Create the root node if the keyspace has none yet.
pub async fn ensure_root(store: &dyn KvStore) -> Result<(), KvError> {
    let node_key = path::node_key("/").map_err(|e| KvError::Protocol(e.to_string()))?;
    let meta_key = path::child_meta_key("/").map_err(|e| KvError::Protocol(e.to_string()))?;
    let root = NodeRecord::new(Vec::new(), Acl::world_all(), 0, now_millis());
    let txn = Txn::new()
        .when(Compare::absent(node_key.clone()))
        .put(node_key, record::encode(&root)?)
        .put(meta_key, record::encode(&ChildRecord::default())?);
    if store.txn(txn).await?.succeeded {
        tracing::info!(store = store.name(), "created root node");
    }
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn bad_path(err: PathError) -> ZkError {
    tracing::debug!(error = %err, "rejected path");
    match err {
        PathError::MalformedKey(_) | PathError::Unbounded => ZkError::SystemError,
        _ => ZkError::BadArguments,
    }
}

/// [`HandlerFactory`] over a [`KvStore`].
#[derive(Debug, Clone)]
pub struct KvHandlerFactory {
    store: Arc<dyn KvStore>,
}

impl KvHandlerFactory {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HandlerFactory for KvHandlerFactory {
    async fn new_handler(
        &self,
        ctx: &RequestContext,
        session: &Session,
        watches: WatchSink,
    ) -> Result<Box<dyn RequestHandler>, ZkError> {
        Ok(Box::new(KvHandler::new(
            self.store.clone(),
            ctx.child(),
            session.clone(),
            watches,
        )))
    }
}

/// Both records of a node, as read together.
#[derive(Debug, Clone)]
struct NodeState {
    node: KvEntry,
    record: NodeRecord,
    child: KvEntry,
    children: ChildRecord,
}

impl NodeState {
    fn stat(&self) -> Stat {
        record::stat(&self.node, &self.record, &self.child, &self.children)
    }
}

/// Serves one session from a [`KvStore`].
pub struct KvHandler {
    store: Arc<dyn KvStore>,
    ctx: RequestContext,
    session: Session,
    watches: WatchSink,
    /// Ephemeral nodes this session created and has not deleted.
    ephemerals: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for KvHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvHandler")
            .field("store", &self.store.name())
            .field("session", &format_args!("{:#x}", self.session.id))
            .finish()
    }
}

impl KvHandler {
    pub fn new(
        store: Arc<dyn KvStore>,
        ctx: RequestContext,
        session: Session,
        watches: WatchSink,
    ) -> Self {
        Self {
            store,
            ctx,
            session,
            watches,
            ephemerals: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ephemerals(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.ephemerals.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read a node's two records. `None` when the node does not exist.
    async fn load(&self, path: &str) -> Result<(Option<NodeState>, i64), ZkError> {
        let keys = [
            path::node_key(path).map_err(bad_path)?,
            path::child_meta_key(path).map_err(bad_path)?,
        ];
        let read = self.store.get_many(&keys).await?;
        let mut entries = read.entries.into_iter();
        let (node, child) = (entries.next().flatten(), entries.next().flatten());
        let state = match (node, child) {
            (None, _) => None,
            (Some(_), None) => {
                tracing::error!(path, "node record without child record");
                return Err(ZkError::DataInconsistency);
            }
            (Some(node), Some(child)) => Some(NodeState {
                record: record::decode(&node)?,
                children: record::decode(&child)?,
                node,
                child,
            }),
        };
        Ok((state, read.revision))
    }

    async fn create(
        &self,
        path: String,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> Result<Reply, ZkError> {
        path::validate_path(&path).map_err(bad_path)?;
        if path == "/" {
            return Err(ZkError::NodeExists);
        }
        if acl.is_empty() {
            return Err(ZkError::InvalidAcl);
        }
        let parent = path::parent(&path).ok_or(ZkError::BadArguments)?;
        let owner = if mode.is_ephemeral() { self.session.id } else { 0 };

        for _ in 0..MAX_TXN_ATTEMPTS {
            let parent_state = self.load(parent).await?.0.ok_or(ZkError::NoNode)?;
            if parent_state.record.ephemeral_owner != 0 {
                return Err(ZkError::NoChildrenForEphemerals);
            }

            let name = if mode.is_sequential() {
                format!("{}{:010}", path, parent_state.children.cversion)
            } else {
                path.clone()
            };
            let node_key = path::node_key(&name).map_err(bad_path)?;
            let meta_key = path::child_meta_key(&name).map_err(bad_path)?;
            let parent_children = ChildRecord {
                cversion: parent_state.children.cversion.wrapping_add(1),
                num_children: parent_state.children.num_children + 1,
            };
            let record = NodeRecord::new(data.clone(), acl.clone(), owner, now_millis());

            let txn = Txn::new()
                .when(Compare::absent(node_key.clone()))
                .when(Compare::unchanged(&parent_state.child))
                .put(node_key, record::encode(&record)?)
                .put(meta_key, record::encode(&ChildRecord::default())?)
                .put(
                    parent_state.child.key.clone(),
                    record::encode(&parent_children)?,
                );
            let result = self.store.txn(txn).await?;
            if result.succeeded {
                if owner != 0 {
                    self.ephemerals().insert(name.clone());
                }
                tracing::debug!(path = %name, mode = ?mode, zxid = result.revision, "created");
                return Ok(Reply::new(result.revision, Response::Create { path: name }));
            }
            if self.load(&name).await?.0.is_some() {
                return Err(ZkError::NodeExists);
            }
        }
        tracing::warn!(path, "create abandoned after repeated conflicts");
        Err(ZkError::OperationTimeout)
    }

    async fn delete(&self, path: String, version: i32) -> Result<Reply, ZkError> {
        self.remove(&path, version, None).await
    }

    /// Delete a node. With `owner` set, only a node that session still owns
    /// is removed; anything else reads as `NoNode`.
    async fn remove(&self, path: &str, version: i32, owner: Option<i64>) -> Result<Reply, ZkError> {
        path::validate_path(path).map_err(bad_path)?;
        let parent = path::parent(path).ok_or(ZkError::BadArguments)?;

        for _ in 0..MAX_TXN_ATTEMPTS {
            let state = self.load(path).await?.0.ok_or(ZkError::NoNode)?;
            if owner.is_some_and(|owner| owner != state.record.ephemeral_owner) {
                return Err(ZkError::NoNode);
            }
            if version != -1 && version != state.record.version {
                return Err(ZkError::BadVersion);
            }
            if state.children.num_children > 0 {
                return Err(ZkError::NotEmpty);
            }
            let parent_state = self.load(parent).await?.0.ok_or(ZkError::NoNode)?;
            let parent_children = ChildRecord {
                cversion: parent_state.children.cversion.wrapping_add(1),
                num_children: (parent_state.children.num_children - 1).max(0),
            };

            let txn = Txn::new()
                .when(Compare::unchanged(&state.node))
                .when(Compare::unchanged(&state.child))
                .when(Compare::unchanged(&parent_state.child))
                .delete(state.node.key.clone())
                .delete(state.child.key.clone())
                .put(
                    parent_state.child.key.clone(),
                    record::encode(&parent_children)?,
                );
            let result = self.store.txn(txn).await?;
            if result.succeeded {
                self.ephemerals().remove(path);
                tracing::debug!(path, zxid = result.revision, "deleted");
                return Ok(Reply::new(result.revision, Response::Delete));
            }
        }
        tracing::warn!(path, "delete abandoned after repeated conflicts");
        Err(ZkError::OperationTimeout)
    }

    async fn exists(&self, path: String, watch: bool) -> Result<Reply, ZkError> {
        path::validate_path(&path).map_err(bad_path)?;
        let (state, revision) = self.load(&path).await?;
        if watch {
            self.watch_node(path, revision);
        }
        let state = state.ok_or(ZkError::NoNode)?;
        Ok(Reply::new(revision, Response::Exists { stat: state.stat() }))
    }

    async fn get_data(&self, path: String, watch: bool) -> Result<Reply, ZkError> {
        path::validate_path(&path).map_err(bad_path)?;
        let (state, revision) = self.load(&path).await?;
        let state = state.ok_or(ZkError::NoNode)?;
        if watch {
            self.watch_node(path, revision);
        }
        Ok(Reply::new(
            revision,
            Response::GetData {
                stat: state.stat(),
                data: state.record.data,
            },
        ))
    }

    /// Rewrite a node record if `version` matches, returning the new stat.
    async fn update_record<F>(&self, path: &str, version: i32, check_aversion: bool, update: F) -> Result<(Stat, i64), ZkError>
    where
        F: Fn(&mut NodeRecord),
    {
        for _ in 0..MAX_TXN_ATTEMPTS {
            let mut state = self.load(path).await?.0.ok_or(ZkError::NoNode)?;
            let current = if check_aversion {
                state.record.aversion
            } else {
                state.record.version
            };
            if version != -1 && version != current {
                return Err(ZkError::BadVersion);
            }
            update(&mut state.record);

            let txn = Txn::new()
                .when(Compare::unchanged(&state.node))
                .put(state.node.key.clone(), record::encode(&state.record)?);
            let result = self.store.txn(txn).await?;
            if result.succeeded {
                state.node.mod_revision = result.revision;
                return Ok((state.stat(), result.revision));
            }
        }
        tracing::warn!(path, "update abandoned after repeated conflicts");
        Err(ZkError::OperationTimeout)
    }

    async fn set_data(&self, path: String, data: Vec<u8>, version: i32) -> Result<Reply, ZkError> {
        path::validate_path(&path).map_err(bad_path)?;
        let now = now_millis();
        let (stat, zxid) = self
            .update_record(&path, version, false, |record| {
                record.data = data.clone();
                record.version = record.version.wrapping_add(1);
                record.mtime = now;
            })
            .await?;
        Ok(Reply::new(zxid, Response::SetData { stat }))
    }

    async fn get_acl(&self, path: String) -> Result<Reply, ZkError> {
        path::validate_path(&path).map_err(bad_path)?;
        let (state, revision) = self.load(&path).await?;
        let state = state.ok_or(ZkError::NoNode)?;
        Ok(Reply::new(
            revision,
            Response::GetAcl {
                stat: state.stat(),
                acl: state.record.acl,
            },
        ))
    }

    async fn set_acl(&self, path: String, acl: Vec<Acl>, version: i32) -> Result<Reply, ZkError> {
        path::validate_path(&path).map_err(bad_path)?;
        if acl.is_empty() {
            return Err(ZkError::InvalidAcl);
        }
        let (stat, zxid) = self
            .update_record(&path, version, true, |record| {
                record.acl = acl.clone();
                record.aversion = record.aversion.wrapping_add(1);
            })
            .await?;
        Ok(Reply::new(zxid, Response::SetAcl { stat }))
    }

    async fn get_children(&self, path: String, watch: bool, with_stat: bool) -> Result<Reply, ZkError> {
        path::validate_path(&path).map_err(bad_path)?;
        let state = self.load(&path).await?.0.ok_or(ZkError::NoNode)?;

        let range = path::child_range(&path).map_err(bad_path)?;
        let listing = self.store.range(&range.start, &range.end).await?;
        let mut children = Vec::with_capacity(listing.entries.len());
        for entry in &listing.entries {
            let child = path::path_from_node_key(&entry.key).map_err(bad_path)?;
            if child != path {
                children.push(path::base_name(&child).to_string());
            }
        }
        if watch {
            self.watch_children(path, listing.revision);
        }

        let response = if with_stat {
            Response::GetChildren2 {
                children,
                stat: state.stat(),
            }
        } else {
            Response::GetChildren { children }
        };
        Ok(Reply::new(listing.revision, response))
    }

    async fn sync(&self, path: String) -> Result<Reply, ZkError> {
        path::validate_path(&path).map_err(bad_path)?;
        let (_, revision) = self.load(&path).await?;
        Ok(Reply::new(revision, Response::Sync { path }))
    }

    /// One-shot watch on a node's own key.
    fn watch_node(&self, path: String, revision: i64) {
        let Ok(key) = path::node_key(&path) else {
            return;
        };
        let store = self.store.clone();
        let sink = self.watches.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = store.watch(&key, &[], revision + 1) => match result {
                    Ok(events) => {
                        if let Some(event) = events.first() {
                            let kind = node_event_type(event);
                            tracing::trace!(path = %path, event = ?kind, "node watch fired");
                            sink.send(WatcherEvent::new(kind, path));
                        }
                    }
                    Err(err) => tracing::warn!(path = %path, error = %err, "node watch failed"),
                },
                _ = ctx.cancelled() => {}
            }
        });
    }

    /// One-shot watch on a node's children, which also fires if the node
    /// itself is deleted.
    fn watch_children(&self, path: String, revision: i64) {
        let (Ok(range), Ok(node_key)) = (path::child_range(&path), path::node_key(&path)) else {
            return;
        };
        let store = self.store.clone();
        let sink = self.watches.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let mut from_children = revision + 1;
            let mut from_node = revision + 1;
            loop {
                if sink.is_closed() {
                    return;
                }
                tokio::select! {
                    result = store.watch(&range.start, &range.end, from_children) => {
                        let events = match result {
                            Ok(events) => events,
                            Err(err) => {
                                tracing::warn!(path = %path, error = %err, "child watch failed");
                                return;
                            }
                        };
                        let membership_changed = events.iter().any(|e| {
                            e.key != node_key && (e.is_create() || e.kind == KvEventKind::Delete)
                        });
                        if membership_changed {
                            sink.send(WatcherEvent::new(EventType::NodeChildrenChanged, path));
                            return;
                        }
                        from_children = next_revision(&events, from_children);
                    }
                    result = store.watch(&node_key, &[], from_node) => {
                        let events = match result {
                            Ok(events) => events,
                            Err(err) => {
                                tracing::warn!(path = %path, error = %err, "child watch failed");
                                return;
                            }
                        };
                        if events.iter().any(|e| e.kind == KvEventKind::Delete) {
                            sink.send(WatcherEvent::new(EventType::NodeDeleted, path));
                            return;
                        }
                        from_node = next_revision(&events, from_node);
                    }
                    _ = ctx.cancelled() => return,
                }
            }
        });
    }

    async fn close_session(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let owned: Vec<String> = std::mem::take(&mut *self.ephemerals()).into_iter().collect();
        for path in owned {
            match self.remove(&path, -1, Some(self.session.id)).await {
                Ok(_) | Err(ZkError::NoNode) => {}
                Err(err) => tracing::warn!(path, error = %err, "failed to remove ephemeral node"),
            }
        }
        self.ctx.cancel();
        tracing::info!(session = format_args!("{:#x}", self.session.id), "session closed");
    }
}

fn node_event_type(event: &KvEvent) -> EventType {
    match event.kind {
        KvEventKind::Delete => EventType::NodeDeleted,
        KvEventKind::Put if event.is_create() => EventType::NodeCreated,
        KvEventKind::Put => EventType::NodeDataChanged,
    }
}

fn next_revision(events: &[KvEvent], current: i64) -> i64 {
    events
        .iter()
        .map(|e| e.mod_revision + 1)
        .max()
        .unwrap_or(current)
        .max(current)
}

#[async_trait]
impl RequestHandler for KvHandler {
    async fn handle(&self, request: Request) -> Result<Reply, ZkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ZkError::SessionExpired);
        }
        match request {
            Request::Create {
                path,
                data,
                acl,
                mode,
            } => self.create(path, data, acl, mode).await,
            Request::Delete { path, version } => self.delete(path, version).await,
            Request::Exists { path, watch } => self.exists(path, watch).await,
            Request::GetData { path, watch } => self.get_data(path, watch).await,
            Request::SetData {
                path,
                data,
                version,
            } => self.set_data(path, data, version).await,
            Request::GetAcl { path } => self.get_acl(path).await,
            Request::SetAcl { path, acl, version } => self.set_acl(path, acl, version).await,
            Request::GetChildren { path, watch } => self.get_children(path, watch, false).await,
            Request::GetChildren2 { path, watch } => self.get_children(path, watch, true).await,
            Request::Sync { path } => self.sync(path).await,
            Request::Ping => Ok(Reply::new(0, Response::Ping)),
            Request::CloseSession => {
                self.close_session().await;
                Ok(Reply::new(0, Response::CloseSession))
            }
        }
    }

    async fn close(&self) {
        self.close_session().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemStore;
    use crate::proto::PASSWORD_LEN;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn session(id: i64) -> Session {
        Session {
            id,
            timeout_ms: 10_000,
            password: vec![0; PASSWORD_LEN],
            read_only: false,
        }
    }

    async fn handler(store: &MemStore, id: i64) -> (KvHandler, UnboundedReceiver<WatcherEvent>) {
        ensure_root(store).await.unwrap();
        let (sink, rx) = WatchSink::channel();
        let handler = KvHandler::new(Arc::new(store.clone()), RequestContext::new(), session(id), sink);
        (handler, rx)
    }

    fn create(path: &str, mode: CreateMode) -> Request {
        Request::Create {
            path: path.into(),
            data: b"v".to_vec(),
            acl: Acl::world_all(),
            mode,
        }
    }

    async fn children(h: &KvHandler, path: &str) -> Vec<String> {
        match h
            .handle(Request::GetChildren {
                path: path.into(),
                watch: false,
            })
            .await
            .unwrap()
            .response
        {
            Response::GetChildren { mut children } => {
                children.sort();
                children
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    async fn next_event(rx: &mut UnboundedReceiver<WatcherEvent>) -> WatcherEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("watch did not fire")
            .expect("sink closed")
    }

    #[tokio::test]
    async fn ensure_root_is_idempotent() {
        let store = MemStore::new();
        ensure_root(&store).await.unwrap();
        let rev = store.current_revision();
        ensure_root(&store).await.unwrap();
        assert_eq!(store.current_revision(), rev);
    }

    #[tokio::test]
    async fn create_get_and_list() {
        let store = MemStore::new();
        let (h, _rx) = handler(&store, 1).await;

        h.handle(create("/a", CreateMode::Persistent)).await.unwrap();
        h.handle(create("/a/b", CreateMode::Persistent)).await.unwrap();
        h.handle(create("/c", CreateMode::Persistent)).await.unwrap();

        assert_eq!(children(&h, "/").await, vec!["a", "c"]);
        assert_eq!(children(&h, "/a").await, vec!["b"]);
        assert!(children(&h, "/a/b").await.is_empty());

        let reply = h
            .handle(Request::GetData {
                path: "/a/b".into(),
                watch: false,
            })
            .await
            .unwrap();
        match reply.response {
            Response::GetData { data, stat } => {
                assert_eq!(data, b"v");
                assert_eq!(stat.version, 0);
                assert_eq!(stat.czxid, stat.mzxid);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn create_errors() {
        let store = MemStore::new();
        let (h, _rx) = handler(&store, 1).await;

        assert_eq!(
            h.handle(create("/missing/child", CreateMode::Persistent)).await,
            Err(ZkError::NoNode)
        );
        h.handle(create("/a", CreateMode::Persistent)).await.unwrap();
        assert_eq!(
            h.handle(create("/a", CreateMode::Persistent)).await,
            Err(ZkError::NodeExists)
        );
        assert_eq!(
            h.handle(create("bad", CreateMode::Persistent)).await,
            Err(ZkError::BadArguments)
        );
        h.handle(create("/e", CreateMode::Ephemeral)).await.unwrap();
        assert_eq!(
            h.handle(create("/e/x", CreateMode::Persistent)).await,
            Err(ZkError::NoChildrenForEphemerals)
        );
        let no_acl = Request::Create {
            path: "/n".into(),
            data: vec![],
            acl: vec![],
            mode: CreateMode::Persistent,
        };
        assert_eq!(h.handle(no_acl).await, Err(ZkError::InvalidAcl));
    }

    #[tokio::test]
    async fn sequential_names_follow_cversion() {
        let store = MemStore::new();
        let (h, _rx) = handler(&store, 1).await;
        h.handle(create("/q", CreateMode::Persistent)).await.unwrap();

        let first = h
            .handle(create("/q/n-", CreateMode::PersistentSequential))
            .await
            .unwrap();
        h.handle(Request::Delete {
            path: "/q/n-0000000000".into(),
            version: -1,
        })
        .await
        .unwrap();
        let second = h
            .handle(create("/q/n-", CreateMode::PersistentSequential))
            .await
            .unwrap();

        assert_eq!(first.response, Response::Create { path: "/q/n-0000000000".into() });
        assert_eq!(second.response, Response::Create { path: "/q/n-0000000002".into() });
    }

    #[tokio::test]
    async fn set_data_checks_version() {
        let store = MemStore::new();
        let (h, _rx) = handler(&store, 1).await;
        h.handle(create("/a", CreateMode::Persistent)).await.unwrap();

        let set = |version| Request::SetData {
            path: "/a".into(),
            data: b"new".to_vec(),
            version,
        };
        let reply = h.handle(set(0)).await.unwrap();
        match reply.response {
            Response::SetData { stat } => {
                assert_eq!(stat.version, 1);
                assert_eq!(stat.data_length, 3);
                assert_eq!(stat.mzxid, reply.zxid);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.handle(set(0)).await, Err(ZkError::BadVersion));
        assert!(h.handle(set(-1)).await.is_ok());
    }

    #[tokio::test]
    async fn delete_rules() {
        let store = MemStore::new();
        let (h, _rx) = handler(&store, 1).await;
        h.handle(create("/a", CreateMode::Persistent)).await.unwrap();
        h.handle(create("/a/b", CreateMode::Persistent)).await.unwrap();

        let delete = |path: &str, version| Request::Delete {
            path: path.into(),
            version,
        };
        assert_eq!(h.handle(delete("/a", -1)).await, Err(ZkError::NotEmpty));
        assert_eq!(h.handle(delete("/a/b", 3)).await, Err(ZkError::BadVersion));
        assert!(h.handle(delete("/a/b", 0)).await.is_ok());
        assert!(h.handle(delete("/a", -1)).await.is_ok());
        assert_eq!(h.handle(delete("/a", -1)).await, Err(ZkError::NoNode));
        assert_eq!(h.handle(delete("/", -1)).await, Err(ZkError::BadArguments));
    }

    #[tokio::test]
    async fn parent_stat_tracks_children() {
        let store = MemStore::new();
        let (h, _rx) = handler(&store, 1).await;
        h.handle(create("/p", CreateMode::Persistent)).await.unwrap();
        h.handle(create("/p/x", CreateMode::Persistent)).await.unwrap();
        h.handle(create("/p/y", CreateMode::Persistent)).await.unwrap();
        h.handle(Request::Delete {
            path: "/p/x".into(),
            version: -1,
        })
        .await
        .unwrap();

        let reply = h
            .handle(Request::Exists {
                path: "/p".into(),
                watch: false,
            })
            .await
            .unwrap();
        match reply.response {
            Response::Exists { stat } => {
                assert_eq!(stat.num_children, 1);
                assert_eq!(stat.cversion, 3);
                assert_eq!(stat.version, 0);
                assert!(stat.pzxid > stat.mzxid);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn acl_round_trip() {
        let store = MemStore::new();
        let (h, _rx) = handler(&store, 1).await;
        h.handle(create("/a", CreateMode::Persistent)).await.unwrap();

        let acl = vec![Acl {
            perms: crate::proto::perms::READ,
            id: crate::proto::Id {
                scheme: "world".into(),
                id: "anyone".into(),
            },
        }];
        let reply = h
            .handle(Request::SetAcl {
                path: "/a".into(),
                acl: acl.clone(),
                version: 0,
            })
            .await
            .unwrap();
        assert!(matches!(reply.response, Response::SetAcl { stat } if stat.aversion == 1));

        let reply = h.handle(Request::GetAcl { path: "/a".into() }).await.unwrap();
        assert!(matches!(reply.response, Response::GetAcl { acl: got, .. } if got == acl));
    }

    #[tokio::test]
    async fn ephemerals_are_removed_on_close() {
        let store = MemStore::new();
        let (owner, _rx1) = handler(&store, 1).await;
        let (observer, _rx2) = handler(&store, 2).await;

        owner.handle(create("/e", CreateMode::Ephemeral)).await.unwrap();
        let created = owner
            .handle(create("/s-", CreateMode::EphemeralSequential))
            .await
            .unwrap();
        assert!(matches!(created.response, Response::Create { .. }));
        assert_eq!(children(&observer, "/").await.len(), 2);

        owner.close().await;
        assert!(children(&observer, "/").await.is_empty());
        assert_eq!(
            owner.handle(Request::Ping).await,
            Err(ZkError::SessionExpired)
        );
    }

    #[tokio::test]
    async fn close_spares_a_node_recreated_by_another_session() {
        let store = MemStore::new();
        let (owner, _rx1) = handler(&store, 1).await;
        let (other, _rx2) = handler(&store, 2).await;

        owner.handle(create("/e", CreateMode::Ephemeral)).await.unwrap();
        other
            .handle(Request::Delete {
                path: "/e".into(),
                version: -1,
            })
            .await
            .unwrap();
        other
            .handle(Request::Create {
                path: "/e".into(),
                data: b"mine".to_vec(),
                acl: Acl::world_all(),
                mode: CreateMode::Persistent,
            })
            .await
            .unwrap();

        owner.close().await;

        let reply = other
            .handle(Request::GetData {
                path: "/e".into(),
                watch: false,
            })
            .await
            .unwrap();
        match reply.response {
            Response::GetData { data, stat } => {
                assert_eq!(data, b"mine");
                assert_eq!(stat.ephemeral_owner, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn ephemeral_owner_is_reported() {
        let store = MemStore::new();
        let (h, _rx) = handler(&store, 42).await;
        h.handle(create("/e", CreateMode::Ephemeral)).await.unwrap();
        let reply = h
            .handle(Request::Exists {
                path: "/e".into(),
                watch: false,
            })
            .await
            .unwrap();
        assert!(matches!(reply.response, Response::Exists { stat } if stat.ephemeral_owner == 42));
    }

    #[tokio::test]
    async fn data_watch_fires_once_on_change() {
        let store = MemStore::new();
        let (h, mut rx) = handler(&store, 1).await;
        h.handle(create("/a", CreateMode::Persistent)).await.unwrap();
        h.handle(Request::GetData {
            path: "/a".into(),
            watch: true,
        })
        .await
        .unwrap();

        h.handle(Request::SetData {
            path: "/a".into(),
            data: b"x".to_vec(),
            version: -1,
        })
        .await
        .unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event, WatcherEvent::new(EventType::NodeDataChanged, "/a"));
    }

    #[tokio::test]
    async fn exists_watch_sees_creation() {
        let store = MemStore::new();
        let (h, mut rx) = handler(&store, 1).await;
        assert_eq!(
            h.handle(Request::Exists {
                path: "/later".into(),
                watch: true,
            })
            .await,
            Err(ZkError::NoNode)
        );
        h.handle(create("/later", CreateMode::Persistent)).await.unwrap();
        let event = next_event(&mut rx).await;
        assert_eq!(event, WatcherEvent::new(EventType::NodeCreated, "/later"));
    }

    #[tokio::test]
    async fn child_watch_ignores_grandchildren_and_data() {
        let store = MemStore::new();
        let (h, mut rx) = handler(&store, 1).await;
        h.handle(create("/a", CreateMode::Persistent)).await.unwrap();
        h.handle(create("/a/b", CreateMode::Persistent)).await.unwrap();
        h.handle(Request::GetChildren {
            path: "/a".into(),
            watch: true,
        })
        .await
        .unwrap();

        // Neither a grandchild nor a child's data change is a membership change.
        h.handle(create("/a/b/c", CreateMode::Persistent)).await.unwrap();
        h.handle(Request::SetData {
            path: "/a/b".into(),
            data: b"x".to_vec(),
            version: -1,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        h.handle(create("/a/d", CreateMode::Persistent)).await.unwrap();
        let event = next_event(&mut rx).await;
        assert_eq!(event, WatcherEvent::new(EventType::NodeChildrenChanged, "/a"));
    }

    #[tokio::test]
    async fn store_errors_become_protocol_errors() {
        let store = MemStore::new();
        let (h, _rx) = handler(&store, 1).await;
        store.fail_next(KvError::Timeout);
        assert_eq!(
            h.handle(Request::GetData {
                path: "/".into(),
                watch: false,
            })
            .await,
            Err(ZkError::OperationTimeout)
        );
    }
}
