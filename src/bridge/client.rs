//! bridge::client
//!
//! Minimal asynchronous client for an upstream ensemble.
//!
//! # Design
//!
//! One TCP connection per session. Writes are serialized through a mutex;
//! a reader task routes each reply to the caller waiting on its xid and
//! pushes watch notifications into an event channel. When the connection
//! drops, every waiting caller sees `ConnectionLoss`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::proto::codec::{
    decode_connect_response, decode_reply_header, decode_response, decode_watcher_event,
    encode_connect_request, encode_request,
};
use crate::proto::frame::{read_frame, write_frame};
use crate::proto::{
    ConnectRequest, ConnectResponse, OpCode, Reply, Request, WatcherEvent, ZkError, PING_XID,
    WATCH_XID,
};

type PendingMap = HashMap<i32, (OpCode, oneshot::Sender<Result<Reply, ZkError>>)>;

/// A session with an upstream server.
#[derive(Debug)]
pub struct ZkClient {
    addr: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<PendingMap>>,
    next_xid: AtomicI32,
    session: ConnectResponse,
    events: Mutex<Option<mpsc::UnboundedReceiver<WatcherEvent>>>,
    call_timeout: Duration,
    closed: AtomicBool,
    reader: JoinHandle<()>,
}

impl ZkClient {
    /// Connect to the first reachable address in `addrs` and open a session
    /// with `request`.
    ///
    /// # Errors
    ///
    /// - `ConnectionLoss` when no address accepts a connection
    /// - `SessionExpired` when the server rejects the session
    pub async fn connect(
        addrs: &[String],
        request: &ConnectRequest,
        call_timeout: Duration,
    ) -> Result<Self, ZkError> {
        for addr in addrs {
            let stream = match tokio::time::timeout(call_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    tracing::debug!(addr, error = %err, "upstream connect failed");
                    continue;
                }
                Err(_) => {
                    tracing::debug!(addr, "upstream connect timed out");
                    continue;
                }
            };
            match tokio::time::timeout(call_timeout, Self::handshake(addr, stream, request, call_timeout))
                .await
            {
                Ok(Ok(client)) => return Ok(client),
                Ok(Err(ZkError::SessionExpired)) => return Err(ZkError::SessionExpired),
                Ok(Err(err)) => tracing::debug!(addr, error = %err, "upstream handshake failed"),
                Err(_) => tracing::debug!(addr, "upstream handshake timed out"),
            }
        }
        tracing::warn!(addrs = ?addrs, "no upstream server reachable");
        Err(ZkError::ConnectionLoss)
    }

    async fn handshake(
        addr: &str,
        stream: TcpStream,
        request: &ConnectRequest,
        call_timeout: Duration,
    ) -> Result<Self, ZkError> {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        write_frame(&mut write_half, &encode_connect_request(request))
            .await
            .map_err(|_| ZkError::ConnectionLoss)?;
        let frame = read_frame(&mut read_half)
            .await
            .map_err(|_| ZkError::ConnectionLoss)?
            .ok_or(ZkError::ConnectionLoss)?;
        let session = decode_connect_response(&frame).map_err(|_| ZkError::MarshallingError)?;
        if session.is_rejected() {
            return Err(ZkError::SessionExpired);
        }

        let pending: Arc<Mutex<PendingMap>> = Arc::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(read_half, pending.clone(), events_tx));
        tracing::debug!(
            addr,
            session = format_args!("{:#x}", session.session_id),
            "upstream session opened"
        );

        Ok(Self {
            addr: addr.to_string(),
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            next_xid: AtomicI32::new(1),
            session,
            events: Mutex::new(Some(events_rx)),
            call_timeout,
            closed: AtomicBool::new(false),
            reader,
        })
    }

    /// The server's answer to the connect request.
    pub fn session(&self) -> &ConnectResponse {
        &self.session
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Watch notifications from the server. Only the first caller gets them.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<WatcherEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send one request and wait for its reply.
    pub async fn call(&self, request: Request) -> Result<Reply, ZkError> {
        if self.reader.is_finished() {
            return Err(ZkError::ConnectionLoss);
        }
        let op = request.op_code();
        let xid = if op == OpCode::Ping {
            PING_XID
        } else {
            self.next_xid.fetch_add(1, Ordering::SeqCst)
        };
        let (tx, rx) = oneshot::channel();
        self.pending().insert(xid, (op, tx));

        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &encode_request(xid, &request)).await
        };
        if let Err(err) = written {
            self.pending().remove(&xid);
            tracing::debug!(addr = %self.addr, error = %err, "upstream write failed");
            return Err(ZkError::ConnectionLoss);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ZkError::ConnectionLoss),
            Err(_) => {
                self.pending().remove(&xid);
                Err(ZkError::OperationTimeout)
            }
        }
    }

    /// Ping every `interval` until the connection goes away.
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else {
                    return;
                };
                if client.call(Request::Ping).await.is_err() && client.reader.is_finished() {
                    return;
                }
            }
        })
    }

    /// End the session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.call(Request::CloseSession).await {
            tracing::debug!(addr = %self.addr, error = %err, "upstream close failed");
        }
        self.reader.abort();
    }
}

impl Drop for ZkClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    pending: Arc<Mutex<PendingMap>>,
    events: mpsc::UnboundedSender<WatcherEvent>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "upstream read failed");
                break;
            }
        };
        let (header, body) = match decode_reply_header(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable upstream reply");
                break;
            }
        };

        if header.xid == WATCH_XID {
            match decode_watcher_event(body) {
                Ok(event) => {
                    let _ = events.send(event);
                }
                Err(err) => tracing::warn!(error = %err, "undecodable upstream watch event"),
            }
            continue;
        }

        let waiter = pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&header.xid);
        let Some((op, tx)) = waiter else {
            tracing::trace!(xid = header.xid, "reply without waiter");
            continue;
        };
        let result = if header.err != 0 {
            Err(ZkError::from_code(header.err))
        } else {
            decode_response(op, body)
                .map(|response| Reply::new(header.zxid, response))
                .map_err(|_| ZkError::MarshallingError)
        };
        let _ = tx.send(result);
    }
    // Dropping the senders fails every outstanding call.
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
}
