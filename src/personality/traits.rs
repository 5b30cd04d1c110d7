//! personality::traits
//!
//! The capability pair every personality provides.
//!
//! # Design
//!
//! A client session touches a backend in exactly two places: once when it
//! connects ([`AuthCapability`]) and then for every request
//! ([`HandlerFactory`] hands out one [`RequestHandler`] per session). The
//! server drives these traits without knowing whether the etcd adapter, the
//! bridge, or the oracle sits behind them.
//!
//! All traits are async and `Send + Sync` so one personality can be shared
//! across session tasks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::context::RequestContext;
use crate::proto::{ConnectRequest, ConnectResponse, Reply, Request, WatcherEvent, ZkError};

/// An established client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session id handed to the client.
    pub id: i64,
    /// Negotiated session timeout.
    pub timeout_ms: i32,
    /// Password the client presents when reconnecting.
    pub password: Vec<u8>,
    /// Whether the session only accepts reads.
    pub read_only: bool,
}

impl Session {
    /// The connect response announcing this session.
    pub fn connect_response(&self) -> ConnectResponse {
        ConnectResponse {
            protocol_version: 0,
            timeout_ms: self.timeout_ms,
            session_id: self.id,
            password: self.password.clone(),
            read_only: self.read_only,
        }
    }
}

/// Delivery channel for a session's watch notifications.
#[derive(Debug, Clone)]
pub struct WatchSink {
    tx: mpsc::UnboundedSender<WatcherEvent>,
}

impl WatchSink {
    /// A sink and the receiver the session loop drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WatcherEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a notification. Returns false once the session is gone.
    pub fn send(&self, event: WatcherEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Decides whether a connecting client gets a session.
#[async_trait]
pub trait AuthCapability: Send + Sync {
    /// Authenticate a connect request.
    ///
    /// # Errors
    ///
    /// - `SessionExpired` when the client asks to resume a session the
    ///   backend does not know
    /// - `ConnectionLoss` when the backend cannot be reached
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &ConnectRequest,
    ) -> Result<Session, ZkError>;
}

/// Binds an authenticated session to a backend.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    /// Create the request handler for `session`.
    ///
    /// Watch notifications for the session are pushed into `watches`.
    async fn new_handler(
        &self,
        ctx: &RequestContext,
        session: &Session,
        watches: WatchSink,
    ) -> Result<Box<dyn RequestHandler>, ZkError>;
}

/// Serves the requests of one session.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Serve one request. Errors are returned to the client as native codes.
    async fn handle(&self, request: Request) -> Result<Reply, ZkError>;

    /// Release the session after the client disconnected. Idempotent.
    async fn close(&self);
}
