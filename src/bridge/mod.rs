//! bridge
//!
//! Personality that forwards every session to an upstream ensemble.
//!
//! # Design
//!
//! Authentication opens an upstream session with the client's connect
//! request, forwarded verbatim, and parks the connection until the server
//! asks for the session's handler. The handler then relays each request on
//! that connection and pipes upstream watch notifications into the
//! session's sink.

mod client;

pub use client::ZkClient;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::personality::{
    AuthCapability, HandlerFactory, RequestContext, RequestHandler, Session, WatchSink,
};
use crate::proto::{ConnectRequest, Reply, Request, ZkError};

/// Upstream ensemble reached over one connection per session.
#[derive(Debug)]
pub struct Bridge {
    addrs: Vec<String>,
    call_timeout: Duration,
    /// Connections authenticated but not yet bound to a handler.
    parked: Mutex<HashMap<i64, ZkClient>>,
}

impl Bridge {
    pub fn new(addrs: Vec<String>, call_timeout: Duration) -> Self {
        Self {
            addrs,
            call_timeout,
            parked: Mutex::new(HashMap::new()),
        }
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    fn parked(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ZkClient>> {
        self.parked.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AuthCapability for Bridge {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &ConnectRequest,
    ) -> Result<Session, ZkError> {
        let client = tokio::select! {
            client = ZkClient::connect(&self.addrs, request, self.call_timeout) => client?,
            _ = ctx.cancelled() => return Err(ZkError::ConnectionLoss),
        };
        let upstream = client.session();
        let session = Session {
            id: upstream.session_id,
            timeout_ms: upstream.timeout_ms,
            password: upstream.password.clone(),
            read_only: upstream.read_only,
        };
        tracing::info!(
            session = format_args!("{:#x}", session.id),
            upstream = client.addr(),
            "bridged session established"
        );
        self.parked().insert(session.id, client);
        Ok(session)
    }
}

#[async_trait]
impl HandlerFactory for Bridge {
    async fn new_handler(
        &self,
        _ctx: &RequestContext,
        session: &Session,
        watches: WatchSink,
    ) -> Result<Box<dyn RequestHandler>, ZkError> {
        let client = self
            .parked()
            .remove(&session.id)
            .ok_or(ZkError::SessionExpired)?;
        if let Some(mut events) = client.take_events() {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if !watches.send(event) {
                        break;
                    }
                }
            });
        }
        Ok(Box::new(BridgeHandler { client }))
    }
}

struct BridgeHandler {
    client: ZkClient,
}

#[async_trait]
impl RequestHandler for BridgeHandler {
    async fn handle(&self, request: Request) -> Result<Reply, ZkError> {
        self.client.call(request).await
    }

    async fn close(&self) {
        self.client.close().await;
    }
}
