//! personality::mock
//!
//! Scripted personality for deterministic testing.
//!
//! # Design
//!
//! The mock answers every connect with a fixed session (or error) and every
//! request with a canned reply per opcode, defaulting to an empty success.
//! Calls are appended to a log that several mocks can share, so tests can
//! assert the order in which delegates were consulted.
//!
//! # Example
//!
//! ```
//! use zetcd::personality::mock::MockPersonality;
//! use zetcd::personality::{AuthCapability, RequestContext};
//! use zetcd::proto::ConnectRequest;
//!
//! # tokio_test::block_on(async {
//! let mock = MockPersonality::new("ref");
//! let session = mock
//!     .authenticate(&RequestContext::new(), &ConnectRequest::new_session(5_000))
//!     .await
//!     .unwrap();
//! assert_eq!(session.timeout_ms, 5_000);
//! assert_eq!(mock.calls(), vec!["ref:connect"]);
//! # });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    AuthCapability, HandlerFactory, Personality, RequestContext, RequestHandler, Session,
    WatchSink,
};
use crate::proto::{ConnectRequest, OpCode, Reply, Request, Response, Stat, WatcherEvent, ZkError};

/// Call log shared between mocks.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Scripted personality. Clones share state.
#[derive(Debug, Clone)]
pub struct MockPersonality {
    name: String,
    inner: Arc<Mutex<MockInner>>,
    log: CallLog,
}

#[derive(Debug)]
struct MockInner {
    /// Next session id handed out.
    next_session: i64,
    /// Refuses every connect when set.
    auth_error: Option<ZkError>,
    /// Refuses every handler when set.
    handler_error: Option<ZkError>,
    replies: HashMap<OpCode, Result<Reply, ZkError>>,
    /// Delivered to each new handler's sink.
    connect_events: Vec<WatcherEvent>,
    /// How long every request takes.
    latency: Option<Duration>,
    in_flight: usize,
    peak_in_flight: usize,
}

impl MockPersonality {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(MockInner {
                next_session: 1,
                auth_error: None,
                handler_error: None,
                replies: HashMap::new(),
                connect_events: Vec::new(),
                latency: None,
                in_flight: 0,
                peak_in_flight: 0,
            })),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record calls into `log` instead of a private log.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    /// Start handing out session ids at `id`.
    pub fn with_session_ids(self, id: i64) -> Self {
        self.lock().next_session = id;
        self
    }

    /// Refuse every connect with `err`.
    pub fn fail_auth(self, err: ZkError) -> Self {
        self.lock().auth_error = Some(err);
        self
    }

    /// Grant sessions but refuse to build their handlers with `err`.
    pub fn fail_handlers(self, err: ZkError) -> Self {
        self.lock().handler_error = Some(err);
        self
    }

    /// Answer every request with opcode `op` by `reply`.
    pub fn reply_with(&self, op: OpCode, reply: Result<Reply, ZkError>) {
        self.lock().replies.insert(op, reply);
    }

    /// Push `event` to every session as soon as its handler is created.
    pub fn emit_on_connect(&self, event: WatcherEvent) {
        self.lock().connect_events.push(event);
    }

    /// Make every request take `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = Some(latency);
        self
    }

    /// Most requests and closes ever running at once, across all sessions.
    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    /// Calls recorded so far, as `name:operation` strings.
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// A concurrently dispatched personality backed by this mock.
    pub fn personality(&self) -> Personality {
        let shared = Arc::new(self.clone());
        Personality::new(
            self.name.clone(),
            shared.clone(),
            shared,
            RequestContext::new(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count a call as running until the guard drops.
    fn enter(&self) -> Running<'_> {
        let mut inner = self.lock();
        inner.in_flight += 1;
        inner.peak_in_flight = inner.peak_in_flight.max(inner.in_flight);
        Running(self)
    }

    fn record(&self, call: String) {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{}:{}", self.name, call));
    }
}

/// A call counted by [`MockPersonality::enter`].
struct Running<'a>(&'a MockPersonality);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.lock().in_flight -= 1;
    }
}

/// Empty success for `request`.
fn default_response(request: &Request) -> Response {
    let stat = Stat::default();
    match request {
        Request::Create { path, .. } => Response::Create { path: path.clone() },
        Request::Delete { .. } => Response::Delete,
        Request::Exists { .. } => Response::Exists { stat },
        Request::GetData { .. } => Response::GetData {
            data: Vec::new(),
            stat,
        },
        Request::SetData { .. } => Response::SetData { stat },
        Request::GetAcl { .. } => Response::GetAcl {
            acl: Vec::new(),
            stat,
        },
        Request::SetAcl { .. } => Response::SetAcl { stat },
        Request::GetChildren { .. } => Response::GetChildren {
            children: Vec::new(),
        },
        Request::GetChildren2 { .. } => Response::GetChildren2 {
            children: Vec::new(),
            stat,
        },
        Request::Sync { path } => Response::Sync { path: path.clone() },
        Request::Ping => Response::Ping,
        Request::CloseSession => Response::CloseSession,
    }
}

#[async_trait]
impl AuthCapability for MockPersonality {
    async fn authenticate(
        &self,
        _ctx: &RequestContext,
        request: &ConnectRequest,
    ) -> Result<Session, ZkError> {
        self.record("connect".to_string());
        let mut inner = self.lock();
        if let Some(err) = inner.auth_error {
            return Err(err);
        }
        let id = inner.next_session;
        inner.next_session += 1;
        Ok(Session {
            id,
            timeout_ms: request.timeout_ms,
            password: vec![0; crate::proto::PASSWORD_LEN],
            read_only: false,
        })
    }
}

#[async_trait]
impl HandlerFactory for MockPersonality {
    async fn new_handler(
        &self,
        _ctx: &RequestContext,
        session: &Session,
        watches: WatchSink,
    ) -> Result<Box<dyn RequestHandler>, ZkError> {
        self.record(format!("handler {}", session.id));
        if let Some(err) = self.lock().handler_error {
            return Err(err);
        }
        for event in self.lock().connect_events.iter().cloned() {
            watches.send(event);
        }
        Ok(Box::new(MockHandler {
            mock: self.clone(),
            _watches: watches,
        }))
    }
}

struct MockHandler {
    mock: MockPersonality,
    /// Held so the session's sink stays open while the handler lives.
    _watches: WatchSink,
}

#[async_trait]
impl RequestHandler for MockHandler {
    async fn handle(&self, request: Request) -> Result<Reply, ZkError> {
        let op = request.op_code();
        self.mock.record(match request.path() {
            Some(path) => format!("{} {}", op.name(), path),
            None => op.name().to_string(),
        });
        let _running = self.mock.enter();
        let latency = self.mock.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let scripted = self.mock.lock().replies.get(&op).cloned();
        scripted.unwrap_or_else(|| Ok(Reply::new(0, default_response(&request))))
    }

    async fn close(&self) {
        self.mock.record("close".to_string());
        let _running = self.mock.enter();
    }
}
