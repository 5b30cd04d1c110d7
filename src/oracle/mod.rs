//! oracle
//!
//! Cross-checks one personality against another.
//!
//! # Design
//!
//! [`CrossCheckOracle`] is itself a personality built from two others: a
//! reference, whose answers reach the client, and a candidate, which sees
//! the same calls so its answers can be compared. Every call goes to the
//! reference first and then to the candidate, sequentially, so both observe
//! the same sequence of mutations. Disagreements are reported as
//! [`Divergence`]s and never change what the client sees.
//!
//! The oracle is meant to run serialized: with concurrent sessions the two
//! backends could order interleaved writes differently and report spurious
//! divergences.

mod compare;

pub use compare::{responses_match, stats_match, ComparisonResult};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::personality::{
    AuthCapability, DispatchMode, HandlerFactory, Personality, RequestContext, RequestHandler,
    Session, WatchSink,
};
use crate::proto::{ConnectRequest, Reply, Request, ZkError};

/// A call the two delegates answered differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// Operation name (e.g., "connect", "getData").
    pub operation: String,
    pub request: String,
    pub reference: String,
    pub candidate: String,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} => reference {} / candidate {}",
            self.operation, self.request, self.reference, self.candidate
        )
    }
}

/// Receives divergences in addition to the log. Must not block.
pub trait DivergenceReporter: Send + Sync {
    fn report(&self, divergence: &Divergence);
}

/// Forwards divergences to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<Divergence>,
}

impl ChannelReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Divergence>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DivergenceReporter for ChannelReporter {
    fn report(&self, divergence: &Divergence) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(divergence.clone());
    }
}

/// Personality answering from `reference` while checking `candidate`.
pub struct CrossCheckOracle {
    reference: Personality,
    candidate: Personality,
    reporter: Option<Arc<dyn DivergenceReporter>>,
    /// Candidate sessions keyed by the reference session they shadow.
    sessions: Mutex<HashMap<i64, Session>>,
}

impl fmt::Debug for CrossCheckOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossCheckOracle")
            .field("reference", &self.reference.name)
            .field("candidate", &self.candidate.name)
            .finish()
    }
}

impl CrossCheckOracle {
    pub fn new(reference: Personality, candidate: Personality) -> Self {
        Self {
            reference,
            candidate,
            reporter: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Also send every divergence to `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn DivergenceReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Wrap the oracle as a serialized personality.
    pub fn into_personality(self, name: impl Into<String>) -> Personality {
        let oracle = Arc::new(self);
        Personality::new(name, oracle.clone(), oracle, RequestContext::new())
            .with_dispatch(DispatchMode::Serialized)
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open and close a candidate session the client will never use, so the
    /// candidate frees whatever it holds for it.
    async fn release_candidate(&self, ctx: &RequestContext, session: &Session) {
        let (sink, _events) = WatchSink::channel();
        match self.candidate.handlers.new_handler(ctx, session, sink).await {
            Ok(handler) => handler.close().await,
            Err(err) => tracing::debug!(error = %err, "candidate session not released"),
        }
    }
}

fn report(reporter: &Option<Arc<dyn DivergenceReporter>>, divergence: Divergence) {
    tracing::warn!(
        operation = %divergence.operation,
        request = %divergence.request,
        reference = %divergence.reference,
        candidate = %divergence.candidate,
        "divergence"
    );
    if let Some(reporter) = reporter {
        reporter.report(&divergence);
    }
}

fn describe<T: fmt::Debug>(result: &Result<T, ZkError>) -> String {
    match result {
        Ok(value) => format!("{:?}", value),
        Err(err) => format!("error {} ({})", err.code(), err),
    }
}

#[async_trait]
impl AuthCapability for CrossCheckOracle {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &ConnectRequest,
    ) -> Result<Session, ZkError> {
        let reference = self.reference.auth.authenticate(ctx, request).await;
        let candidate = self.candidate.auth.authenticate(ctx, request).await;

        let result = ComparisonResult::of_sessions(&reference, &candidate);
        if !result.matched {
            report(
                &self.reporter,
                Divergence {
                    operation: "connect".to_string(),
                    request: format!("timeout={}ms", request.timeout_ms),
                    reference: describe(result.reference),
                    candidate: describe(result.candidate),
                },
            );
        }
        match (&reference, candidate) {
            (Ok(reference), Ok(candidate)) => {
                self.sessions().insert(reference.id, candidate);
            }
            (Err(_), Ok(candidate)) => self.release_candidate(ctx, &candidate).await,
            _ => {}
        }
        reference
    }
}

#[async_trait]
impl HandlerFactory for CrossCheckOracle {
    async fn new_handler(
        &self,
        ctx: &RequestContext,
        session: &Session,
        watches: WatchSink,
    ) -> Result<Box<dyn RequestHandler>, ZkError> {
        let candidate_session = self.sessions().remove(&session.id);
        let reference = match self.reference.handlers.new_handler(ctx, session, watches).await {
            Ok(handler) => handler,
            Err(err) => {
                if let Some(candidate_session) = candidate_session {
                    self.release_candidate(ctx, &candidate_session).await;
                }
                return Err(err);
            }
        };

        let candidate = match candidate_session {
            Some(candidate_session) => {
                let (sink, mut events) = WatchSink::channel();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        tracing::debug!(event = ?event, "candidate watch event");
                    }
                });
                match self
                    .candidate
                    .handlers
                    .new_handler(ctx, &candidate_session, sink)
                    .await
                {
                    Ok(handler) => Some(handler),
                    Err(err) => {
                        tracing::warn!(error = %err, "candidate refused session; requests go unchecked");
                        None
                    }
                }
            }
            None => {
                tracing::warn!(
                    session = format_args!("{:#x}", session.id),
                    "no candidate session; requests go unchecked"
                );
                None
            }
        };

        Ok(Box::new(OracleHandler {
            reference,
            candidate,
            reporter: self.reporter.clone(),
        }))
    }
}

struct OracleHandler {
    reference: Box<dyn RequestHandler>,
    candidate: Option<Box<dyn RequestHandler>>,
    reporter: Option<Arc<dyn DivergenceReporter>>,
}

#[async_trait]
impl RequestHandler for OracleHandler {
    async fn handle(&self, request: Request) -> Result<Reply, ZkError> {
        let reference = self.reference.handle(request.clone()).await;
        if let Some(candidate) = &self.candidate {
            let candidate = candidate.handle(request.clone()).await;
            let result = ComparisonResult::of_replies(&reference, &candidate);
            if !result.matched {
                report(
                    &self.reporter,
                    Divergence {
                        operation: request.op_code().name().to_string(),
                        request: format!("{:?}", request),
                        reference: describe(result.reference),
                        candidate: describe(result.candidate),
                    },
                );
            }
        }
        reference
    }

    async fn close(&self) {
        self.reference.close().await;
        if let Some(candidate) = &self.candidate {
            candidate.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::personality::mock::{CallLog, MockPersonality};
    use crate::proto::{OpCode, Response, Stat};

    fn pair() -> (MockPersonality, MockPersonality, CallLog) {
        let log: CallLog = Arc::default();
        let reference = MockPersonality::new("ref").with_log(log.clone());
        let candidate = MockPersonality::new("cand")
            .with_log(log.clone())
            .with_session_ids(100);
        (reference, candidate, log)
    }

    async fn open(oracle: &Personality) -> Box<dyn RequestHandler> {
        let ctx = RequestContext::new();
        let session = oracle
            .auth
            .authenticate(&ctx, &ConnectRequest::new_session(5_000))
            .await
            .unwrap();
        let (sink, _rx) = WatchSink::channel();
        oracle.handlers.new_handler(&ctx, &session, sink).await.unwrap()
    }

    #[tokio::test]
    async fn calls_reference_then_candidate() {
        let (reference, candidate, _log) = pair();
        let oracle = CrossCheckOracle::new(reference.personality(), candidate.personality())
            .into_personality("oracle");
        assert_eq!(oracle.dispatch, DispatchMode::Serialized);

        let handler = open(&oracle).await;
        handler.handle(Request::Sync { path: "/a".into() }).await.unwrap();
        handler.close().await;

        assert_eq!(
            reference.calls(),
            vec![
                "ref:connect",
                "cand:connect",
                "ref:handler 1",
                "cand:handler 100",
                "ref:sync /a",
                "cand:sync /a",
                "ref:close",
                "cand:close",
            ]
        );
    }

    #[tokio::test]
    async fn candidate_session_failure_is_a_divergence() {
        let log: CallLog = Arc::default();
        let reference = MockPersonality::new("ref").with_log(log.clone());
        let candidate = MockPersonality::new("cand")
            .with_log(log)
            .fail_auth(ZkError::ConnectionLoss);
        let (reporter, mut divergences) = ChannelReporter::channel();
        let oracle = CrossCheckOracle::new(reference.personality(), candidate.personality())
            .with_reporter(Arc::new(reporter))
            .into_personality("oracle");

        let handler = open(&oracle).await;
        let divergence = divergences.try_recv().unwrap();
        assert_eq!(divergence.operation, "connect");

        // Without a candidate session requests still reach the reference.
        handler.handle(Request::Ping).await.unwrap();
        assert!(divergences.try_recv().is_err());
    }

    #[tokio::test]
    async fn stat_differences_are_reported() {
        let (reference, candidate, _log) = pair();
        let stat = |version| Stat {
            version,
            ..Stat::default()
        };
        reference.reply_with(OpCode::SetData, Ok(Reply::new(5, Response::SetData { stat: stat(1) })));
        candidate.reply_with(OpCode::SetData, Ok(Reply::new(9, Response::SetData { stat: stat(2) })));
        let (reporter, mut divergences) = ChannelReporter::channel();
        let oracle = CrossCheckOracle::new(reference.personality(), candidate.personality())
            .with_reporter(Arc::new(reporter))
            .into_personality("oracle");

        let handler = open(&oracle).await;
        let got = handler
            .handle(Request::SetData {
                path: "/a".into(),
                data: vec![],
                version: -1,
            })
            .await
            .unwrap();

        assert_eq!(got.zxid, 5);
        let divergence = divergences.try_recv().unwrap();
        assert_eq!(divergence.operation, "setData");
        assert!(divergence.request.contains("/a"));
    }

    #[tokio::test]
    async fn candidate_watch_events_are_not_delivered() {
        let (reference, candidate, _log) = pair();
        candidate.emit_on_connect(crate::proto::WatcherEvent::new(
            crate::proto::EventType::NodeCreated,
            "/x",
        ));
        let oracle = CrossCheckOracle::new(reference.personality(), candidate.personality())
            .into_personality("oracle");

        let ctx = RequestContext::new();
        let session = oracle
            .auth
            .authenticate(&ctx, &ConnectRequest::new_session(5_000))
            .await
            .unwrap();
        let (sink, mut rx) = WatchSink::channel();
        let _handler = oracle.handlers.new_handler(&ctx, &session, sink).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
