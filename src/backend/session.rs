//! backend::session
//!
//! Session admission for the keyspace-backed personality.
//!
//! Sessions live exactly as long as their connection: a resume request for
//! an earlier session id is answered with `SessionExpired`, and a session's
//! ephemeral nodes are removed when its handler closes.

use std::sync::Arc;

use async_trait::async_trait;

use super::KvStore;
use crate::core::path;
use crate::personality::{AuthCapability, RequestContext, Session};
use crate::proto::{ConnectRequest, ZkError, PASSWORD_LEN};

/// Bounds applied to the timeout a client asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub min_timeout_ms: i32,
    pub max_timeout_ms: i32,
}

impl Default for SessionLimits {
    /// Twice and twenty times a 2s tick, as a stock ensemble negotiates.
    fn default() -> Self {
        Self {
            min_timeout_ms: 4_000,
            max_timeout_ms: 40_000,
        }
    }
}

impl SessionLimits {
    pub fn negotiate(&self, requested_ms: i32) -> i32 {
        requested_ms.clamp(self.min_timeout_ms, self.max_timeout_ms)
    }
}

/// [`AuthCapability`] over a [`KvStore`].
#[derive(Debug, Clone)]
pub struct KvAuth {
    store: Arc<dyn KvStore>,
    limits: SessionLimits,
}

impl KvAuth {
    pub fn new(store: Arc<dyn KvStore>, limits: SessionLimits) -> Self {
        Self { store, limits }
    }
}

#[async_trait]
impl AuthCapability for KvAuth {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &ConnectRequest,
    ) -> Result<Session, ZkError> {
        if request.session_id != 0 {
            tracing::debug!(
                session = format_args!("{:#x}", request.session_id),
                "resume of unknown session refused"
            );
            return Err(ZkError::SessionExpired);
        }

        // A session is only handed out while the store answers.
        let keys = [path::node_key("/").map_err(|_| ZkError::SystemError)?];
        tokio::select! {
            read = self.store.get_many(&keys) => { read?; }
            _ = ctx.cancelled() => return Err(ZkError::ConnectionLoss),
        }

        let (id, password) = new_credentials();
        let session = Session {
            id,
            timeout_ms: self.limits.negotiate(request.timeout_ms),
            password,
            read_only: false,
        };
        tracing::info!(
            session = format_args!("{:#x}", session.id),
            timeout_ms = session.timeout_ms,
            store = self.store.name(),
            "session established"
        );
        Ok(session)
    }
}

/// A positive, non-zero session id and a random password.
fn new_credentials() -> (i64, Vec<u8>) {
    let uuid = uuid::Uuid::new_v4();
    let (hi, _) = uuid.as_u64_pair();
    let id = ((hi & i64::MAX as u64) as i64).max(1);
    let password = uuid.as_bytes()[..PASSWORD_LEN].to_vec();
    (id, password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KvError, MemStore};

    fn auth(store: &MemStore) -> KvAuth {
        KvAuth::new(Arc::new(store.clone()), SessionLimits::default())
    }

    #[test]
    fn negotiation_clamps() {
        let limits = SessionLimits::default();
        assert_eq!(limits.negotiate(100), 4_000);
        assert_eq!(limits.negotiate(10_000), 10_000);
        assert_eq!(limits.negotiate(1_000_000), 40_000);
    }

    #[test]
    fn credentials_are_valid() {
        let (id, password) = new_credentials();
        assert!(id > 0);
        assert_eq!(password.len(), PASSWORD_LEN);
    }

    #[tokio::test]
    async fn new_session_is_granted() {
        let store = MemStore::new();
        let session = auth(&store)
            .authenticate(&RequestContext::new(), &ConnectRequest::new_session(30_000))
            .await
            .unwrap();
        assert_eq!(session.timeout_ms, 30_000);
        assert!(session.id > 0);
    }

    #[tokio::test]
    async fn resume_is_refused() {
        let store = MemStore::new();
        let mut request = ConnectRequest::new_session(30_000);
        request.session_id = 77;
        let err = auth(&store)
            .authenticate(&RequestContext::new(), &request)
            .await
            .unwrap_err();
        assert_eq!(err, ZkError::SessionExpired);
    }

    #[tokio::test]
    async fn unreachable_store_refuses_sessions() {
        let store = MemStore::new();
        store.fail_next(KvError::Unavailable("down".into()));
        let err = auth(&store)
            .authenticate(&RequestContext::new(), &ConnectRequest::new_session(30_000))
            .await
            .unwrap_err();
        assert_eq!(err, ZkError::ConnectionLoss);
    }
}
