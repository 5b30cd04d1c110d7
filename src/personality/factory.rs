//! personality::factory
//!
//! Personality selection and creation.
//!
//! # Design
//!
//! `main` calls [`from_config`] once; the constructors below are the only
//! place that knows which adapter types back a personality. Construction
//! failures come back as [`PersonalityError`] so the caller decides how to
//! exit.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::{Personality, RequestContext};
use crate::backend::{
    ensure_root, EtcdGateway, KvAuth, KvError, KvHandlerFactory, KvStore, MemStore,
    SessionLimits, TlsFiles,
};
use crate::bridge::Bridge;
use crate::config::{Config, Mode};
use crate::oracle::{CrossCheckOracle, DivergenceReporter};

/// Endpoint selecting the in-process store.
pub const MEMORY_ENDPOINT: &str = "mem://";

/// Errors from building a personality.
#[derive(Debug, Error)]
pub enum PersonalityError {
    #[error("cannot reach backend at '{endpoint}': {source}")]
    Backend { endpoint: String, source: KvError },

    #[error("no upstream addresses given")]
    NoUpstream,
}

/// Which delegate of an oracle answers clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleSide {
    /// The bridge answers; the flat backend is checked.
    Zk,
    /// The flat backend answers; the bridge is checked.
    Etcd,
}

impl OracleSide {
    /// Parse an oracle identifier.
    ///
    /// # Example
    ///
    /// ```
    /// use zetcd::personality::OracleSide;
    ///
    /// assert_eq!(OracleSide::parse("zk"), Some(OracleSide::Zk));
    /// assert_eq!(OracleSide::parse("consul"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zk" => Some(OracleSide::Zk),
            "etcd" => Some(OracleSide::Etcd),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OracleSide::Zk => "zk",
            OracleSide::Etcd => "etcd",
        }
    }
}

impl std::fmt::Display for OracleSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Serve the protocol from `store`, creating the root node if needed.
pub async fn from_store(
    store: Arc<dyn KvStore>,
    limits: SessionLimits,
) -> Result<Personality, PersonalityError> {
    ensure_root(store.as_ref())
        .await
        .map_err(|source| PersonalityError::Backend {
            endpoint: store.name().to_string(),
            source,
        })?;
    Ok(Personality::new(
        store.name(),
        Arc::new(KvAuth::new(store.clone(), limits)),
        Arc::new(KvHandlerFactory::new(store)),
        RequestContext::new(),
    ))
}

/// Connect to the flat backend at `endpoint`.
pub async fn backend_direct(
    endpoint: &str,
    tls: Option<&TlsFiles>,
    limits: SessionLimits,
    request_timeout: Duration,
) -> Result<Personality, PersonalityError> {
    let store: Arc<dyn KvStore> = if endpoint == MEMORY_ENDPOINT {
        tracing::warn!("serving from an in-process store; data is lost on exit");
        Arc::new(MemStore::new())
    } else {
        let gateway = EtcdGateway::connect(endpoint, tls, request_timeout)
            .await
            .map_err(|source| PersonalityError::Backend {
                endpoint: endpoint.to_string(),
                source,
            })?;
        Arc::new(gateway)
    };
    from_store(store, limits).await
}

/// Forward every session to the ensemble at `addrs`.
pub fn bridge_direct(
    addrs: Vec<String>,
    call_timeout: Duration,
) -> Result<Personality, PersonalityError> {
    if addrs.is_empty() {
        return Err(PersonalityError::NoUpstream);
    }
    let bridge = Arc::new(Bridge::new(addrs, call_timeout));
    tracing::debug!(upstream = ?bridge.addrs(), "bridging to ensemble");
    Ok(Personality::new(
        "bridge",
        bridge.clone(),
        bridge,
        RequestContext::background(),
    ))
}

/// Cross-check `backend` against `bridge`, answering from `side`.
pub fn oracle_composed(
    side: OracleSide,
    backend: Personality,
    bridge: Personality,
    reporter: Option<Arc<dyn DivergenceReporter>>,
) -> Personality {
    let (reference, candidate) = match side {
        OracleSide::Zk => (bridge, backend),
        OracleSide::Etcd => (backend, bridge),
    };
    let ctx = reference.ctx.clone();
    let mut oracle = CrossCheckOracle::new(reference, candidate);
    if let Some(reporter) = reporter {
        oracle = oracle.with_reporter(reporter);
    }
    let mut personality = oracle.into_personality(format!("oracle-{}", side));
    personality.ctx = ctx;
    personality
}

/// Build the personality `config` asks for.
pub async fn from_config(config: &Config) -> Result<Personality, PersonalityError> {
    let personality = match &config.mode {
        Mode::Backend { endpoint, tls } => {
            backend_direct(endpoint, tls.as_ref(), config.limits, config.request_timeout).await?
        }
        Mode::Bridge { addrs } => bridge_direct(addrs.clone(), config.request_timeout)?,
        Mode::Oracle {
            side,
            endpoint,
            tls,
            addrs,
        } => {
            let backend =
                backend_direct(endpoint, tls.as_ref(), config.limits, config.request_timeout)
                    .await?;
            let bridge = bridge_direct(addrs.clone(), config.request_timeout)?;
            oracle_composed(*side, backend, bridge, None)
        }
    };
    tracing::info!(
        personality = %personality.name,
        dispatch = ?personality.dispatch,
        "personality ready"
    );
    Ok(personality)
}
