//! personality
//!
//! The uniform capability pair the server drives, and the constructors that
//! choose what sits behind it.
//!
//! # Architecture
//!
//! A [`Personality`] bundles an [`AuthCapability`], a [`HandlerFactory`],
//! the [`RequestContext`] its backend calls inherit, and how the server
//! should dispatch requests to it. Exactly one is built per process:
//!
//! - backend-direct: the protocol served from a flat keyspace
//! - bridge-direct: every session forwarded to an upstream ensemble
//! - oracle-composed: both, with one answering and the other cross-checked
//!
//! # Modules
//!
//! - `context`: cancellation scope
//! - `traits`: capability traits and session types
//! - `factory`: personality construction
//! - [`mock`]: scripted personality for tests

mod context;
mod factory;
pub mod mock;
mod traits;

pub use context::RequestContext;
pub use factory::{
    backend_direct, bridge_direct, from_config, from_store, oracle_composed, OracleSide,
    PersonalityError,
};
pub use traits::*;

use std::fmt;
use std::sync::Arc;

/// How the server hands requests to a personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Sessions run independently.
    Concurrent,
    /// One request at a time across the whole process, connects included.
    Serialized,
}

/// A backend as the server sees it.
#[derive(Clone)]
pub struct Personality {
    /// Name for logs (e.g., "etcd", "bridge", "oracle-zk").
    pub name: String,
    pub auth: Arc<dyn AuthCapability>,
    pub handlers: Arc<dyn HandlerFactory>,
    pub ctx: RequestContext,
    pub dispatch: DispatchMode,
}

impl Personality {
    /// A concurrently dispatched personality.
    pub fn new(
        name: impl Into<String>,
        auth: Arc<dyn AuthCapability>,
        handlers: Arc<dyn HandlerFactory>,
        ctx: RequestContext,
    ) -> Self {
        Self {
            name: name.into(),
            auth,
            handlers,
            ctx,
            dispatch: DispatchMode::Concurrent,
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }
}

impl fmt::Debug for Personality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Personality")
            .field("name", &self.name)
            .field("dispatch", &self.dispatch)
            .field("cancelled", &self.ctx.is_cancelled())
            .finish()
    }
}
