//! server
//!
//! Accepts client connections and drives a [`Personality`].
//!
//! # Dispatch
//!
//! - [`DispatchMode::Concurrent`]: every session runs on its own task and
//!   requests of different sessions overlap freely.
//! - [`DispatchMode::Serialized`]: sessions still get their own tasks, but a
//!   process-wide gate admits one step at a time, connects included.
//!
//! Requests within one session are always answered in order.
//!
//! # Example
//!
//! ```no_run
//! use zetcd::personality::from_store;
//! use zetcd::backend::{MemStore, SessionLimits};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let personality = from_store(Arc::new(MemStore::new()), SessionLimits::default()).await?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:2181").await?;
//! zetcd::server::serve(listener, personality).await?;
//! # Ok(())
//! # }
//! ```

mod session;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::personality::{DispatchMode, Personality};
use crate::proto::CodecError;

/// Errors ending a session or the server.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] CodecError),
}

/// Serve clients from `listener` until the personality's scope is cancelled.
///
/// # Errors
///
/// Only failures of the listener itself end the server; session errors are
/// logged and close that session alone.
pub async fn serve(listener: TcpListener, personality: Personality) -> Result<(), ServeError> {
    let gate = match personality.dispatch {
        DispatchMode::Concurrent => None,
        DispatchMode::Serialized => Some(Arc::new(Mutex::new(()))),
    };
    let ctx = personality.ctx.clone();
    tracing::info!(
        addr = %listener.local_addr()?,
        personality = %personality.name,
        dispatch = ?personality.dispatch,
        "serving"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        // Back off on descriptor exhaustion.
                        tracing::warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let personality = personality.clone();
                let gate = gate.clone();
                tokio::spawn(async move {
                    if let Err(err) = session::run(stream, peer, personality, gate).await {
                        tracing::debug!(%peer, error = %err, "session closed with error");
                    }
                });
            }
            _ = ctx.cancelled() => {
                tracing::info!("shutting down");
                return Ok(());
            }
        }
    }
}
