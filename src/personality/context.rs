//! personality::context
//!
//! Cancellation scope shared by every call issued through a personality.

use std::sync::Arc;

use tokio::sync::watch;

/// A cancellable scope.
///
/// Clones share the same scope. Cancelling is sticky: once cancelled, every
/// current and future waiter on [`cancelled`](Self::cancelled) returns
/// immediately.
#[derive(Debug, Clone)]
pub struct RequestContext {
    state: Arc<watch::Sender<bool>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// A fresh, uncancelled scope.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: Arc::new(tx),
        }
    }

    /// A scope nobody outside the process cancels. The bridge client bounds
    /// each call with its own timeout instead.
    pub fn background() -> Self {
        Self::new()
    }

    /// A scope that is cancelled with `self`, and can also be cancelled alone.
    ///
    /// Must be called from within a tokio runtime.
    pub fn child(&self) -> RequestContext {
        let child = RequestContext::new();
        let parent = self.clone();
        let linked = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        child
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once the scope is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
