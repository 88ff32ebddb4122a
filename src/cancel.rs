//! External cancellation signal (§5 "Cancellation / timeouts"; the `ctx`
//! parameter of §6's external interface), built on the same
//! `tokio::sync::watch` primitive already used for the maintenance
//! sweeper's shutdown signal.

use crate::error::{EngineError, Result};

/// Cancellation handle threaded through every operation §6 lists with a
/// leading `ctx` parameter. Cloning is cheap; every clone observes the
/// same underlying signal.
#[derive(Clone)]
pub struct CancelToken(tokio::sync::watch::Receiver<bool>);

impl CancelToken {
    pub fn new(receiver: tokio::sync::watch::Receiver<bool>) -> Self {
        Self(receiver)
    }

    /// A token that never fires, for callers with no cancellation source.
    pub fn never() -> Self {
        Self(tokio::sync::watch::channel(false).1)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// `Err(EngineError::Cancelled)` once the signal has fired, `Ok(())`
    /// otherwise. Call at operation entry and at loop checkpoints inside
    /// long scans so in-flight iterators are dropped promptly.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}
