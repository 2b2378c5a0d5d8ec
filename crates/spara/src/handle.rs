use core::time::Duration;

use crate::{CancelToken, ScopeError};

/// Read-only view of a run's cancellation scope, passed to every work unit.
///
/// The handle reports cancellation once any of these happen: a unit fails,
/// the caller's scope completes, or the run returns. It cannot cancel the run
/// itself. Units that want to stop early check [`Self::is_cancelled`] or block
/// on [`Self::wait`]; nothing interrupts a unit that ignores it.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    token: CancelToken,
}

impl CancelHandle {
    pub(crate) const fn new(token: CancelToken) -> Self {
        Self { token }
    }

    /// `true` once the run has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the run was cancelled.
    ///
    /// A run stopped by a failing unit reports [`ScopeError::Cancelled`]; the
    /// unit's own error is what [`run`](crate::run) returns.
    pub fn reason(&self) -> Option<ScopeError> {
        self.token.reason()
    }

    /// Blocks until the run is cancelled.
    pub fn wait(&self) {
        self.token.wait();
    }

    /// Blocks for at most `timeout`; returns `true` if the run was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.token.wait_timeout(timeout)
    }

    /// Deadline inherited from the caller's scope, if any.
    pub fn deadline(&self) -> Option<std::time::Instant> {
        self.token.deadline()
    }

    /// Derives a scope that completes with the run, for handing to nested
    /// blocking work. Cancelling the child does not affect the run.
    pub fn child_token(&self) -> CancelToken {
        self.token.child_token()
    }
}
