use portable_atomic::{AtomicU8, AtomicUsize, Ordering};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    CancelHandle, CancelToken, Error, ScopeError,
    cursor::Cursor,
    mutex::{Mutex, lock},
};

const RUNNING: u8 = 0;
const LOCAL_FAIL: u8 = 1;
const EXTERNAL_CANCEL: u8 = 2;
const RESOLVED: u8 = 3;

/// Per-run arbitration between a failing unit, the caller's scope completing,
/// and the run finishing on its own.
///
/// The tag leaves `RUNNING` exactly once through a compare-exchange. Whoever
/// wins decides the run's result; every later contender is a no-op.
pub(crate) struct CancellationState<'c, E> {
    tag: AtomicU8,
    first_err: Mutex<Option<E>>,
    suppressed: AtomicUsize,
    cursor: &'c Cursor,
    run_token: CancelToken,
}

impl<'c, E> CancellationState<'c, E> {
    /// `run_token` must be a scope derived for this run alone; settling the
    /// state cancels it.
    pub(crate) fn new(cursor: &'c Cursor, run_token: CancelToken) -> Self {
        Self {
            tag: AtomicU8::new(RUNNING),
            first_err: Mutex::new(None),
            suppressed: AtomicUsize::new(0),
            cursor,
            run_token,
        }
    }

    #[inline]
    fn transition(&self, to: u8) -> bool {
        self.tag
            .compare_exchange(RUNNING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records `err` as the run's result if no other cause has settled yet.
    ///
    /// On success the cursor is exhausted and the run handle is cancelled.
    /// Returns `false` (dropping `err`) if another cause won.
    pub(crate) fn try_cancel_locally(&self, err: E) -> bool {
        if !self.transition(LOCAL_FAIL) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            tracing::debug!("Dropping unit error, run already settled");
            return false;
        }

        self.cursor.force_exhaust();
        *lock(&self.first_err) = Some(err);
        self.run_token.cancel();

        #[cfg(feature = "tracing")]
        tracing::debug!("Run cancelled by failing unit");
        true
    }

    /// Called by the watcher once the run token completes. Wins only if the
    /// caller's scope completed before any unit failed and before the run
    /// resolved.
    pub(crate) fn observe_external_done(&self) -> bool {
        // Forcing exhaustion twice is harmless, so only the winner bothers.
        if self.transition(EXTERNAL_CANCEL) {
            self.cursor.force_exhaust();
            #[cfg(feature = "tracing")]
            tracing::debug!("Run cancelled by external scope");
            true
        } else {
            false
        }
    }

    /// Stops dispatch without settling, used while a worker unwinds.
    pub(crate) fn abort(&self) {
        self.cursor.force_exhaust();
        self.run_token.cancel();
    }

    pub(crate) fn handle(&self) -> CancelHandle {
        CancelHandle::new(self.run_token.clone())
    }

    /// Unit errors discarded because another cause had already settled.
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    pub(crate) fn suppressed(&self) -> usize {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Final arbitration. Must run after every worker has joined and before
    /// the run token is cancelled on the way out.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all))]
    pub(crate) fn resolve(&self, scope: &CancelToken) -> Result<(), Error<E>> {
        if let Some(err) = lock(&self.first_err).take() {
            return Err(Error::Work(err));
        }

        if !scope.can_complete() {
            return Ok(());
        }

        if self.transition(RESOLVED) {
            return Ok(());
        }

        let reason = scope
            .reason()
            .or_else(|| self.run_token.reason())
            .unwrap_or(ScopeError::Cancelled);
        Err(Error::Scope(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_local_failure_wins() {
        let cursor = Cursor::new(2, 10);
        let token = CancelToken::new();
        let state = CancellationState::new(&cursor, token.child_token());
        let handle = state.handle();

        assert!(state.try_cancel_locally("first"));
        assert!(!state.try_cancel_locally("second"));
        assert!(!state.observe_external_done());
        assert_eq!(state.suppressed(), 1);

        assert!(handle.is_cancelled());
        assert_eq!(cursor.claim_next(), None);
        assert!(!token.is_cancelled());
        assert_eq!(state.resolve(&token), Err(Error::Work("first")));
    }

    #[test]
    fn external_done_blocks_later_local_failure() {
        let cursor = Cursor::new(1, 10);
        let token = CancelToken::new();
        let state = CancellationState::new(&cursor, token.child_token());

        token.cancel();
        assert!(state.observe_external_done());
        assert!(!state.try_cancel_locally("late"));
        assert_eq!(cursor.claim_next(), None);
        assert_eq!(
            state.resolve(&token),
            Err(Error::Scope(ScopeError::Cancelled))
        );
    }

    #[test]
    fn natural_completion_beats_late_watcher() {
        let cursor = Cursor::new(1, 1);
        let token = CancelToken::new();
        let state = CancellationState::<&str>::new(&cursor, token.child_token());

        assert_eq!(state.resolve(&token), Ok(()));
        token.cancel();
        assert!(!state.observe_external_done());
    }

    #[test]
    fn never_scope_resolves_ok_without_transition() {
        let cursor = Cursor::new(1, 1);
        let scope = CancelToken::never();
        let state = CancellationState::<()>::new(&cursor, scope.child_token());
        assert_eq!(state.resolve(&scope), Ok(()));
        assert_eq!(state.tag.load(Ordering::Relaxed), RUNNING);
    }

    #[test]
    fn abort_stops_dispatch_without_settling() {
        let cursor = Cursor::new(1, 10);
        let scope = CancelToken::never();
        let state = CancellationState::new(&cursor, scope.child_token());
        let handle = state.handle();

        state.abort();
        assert!(handle.is_cancelled());
        assert_eq!(cursor.claim_next(), None);
        assert!(state.try_cancel_locally(7));
        assert_eq!(state.resolve(&scope), Err(Error::Work(7)));
    }
}
