//! Thread-blocking cancellation scopes.
//!
//! A [`CancelToken`] is the external scope a caller hands to
//! [`run_with_scope`](crate::run_with_scope), and also the run-scoped token a
//! run derives from it. Tokens form a tree: cancelling a token cancels every
//! live descendant with the same [`ScopeError`], while cancelling a child
//! never touches its parent.
//!
//! Deadlines are observed lazily. No timer thread is spawned; a token whose
//! deadline has passed settles itself with [`ScopeError::DeadlineExceeded`]
//! the first time anyone checks it, and blocked waiters use timed waits so
//! they wake up on time.

use core::fmt;
use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use portable_atomic::{AtomicBool, Ordering};

use crate::{
    error::ScopeError,
    mutex::{Condvar, Mutex, lock, wait, wait_until},
};

struct Node {
    cancelled: AtomicBool,
    // Already folded with every ancestor deadline.
    deadline: Option<Instant>,
    state: Mutex<NodeState>,
    cond: Condvar,
}

#[derive(Default)]
struct NodeState {
    reason: Option<ScopeError>,
    children: Vec<Weak<Node>>,
}

impl Node {
    fn new(deadline: Option<Instant>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            deadline,
            state: Mutex::new(NodeState::default()),
            cond: Condvar::new(),
        })
    }

    /// Records `reason` if the node is still live, wakes waiters and cascades
    /// to children. Returns `false` if another reason won.
    fn settle(&self, reason: ScopeError) -> bool {
        let children = {
            let mut state = lock(&self.state);
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason);
            self.cancelled.store(true, Ordering::Release);
            core::mem::take(&mut state.children)
        };
        self.cond.notify_all();

        for child in children {
            if let Some(child) = child.upgrade() {
                child.settle(reason);
            }
        }
        true
    }

    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    fn reason(&self) -> Option<ScopeError> {
        if !self.cancelled.load(Ordering::Acquire) {
            if !self.expired(Instant::now()) {
                return None;
            }
            self.settle(ScopeError::DeadlineExceeded);
        }
        lock(&self.state).reason
    }

    fn wait(&self) {
        let mut state = lock(&self.state);
        loop {
            if state.reason.is_some() {
                return;
            }
            match self.deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        drop(state);
                        self.settle(ScopeError::DeadlineExceeded);
                        return;
                    }
                    state = wait_until(&self.cond, state, deadline);
                }
                None => state = wait(&self.cond, state),
            }
        }
    }

    fn wait_before(&self, until: Instant) -> bool {
        let mut state = lock(&self.state);
        loop {
            if state.reason.is_some() {
                return true;
            }
            let now = Instant::now();
            if self.expired(now) {
                drop(state);
                self.settle(ScopeError::DeadlineExceeded);
                return true;
            }
            if now >= until {
                return false;
            }
            let wake_at = self.deadline.map_or(until, |deadline| deadline.min(until));
            state = wait_until(&self.cond, state, wake_at);
        }
    }

    fn attach(parent: &Arc<Self>, deadline: Option<Instant>) -> Arc<Self> {
        let deadline = match (parent.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let child = Self::new(deadline);

        let inherited = {
            let mut state = lock(&parent.state);
            match state.reason {
                Some(reason) => Some(reason),
                None => {
                    state.children.retain(|weak| weak.strong_count() > 0);
                    state.children.push(Arc::downgrade(&child));
                    None
                }
            }
        };
        if let Some(reason) = inherited {
            child.settle(reason);
        }
        child
    }
}

/// A cancellation scope that threads can check or block on.
///
/// Cloning is cheap and every clone refers to the same scope. The
/// [`Default`] token is [`CancelToken::never`].
///
/// # Example
/// ```
/// use spara::{CancelToken, ScopeError};
/// use std::time::Duration;
///
/// let parent = CancelToken::new();
/// let child = parent.child_with_timeout(Duration::from_secs(60));
///
/// parent.cancel();
/// assert!(child.is_cancelled());
/// assert_eq!(child.reason(), Some(ScopeError::Cancelled));
/// ```
#[derive(Clone, Default)]
pub struct CancelToken {
    node: Option<Arc<Node>>,
}

impl CancelToken {
    /// A scope that never completes.
    ///
    /// [`Self::cancel`] is a no-op on it and [`Self::can_complete`] returns
    /// `false`. Runs in such a scope spawn no watcher thread.
    pub const fn never() -> Self {
        Self { node: None }
    }

    /// A root scope that completes only when [`Self::cancel`] is called.
    pub fn new() -> Self {
        Self {
            node: Some(Node::new(None)),
        }
    }

    /// A root scope that completes at `deadline` or when cancelled.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            node: Some(Node::new(Some(deadline))),
        }
    }

    /// A root scope that completes after `timeout` or when cancelled.
    ///
    /// A timeout too large to represent as an [`Instant`] means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            node: Some(Node::new(Instant::now().checked_add(timeout))),
        }
    }

    /// Derives a child scope that completes with this one, or on its own
    /// [`Self::cancel`].
    pub fn child_token(&self) -> Self {
        self.derive(None)
    }

    /// Like [`Self::child_token`], additionally completing at `deadline`.
    ///
    /// The effective deadline is the earlier of `deadline` and any ancestor's.
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        self.derive(Some(deadline))
    }

    /// Like [`Self::child_token`], additionally completing after `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        self.derive(Instant::now().checked_add(timeout))
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let node = match &self.node {
            Some(parent) => Node::attach(parent, deadline),
            None => Node::new(deadline),
        };
        Self { node: Some(node) }
    }

    /// Cancels this scope and every live descendant.
    ///
    /// The first reason recorded wins; cancelling an already completed scope
    /// does nothing.
    pub fn cancel(&self) {
        if let Some(node) = &self.node {
            node.settle(ScopeError::Cancelled);
        }
    }

    /// `true` once the scope has completed for any reason.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Why the scope completed, or `None` while it is live.
    pub fn reason(&self) -> Option<ScopeError> {
        self.node.as_ref().and_then(|node| node.reason())
    }

    /// Blocks the calling thread until the scope completes.
    ///
    /// On [`CancelToken::never`] this blocks forever.
    pub fn wait(&self) {
        match &self.node {
            Some(node) => node.wait(),
            None => loop {
                std::thread::park();
            },
        }
    }

    /// Blocks for at most `timeout`; returns `true` if the scope completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(until) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        match &self.node {
            Some(node) => node.wait_before(until),
            None => {
                std::thread::sleep(timeout);
                false
            }
        }
    }

    /// The effective deadline, if this scope or an ancestor has one.
    pub fn deadline(&self) -> Option<Instant> {
        self.node.as_ref().and_then(|node| node.deadline)
    }

    /// `false` only for [`CancelToken::never`] and its clones.
    pub const fn can_complete(&self) -> bool {
        self.node.is_some()
    }

    /// Returns a guard that cancels this scope when dropped.
    pub fn drop_guard(self) -> DropGuard {
        DropGuard { token: Some(self) }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("can_complete", &self.can_complete())
            .field("reason", &self.reason())
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Cancels the wrapped [`CancelToken`] on drop, unwinding included.
#[derive(Debug)]
#[must_use = "dropping the guard cancels the token immediately"]
pub struct DropGuard {
    token: Option<CancelToken>,
}

impl DropGuard {
    /// Releases the token without cancelling it.
    pub fn disarm(mut self) -> CancelToken {
        self.token.take().unwrap_or_default()
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn never_does_not_complete() {
        let token = CancelToken::never();
        token.cancel();
        assert!(!token.can_complete());
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);
        assert!(!token.wait_timeout(Duration::from_millis(1)));
        assert!(!CancelToken::default().can_complete());
    }

    #[test]
    fn cancel_records_first_reason() {
        let token = CancelToken::new();
        assert!(token.can_complete());
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert_eq!(token.reason(), Some(ScopeError::Cancelled));
        assert!(token.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn parent_cancel_cascades_to_descendants() {
        let root = CancelToken::new();
        let child = root.child_token();
        let grandchild = child.child_token();

        root.cancel();
        assert_eq!(child.reason(), Some(ScopeError::Cancelled));
        assert_eq!(grandchild.reason(), Some(ScopeError::Cancelled));
    }

    #[test]
    fn child_cancel_leaves_parent_live() {
        let root = CancelToken::new();
        let child = root.child_token();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let root = CancelToken::new();
        root.cancel();
        let child = root.child_token();
        assert_eq!(child.reason(), Some(ScopeError::Cancelled));
    }

    #[test]
    fn child_of_never_is_independent_root() {
        let child = CancelToken::never().child_token();
        assert!(child.can_complete());
        assert!(!child.is_cancelled());
        child.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn dropped_children_are_pruned() {
        let root = CancelToken::new();
        for _ in 0..64 {
            drop(root.child_token());
        }
        let live = root.child_token();
        let node = root.node.as_ref().unwrap();
        assert_eq!(lock(&node.state).children.len(), 1);
        root.cancel();
        assert!(live.is_cancelled());
    }

    #[test]
    fn elapsed_deadline_reports_deadline_exceeded() {
        let token = CancelToken::with_deadline(Instant::now());
        assert_eq!(token.reason(), Some(ScopeError::DeadlineExceeded));
        token.cancel();
        assert_eq!(token.reason(), Some(ScopeError::DeadlineExceeded));
    }

    #[test]
    fn child_inherits_earlier_deadline() {
        let soon = Instant::now() + Duration::from_millis(20);
        let parent = CancelToken::with_deadline(soon);
        let child = parent.child_with_timeout(Duration::from_secs(3600));
        assert_eq!(child.deadline(), Some(soon));

        let later = CancelToken::with_timeout(Duration::from_secs(3600));
        let child = later.child_with_deadline(soon);
        assert_eq!(child.deadline(), Some(soon));
    }

    #[test]
    fn wait_returns_at_deadline() {
        let token = CancelToken::with_timeout(Duration::from_millis(20));
        let start = Instant::now();
        token.wait();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(token.reason(), Some(ScopeError::DeadlineExceeded));
    }

    #[test]
    fn wait_timeout_expires_on_live_token() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn wait_wakes_on_cancel_from_other_thread() {
        let token = CancelToken::new();
        let child = token.child_token();

        thread::scope(|s| {
            let waiter = s.spawn(|| {
                child.wait();
                child.reason()
            });
            thread::sleep(Duration::from_millis(10));
            token.cancel();
            assert_eq!(waiter.join().unwrap(), Some(ScopeError::Cancelled));
        });
    }

    #[test]
    fn drop_guard_cancels_and_disarm_does_not() {
        let token = CancelToken::new();
        drop(token.clone().drop_guard());
        assert!(token.is_cancelled());

        let token = CancelToken::new();
        let released = token.clone().drop_guard().disarm();
        assert!(!token.is_cancelled());
        assert!(!released.is_cancelled());
    }
}
