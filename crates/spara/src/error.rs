//! Error types returned by [`run`](crate::run) and friends.
//!
//! A run reports exactly one cause. Input validation errors are returned
//! before any thread is spawned; otherwise the result is either the first
//! error a work unit returned ([`Error::Work`]) or the termination reason of
//! the caller's scope ([`Error::Scope`]).

/// Why a [`CancelToken`](crate::CancelToken) completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum ScopeError {
    /// The scope, or one of its ancestors, was cancelled explicitly.
    #[error("scope cancelled")]
    Cancelled,

    /// The scope's deadline, or an ancestor's, has passed.
    #[error("scope deadline exceeded")]
    DeadlineExceeded,
}

/// All errors a run can produce.
///
/// `E` is the error type of the mapping function. It is surfaced verbatim in
/// [`Error::Work`]; no wrapping or conversion is applied.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error<E> {
    /// The worker budget was zero.
    #[error("spara: invalid number of workers")]
    InvalidWorkers,

    /// The iteration count exceeds [`MAX_ITERATIONS`].
    ///
    /// A negative signed count cast with `as usize` always lands here.
    ///
    /// [`MAX_ITERATIONS`]: crate::MAX_ITERATIONS
    #[error("spara: invalid number of iterations")]
    InvalidIterations,

    /// [`WorkSpec::map`](crate::WorkSpec::map) was `None`.
    #[error("spara: mapping function must be provided")]
    MissingMappingFunction,

    /// [`WorkSpec::run_in`](crate::WorkSpec::run_in) was given no scope.
    #[error("spara: cancellation scope must be provided")]
    MissingScope,

    /// The first error returned by a work unit.
    #[error("{0}")]
    Work(E),

    /// The caller's scope completed before the run finished naturally.
    #[error("{0}")]
    Scope(ScopeError),
}

impl<E> Error<E> {
    /// Returns the work unit's error, if that is what stopped the run.
    pub fn into_work(self) -> Option<E> {
        match self {
            Self::Work(err) => Some(err),
            _ => None,
        }
    }

    /// Borrowing variant of [`Self::into_work`].
    pub const fn work(&self) -> Option<&E> {
        match self {
            Self::Work(err) => Some(err),
            _ => None,
        }
    }

    /// Returns the scope's termination reason, if that is what stopped the
    /// run.
    pub const fn scope(&self) -> Option<ScopeError> {
        match self {
            Self::Scope(reason) => Some(*reason),
            _ => None,
        }
    }

    /// `true` for the errors returned before any work was dispatched because
    /// the arguments were unusable.
    pub const fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidWorkers
                | Self::InvalidIterations
                | Self::MissingMappingFunction
                | Self::MissingScope
        )
    }
}

impl<E> From<ScopeError> for Error<E> {
    fn from(reason: ScopeError) -> Self {
        Self::Scope(reason)
    }
}
