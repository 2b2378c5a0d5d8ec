use std::{panic, thread};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    CancelHandle, CancelToken, Error,
    cursor::Cursor,
    state::CancellationState,
    worker::{Shared, worker_loop},
};

/// Largest iteration count a run accepts.
///
/// Anything above `isize::MAX` is rejected with [`Error::InvalidIterations`],
/// which also catches negative signed counts converted with `as usize`.
pub const MAX_ITERATIONS: usize = isize::MAX as usize;

/// A fully described run: worker budget, iteration count and mapping
/// function.
///
/// The free functions [`run`] and [`run_with_scope`] cover the common cases.
/// `WorkSpec` is for callers assembling a run from optional parts, where a
/// missing function or scope should surface as an error rather than a panic.
///
/// # Example
/// ```
/// use spara::{CancelToken, Error, WorkSpec};
///
/// let inputs = [1, 2, 3, 4];
/// let spec = WorkSpec::new(2, inputs.len(), |_, i: usize| {
///     if inputs[i] > 0 { Ok(()) } else { Err(i) }
/// });
/// assert_eq!(spec.run_in(Some(&CancelToken::new())), Ok(()));
///
/// let missing = WorkSpec::<fn(&spara::CancelHandle, usize) -> Result<(), ()>> {
///     workers: 2,
///     iterations: 4,
///     map: None,
/// };
/// assert_eq!(missing.run(), Err(Error::MissingMappingFunction));
/// ```
#[derive(Clone, Debug)]
pub struct WorkSpec<F> {
    /// Maximum number of worker threads. Clamped to `iterations`.
    pub workers: usize,
    /// Indices `0..iterations` are each processed exactly once.
    pub iterations: usize,
    /// Called as `map(handle, index)` for every index.
    pub map: Option<F>,
}

impl<F> WorkSpec<F> {
    pub fn new<E>(workers: usize, iterations: usize, map: F) -> Self
    where
        F: Fn(&CancelHandle, usize) -> Result<(), E>,
    {
        Self {
            workers,
            iterations,
            map: Some(map),
        }
    }

    /// Runs in a scope that never completes.
    ///
    /// # Errors
    ///
    /// See [`Self::run_in`]; [`Error::MissingScope`] and [`Error::Scope`] are
    /// never returned.
    pub fn run<E>(self) -> Result<(), Error<E>>
    where
        F: Fn(&CancelHandle, usize) -> Result<(), E> + Sync,
        E: Send,
    {
        self.run_in(Some(&CancelToken::never()))
    }

    /// Runs inside `scope`, which is required.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidWorkers`] if `workers == 0`.
    /// - [`Error::InvalidIterations`] if `iterations > MAX_ITERATIONS`.
    /// - [`Error::MissingMappingFunction`] if `map` is `None`.
    /// - [`Error::MissingScope`] if `scope` is `None`.
    /// - [`Error::Scope`] if `scope` completed before or during the run and
    ///   no unit failed first.
    /// - [`Error::Work`] with the first error a unit returned.
    ///
    /// # Panics
    ///
    /// If a unit panics, the remaining workers stop claiming new indices and
    /// the panic is resumed on the calling thread once every thread has
    /// joined.
    pub fn run_in<E>(self, scope: Option<&CancelToken>) -> Result<(), Error<E>>
    where
        F: Fn(&CancelHandle, usize) -> Result<(), E> + Sync,
        E: Send,
    {
        if self.workers == 0 {
            return Err(Error::InvalidWorkers);
        }
        if self.iterations > MAX_ITERATIONS {
            return Err(Error::InvalidIterations);
        }
        let Some(map) = self.map else {
            return Err(Error::MissingMappingFunction);
        };
        let Some(scope) = scope else {
            return Err(Error::MissingScope);
        };

        execute(scope, self.workers, self.iterations, &map)
    }
}

/// Calls `f` with every index in `0..iterations` on up to `workers` threads.
///
/// The first error returned by `f` stops dispatch of new indices; calls
/// already in flight finish, then that error is returned. Side effects across
/// indices are unordered, but each index is passed to `f` exactly once unless
/// the run stops early.
///
/// # Errors
///
/// [`Error::InvalidWorkers`], [`Error::InvalidIterations`], or
/// [`Error::Work`] with the first unit error.
///
/// # Example
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// let inputs = [1, 2, 3, 4, 5];
/// let outputs: Vec<AtomicU64> = inputs.iter().map(|_| AtomicU64::new(0)).collect();
///
/// spara::run(5, inputs.len(), |i| {
///     outputs[i].store(inputs[i] * 2, Ordering::Relaxed);
///     Ok::<_, ()>(())
/// })
/// .unwrap();
///
/// let outputs: Vec<u64> = outputs.into_iter().map(AtomicU64::into_inner).collect();
/// assert_eq!(outputs, [2, 4, 6, 8, 10]);
/// ```
pub fn run<F, E>(workers: usize, iterations: usize, f: F) -> Result<(), Error<E>>
where
    F: Fn(usize) -> Result<(), E> + Sync,
    E: Send,
{
    WorkSpec::new(workers, iterations, move |_: &CancelHandle, index| f(index)).run()
}

/// Like [`run`], inside a caller-supplied cancellation scope.
///
/// `f` receives a [`CancelHandle`] that reports cancellation when a unit
/// fails, when `scope` completes, or when the run returns. If `scope` stops
/// the run, its [`ScopeError`](crate::ScopeError) is returned; if the run
/// finished naturally first, the result is `Ok(())` even if `scope`
/// completes right afterwards.
///
/// # Errors
///
/// See [`WorkSpec::run_in`].
///
/// # Example
/// ```
/// use spara::{CancelToken, Error, ScopeError};
///
/// let scope = CancelToken::new();
/// scope.cancel();
///
/// let result = spara::run_with_scope(&scope, 4, 100, |_, _| Ok::<_, ()>(()));
/// assert_eq!(result, Err(Error::Scope(ScopeError::Cancelled)));
/// ```
pub fn run_with_scope<F, E>(
    scope: &CancelToken,
    workers: usize,
    iterations: usize,
    f: F,
) -> Result<(), Error<E>>
where
    F: Fn(&CancelHandle, usize) -> Result<(), E> + Sync,
    E: Send,
{
    WorkSpec::new(workers, iterations, f).run_in(Some(scope))
}

#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip(scope, map), fields(can_complete = scope.can_complete()))
)]
fn execute<F, E>(
    scope: &CancelToken,
    workers: usize,
    iterations: usize,
    map: &F,
) -> Result<(), Error<E>>
where
    F: Fn(&CancelHandle, usize) -> Result<(), E> + Sync,
    E: Send,
{
    if iterations == 0 {
        return Ok(());
    }
    let workers = workers.min(iterations);

    if let Some(reason) = scope.reason() {
        #[cfg(feature = "tracing")]
        tracing::debug!("Scope already completed ({reason}), nothing dispatched");
        return Err(Error::Scope(reason));
    }

    let cursor = Cursor::new(workers, iterations);
    let run_token = scope.child_token();
    let state = CancellationState::new(&cursor, run_token.clone());
    let handle = state.handle();
    let shared = Shared {
        cursor: &cursor,
        state: &state,
        handle: &handle,
        map,
    };

    let result = thread::scope(|s| {
        // Cancelled on every exit path, so the watcher below always returns.
        let _run_guard = run_token.clone().drop_guard();

        if scope.can_complete() {
            let run_token = &run_token;
            let state = &state;
            s.spawn(move || {
                run_token.wait();
                state.observe_external_done();
            });
        }

        let shared = &shared;
        let handles: Vec<_> = (0..workers)
            .map(|worker_id| s.spawn(move || worker_loop(worker_id, worker_id, shared)))
            .collect();

        let mut panicked = None;
        for handle in handles {
            if let Err(payload) = handle.join() {
                panicked.get_or_insert(payload);
            }
        }
        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }

        state.resolve(scope)
    });

    #[cfg(feature = "tracing")]
    match &result {
        Ok(()) => tracing::debug!("Run completed"),
        Err(Error::Work(_)) => tracing::debug!(
            "Run stopped by failing unit ({} later errors dropped)",
            state.suppressed()
        ),
        Err(Error::Scope(reason)) => tracing::debug!("Run stopped by scope ({reason})"),
        Err(_) => {}
    }

    result
}
