use crate::{CancelHandle, cursor::Cursor, state::CancellationState};

/// Everything a worker borrows from the orchestrator for one run.
pub(crate) struct Shared<'r, F, E> {
    pub(crate) cursor: &'r Cursor,
    pub(crate) state: &'r CancellationState<'r, E>,
    pub(crate) handle: &'r CancelHandle,
    pub(crate) map: &'r F,
}

/// Stops the rest of the pool if the owning worker unwinds out of a unit.
struct AbortOnUnwind<'a, 'r, E>(&'a CancellationState<'r, E>);

impl<E> Drop for AbortOnUnwind<'_, '_, E> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.abort();
        }
    }
}

/// Runs units starting at `start`, then keeps claiming indices until the
/// cursor is exhausted or a unit fails.
///
/// A failing unit settles the run and ends this worker immediately; the
/// worker never re-checks cancellation between claim and invoke, so a unit
/// that has been claimed always runs.
///
/// # Arguments
///
/// - `worker_id`: index of this worker in the pool, for logs.
/// - `start`: pre-assigned first index, `< iterations`.
/// - `shared`: cursor, state, handle and mapping function of the run.
pub(crate) fn worker_loop<F, E>(worker_id: usize, start: usize, shared: &Shared<'_, F, E>)
where
    F: Fn(&CancelHandle, usize) -> Result<(), E>,
{
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started at index {start}");
    #[cfg(not(feature = "tracing"))]
    let _ = worker_id;

    let _guard = AbortOnUnwind(shared.state);
    let mut units = 0_usize;
    let mut next = Some(start);

    while let Some(index) = next {
        units += 1;
        if let Err(err) = (shared.map)(shared.handle, index) {
            #[cfg(feature = "tracing")]
            tracing::trace!("Worker {worker_id} unit {index} failed");
            shared.state.try_cancel_locally(err);
            break;
        }
        next = shared.cursor.claim_next();
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped after {units} units");
    #[cfg(not(feature = "tracing"))]
    let _ = units;
}
