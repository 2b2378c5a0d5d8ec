use portable_atomic::{AtomicUsize, Ordering};

/// Shared work cursor handing out indices in `[0, end)`.
///
/// Every worker is given its first index directly, so the counter starts at
/// `workers - 1` and the first claim returns `workers`. Claims are a single
/// `fetch_add`: strictly increasing, never reused, no locks.
///
/// Cancellation uses [`Cursor::force_exhaust`] to push the counter to `end`,
/// which makes every later claim report exhaustion without workers polling a
/// separate flag.
#[derive(Debug)]
pub(crate) struct Cursor {
    #[cfg(feature = "cache-padded")]
    next: crossbeam_utils::CachePadded<AtomicUsize>,
    #[cfg(not(feature = "cache-padded"))]
    next: AtomicUsize,
    end: usize,
}

impl Cursor {
    /// Creates a cursor for `workers` pre-seeded workers over `end` indices.
    ///
    /// `workers` must be in `1..=end`.
    pub(crate) fn new(workers: usize, end: usize) -> Self {
        debug_assert!(workers > 0 && workers <= end);
        let seed = workers - 1;
        Self {
            #[cfg(feature = "cache-padded")]
            next: crossbeam_utils::CachePadded::new(AtomicUsize::new(seed)),
            #[cfg(not(feature = "cache-padded"))]
            next: AtomicUsize::new(seed),
            end,
        }
    }

    /// Claims the next unclaimed index, or `None` once the range is
    /// exhausted (naturally or forced).
    #[inline]
    pub(crate) fn claim_next(&self) -> Option<usize> {
        // `end <= isize::MAX` and at most one failed claim per worker lands
        // past `end`, so this never wraps.
        let index = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        (index < self.end).then_some(index)
    }

    /// Makes every subsequent [`Self::claim_next`] report exhaustion.
    ///
    /// Idempotent, and never moves the counter backwards.
    #[inline]
    pub(crate) fn force_exhaust(&self) {
        self.next.fetch_max(self.end, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn end(&self) -> usize {
        self.end
    }
}
