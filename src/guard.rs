use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot latch: the first `try_acquire` wins, every later call loses.
///
/// Never reset. Owned by a single controller, so separate controllers in the
/// same process do not interfere with each other.
#[derive(Debug, Default)]
pub struct ShutdownGuard {
    taken: AtomicBool,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` to exactly one caller for the lifetime of the guard.
    pub fn try_acquire(&self) -> bool {
        self.taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_acquired(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }
}
