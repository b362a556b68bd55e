use std::sync::atomic::{AtomicU8, Ordering};

use crate::QuotaBucketError;

const RUNNING: u8 = 0;
const STOPPED: u8 = 1;

/// Running/Stopped state shared by every operation of a store.
///
/// The only transition is Running → Stopped, taken by exactly one caller.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    /// Fail with [`QuotaBucketError::Stopped`] once the store is closed.
    #[inline]
    pub(crate) fn ensure_running(&self) -> Result<(), QuotaBucketError> {
        if self.is_stopped() {
            Err(QuotaBucketError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Returns `true` for the single caller that performs the transition, and
    /// therefore owns teardown.
    pub(crate) fn stop(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
