use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Source of wall-clock time for bucket arithmetic.
///
/// Buckets store absolute timestamps shared between processes, so the value
/// must be Unix time in nanoseconds, not a process-local monotonic reading.
pub trait Clock: Debug + Send + Sync {
    /// Current Unix time in nanoseconds.
    fn now_nanos(&self) -> u64;
}

/// Clock backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock, for tests and simulations.
///
/// ```
/// use std::time::Duration;
/// use quotabucket::{Clock, ManualClock};
///
/// let clock = ManualClock::new(0);
/// clock.advance(Duration::from_secs(61));
/// assert_eq!(clock.now_nanos(), 61_000_000_000);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `now_nanos`.
    pub fn new(now_nanos: u64) -> Self {
        Self {
            now: AtomicU64::new(now_nanos),
        }
    }

    /// Create a clock reading the current system time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now_nanos())
    }

    /// Set the current reading.
    pub fn set(&self, now_nanos: u64) {
        self.now.store(now_nanos, Ordering::SeqCst);
    }

    /// Move the reading forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
