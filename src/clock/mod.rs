use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of timestamps for records, beacons, and send scheduling.
///
/// Implementations must return UTC wall-clock milliseconds. Tests substitute
/// a settable clock to drive time-dependent behavior deterministically.
pub trait TimingProvider: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl TimingProvider for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Source of session numbers.
///
/// Numbers must be monotonic per process; wrapping at `i32::MAX` is
/// permitted.
pub trait SessionIdProvider: Send + Sync {
    /// Next session number.
    fn next_session_id(&self) -> i32;
}

/// Process-wide sequential session id source starting at 1.
#[derive(Debug)]
pub struct SequentialSessionIdProvider {
    next: AtomicI32,
}

impl SequentialSessionIdProvider {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }
}

impl Default for SequentialSessionIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIdProvider for SequentialSessionIdProvider {
    fn next_session_id(&self) -> i32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
