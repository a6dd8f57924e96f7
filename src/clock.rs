//! Challenge timestamps
//!
//! Challenges carry the wall-clock time of their construction in
//! milliseconds since the Unix epoch. The verifier uses that value for
//! freshness and replay windows, so within one process it must never repeat
//! or go backwards, even if the system clock is stepped.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of challenge timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock that only moves forward.
///
/// Each call returns `max(wall_time, last + 1)`, so successive challenges
/// from one clock are strictly ordered.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_issued_ms: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = wall_time_ms();
        let mut last = self.last_issued_ms.load(Ordering::SeqCst);
        loop {
            let next = wall.max(last.saturating_add(1));
            match self.last_issued_ms.compare_exchange(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Timestamp(next),
                Err(observed) => last = observed,
            }
        }
    }
}

/// Clock frozen at one instant, for golden-value tests and replays.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Timestamp);

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.0
    }
}

/// Get milliseconds since the Unix epoch (0 if the clock is before it)
fn wall_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
