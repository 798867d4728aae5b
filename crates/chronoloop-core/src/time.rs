//! Monotonic microsecond clock sources.
//!
//! Loopers and media clocks never read the system clock directly. They hold a
//! [`SharedClock`] so that tests and simulations can substitute a
//! [`ManualClock`] for the default [`MonotonicClock`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// A source of monotonic timestamps in microseconds.
pub trait ClockSource: Send + Sync {
    /// Current time in microseconds. Never decreases.
    fn now_us(&self) -> i64;
}

/// Clock handle shared between loopers and clocks.
pub type SharedClock = Arc<dyn ClockSource>;

/// Process-wide monotonic clock backed by [`Instant`].
///
/// Timestamps count microseconds since the first time any `MonotonicClock`
/// was read in this process, so they are always non-negative.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    fn epoch() -> Instant {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        *EPOCH.get_or_init(Instant::now)
    }

    /// A shared handle to the monotonic clock.
    pub fn shared() -> SharedClock {
        Arc::new(MonotonicClock)
    }
}

impl ClockSource for MonotonicClock {
    fn now_us(&self) -> i64 {
        let elapsed = Self::epoch().elapsed().as_micros();
        i64::try_from(elapsed).unwrap_or(i64::MAX)
    }
}

/// Current monotonic time in microseconds.
pub fn now_us() -> i64 {
    MonotonicClock.now_us()
}

/// A clock that only moves when told to.
///
/// Used to drive the media clock deterministically. Loopers built on a manual
/// clock should also set a poll interval, since advancing the clock does not
/// wake a worker that is already waiting.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a manual clock reading `start_us`.
    pub fn new(start_us: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_us),
        })
    }

    /// Set the current time. Values earlier than the current reading are ignored.
    pub fn set(&self, now_us: i64) {
        self.now.fetch_max(now_us, Ordering::SeqCst);
    }

    /// Move the clock forward by `delta_us` (negative deltas are ignored).
    pub fn advance(&self, delta_us: i64) {
        if delta_us > 0 {
            let _ = self
                .now
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                    Some(now.saturating_add(delta_us))
                });
        }
    }
}

impl ClockSource for ManualClock {
    fn now_us(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
