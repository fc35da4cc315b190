//! Time sources for sampling and ramp scheduling.

use core::cell::Cell;

use chrono::{NaiveDateTime, TimeDelta};

/// Millisecond resolution duration used throughout the crate.
pub type Duration = fugit::MillisDurationU64;
/// Millisecond resolution monotonic instant.
pub type Instant = fugit::TimerInstantU64<1000>;

/// Where sessions get the time from.
pub trait Clock {
    /// Monotonic time, only meaningful relative to other readings of the same clock.
    fn now(&self) -> Instant;

    /// Block for `duration`.
    fn sleep(&self, duration: Duration);

    /// Wall-clock time for sample records.
    fn timestamp(&self) -> NaiveDateTime;

    /// Time passed since `earlier`.
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now() - earlier
    }
}

/// Seconds as a float, for logging and rate calculations.
pub fn as_secs_f64(duration: Duration) -> f64 {
    duration.to_millis() as f64 / 1000.0
}

/// The host's clocks.
#[derive(Debug)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.origin.elapsed().as_millis() as u64)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(std::time::Duration::from_millis(duration.to_millis()));
    }

    fn timestamp(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// A clock that only moves when slept on or advanced.
///
/// Useful for dry runs and tests, where a multi-hour stage plan should finish instantly.
#[derive(Debug)]
pub struct ManualClock {
    elapsed_ms: Cell<u64>,
    epoch: NaiveDateTime,
}

impl ManualClock {
    /// Start at `epoch` wall-clock time.
    pub fn new(epoch: NaiveDateTime) -> Self {
        Self {
            elapsed_ms: Cell::new(0),
            epoch,
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.elapsed_ms
            .set(self.elapsed_ms.get() + duration.to_millis());
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(NaiveDateTime::default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.elapsed_ms.get())
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn timestamp(&self) -> NaiveDateTime {
        self.epoch + TimeDelta::milliseconds(self.elapsed_ms.get() as i64)
    }
}
