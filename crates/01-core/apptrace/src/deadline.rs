//! Deadlines bounding every blocking call in the tracing core.
//!
//! A deadline is created per blocking operation and discarded afterwards. Only
//! `elapsed` changes after construction; it is refreshed by [`Deadline::check`].

use std::fmt;
use std::time::Duration;

use crate::platform::{Clock, SystemClock};
use crate::{TraceError, TraceResult};

/// Raw timeout value meaning "wait indefinitely".
pub const TIMEOUT_INFINITE_US: u32 = u32::MAX;

/// Upper bound of a wait, in microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Never expires.
    Infinite,
    /// Expires once this many microseconds have elapsed.
    Micros(u64),
}

impl Timeout {
    /// Converts a raw microsecond timeout; the all-ones value maps to [`Timeout::Infinite`].
    pub const fn from_us(us: u32) -> Self {
        if us == TIMEOUT_INFINITE_US {
            Timeout::Infinite
        } else {
            Timeout::Micros(us as u64)
        }
    }

    /// Raw microsecond form, saturating finite values just below the sentinel.
    pub fn as_us(self) -> u32 {
        match self {
            Timeout::Infinite => TIMEOUT_INFINITE_US,
            Timeout::Micros(us) => u32::try_from(us)
                .unwrap_or(TIMEOUT_INFINITE_US - 1)
                .min(TIMEOUT_INFINITE_US - 1),
        }
    }

    pub const fn is_infinite(self) -> bool {
        matches!(self, Timeout::Infinite)
    }
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        Timeout::Micros(u64::try_from(value.as_micros()).unwrap_or(u64::MAX))
    }
}

/// Monotonic interval tracker with an infinite mode.
#[derive(Clone, Copy)]
pub struct Deadline {
    clock: &'static dyn Clock,
    start: u64,
    limit: Timeout,
    elapsed: u64,
}

impl Deadline {
    /// Starts a deadline on the process-wide [`SystemClock`].
    pub fn new(limit: Timeout) -> Self {
        Self::with_clock(&SystemClock, limit)
    }

    pub fn with_clock(clock: &'static dyn Clock, limit: Timeout) -> Self {
        Self {
            clock,
            start: clock.now_us(),
            limit,
            elapsed: 0,
        }
    }

    pub fn infinite() -> Self {
        Self::new(Timeout::Infinite)
    }

    /// A deadline that allows exactly one attempt before reporting a timeout.
    pub fn immediate() -> Self {
        Self::new(Timeout::Micros(0))
    }

    pub fn from_us(us: u32) -> Self {
        Self::new(Timeout::from_us(us))
    }

    pub fn limit(&self) -> Timeout {
        self.limit
    }

    /// Time elapsed as of the last [`Deadline::check`].
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.elapsed)
    }

    /// Refreshes `elapsed` and reports whether the limit has been reached.
    ///
    /// A counter value below `start` is treated as a single wraparound of the
    /// underlying clock.
    pub fn check(&mut self) -> TraceResult<()> {
        let now = self.clock.now_us();
        self.elapsed = if now >= self.start {
            now - self.start
        } else {
            (self.clock.max_us() - self.start).saturating_add(now)
        };

        match self.limit {
            Timeout::Micros(limit) if self.elapsed >= limit => Err(TraceError::TimedOut),
            _ => Ok(()),
        }
    }

    /// Best-effort estimate of the time left, based on the last refresh.
    pub fn remaining(&self) -> Timeout {
        match self.limit {
            Timeout::Infinite => Timeout::Infinite,
            Timeout::Micros(limit) => Timeout::Micros(limit.saturating_sub(self.elapsed)),
        }
    }

    pub fn is_expired(&mut self) -> bool {
        self.check().is_err()
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::infinite()
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deadline")
            .field("start", &self.start)
            .field("limit", &self.limit)
            .field("elapsed", &self.elapsed)
            .finish()
    }
}
