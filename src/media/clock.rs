use std::sync::OnceLock;
use std::time::Instant;

/// Tick frequency of the monotonic clock, in ticks per second.
pub const TICKS_PER_SECOND: u64 = 1_000_000_000;

/// A QPC-style monotonic tick source
///
/// Jitter rows carry raw `(ticks, frequency)` pairs from both peers so
/// the consumer can convert without trusting either host's wall clock.
/// Frequency is fixed at nanosecond resolution.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Ticks elapsed since this clock was created.
    pub fn ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    pub const fn frequency(&self) -> u64 {
        TICKS_PER_SECOND
    }

    /// The process-wide clock; every component stamps against the same
    /// origin.
    pub fn global() -> &'static MonotonicClock {
        static GLOBAL: OnceLock<MonotonicClock> = OnceLock::new();
        GLOBAL.get_or_init(MonotonicClock::new)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
