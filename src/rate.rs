use std::time::{Duration, Instant};

/// Decision for one send request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// The bytes fit in the current period's budget
    Now,
    /// Re-ask no earlier than this instant
    At(Instant),
}

/// Token-bucket pacing for a single connection's send direction
///
/// A budget of `bytes_per_second` is granted in period-sized slices. A
/// send either fits into the current period or is deferred to the start
/// of the next one; the connection driver sleeps on a timer rather than
/// blocking a worker. A zero rate disables pacing entirely.
#[derive(Debug)]
pub struct RateLimiter {
    budget_per_period: u64,
    period: Duration,
    window_start: Instant,
    spent: u64,
}

impl RateLimiter {
    pub fn new(bytes_per_second: u64, period_ms: u64) -> Self {
        let period = Duration::from_millis(period_ms);
        let budget_per_period = if bytes_per_second == 0 {
            0
        } else {
            // Never let a nonzero rate collapse to a zero budget.
            (bytes_per_second * period_ms / 1000).max(1)
        };
        Self {
            budget_per_period,
            period,
            window_start: Instant::now(),
            spent: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, crate::config::DEFAULT_RATE_PERIOD_MS)
    }

    pub fn is_disabled(&self) -> bool {
        self.budget_per_period == 0
    }

    /// Asks when `bytes` may be sent.
    ///
    /// `Gate::At` does not reserve budget; the caller re-asks once the
    /// deadline passes.
    pub fn schedule(&mut self, bytes: u64, now: Instant) -> Gate {
        if self.is_disabled() {
            return Gate::Now;
        }

        if now >= self.window_start + self.period {
            let elapsed = now.duration_since(self.window_start);
            let periods = elapsed.as_nanos() / self.period.as_nanos();
            self.window_start += self.period * periods as u32;
            // Each elapsed period forgives one budget's worth. Unspent
            // budget is never banked; overspend drains at the configured
            // rate before new bytes are admitted.
            self.spent = self
                .spent
                .saturating_sub(periods as u64 * self.budget_per_period);
        }

        // A task larger than the whole budget is charged against an empty
        // period; otherwise it could never be sent. The excess lingers as
        // debt for the following periods.
        if self.spent + bytes <= self.budget_per_period
            || (self.spent == 0 && bytes > self.budget_per_period)
        {
            self.spent += bytes;
            Gate::Now
        } else {
            Gate::At(self.window_start + self.period)
        }
    }
}
