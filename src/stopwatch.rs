use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of completed intervals the smoothed rate averages over.
pub const RATE_WINDOW_LEN: usize = 3;

/// Periodic timer with a smoothed throughput rate.
///
/// [`add_unit`](Self::add_unit) counts work done in the current interval;
/// [`is_time_over`](Self::is_time_over) fires at most once per elapsed
/// timeout, rotating the current count into a fixed-length window and
/// recomputing `rate = total_units * 1000 / (window_entries * timeout_ms)`.
/// Callers that only need the timer simply never add units.
#[derive(Clone, Debug)]
pub struct RateStopwatch {
    timeout: Duration,
    last_time_check: Instant,
    units_this_interval: u64,
    interval_counts: VecDeque<u64>,
    rate_per_second: f64,
}

impl RateStopwatch {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_time_check: Instant::now(),
            units_this_interval: 0,
            interval_counts: VecDeque::with_capacity(RATE_WINDOW_LEN),
            rate_per_second: 0.0,
        }
    }

    pub fn add_unit(&mut self) {
        self.units_this_interval = self.units_this_interval.saturating_add(1);
    }

    pub fn add_units(&mut self, units: u64) {
        self.units_this_interval = self.units_this_interval.saturating_add(units);
    }

    /// Checks elapsed time since the last firing. On `elapsed >= timeout`
    /// the window rotates, the interval counter resets, the reference
    /// timestamp advances, and `true` is returned; otherwise `false` with
    /// no other effect.
    pub fn is_time_over(&mut self) -> bool {
        self.is_time_over_at(Instant::now())
    }

    fn is_time_over_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_time_check) < self.timeout {
            return false;
        }

        if self.interval_counts.len() == RATE_WINDOW_LEN {
            self.interval_counts.pop_front();
        }
        self.interval_counts.push_back(self.units_this_interval);
        self.units_this_interval = 0;
        self.last_time_check = now;
        self.recompute_rate();
        true
    }

    #[allow(clippy::cast_precision_loss)]
    fn recompute_rate(&mut self) {
        let entries = self.interval_counts.len();
        if entries == 0 {
            self.rate_per_second = 0.0;
            return;
        }

        let total_units: u64 = self.interval_counts.iter().sum();
        let window_ms = entries as f64 * self.timeout.as_millis() as f64;
        self.rate_per_second = if window_ms > 0.0 {
            total_units as f64 * 1_000.0 / window_ms
        } else {
            0.0
        };
    }

    /// Pure read of the last computed smoothed rate.
    #[must_use]
    pub const fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }
}
