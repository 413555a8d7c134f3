use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// One recorded invocation: elapsed milliseconds plus whether the timed
/// operation failed. Failed samples still count toward latency statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Sample {
    value_ms: f64,
    failed: bool,
}

/// Outlier judgment for a sample, relative to the window it arrived into.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outlier {
    /// Deviation reached `threshold * stddev`; `deviations` is the whole
    /// number of standard deviations from the mean.
    Deviant {
        deviations: u64,
        value_ms: f64,
        mean_ms: f64,
        stddev_ms: f64,
    },
    /// The window had zero spread and the sample differs from the mean.
    ZeroSpread { value_ms: f64, mean_ms: f64 },
}

/// Point-in-time view of the window. A pure read; no side effects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub stddev_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub failed_count: u64,
}

impl StatsSnapshot {
    /// Renders `count,mean,stddev,min,max` with latencies rounded to whole
    /// milliseconds.
    #[must_use]
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.count,
            round_ms(self.mean_ms),
            round_ms(self.stddev_ms),
            round_ms(self.min_ms),
            round_ms(self.max_ms),
        )
    }
}

#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn round_ms(value_ms: f64) -> i64 {
    if value_ms.is_finite() {
        value_ms.round() as i64
    } else {
        0
    }
}

/// Online statistics over a sliding count-based window. The newest
/// `capacity` samples are retained; the oldest is evicted on overflow.
#[derive(Clone, Debug)]
pub struct WindowedStats {
    capacity: usize,
    min_population: usize,
    outlier_threshold_stddev: f64,
    samples: VecDeque<Sample>,
    sum: f64,
    sum_squares: f64,
    failed_count: u64,
}

impl WindowedStats {
    /// `min_population_percent` is the fraction of `capacity` (in percent)
    /// that must be populated before mean/stddev are trusted.
    #[must_use]
    pub fn new(capacity: usize, min_population_percent: u8, outlier_threshold_stddev: f64) -> Self {
        let capacity = capacity.max(1);
        let min_population = (capacity * usize::from(min_population_percent) / 100).max(1);
        Self {
            capacity,
            min_population,
            outlier_threshold_stddev,
            samples: VecDeque::with_capacity(capacity),
            sum: 0.0,
            sum_squares: 0.0,
            failed_count: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn min_population(&self) -> usize {
        self.min_population
    }

    /// True once enough samples exist to trust mean/stddev.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.samples.len() >= self.min_population
    }

    /// Records one sample, evicting the oldest when the window is full.
    ///
    /// Returns the outlier judgment of the sample against the window as it
    /// stood before the add: `None` unless the window was ready and the
    /// sample's absolute deviation from the mean reached
    /// `outlier_threshold * stddev`. A zero-spread window flags any
    /// differing value as [`Outlier::ZeroSpread`] and never flags a value
    /// equal to the mean.
    pub fn record(&mut self, value_ms: f64, failed: bool) -> Option<Outlier> {
        let judgment = self.judge(value_ms);

        if self.samples.len() == self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted.value_ms;
                self.sum_squares -= evicted.value_ms * evicted.value_ms;
            }
        }

        self.samples.push_back(Sample { value_ms, failed });
        self.sum += value_ms;
        self.sum_squares += value_ms * value_ms;
        if failed {
            self.failed_count = self.failed_count.saturating_add(1);
        }

        judgment
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn judge(&self, value_ms: f64) -> Option<Outlier> {
        if !self.is_ready() {
            return None;
        }

        let mean_ms = self.mean();
        let stddev_ms = self.stddev();
        let distance = (value_ms - mean_ms).abs();

        if stddev_ms == 0.0 {
            if distance == 0.0 {
                return None;
            }
            return Some(Outlier::ZeroSpread { value_ms, mean_ms });
        }

        let deviations = (distance / stddev_ms).floor();
        if deviations >= self.outlier_threshold_stddev {
            Some(Outlier::Deviant {
                deviations: deviations as u64,
                value_ms,
                mean_ms,
                stddev_ms,
            })
        } else {
            None
        }
    }

    /// Discards all samples and the failure counter, starting a fresh
    /// accumulation epoch.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
        self.sum_squares = 0.0;
        self.failed_count = 0;
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut min_ms = f64::INFINITY;
        let mut max_ms = f64::NEG_INFINITY;
        for sample in &self.samples {
            min_ms = min_ms.min(sample.value_ms);
            max_ms = max_ms.max(sample.value_ms);
        }
        if self.samples.is_empty() {
            min_ms = 0.0;
            max_ms = 0.0;
        }

        StatsSnapshot {
            count: self.samples.len() as u64,
            mean_ms: self.mean(),
            stddev_ms: self.stddev(),
            min_ms,
            max_ms,
            failed_count: self.failed_count,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum / self.samples.len() as f64
    }

    #[allow(clippy::cast_precision_loss)]
    fn stddev(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let n = self.samples.len() as f64;
        let mean = self.sum / n;
        let variance = (self.sum_squares / n - mean * mean).max(0.0);
        variance.sqrt()
    }
}
