//! Latency statistics.
//!
//! The aggregator keeps three views of the valid samples:
//!
//! - [`RunningStats`]: count, sum, sum of squares, min, max; O(1) per sample
//! - [`Histogram`]: fixed-width microsecond buckets plus an overflow counter
//! - [`SampleWindow`]: the most recent samples, for percentiles
//!
//! All three sit behind one lock owned by the aggregator, separate from the
//! transfer path.

use core::fmt;

use parking_lot::Mutex;

use crate::driver::config::HistogramConfig;
use crate::internal::constants::{HISTOGRAM_BAR_WIDTH, REPORT_PERCENTILES};

const NS_PER_US: u64 = 1_000;

/// One round-trip measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    /// Round-trip time in nanoseconds
    pub round_trip_ns: u64,
    /// Payload verified
    pub valid: bool,
}

impl LatencySample {
    /// A verified sample
    pub const fn valid(round_trip_ns: u64) -> Self {
        Self {
            round_trip_ns,
            valid: true,
        }
    }

    /// A sample whose payload failed verification
    pub const fn invalid(round_trip_ns: u64) -> Self {
        Self {
            round_trip_ns,
            valid: false,
        }
    }
}

// =============================================================================
// Running Statistics
// =============================================================================

/// Incrementally updated moments and extrema
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningStats {
    count: u64,
    sum: u128,
    sum_sq: u128,
    min: u64,
    max: u64,
}

impl RunningStats {
    /// Empty statistics
    pub const fn new() -> Self {
        Self {
            count: 0,
            sum: 0,
            sum_sq: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    /// Add one value
    pub fn push(&mut self, ns: u64) {
        self.count += 1;
        self.sum += u128::from(ns);
        self.sum_sq += u128::from(ns) * u128::from(ns);
        self.min = self.min.min(ns);
        self.max = self.max.max(ns);
    }

    /// Number of values
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Smallest value
    pub fn min(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest value
    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max)
    }

    /// Arithmetic mean (0 when empty)
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    /// Population standard deviation (0 when empty)
    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let mean = self.sum as f64 / n;
        let variance = self.sum_sq as f64 / n - mean * mean;
        variance.max(0.0).sqrt()
    }
}

// =============================================================================
// Histogram
// =============================================================================

/// One non-empty histogram bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramBin {
    /// Inclusive lower bound in microseconds
    pub start_us: u64,
    /// Exclusive upper bound in microseconds
    pub end_us: u64,
    /// Samples in this bucket
    pub count: u64,
}

/// Fixed-width latency histogram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    buckets: Box<[u64]>,
    width_us: u64,
    overflow: u64,
}

impl Histogram {
    /// Create an empty histogram
    pub fn new(config: HistogramConfig) -> Self {
        Self {
            buckets: vec![0; config.buckets].into_boxed_slice(),
            width_us: config.bucket_width_us.max(1),
            overflow: 0,
        }
    }

    /// Count one value
    pub fn record(&mut self, ns: u64) {
        let bucket = (ns / NS_PER_US / self.width_us) as usize;
        match self.buckets.get_mut(bucket) {
            Some(count) => *count += 1,
            None => self.overflow += 1,
        }
    }

    /// Count in bucket `index`
    pub fn bucket(&self, index: usize) -> u64 {
        self.buckets.get(index).copied().unwrap_or(0)
    }

    /// Number of buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Check if there are no buckets
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Values beyond the last bucket
    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    /// Sum of all buckets and the overflow counter
    pub fn total(&self) -> u64 {
        self.buckets.iter().sum::<u64>() + self.overflow
    }

    /// Non-empty buckets in ascending order
    pub fn bins(&self) -> Vec<HistogramBin> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(i, count)| HistogramBin {
                start_us: i as u64 * self.width_us,
                end_us: (i as u64 + 1) * self.width_us,
                count: *count,
            })
            .collect()
    }

    /// Lower bound of the overflow range in microseconds
    pub fn overflow_start_us(&self) -> u64 {
        self.buckets.len() as u64 * self.width_us
    }
}

// =============================================================================
// Sample Window
// =============================================================================

/// Circular buffer of the most recent samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleWindow {
    samples: Vec<u64>,
    capacity: usize,
    next: usize,
}

impl SampleWindow {
    /// Create a window holding up to `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    /// Store a sample, overwriting the oldest once full
    pub fn push(&mut self, ns: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push(ns);
        } else {
            self.samples[self.next] = ns;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Samples held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the window is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Copy of the held samples in storage order
    pub fn snapshot(&self) -> Vec<u64> {
        self.samples.clone()
    }
}

/// Value at percentile `p` of an ascending slice
pub fn percentile_of_sorted(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let index = ((p * sorted.len() as f64) / 100.0) as usize;
    Some(sorted[index.min(sorted.len() - 1)])
}

// =============================================================================
// Aggregator
// =============================================================================

#[derive(Debug)]
struct AggregatorState {
    running: RunningStats,
    histogram: Histogram,
    window: SampleWindow,
    errors: u64,
}

/// Point-in-time summary for progress lines
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Valid samples
    pub count: u64,
    /// Invalid samples and sample-level errors
    pub errors: u64,
    /// Smallest round trip in nanoseconds
    pub min_ns: Option<u64>,
    /// Largest round trip in nanoseconds
    pub max_ns: Option<u64>,
    /// Mean round trip in nanoseconds
    pub mean_ns: f64,
    /// Standard deviation in nanoseconds
    pub stddev_ns: f64,
}

/// Thread-safe latency statistics
#[derive(Debug)]
pub struct StatisticsAggregator {
    state: Mutex<AggregatorState>,
}

impl StatisticsAggregator {
    /// Create an aggregator keeping `window` samples for percentiles
    pub fn new(histogram: HistogramConfig, window: usize) -> Self {
        Self {
            state: Mutex::new(AggregatorState {
                running: RunningStats::new(),
                histogram: Histogram::new(histogram),
                window: SampleWindow::new(window),
                errors: 0,
            }),
        }
    }

    /// Record a sample. Invalid samples only count as errors.
    pub fn record(&self, sample: LatencySample) {
        let mut state = self.state.lock();
        if !sample.valid {
            state.errors += 1;
            return;
        }
        let ns = sample.round_trip_ns;
        state.running.push(ns);
        state.histogram.record(ns);
        state.window.push(ns);
    }

    /// Count a sample-level error that produced no sample
    pub fn record_error(&self) {
        self.state.lock().errors += 1;
    }

    /// Valid samples recorded
    pub fn count(&self) -> u64 {
        self.state.lock().running.count()
    }

    /// Errors recorded
    pub fn errors(&self) -> u64 {
        self.state.lock().errors
    }

    /// Percentile `p` (0..=100) of the sample window
    pub fn percentile(&self, p: f64) -> Option<u64> {
        let mut sorted = self.state.lock().window.snapshot();
        sorted.sort_unstable();
        percentile_of_sorted(&sorted, p)
    }

    /// Summary for progress reporting
    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.state.lock();
        StatsSnapshot {
            count: state.running.count(),
            errors: state.errors,
            min_ns: state.running.min(),
            max_ns: state.running.max(),
            mean_ns: state.running.mean(),
            stddev_ns: state.running.stddev(),
        }
    }

    /// Full report; `expected` is the number of recorded iterations the run
    /// aimed for
    pub fn report(&self, expected: u64) -> LatencyReport {
        let (running, histogram, mut sorted, errors) = {
            let state = self.state.lock();
            (
                state.running,
                state.histogram.clone(),
                state.window.snapshot(),
                state.errors,
            )
        };
        sorted.sort_unstable();

        let percentiles = REPORT_PERCENTILES
            .iter()
            .filter_map(|p| percentile_of_sorted(&sorted, *p).map(|v| (*p, v)))
            .collect();

        LatencyReport {
            expected,
            count: running.count(),
            errors,
            min_ns: running.min(),
            max_ns: running.max(),
            mean_ns: running.mean(),
            stddev_ns: running.stddev(),
            percentiles,
            histogram: histogram.bins(),
            overflow: histogram.overflow(),
            overflow_start_us: histogram.overflow_start_us(),
            show_histogram: true,
        }
    }
}

// =============================================================================
// Report
// =============================================================================

/// Rendered latency statistics
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyReport {
    /// Iterations the run aimed to record
    pub expected: u64,
    /// Valid samples
    pub count: u64,
    /// Errors
    pub errors: u64,
    /// Minimum in nanoseconds
    pub min_ns: Option<u64>,
    /// Maximum in nanoseconds
    pub max_ns: Option<u64>,
    /// Mean in nanoseconds
    pub mean_ns: f64,
    /// Standard deviation in nanoseconds
    pub stddev_ns: f64,
    /// `(percentile, nanoseconds)` pairs
    pub percentiles: Vec<(f64, u64)>,
    /// Non-empty buckets in ascending order
    pub histogram: Vec<HistogramBin>,
    /// Samples beyond the last bucket
    pub overflow: u64,
    /// Lower bound of the overflow range in microseconds
    pub overflow_start_us: u64,
    /// Render the histogram
    pub show_histogram: bool,
}

impl LatencyReport {
    /// Value at percentile `p`, if it was computed
    pub fn percentile(&self, p: f64) -> Option<u64> {
        self.percentiles
            .iter()
            .find(|(q, _)| (*q - p).abs() < f64::EPSILON)
            .map(|(_, v)| *v)
    }
}

fn us(ns: f64) -> f64 {
    ns / NS_PER_US as f64
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DMA Latency Statistics:")?;
        writeln!(f, "{}", "-".repeat(40))?;
        if self.expected > 0 {
            writeln!(f, "Valid measurements: {}/{}", self.count, self.expected)?;
        } else {
            writeln!(f, "Valid measurements: {}", self.count)?;
        }
        writeln!(f, "Errors:             {}", self.errors)?;

        let (Some(min), Some(max)) = (self.min_ns, self.max_ns) else {
            return writeln!(f, "No valid measurements");
        };
        writeln!(f, "Min latency:        {:.3} µs", us(min as f64))?;
        writeln!(f, "Max latency:        {:.3} µs", us(max as f64))?;
        writeln!(f, "Mean latency:       {:.3} µs", us(self.mean_ns))?;
        writeln!(f, "Std deviation:      {:.3} µs", us(self.stddev_ns))?;

        if !self.percentiles.is_empty() {
            writeln!(f)?;
            writeln!(f, "Percentiles:")?;
            for (p, v) in &self.percentiles {
                let label = if (*p - 50.0).abs() < f64::EPSILON {
                    "50% (median):".to_string()
                } else {
                    format!("{p}%:")
                };
                writeln!(f, "  {label:<16}{:.3} µs", us(*v as f64))?;
            }
        }

        if self.show_histogram && (!self.histogram.is_empty() || self.overflow > 0) {
            writeln!(f)?;
            writeln!(f, "Latency Distribution (µs):")?;
            for bin in &self.histogram {
                let bar = ((bin.count as u128 * HISTOGRAM_BAR_WIDTH as u128)
                    / u128::from(self.count.max(1)))
                .min(HISTOGRAM_BAR_WIDTH as u128) as usize;
                writeln!(
                    f,
                    "  [{:>4}-{:>4}): {:>8} |{}",
                    bin.start_us,
                    bin.end_us,
                    bin.count,
                    "█".repeat(bar)
                )?;
            }
            if self.overflow > 0 {
                writeln!(
                    f,
                    "  [{}+):     {:>8} (overflow)",
                    self.overflow_start_us, self.overflow
                )?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(values: &[u64]) -> StatisticsAggregator {
        let stats = StatisticsAggregator::new(HistogramConfig::default(), 1000);
        for v in values {
            stats.record(LatencySample::valid(*v));
        }
        stats
    }

    // =========================================================================
    // Running Statistics Tests
    // =========================================================================

    #[test]
    fn running_stats_moments() {
        let mut stats = RunningStats::new();
        for v in [2_000, 4_000, 4_000, 4_000, 5_000, 5_000, 7_000, 9_000] {
            stats.push(v);
        }
        assert_eq!(stats.count(), 8);
        assert_eq!(stats.min(), Some(2_000));
        assert_eq!(stats.max(), Some(9_000));
        assert!((stats.mean() - 5_000.0).abs() < 1e-6);
        assert!((stats.stddev() - 2_000.0).abs() < 1e-6);
    }

    #[test]
    fn running_stats_empty() {
        let stats = RunningStats::new();
        assert_eq!(stats.min(), None);
        assert_eq!(stats.max(), None);
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.stddev(), 0.0);
    }

    // =========================================================================
    // Histogram Tests
    // =========================================================================

    #[test]
    fn histogram_truncates_to_microseconds() {
        let mut histogram = Histogram::new(HistogramConfig {
            buckets: 10,
            bucket_width_us: 1,
        });
        histogram.record(999);
        histogram.record(1_000);
        histogram.record(1_999);
        assert_eq!(histogram.bucket(0), 1);
        assert_eq!(histogram.bucket(1), 2);
    }

    #[test]
    fn histogram_overflow_is_counted() {
        let mut histogram = Histogram::new(HistogramConfig {
            buckets: 4,
            bucket_width_us: 2,
        });
        histogram.record(7_999);
        histogram.record(8_000);
        histogram.record(1_000_000);
        assert_eq!(histogram.bucket(3), 1);
        assert_eq!(histogram.overflow(), 2);
        assert_eq!(histogram.total(), 3);
        assert_eq!(histogram.overflow_start_us(), 8);
    }

    #[test]
    fn histogram_bins_are_ordered() {
        let mut histogram = Histogram::new(HistogramConfig::default());
        for ns in [5_500, 1_200, 5_100, 900] {
            histogram.record(ns);
        }
        let bins = histogram.bins();
        let starts: Vec<_> = bins.iter().map(|b| b.start_us).collect();
        assert_eq!(starts, vec![0, 1, 5]);
        assert_eq!(bins[2].count, 2);
    }

    // =========================================================================
    // Window and Percentile Tests
    // =========================================================================

    #[test]
    fn window_overwrites_oldest() {
        let mut window = SampleWindow::new(3);
        for v in 1..=5 {
            window.push(v);
        }
        let mut held = window.snapshot();
        held.sort_unstable();
        assert_eq!(held, vec![3, 4, 5]);
    }

    #[test]
    fn percentile_index_is_floor_clamped() {
        let sorted: Vec<u64> = (1..=10).collect();
        assert_eq!(percentile_of_sorted(&sorted, 50.0), Some(6));
        assert_eq!(percentile_of_sorted(&sorted, 99.9), Some(10));
        assert_eq!(percentile_of_sorted(&sorted, 100.0), Some(10));
        assert_eq!(percentile_of_sorted(&sorted, 0.0), Some(1));
        assert_eq!(percentile_of_sorted(&[], 50.0), None);
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut state = 12345u32;
        let values: Vec<u64> = (0..997)
            .map(|_| {
                state = state.wrapping_mul(69069).wrapping_add(1);
                u64::from(state % 50_000)
            })
            .collect();
        let report = aggregator(&values).report(997);

        let mut previous = report.min_ns.unwrap();
        for (_, v) in &report.percentiles {
            assert!(*v >= previous);
            previous = *v;
        }
        assert!(previous <= report.max_ns.unwrap());
    }

    // =========================================================================
    // Aggregator Tests
    // =========================================================================

    #[test]
    fn invalid_samples_count_as_errors() {
        let stats = aggregator(&[1_000]);
        stats.record(LatencySample::invalid(2_000));
        stats.record_error();
        assert_eq!(stats.count(), 1);
        assert_eq!(stats.errors(), 2);
    }

    #[test]
    fn histogram_accounts_for_every_valid_sample() {
        let stats = StatisticsAggregator::new(
            HistogramConfig {
                buckets: 5,
                bucket_width_us: 1,
            },
            100,
        );
        for ns in [100, 1_500, 4_999, 5_000, 80_000] {
            stats.record(LatencySample::valid(ns));
        }
        let report = stats.report(5);
        let binned: u64 = report.histogram.iter().map(|b| b.count).sum();
        assert_eq!(binned + report.overflow, report.count);
        assert_eq!(report.overflow, 2);
    }

    #[test]
    fn report_with_no_samples_states_zero_of_n() {
        let stats = StatisticsAggregator::new(HistogramConfig::default(), 10);
        let report = stats.report(50);
        assert_eq!(report.count, 0);
        assert!(report.percentiles.is_empty());

        let text = report.to_string();
        assert!(text.contains("0/50"));
        assert!(text.contains("No valid measurements"));
    }

    #[test]
    fn report_renders_percentiles_and_histogram() {
        let stats = aggregator(&[1_500, 2_500, 2_600, 3_000]);
        let text = stats.report(4).to_string();
        assert!(text.contains("4/4"));
        assert!(text.contains("50% (median):"));
        assert!(text.contains("99.9%:"));
        assert!(text.contains("[   2-   3):        2"));
    }

    #[test]
    fn report_percentile_lookup() {
        let report = aggregator(&[1_000, 2_000, 3_000, 4_000]).report(4);
        assert_eq!(report.percentile(50.0), Some(3_000));
        assert_eq!(report.percentile(42.0), None);
    }

    #[test]
    fn snapshot_matches_running_stats() {
        let snapshot = aggregator(&[1_000, 3_000]).snapshot();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.min_ns, Some(1_000));
        assert_eq!(snapshot.max_ns, Some(3_000));
        assert!((snapshot.mean_ns - 2_000.0).abs() < 1e-9);
    }
}
