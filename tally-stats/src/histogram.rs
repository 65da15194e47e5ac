//! Histogram sample storage and summary statistics.
//!
//! Recorded values are collected in [`HistogramData`], a mergeable representation of the sample
//! multiset. Values below 100 are kept exactly. Larger values are grouped into log-linear bins
//! that retain two significant decimal digits, which bounds the relative error of any reported
//! quantile to 1% while keeping memory proportional to the number of distinct bins rather than
//! the number of samples.
//!
//! [`HistogramStatistics`] is a snapshot of quantiles and cumulative bucket counts computed from
//! a [`HistogramData`] whenever a parent histogram is merged.

use std::collections::BTreeMap;
use std::fmt::Write;

/// Quantiles computed for every histogram.
pub const SUPPORTED_QUANTILES: [f64; 10] = [0.0, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99, 0.995, 0.999, 1.0];

/// Upper bounds of the cumulative buckets computed for every histogram.
pub const DEFAULT_BUCKETS: [f64; 19] = [
    0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
    30000.0, 60000.0, 300000.0, 600000.0, 1800000.0, 3600000.0,
];

/// Values below this limit are stored without loss.
const EXACT_LIMIT: u64 = 100;

/// Returns the lower bound and the width of the bin containing `value`.
fn bin_of(value: u64) -> (u64, u64) {
    let mut width = 1;
    while value / width >= EXACT_LIMIT {
        width *= 10;
    }
    (value / width * width, width)
}

/// The raw sample data of a histogram.
///
/// Merging is associative and commutative: merging the same set of recordings in any order
/// yields equal data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistogramData {
    /// Sample counts keyed by the lower bound of their bin.
    bins: BTreeMap<u64, u64>,
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
}

impl HistogramData {
    /// Creates empty data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single value.
    pub fn record(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        *self.bins.entry(bin_of(value).0).or_default() += 1;
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
    }

    /// Adds all samples of `other` to this data.
    pub fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }

        if self.is_empty() {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }

        for (&lower, &count) in &other.bins {
            *self.bins.entry(lower).or_default() += count;
        }
        self.count += other.count;
        self.sum = self.sum.saturating_add(other.sum);
    }

    /// Removes all samples.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Returns `true` if no values have been recorded.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the number of recorded values.
    pub fn sample_count(&self) -> u64 {
        self.count
    }

    /// Returns the sum of recorded values, saturating at `u64::MAX`.
    pub fn sample_sum(&self) -> u64 {
        self.sum
    }

    /// Returns the smallest recorded value.
    pub fn min(&self) -> Option<u64> {
        (!self.is_empty()).then_some(self.min)
    }

    /// Returns the largest recorded value.
    pub fn max(&self) -> Option<u64> {
        (!self.is_empty()).then_some(self.max)
    }

    /// Estimates the `q`-quantile, for `q` between `0.0` and `1.0`.
    ///
    /// Interpolates linearly between the two order statistics around rank `q * (n - 1)`. Returns
    /// `None` if no values have been recorded.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }

        let rank = q.clamp(0.0, 1.0) * (self.count - 1) as f64;
        let lower = rank.floor();
        let low = self.order_statistic(lower as u64);
        if rank == lower {
            return Some(low);
        }

        let high = self.order_statistic(rank.ceil() as u64);
        Some(low + (high - low) * (rank - lower))
    }

    /// Returns the number of samples less than or equal to `bound`.
    ///
    /// A binned sample counts as its bin's lower bound.
    pub fn cumulative_count(&self, bound: f64) -> u64 {
        self.bins
            .iter()
            .take_while(|(lower, _)| **lower as f64 <= bound)
            .map(|(_, &count)| count)
            .sum()
    }

    /// Returns the estimated value of the sample at `index` in sorted order.
    ///
    /// Samples inside a wide bin are spread evenly across the bin.
    fn order_statistic(&self, index: u64) -> f64 {
        let mut seen = 0;

        for (&lower, &count) in &self.bins {
            if index < seen + count {
                let width = bin_of(lower).1;
                if width == 1 {
                    return lower as f64;
                }

                let offset = (index - seen) as f64 / count as f64;
                let value = lower as f64 + width as f64 * offset;
                return value.clamp(self.min as f64, self.max as f64);
            }
            seen += count;
        }

        self.max as f64
    }
}

/// Quantiles and bucket counts computed from a [`HistogramData`].
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramStatistics {
    computed_quantiles: Vec<Option<f64>>,
    computed_buckets: Vec<u64>,
    sample_count: u64,
    sample_sum: u64,
}

impl HistogramStatistics {
    /// Computes statistics over the given data.
    pub fn new(data: &HistogramData) -> Self {
        Self {
            computed_quantiles: SUPPORTED_QUANTILES
                .iter()
                .map(|&q| data.quantile(q))
                .collect(),
            computed_buckets: DEFAULT_BUCKETS
                .iter()
                .map(|&bound| data.cumulative_count(bound))
                .collect(),
            sample_count: data.sample_count(),
            sample_sum: data.sample_sum(),
        }
    }

    /// Returns the quantiles in the order of [`computed_quantiles`](Self::computed_quantiles).
    pub fn supported_quantiles(&self) -> &'static [f64] {
        &SUPPORTED_QUANTILES
    }

    /// Returns the value at each supported quantile, `None` if there was no data.
    pub fn computed_quantiles(&self) -> &[Option<f64>] {
        &self.computed_quantiles
    }

    /// Returns the bucket bounds in the order of [`computed_buckets`](Self::computed_buckets).
    pub fn supported_buckets(&self) -> &'static [f64] {
        &DEFAULT_BUCKETS
    }

    /// Returns the cumulative number of samples in each supported bucket.
    pub fn computed_buckets(&self) -> &[u64] {
        &self.computed_buckets
    }

    /// Returns the number of samples.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Returns the sum of all samples.
    pub fn sample_sum(&self) -> u64 {
        self.sample_sum
    }

    /// Formats the quantiles as `P0: 1, P25: 1.75, ...`.
    pub fn quantile_summary(&self) -> String {
        let mut summary = String::new();
        for (i, (&q, value)) in SUPPORTED_QUANTILES
            .iter()
            .zip(&self.computed_quantiles)
            .enumerate()
        {
            if i > 0 {
                summary.push_str(", ");
            }
            let _ = write!(summary, "P{}: {}", quantile_label(q), format_value(*value));
        }
        summary
    }

    /// Formats the buckets as `B0.5: 0, B1: 1, ...`.
    pub fn bucket_summary(&self) -> String {
        let mut summary = String::new();
        for (i, (bound, count)) in DEFAULT_BUCKETS
            .iter()
            .zip(&self.computed_buckets)
            .enumerate()
        {
            if i > 0 {
                summary.push_str(", ");
            }
            let _ = write!(summary, "B{bound}: {count}");
        }
        summary
    }
}

impl Default for HistogramStatistics {
    fn default() -> Self {
        Self::new(&HistogramData::default())
    }
}

/// Formats a quantile as a percentage, such as `99.5` for `0.995`.
pub(crate) fn quantile_label(q: f64) -> f64 {
    (q * 1000.0).round() / 10.0
}

/// Formats a computed quantile with at most three decimals.
pub(crate) fn format_value(value: Option<f64>) -> String {
    match value {
        Some(value) => ((value * 1000.0).round() / 1000.0).to_string(),
        None => "nan".to_owned(),
    }
}
