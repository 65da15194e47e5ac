//! Stat containers.
//!
//! Every kind of stat is a trait: [`Counter`], [`Gauge`], [`Histogram`] and [`ParentHistogram`].
//! The [`Store`](crate::Store) hands out shared real implementations for tracked stats and shared
//! null implementations for rejected ones. Updates never fail and never block on a global lock.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::histogram::{
    format_value, quantile_label, HistogramData, HistogramStatistics, DEFAULT_BUCKETS,
    SUPPORTED_QUANTILES,
};
use crate::sink::SinkRegistry;
use crate::symbol::{StatName, StatNameStorage, SymbolTable};
use crate::tags::Tag;

/// Number of interval buffers per histogram.
const NUM_SHARDS: usize = 16;

/// Common accessors of all stats.
pub trait Metric: Send + Sync + fmt::Debug {
    /// Returns the fully qualified name, including extracted tag values.
    fn name(&self) -> String;

    /// Returns the fully qualified name as [`StatName`].
    fn stat_name(&self) -> &StatName;

    /// Returns the name with all tag values removed.
    fn tag_extracted_name(&self) -> String;

    /// Returns the tag-extracted name as [`StatName`].
    fn tag_extracted_stat_name(&self) -> &StatName;

    /// Returns the tags of this stat.
    fn tags(&self) -> &[Tag];

    /// Returns `true` if the stat has been updated at least once.
    fn used(&self) -> bool;
}

/// A monotonically increasing value.
pub trait Counter: Metric {
    /// Increments the counter by `amount`.
    fn add(&self, amount: u64);

    /// Increments the counter by one.
    fn inc(&self) {
        self.add(1);
    }

    /// Returns the increments since the last call to `latch` and resets them.
    fn latch(&self) -> u64;

    /// Resets the value and pending increments to zero.
    fn reset(&self);

    /// Returns the current value.
    fn value(&self) -> u64;
}

/// A value that can increase and decrease.
pub trait Gauge: Metric {
    /// Increases the gauge by `amount`.
    fn add(&self, amount: u64);

    /// Decreases the gauge by `amount`, stopping at zero.
    fn sub(&self, amount: u64);

    /// Increases the gauge by one.
    fn inc(&self) {
        self.add(1);
    }

    /// Decreases the gauge by one, stopping at zero.
    fn dec(&self) {
        self.sub(1);
    }

    /// Sets the gauge to `value`.
    fn set(&self, value: u64);

    /// Returns the current value.
    fn value(&self) -> u64;
}

/// A distribution of recorded values.
pub trait Histogram: Metric {
    /// Records a value.
    ///
    /// The value is also delivered to all sinks of the store.
    fn record_value(&self, value: u64);
}

/// A histogram that aggregates values recorded from all threads.
///
/// Recorded values are buffered as interval data until [`merge`](Self::merge) folds them into the
/// cumulative data and recomputes the statistics of both.
pub trait ParentHistogram: Histogram {
    /// Folds the interval data into the cumulative data and starts a new interval.
    fn merge(&self);

    /// Returns the statistics of the interval ending at the last merge.
    fn interval_statistics(&self) -> HistogramStatistics;

    /// Returns the statistics of all values merged so far.
    fn cumulative_statistics(&self) -> HistogramStatistics;

    /// Formats interval and cumulative quantiles as `P0(1,1) P25(1.75,1.75) ...`.
    fn quantile_summary(&self) -> String;

    /// Formats interval and cumulative buckets as `B0.5(0,0) B1(1,1) ...`.
    fn bucket_summary(&self) -> String;
}

/// Names and tags of a stat.
#[derive(Debug)]
pub(crate) struct MetricIdentity {
    pub name: StatNameStorage,
    pub tag_extracted_name: StatNameStorage,
    pub tags: Vec<Tag>,
}

impl MetricIdentity {
    /// The identity of null stats.
    pub fn empty(symbol_table: &SymbolTable) -> Self {
        Self {
            name: symbol_table.encode(""),
            tag_extracted_name: symbol_table.encode(""),
            tags: Vec::new(),
        }
    }
}

macro_rules! impl_metric {
    ($ty:ty, |$this:ident| $used:expr) => {
        impl Metric for $ty {
            fn name(&self) -> String {
                self.identity.name.to_string()
            }

            fn stat_name(&self) -> &StatName {
                self.identity.name.stat_name()
            }

            fn tag_extracted_name(&self) -> String {
                self.identity.tag_extracted_name.to_string()
            }

            fn tag_extracted_stat_name(&self) -> &StatName {
                self.identity.tag_extracted_name.stat_name()
            }

            fn tags(&self) -> &[Tag] {
                &self.identity.tags
            }

            fn used(&self) -> bool {
                let $this = self;
                $used
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    .field("name", &self.identity.name)
                    .field("tags", &self.identity.tags)
                    .finish()
            }
        }
    };
}

/// A counter backed by atomics.
pub(crate) struct CounterImpl {
    identity: MetricIdentity,
    value: AtomicU64,
    pending: AtomicU64,
    used: AtomicBool,
}

impl CounterImpl {
    pub fn new(identity: MetricIdentity) -> Self {
        Self {
            identity,
            value: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            used: AtomicBool::new(false),
        }
    }
}

impl_metric!(CounterImpl, |this| this.used.load(Ordering::Relaxed));

impl Counter for CounterImpl {
    fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
        self.pending.fetch_add(amount, Ordering::Relaxed);
        self.used.store(true, Ordering::Relaxed);
    }

    fn latch(&self) -> u64 {
        self.pending.swap(0, Ordering::Relaxed)
    }

    fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
        self.pending.store(0, Ordering::Relaxed);
    }

    fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge backed by an atomic.
pub(crate) struct GaugeImpl {
    identity: MetricIdentity,
    value: AtomicU64,
    used: AtomicBool,
}

impl GaugeImpl {
    pub fn new(identity: MetricIdentity) -> Self {
        Self {
            identity,
            value: AtomicU64::new(0),
            used: AtomicBool::new(false),
        }
    }
}

impl_metric!(GaugeImpl, |this| this.used.load(Ordering::Relaxed));

impl Gauge for GaugeImpl {
    fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
        self.used.store(true, Ordering::Relaxed);
    }

    fn sub(&self, amount: u64) {
        // The closure always returns `Some`, so this cannot fail.
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(amount))
            });
        self.used.store(true, Ordering::Relaxed);
    }

    fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
        self.used.store(true, Ordering::Relaxed);
    }

    fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Returns the interval shard assigned to the calling thread.
///
/// Threads are assigned round-robin on their first record, so that concurrent recorders
/// usually lock different shards.
fn shard_index() -> usize {
    static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

    thread_local! {
        static SHARD: Cell<Option<usize>> = const { Cell::new(None) };
    }

    SHARD.with(|shard| match shard.get() {
        Some(index) => index,
        None => {
            let index = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % NUM_SHARDS;
            shard.set(Some(index));
            index
        }
    })
}

/// State guarded by the merge lock.
#[derive(Debug, Default)]
struct MergedState {
    cumulative: HistogramData,
    interval_statistics: HistogramStatistics,
    cumulative_statistics: HistogramStatistics,
}

/// A histogram buffering interval values in per-thread shards.
pub(crate) struct ParentHistogramImpl {
    identity: MetricIdentity,
    shards: [CachePadded<Mutex<HistogramData>>; NUM_SHARDS],
    merged: Mutex<MergedState>,
    used: AtomicBool,
    sinks: Arc<SinkRegistry>,
}

impl ParentHistogramImpl {
    pub fn new(identity: MetricIdentity, sinks: Arc<SinkRegistry>) -> Self {
        Self {
            identity,
            shards: std::array::from_fn(|_| CachePadded::new(Mutex::new(HistogramData::new()))),
            merged: Mutex::new(MergedState::default()),
            used: AtomicBool::new(false),
            sinks,
        }
    }
}

impl_metric!(ParentHistogramImpl, |this| this.used.load(Ordering::Relaxed));

impl Histogram for ParentHistogramImpl {
    fn record_value(&self, value: u64) {
        self.shards[shard_index()].lock().record(value);
        self.used.store(true, Ordering::Relaxed);
        self.sinks.deliver_histogram(self, value);
    }
}

impl ParentHistogram for ParentHistogramImpl {
    fn merge(&self) {
        let mut state = self.merged.lock();

        let mut interval = HistogramData::new();
        for shard in &self.shards {
            // Swap out under the shard lock, so concurrent records land in the next interval.
            let data = std::mem::take(&mut *shard.lock());
            interval.merge(&data);
        }

        state.cumulative.merge(&interval);
        state.interval_statistics = HistogramStatistics::new(&interval);
        state.cumulative_statistics = HistogramStatistics::new(&state.cumulative);
    }

    fn interval_statistics(&self) -> HistogramStatistics {
        self.merged.lock().interval_statistics.clone()
    }

    fn cumulative_statistics(&self) -> HistogramStatistics {
        self.merged.lock().cumulative_statistics.clone()
    }

    fn quantile_summary(&self) -> String {
        if !self.used() {
            return "No recorded values".to_owned();
        }

        let state = self.merged.lock();
        let interval = state.interval_statistics.computed_quantiles();
        let cumulative = state.cumulative_statistics.computed_quantiles();

        SUPPORTED_QUANTILES
            .iter()
            .zip(interval.iter().zip(cumulative))
            .map(|(&q, (&interval, &cumulative))| {
                format!(
                    "P{}({},{})",
                    quantile_label(q),
                    format_value(interval),
                    format_value(cumulative)
                )
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn bucket_summary(&self) -> String {
        if !self.used() {
            return "No recorded values".to_owned();
        }

        let state = self.merged.lock();
        let interval = state.interval_statistics.computed_buckets();
        let cumulative = state.cumulative_statistics.computed_buckets();

        DEFAULT_BUCKETS
            .iter()
            .zip(interval.iter().zip(cumulative))
            .map(|(bound, (interval, cumulative))| format!("B{bound}({interval},{cumulative})"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A counter that ignores all updates.
pub(crate) struct NullCounter {
    identity: MetricIdentity,
}

impl NullCounter {
    pub fn new(symbol_table: &SymbolTable) -> Self {
        Self {
            identity: MetricIdentity::empty(symbol_table),
        }
    }
}

impl_metric!(NullCounter, |_this| false);

impl Counter for NullCounter {
    fn add(&self, _amount: u64) {}

    fn latch(&self) -> u64 {
        0
    }

    fn reset(&self) {}

    fn value(&self) -> u64 {
        0
    }
}

/// A gauge that ignores all updates.
pub(crate) struct NullGauge {
    identity: MetricIdentity,
}

impl NullGauge {
    pub fn new(symbol_table: &SymbolTable) -> Self {
        Self {
            identity: MetricIdentity::empty(symbol_table),
        }
    }
}

impl_metric!(NullGauge, |_this| false);

impl Gauge for NullGauge {
    fn add(&self, _amount: u64) {}

    fn sub(&self, _amount: u64) {}

    fn set(&self, _value: u64) {}

    fn value(&self) -> u64 {
        0
    }
}

/// A histogram that ignores all values.
pub(crate) struct NullHistogram {
    identity: MetricIdentity,
}

impl NullHistogram {
    pub fn new(symbol_table: &SymbolTable) -> Self {
        Self {
            identity: MetricIdentity::empty(symbol_table),
        }
    }
}

impl_metric!(NullHistogram, |_this| false);

impl Histogram for NullHistogram {
    fn record_value(&self, _value: u64) {}
}

#[cfg(test)]
mod tests {
    use std::thread;

    use similar_asserts::assert_eq;

    use super::*;

    fn identity(table: &SymbolTable, name: &str) -> MetricIdentity {
        MetricIdentity {
            name: table.encode(name),
            tag_extracted_name: table.encode(name),
            tags: Vec::new(),
        }
    }

    fn histogram(table: &SymbolTable) -> ParentHistogramImpl {
        ParentHistogramImpl::new(identity(table, "rq_time"), Arc::default())
    }

    #[test]
    fn test_counter() {
        let table = SymbolTable::new();
        let counter = CounterImpl::new(identity(&table, "requests.total"));
        assert!(!counter.used());

        counter.add(5);
        counter.inc();
        assert!(counter.used());
        assert_eq!(counter.value(), 6);
        assert_eq!(counter.latch(), 6);
        assert_eq!(counter.latch(), 0);

        counter.inc();
        assert_eq!(counter.value(), 7);
        assert_eq!(counter.latch(), 1);

        counter.add(3);
        counter.reset();
        assert_eq!(counter.value(), 0);
        assert_eq!(counter.latch(), 0);
        assert!(counter.used());
    }

    #[test]
    fn test_gauge() {
        let table = SymbolTable::new();
        let gauge = GaugeImpl::new(identity(&table, "cx_active"));

        gauge.set(10);
        gauge.add(5);
        gauge.dec();
        gauge.sub(4);
        assert_eq!(gauge.value(), 10);

        gauge.sub(100);
        assert_eq!(gauge.value(), 0, "subtraction saturates");

        gauge.inc();
        assert_eq!(gauge.value(), 1);
        assert!(gauge.used());
    }

    #[test]
    fn test_metric_names() {
        let table = SymbolTable::new();
        let counter = CounterImpl::new(MetricIdentity {
            name: table.encode("cluster.backend.upstream_rq"),
            tag_extracted_name: table.encode("cluster.upstream_rq"),
            tags: vec![Tag::new("cluster_name", "backend")],
        });

        assert_eq!(counter.name(), "cluster.backend.upstream_rq");
        assert_eq!(counter.tag_extracted_name(), "cluster.upstream_rq");
        assert_eq!(counter.tags(), &[Tag::new("cluster_name", "backend")]);
        assert_eq!(counter.stat_name().len(), 3);
        assert_eq!(counter.tag_extracted_stat_name().len(), 2);
    }

    #[test]
    fn test_concurrent_counter() {
        let table = SymbolTable::new();
        let counter = CounterImpl::new(identity(&table, "hits"));

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        counter.inc();
                    }
                });
            }
        });

        assert_eq!(counter.value(), 80_000);
    }

    #[test]
    fn test_histogram_merge() {
        let table = SymbolTable::new();
        let histogram = histogram(&table);

        for value in [1, 2, 3, 100] {
            histogram.record_value(value);
        }
        assert_eq!(histogram.cumulative_statistics().sample_count(), 0);

        histogram.merge();
        let cumulative = histogram.cumulative_statistics();
        assert_eq!(cumulative.sample_count(), 4);
        assert_eq!(cumulative.computed_quantiles()[2], Some(2.5));
        assert_eq!(histogram.interval_statistics(), cumulative);

        histogram.merge();
        assert_eq!(histogram.cumulative_statistics(), cumulative);
        assert_eq!(histogram.interval_statistics().sample_count(), 0);

        histogram.record_value(7);
        histogram.merge();
        assert_eq!(histogram.interval_statistics().sample_count(), 1);
        assert_eq!(histogram.cumulative_statistics().sample_count(), 5);
    }

    #[test]
    fn test_histogram_summaries() {
        let table = SymbolTable::new();
        let histogram = histogram(&table);

        assert_eq!(histogram.quantile_summary(), "No recorded values");
        assert_eq!(histogram.bucket_summary(), "No recorded values");

        histogram.record_value(1);
        histogram.record_value(2);
        histogram.merge();
        histogram.record_value(3);
        histogram.merge();

        insta::assert_snapshot!(
            histogram.quantile_summary(),
            @"P0(3,1) P25(3,1.5) P50(3,2) P75(3,2.5) P90(3,2.8) P95(3,2.9) P99(3,2.98) P99.5(3,2.99) P99.9(3,2.998) P100(3,3)"
        );
        insta::assert_snapshot!(
            histogram.bucket_summary(),
            @"B0.5(0,0) B1(0,1) B5(1,3) B10(1,3) B25(1,3) B50(1,3) B100(1,3) B250(1,3) B500(1,3) B1000(1,3) B2500(1,3) B5000(1,3) B10000(1,3) B30000(1,3) B60000(1,3) B300000(1,3) B600000(1,3) B1800000(1,3) B3600000(1,3)"
        );
    }

    #[test]
    fn test_concurrent_record_and_merge() {
        let table = SymbolTable::new();
        let histogram = histogram(&table);

        thread::scope(|s| {
            for t in 0..8 {
                let histogram = &histogram;
                s.spawn(move || {
                    for i in 0..1_000 {
                        histogram.record_value(t * 1_000 + i);
                    }
                });
            }

            s.spawn(|| {
                for _ in 0..50 {
                    histogram.merge();
                }
            });
        });

        histogram.merge();
        assert_eq!(histogram.cumulative_statistics().sample_count(), 8_000);
    }

    #[test]
    fn test_null_metrics() {
        let table = SymbolTable::new();

        let counter = NullCounter::new(&table);
        counter.add(10);
        assert_eq!(counter.value(), 0);
        assert_eq!(counter.latch(), 0);
        assert!(!counter.used());
        assert_eq!(counter.name(), "");

        let gauge = NullGauge::new(&table);
        gauge.set(3);
        assert_eq!(gauge.value(), 0);

        let histogram = NullHistogram::new(&table);
        histogram.record_value(3);
        assert!(!histogram.used());
        assert!(histogram.tags().is_empty());
    }
}
