use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use similar_asserts::assert_eq;
use tally_common::{ManualTimeSource, UnixTimestamp};
use tally_stats::{
    Counter, Flusher, Histogram, Metric, ParentHistogram, Sink, SinkError, Source, StatsConfig,
    Store, SymbolTable, Tag,
};

fn store(config: &str) -> Store {
    let config: StatsConfig = serde_json::from_str(config).unwrap();
    Store::from_config(SymbolTable::new(), &config).unwrap()
}

/// Records counter deltas and histogram samples it receives.
#[derive(Default)]
struct RecordingSink {
    deltas: Mutex<Vec<(String, u64)>>,
    samples: Mutex<Vec<(String, u64)>>,
}

impl Sink for RecordingSink {
    fn flush(&self, source: &mut dyn Source) -> Result<(), SinkError> {
        let mut deltas = self.deltas.lock();
        for snapshot in source.cached_counters() {
            deltas.push((snapshot.counter.name(), snapshot.delta));
        }
        Ok(())
    }

    fn on_histogram_complete(&self, histogram: &dyn Histogram, value: u64) -> Result<(), SinkError> {
        self.samples.lock().push((histogram.name(), value));
        Ok(())
    }
}

struct BrokenSink {
    calls: AtomicUsize,
}

impl Sink for BrokenSink {
    fn flush(&self, _source: &mut dyn Source) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(SinkError::Unavailable("connection refused".to_owned()))
    }
}

struct PanickingSink;

impl Sink for PanickingSink {
    fn flush(&self, _source: &mut dyn Source) -> Result<(), SinkError> {
        panic!("exporter crashed");
    }
}

#[test]
fn test_concurrent_increments() {
    tally_log::init_test!();

    const THREADS: u64 = 8;
    const INCREMENTS: u64 = 10_000;

    let store = store("{}");

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let store = &store;
            scope.spawn(move || {
                let counter = store.counter("cluster.backend.upstream_rq_total");
                for _ in 0..INCREMENTS {
                    counter.inc();
                }
            });
        }
    });

    let counters = store.counters();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0].value(), THREADS * INCREMENTS);
}

#[test]
fn test_counter_accumulates() {
    tally_log::init_test!();

    let store = store("{}");
    let first = store.counter("requests.total");
    first.add(5);
    let second = store.counter("requests.total");
    second.inc();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.value(), 6);
    assert_eq!(first.latch(), 6);
    assert_eq!(first.latch(), 0);
    assert_eq!(first.value(), 6);
}

#[test]
fn test_rejected_stats_share_null() {
    tally_log::init_test!();

    let store = store(r#"{"matcher": {"exclusion_list": [{"prefix": "debug."}]}}"#);

    let trace = store.counter("debug.trace");
    trace.add(100);
    assert_eq!(trace.value(), 0);
    assert!(Arc::ptr_eq(&trace, &store.counter("debug.other")));

    let kept = store.counter("cluster.backend.upstream_rq_200");
    kept.inc();

    let names: Vec<_> = store.counters().iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["cluster.backend.upstream_rq_200"]);
    assert_eq!(
        kept.tags(),
        &[
            Tag::new("cluster_name", "backend"),
            Tag::new("response_code", "200")
        ]
    );
}

#[test]
fn test_histogram_merge() {
    tally_log::init_test!();

    let store = store("{}");
    let histogram = store.histogram("http.ingress.downstream_rq_time");
    for value in [1, 2, 3, 100] {
        histogram.record_value(value);
    }
    store.merge_histograms();

    let histograms = store.histograms();
    let parent = &histograms[0];
    let cumulative = parent.cumulative_statistics();
    assert_eq!(cumulative.sample_count(), 4);
    assert_eq!(cumulative.sample_sum(), 106);
    let p50 = cumulative.computed_quantiles()[2].unwrap();
    assert!((2.0..=3.0).contains(&p50), "p50 was {p50}");

    store.merge_histograms();
    assert_eq!(parent.interval_statistics().sample_count(), 0);
    assert_eq!(parent.cumulative_statistics(), cumulative);
}

#[test]
fn test_flush_isolates_failing_sinks() {
    tally_log::init_test!();

    let store = store("{}");
    let healthy = Arc::new(RecordingSink::default());
    let broken = Arc::new(BrokenSink {
        calls: AtomicUsize::new(0),
    });
    store.add_sink(broken.clone());
    store.add_sink(Arc::new(PanickingSink));
    store.add_sink(healthy.clone());

    let time = Arc::new(ManualTimeSource::from_timestamp(UnixTimestamp::from_secs(
        1_700_000_000,
    )));
    let mut flusher = Flusher::new(store.clone(), time.clone());

    let counter = store.counter("requests.total");
    counter.add(3);
    let histogram = store.histogram("rq_time");
    histogram.record_value(12);

    let summary = flusher.flush();
    assert_eq!(summary.sinks, 3);
    assert_eq!(summary.failed_sinks, 2);

    counter.inc();
    time.advance(Duration::from_secs(5));
    let summary = flusher.flush();
    assert_eq!(summary.failed_sinks, 2);
    assert_eq!(summary.timestamp, UnixTimestamp::from_secs(1_700_000_005));

    assert_eq!(broken.calls.load(Ordering::Relaxed), 2);
    assert_eq!(store.sink_errors(), 4);
    assert_eq!(
        *healthy.deltas.lock(),
        vec![
            ("requests.total".to_owned(), 3),
            ("requests.total".to_owned(), 1)
        ]
    );
    assert_eq!(*healthy.samples.lock(), vec![("rq_time".to_owned(), 12)]);
}
