//! Exporting stats to external systems.
//!
//! A [`Sink`] is invoked periodically by the [`Flusher`](crate::Flusher) with a [`Source`] that
//! enumerates all stats of the store, and synchronously for every value recorded into a
//! histogram. Sinks are isolated from each other and from the stat-updating code: their errors
//! and panics are logged and counted, but never propagated.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tally_common::UnixTimestamp;

use crate::metric::{Counter, Gauge, Histogram, ParentHistogram};
use crate::store::Store;

/// An error reported by a [`Sink`].
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The sink cannot currently accept stats.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// Exporting stats failed.
    #[error("failed to export stats")]
    Export(#[source] Box<dyn Error + Send + Sync>),
    /// The sink panicked.
    #[error("sink panicked: {0}")]
    Panicked(String),
}

/// An exporter of stats.
pub trait Sink: Send + Sync {
    /// Exports the stats of one flush cycle.
    ///
    /// All sinks of a cycle receive the same [`Source`], so counter deltas are consistent across
    /// sinks.
    fn flush(&self, source: &mut dyn Source) -> Result<(), SinkError>;

    /// Receives a single value recorded into a histogram.
    ///
    /// This is called on the recording thread and must not block for long. Sinks that need
    /// per-sample data should buffer and export asynchronously.
    fn on_histogram_complete(&self, histogram: &dyn Histogram, value: u64) -> Result<(), SinkError> {
        let _ = (histogram, value);
        Ok(())
    }
}

/// A counter and its increments since the previous flush cycle.
#[derive(Clone, Debug)]
pub struct CounterSnapshot {
    /// The counter.
    pub counter: Arc<dyn Counter>,
    /// Increments since the previous flush cycle.
    pub delta: u64,
}

/// Enumerates the stats of a store for a flush cycle.
///
/// Enumerations are computed on first access and cached until [`clear_cache`](Self::clear_cache).
pub trait Source {
    /// Returns all counters with their deltas, sorted by name.
    fn cached_counters(&mut self) -> &[CounterSnapshot];

    /// Returns all gauges, sorted by name.
    fn cached_gauges(&mut self) -> &[Arc<dyn Gauge>];

    /// Returns all histograms, sorted by name.
    fn cached_histograms(&mut self) -> &[Arc<dyn ParentHistogram>];

    /// Drops the cached enumerations, forcing the next access to re-enumerate.
    ///
    /// Counters enumerated before keep the delta they were reported with.
    fn clear_cache(&mut self);

    /// Returns the time of the flush cycle.
    fn timestamp(&self) -> UnixTimestamp;
}

/// A [`Source`] enumerating the stats of a [`Store`].
///
/// Every counter is latched at most once per source. Re-enumerating after
/// [`clear_cache`](Source::clear_cache) reports the deltas latched before, so all sinks of a flush
/// cycle see the same deltas.
pub struct StoreSource<'a> {
    store: &'a Store,
    timestamp: UnixTimestamp,
    /// Deltas latched by this source, by counter address.
    latched: HashMap<usize, CounterSnapshot>,
    counters: Option<Vec<CounterSnapshot>>,
    gauges: Option<Vec<Arc<dyn Gauge>>>,
    histograms: Option<Vec<Arc<dyn ParentHistogram>>>,
}

impl<'a> StoreSource<'a> {
    /// Creates a source for the given store.
    pub fn new(store: &'a Store, timestamp: UnixTimestamp) -> Self {
        Self {
            store,
            timestamp,
            latched: HashMap::new(),
            counters: None,
            gauges: None,
            histograms: None,
        }
    }
}

impl Source for StoreSource<'_> {
    fn cached_counters(&mut self) -> &[CounterSnapshot] {
        let store = self.store;
        let latched = &mut self.latched;
        self.counters.get_or_insert_with(|| {
            store
                .counters()
                .into_iter()
                .map(|counter| {
                    // The snapshot keeps the counter alive, so its address stays unique.
                    let address = Arc::as_ptr(&counter) as *const () as usize;
                    latched
                        .entry(address)
                        .or_insert_with(|| CounterSnapshot {
                            delta: counter.latch(),
                            counter,
                        })
                        .clone()
                })
                .collect()
        })
    }

    fn cached_gauges(&mut self) -> &[Arc<dyn Gauge>] {
        let store = self.store;
        self.gauges.get_or_insert_with(|| store.gauges())
    }

    fn cached_histograms(&mut self) -> &[Arc<dyn ParentHistogram>] {
        let store = self.store;
        self.histograms.get_or_insert_with(|| store.histograms())
    }

    fn clear_cache(&mut self) {
        self.counters = None;
        self.gauges = None;
        self.histograms = None;
    }

    fn timestamp(&self) -> UnixTimestamp {
        self.timestamp
    }
}

impl fmt::Debug for StoreSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSource")
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// The sinks registered with a store.
///
/// The list is replaced on every registration, so sinks are always called without holding the
/// lock. Sinks may record stats or register other sinks from their callbacks.
pub(crate) struct SinkRegistry {
    sinks: RwLock<Arc<[Arc<dyn Sink>]>>,
    errors: AtomicU64,
}

impl SinkRegistry {
    pub fn add(&self, sink: Arc<dyn Sink>) {
        let mut sinks = self.sinks.write();
        let mut updated = sinks.to_vec();
        updated.push(sink);
        *sinks = updated.into();
    }

    pub fn num_sinks(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> Arc<[Arc<dyn Sink>]> {
        Arc::clone(&self.sinks.read())
    }

    /// Calls every sink's `on_histogram_complete`.
    pub fn deliver_histogram(&self, histogram: &dyn Histogram, value: u64) {
        for sink in self.snapshot().iter() {
            if let Err(error) = self.isolate(|| sink.on_histogram_complete(histogram, value)) {
                tally_log::debug!(
                    error = &error as &dyn Error,
                    histogram = %histogram.name(),
                    "stats sink failed to receive histogram value"
                );
            }
        }
    }

    /// Flushes the source to every sink and returns the number of sinks and failed sinks.
    pub fn flush(&self, source: &mut dyn Source) -> (usize, usize) {
        let sinks = self.snapshot();

        let mut failed = 0;
        for sink in sinks.iter() {
            if let Err(error) = self.isolate(|| sink.flush(source)) {
                tally_log::error!(error = &error as &dyn Error, "stats sink flush failed");
                failed += 1;
            }
        }

        (sinks.len(), failed)
    }

    /// Runs a sink callback, converting panics into errors and counting failures.
    fn isolate<F>(&self, f: F) -> Result<(), SinkError>
    where
        F: FnOnce() -> Result<(), SinkError>,
    {
        let result = panic::catch_unwind(AssertUnwindSafe(f))
            .unwrap_or_else(|payload| Err(SinkError::Panicked(panic_message(&*payload))));

        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        result
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self {
            sinks: RwLock::new(Arc::from(Vec::new())),
            errors: AtomicU64::new(0),
        }
    }
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("sinks", &self.num_sinks())
            .field("errors", &self.errors())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{StatsMatcher, StatsOptions, SymbolTable, TagProducer};

    #[derive(Default)]
    struct RecordingSink {
        flushed: Mutex<Vec<(String, u64)>>,
        histogram_values: Mutex<Vec<(String, u64)>>,
    }

    impl Sink for RecordingSink {
        fn flush(&self, source: &mut dyn Source) -> Result<(), SinkError> {
            let mut flushed = self.flushed.lock();
            for snapshot in source.cached_counters() {
                flushed.push((snapshot.counter.name(), snapshot.delta));
            }
            Ok(())
        }

        fn on_histogram_complete(
            &self,
            histogram: &dyn Histogram,
            value: u64,
        ) -> Result<(), SinkError> {
            self.histogram_values.lock().push((histogram.name(), value));
            Ok(())
        }
    }

    struct FailingSink;

    impl Sink for FailingSink {
        fn flush(&self, _source: &mut dyn Source) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("connection refused".to_owned()))
        }

        fn on_histogram_complete(&self, _: &dyn Histogram, _: u64) -> Result<(), SinkError> {
            panic!("histogram sink exploded");
        }
    }

    fn store() -> Store {
        Store::new(
            SymbolTable::new(),
            StatsOptions::default(),
            StatsMatcher::accept_all(),
            TagProducer::new(),
        )
    }

    #[test]
    fn test_source_latches_counters_once() {
        let store = store();
        store.counter("b.requests").add(3);
        store.counter("a.requests").add(2);

        let mut source = StoreSource::new(&store, UnixTimestamp::from_secs(10));
        let deltas: Vec<_> = source
            .cached_counters()
            .iter()
            .map(|s| (s.counter.name(), s.delta))
            .collect();
        assert_eq!(
            deltas,
            vec![("a.requests".to_owned(), 2), ("b.requests".to_owned(), 3)]
        );

        // Cached enumeration does not latch again.
        assert_eq!(source.cached_counters()[0].delta, 2);

        store.counter("a.requests").inc();
        store.counter("c.requests").add(4);
        source.clear_cache();
        let deltas: Vec<_> = source
            .cached_counters()
            .iter()
            .map(|s| (s.counter.name(), s.delta))
            .collect();
        assert_eq!(
            deltas,
            vec![
                ("a.requests".to_owned(), 2),
                ("b.requests".to_owned(), 3),
                ("c.requests".to_owned(), 4)
            ]
        );
        assert_eq!(store.counter("a.requests").latch(), 1, "left for the next cycle");
        assert_eq!(source.timestamp(), UnixTimestamp::from_secs(10));
    }

    #[test]
    fn test_source_enumerates_all_kinds() {
        let store = store();
        store.gauge("cx_active").set(4);
        store.histogram("rq_time").record_value(12);

        let mut source = StoreSource::new(&store, UnixTimestamp::from_secs(0));
        assert_eq!(source.cached_gauges().len(), 1);
        assert_eq!(source.cached_histograms()[0].name(), "rq_time");
        assert!(source.cached_counters().is_empty());
    }

    #[test]
    fn test_failures_are_isolated() {
        let store = store();
        let recording = Arc::new(RecordingSink::default());
        store.add_sink(Arc::new(FailingSink));
        store.add_sink(recording.clone());

        store.counter("requests").inc();
        store.histogram("rq_time").record_value(5);

        let mut source = StoreSource::new(&store, UnixTimestamp::from_secs(0));
        let (sinks, failed) = store.flush_sinks(&mut source);

        assert_eq!((sinks, failed), (2, 1));
        assert_eq!(*recording.flushed.lock(), vec![("requests".to_owned(), 1)]);
        assert_eq!(
            *recording.histogram_values.lock(),
            vec![("rq_time".to_owned(), 5)]
        );
        assert_eq!(store.sink_errors(), 2);
    }

    /// Reads the counters, then forces the next sink to re-enumerate.
    struct ClearingSink;

    impl Sink for ClearingSink {
        fn flush(&self, source: &mut dyn Source) -> Result<(), SinkError> {
            assert_eq!(source.cached_counters()[0].delta, 7);
            source.clear_cache();
            Ok(())
        }
    }

    #[test]
    fn test_cleared_cache_keeps_deltas() {
        let store = store();
        let recording = Arc::new(RecordingSink::default());
        store.add_sink(Arc::new(ClearingSink));
        store.add_sink(recording.clone());

        store.counter("requests").add(7);

        let mut source = StoreSource::new(&store, UnixTimestamp::from_secs(0));
        assert_eq!(store.flush_sinks(&mut source), (2, 0));
        assert_eq!(*recording.flushed.lock(), vec![("requests".to_owned(), 7)]);
    }

    /// Registers another sink and records a stat from within a histogram callback.
    struct ReentrantSink {
        store: Mutex<Option<Store>>,
        nested: Arc<RecordingSink>,
    }

    impl Sink for ReentrantSink {
        fn flush(&self, _source: &mut dyn Source) -> Result<(), SinkError> {
            Ok(())
        }

        fn on_histogram_complete(&self, _: &dyn Histogram, value: u64) -> Result<(), SinkError> {
            let store = self.store.lock().take();
            if let Some(store) = store {
                store.add_sink(self.nested.clone());
                store.histogram("nested").record_value(value + 1);
            }
            Ok(())
        }
    }

    #[test]
    fn test_sinks_may_reenter_the_store() {
        let store = store();
        let nested = Arc::new(RecordingSink::default());
        store.add_sink(Arc::new(ReentrantSink {
            store: Mutex::new(Some(store.clone())),
            nested: nested.clone(),
        }));

        store.histogram("rq_time").record_value(5);
        store.histogram("rq_time").record_value(8);

        assert_eq!(store.num_sinks(), 2);
        assert_eq!(
            *nested.histogram_values.lock(),
            vec![("nested".to_owned(), 6), ("rq_time".to_owned(), 8)]
        );
        assert_eq!(store.sink_errors(), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 42)).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom 42");

        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*payload), "static");
    }
}
