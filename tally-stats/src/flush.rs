use std::sync::Arc;
use std::time::Duration;

use tally_common::{TimeSource, UnixTimestamp};

use crate::sink::{Source, StoreSource};
use crate::store::Store;

/// Outcome of a single flush cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushSummary {
    /// Time of the flush cycle, as reported to sinks.
    pub timestamp: UnixTimestamp,
    /// Time spent merging histograms and flushing sinks.
    pub duration: Duration,
    /// Number of sinks flushed.
    pub sinks: usize,
    /// Number of sinks that failed.
    pub failed_sinks: usize,
}

/// Drives flush cycles of a [`Store`].
///
/// The flusher does not schedule itself. The host calls [`flush`](Self::flush) from its timer,
/// typically every few seconds.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tally_common::RealTimeSource;
/// use tally_stats::{Flusher, StatsMatcher, StatsOptions, Store, SymbolTable, TagProducer};
///
/// let store = Store::new(
///     SymbolTable::new(),
///     StatsOptions::default(),
///     StatsMatcher::accept_all(),
///     TagProducer::new(),
/// );
///
/// let mut flusher = Flusher::new(store.clone(), Arc::new(RealTimeSource));
/// let summary = flusher.flush();
/// assert_eq!(summary.sinks, 0);
/// assert_eq!(flusher.last_flush(), Some(summary.timestamp));
/// ```
pub struct Flusher {
    store: Store,
    time_source: Arc<dyn TimeSource>,
    last_flush: Option<UnixTimestamp>,
}

impl Flusher {
    /// Creates a flusher for the given store.
    pub fn new(store: Store, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            store,
            time_source,
            last_flush: None,
        }
    }

    /// Runs one flush cycle.
    ///
    /// Merges all histograms, latches all counters exactly once and hands the same [`Source`] to
    /// every sink.
    pub fn flush(&mut self) -> FlushSummary {
        let start = self.time_source.monotonic_time();
        let timestamp = UnixTimestamp::now(&*self.time_source);

        self.store.merge_histograms();

        let mut source = StoreSource::new(&self.store, timestamp);
        source.cached_counters();
        let (sinks, failed_sinks) = self.store.flush_sinks(&mut source);
        source.clear_cache();

        let duration = self
            .time_source
            .monotonic_time()
            .saturating_duration_since(start);

        tally_log::debug!(
            %timestamp,
            ?duration,
            sinks,
            failed_sinks,
            "flushed stats"
        );

        self.last_flush = Some(timestamp);

        FlushSummary {
            timestamp,
            duration,
            sinks,
            failed_sinks,
        }
    }

    /// Returns the timestamp of the last flush cycle.
    pub fn last_flush(&self) -> Option<UnixTimestamp> {
        self.last_flush
    }

    /// Returns the flushed store.
    pub fn store(&self) -> &Store {
        &self.store
    }
}

impl std::fmt::Debug for Flusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flusher")
            .field("store", &self.store)
            .field("last_flush", &self.last_flush)
            .finish()
    }
}
