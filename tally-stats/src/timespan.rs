use std::sync::Arc;
use std::time::{Duration, Instant};

use tally_common::TimeSource;

use crate::metric::Histogram;

/// Measures a duration and records it into a histogram in milliseconds.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tally_common::RealTimeSource;
/// use tally_stats::{StatsMatcher, StatsOptions, Store, SymbolTable, TagProducer, Timespan};
///
/// let store = Store::new(
///     SymbolTable::new(),
///     StatsOptions::default(),
///     StatsMatcher::accept_all(),
///     TagProducer::new(),
/// );
///
/// let timespan = Timespan::new(store.histogram("rq_time"), Arc::new(RealTimeSource));
/// // handle the request
/// timespan.complete();
/// ```
pub struct Timespan {
    histogram: Arc<dyn Histogram>,
    time_source: Arc<dyn TimeSource>,
    start: Instant,
}

impl Timespan {
    /// Starts measuring.
    pub fn new(histogram: Arc<dyn Histogram>, time_source: Arc<dyn TimeSource>) -> Self {
        let start = time_source.monotonic_time();
        Self {
            histogram,
            time_source,
            start,
        }
    }

    /// Returns the time elapsed since the timespan started.
    pub fn elapsed(&self) -> Duration {
        self.time_source
            .monotonic_time()
            .saturating_duration_since(self.start)
    }

    /// Records the elapsed time in whole milliseconds.
    pub fn complete(self) {
        let millis = u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.histogram.record_value(millis);
    }
}

impl std::fmt::Debug for Timespan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timespan")
            .field("histogram", &self.histogram)
            .field("start", &self.start)
            .finish()
    }
}
