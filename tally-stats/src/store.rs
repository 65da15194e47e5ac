use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use hashbrown::{Equivalent, HashMap, HashSet};
use parking_lot::RwLock;

use crate::config::{ConfigError, StatsConfig, StatsOptions};
use crate::matcher::StatsMatcher;
use crate::metric::{
    Counter, CounterImpl, Gauge, GaugeImpl, Histogram, Metric, MetricIdentity, NullCounter,
    NullGauge, NullHistogram, ParentHistogram, ParentHistogramImpl,
};
use crate::sink::{Sink, SinkRegistry, Source};
use crate::symbol::{StatName, StatNameStorage, Symbol, SymbolTable, SEPARATOR};
use crate::tags::{Tag, TagProducer, TRUNCATED_TAG};

type Cache<T> = RwLock<HashMap<StatKey, Arc<T>>>;

/// Identity of a cached stat.
///
/// Plain lookups are keyed by their full name and no tags. Lookups with explicit tags are keyed by
/// the tag-extracted name and one symbol per tag name and tag value.
struct StatKey {
    name: StatNameStorage,
    tags: StatNameStorage,
}

impl StatKey {
    fn borrowed(&self) -> StatKeyRef<'_> {
        StatKeyRef {
            name: self.name.stat_name().symbols(),
            tags: self.tags.stat_name().symbols(),
        }
    }
}

impl PartialEq for StatKey {
    fn eq(&self, other: &Self) -> bool {
        self.borrowed() == other.borrowed()
    }
}

impl Eq for StatKey {}

impl Hash for StatKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.borrowed().hash(state);
    }
}

/// A borrowed [`StatKey`], used to query caches without taking symbol references.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct StatKeyRef<'a> {
    name: &'a [Symbol],
    tags: &'a [Symbol],
}

impl Equivalent<StatKey> for StatKeyRef<'_> {
    fn equivalent(&self, key: &StatKey) -> bool {
        *self == key.borrowed()
    }
}

/// Explicit tags of a lookup.
struct TaggedLookup<'a> {
    /// The name without tags.
    base: &'a StatName,
    /// One symbol per tag name and value.
    symbols: &'a StatName,
    /// Tags sorted by name, without duplicate names.
    tags: &'a [Tag],
}

/// A request for a single stat.
struct Lookup<'a> {
    /// The fully qualified name, as reported by the stat and checked by the matcher.
    name: &'a StatName,
    tagged: Option<TaggedLookup<'a>>,
}

impl<'a> Lookup<'a> {
    fn plain(name: &'a StatName) -> Self {
        Self { name, tagged: None }
    }

    fn key(&self) -> StatKeyRef<'_> {
        match &self.tagged {
            Some(tagged) => StatKeyRef {
                name: tagged.base.symbols(),
                tags: tagged.symbols.symbols(),
            },
            None => StatKeyRef {
                name: self.name.symbols(),
                tags: &[],
            },
        }
    }

    fn to_key(&self, table: &SymbolTable) -> StatKey {
        match &self.tagged {
            Some(tagged) => StatKey {
                name: table.join(&[tagged.base]),
                tags: table.join(&[tagged.symbols]),
            },
            None => StatKey {
                name: table.join(&[self.name]),
                tags: table.join(&[]),
            },
        }
    }
}

/// State shared by a store and all of its scopes.
struct StoreShared {
    symbol_table: SymbolTable,
    options: StatsOptions,
    matcher: RwLock<StatsMatcher>,
    tag_producer: TagProducer,
    counters: Cache<CounterImpl>,
    gauges: Cache<GaugeImpl>,
    histograms: Cache<ParentHistogramImpl>,
    /// Lookups the matcher rejected, so it runs only once per identity.
    rejected: RwLock<HashSet<StatKey>>,
    null_counter: Arc<dyn Counter>,
    null_gauge: Arc<dyn Gauge>,
    null_histogram: Arc<dyn Histogram>,
    sinks: Arc<SinkRegistry>,
}

impl StoreShared {
    fn counter(&self, lookup: Lookup<'_>) -> Arc<dyn Counter> {
        if let Some(counter) = self.find_or_create(&self.counters, lookup, CounterImpl::new) {
            return counter;
        }
        Arc::clone(&self.null_counter)
    }

    fn gauge(&self, lookup: Lookup<'_>) -> Arc<dyn Gauge> {
        if let Some(gauge) = self.find_or_create(&self.gauges, lookup, GaugeImpl::new) {
            return gauge;
        }
        Arc::clone(&self.null_gauge)
    }

    fn histogram(&self, lookup: Lookup<'_>) -> Arc<dyn Histogram> {
        let create = |identity| ParentHistogramImpl::new(identity, Arc::clone(&self.sinks));
        if let Some(histogram) = self.find_or_create(&self.histograms, lookup, create) {
            return histogram;
        }
        Arc::clone(&self.null_histogram)
    }

    /// Returns the cached stat for `lookup`, creating it unless the matcher rejects the name.
    fn find_or_create<T>(
        &self,
        cache: &Cache<T>,
        lookup: Lookup<'_>,
        create: impl FnOnce(MetricIdentity) -> T,
    ) -> Option<Arc<T>> {
        if let Some(metric) = cache.read().get(&lookup.key()) {
            return Some(Arc::clone(metric));
        }

        if self.is_rejected(&lookup) {
            return None;
        }

        let (identity, truncated_key) = self.identity(&lookup);

        let mut cache = cache.write();
        if let Some(metric) = cache.get(&lookup.key()) {
            return Some(Arc::clone(metric));
        }

        let metric = match truncated_key {
            // Lookups truncating to the same identity share one container. The requested key
            // becomes an alias of it.
            Some(truncated_key) => Arc::clone(
                cache
                    .entry(truncated_key)
                    .or_insert_with(|| Arc::new(create(identity))),
            ),
            None => Arc::new(create(identity)),
        };

        cache.insert(lookup.to_key(&self.symbol_table), Arc::clone(&metric));
        Some(metric)
    }

    fn is_rejected(&self, lookup: &Lookup<'_>) -> bool {
        let matcher = self.matcher.read();

        if matcher.accepts_all() {
            return false;
        }
        if matcher.rejects_all() {
            return true;
        }
        if self.rejected.read().contains(&lookup.key()) {
            return true;
        }

        let rejected = matcher.rejects(&self.symbol_table.to_string(lookup.name));
        if rejected {
            self.rejected
                .write()
                .insert(lookup.to_key(&self.symbol_table));
        }

        rejected
    }

    /// Builds names and tags of a new stat, truncating them to the configured limits.
    ///
    /// If anything was truncated, also returns the key of the truncated identity.
    fn identity(&self, lookup: &Lookup<'_>) -> (MetricIdentity, Option<StatKey>) {
        let table = &self.symbol_table;
        let options = &self.options;

        let mut stat_name = table.to_string(lookup.name);
        let (mut extracted_name, mut tags) = match &lookup.tagged {
            Some(tagged) => {
                let mut tags = tagged.tags.to_vec();
                tags.extend_from_slice(self.tag_producer.fixed_tags());
                (table.to_string(tagged.base), tags)
            }
            None => self.tag_producer.produce_tags(&stat_name),
        };

        let name_length = stat_name.len();
        let name_truncated = truncate(&mut stat_name, options.max_name_length);
        let mut truncated = name_truncated;
        truncated |= truncate(&mut extracted_name, options.max_name_length);
        truncated |= tags.len() > options.max_tags;
        for tag in &mut tags {
            truncated |= truncate(&mut tag.value, options.max_tag_value_length);
        }

        if !truncated {
            let identity = MetricIdentity {
                name: table.join(&[lookup.name]),
                tag_extracted_name: table.encode(&extracted_name),
                tags,
            };
            return (identity, None);
        }

        tally_log::warn!(
            stat = %stat_name,
            length = name_length,
            tags = tags.len(),
            "stat exceeds name or tag limits, truncating"
        );
        tags.truncate(options.max_tags.saturating_sub(1));
        tags.push(Tag::new(TRUNCATED_TAG, "true"));

        let name = if name_truncated {
            table.encode(&stat_name)
        } else {
            table.join(&[lookup.name])
        };
        let tag_extracted_name = table.encode(&extracted_name);

        let key = match lookup.tagged {
            Some(_) => StatKey {
                name: tag_extracted_name.clone(),
                tags: tag_symbols(table, &tags),
            },
            None => StatKey {
                name: name.clone(),
                tags: table.join(&[]),
            },
        };

        let identity = MetricIdentity {
            name,
            tag_extracted_name,
            tags,
        };
        (identity, Some(key))
    }
}

/// Truncates `string` to at most `max` bytes on a character boundary.
///
/// Returns `true` if the string was modified.
fn truncate(string: &mut String, max: usize) -> bool {
    if string.len() <= max {
        return false;
    }

    let mut end = max;
    while !string.is_char_boundary(end) {
        end -= 1;
    }
    string.truncate(end);
    true
}

/// Encodes tag names and values into one symbol each.
fn tag_symbols(table: &SymbolTable, tags: &[Tag]) -> StatNameStorage {
    table.encode_fragments(tags.iter().flat_map(|tag| [tag.name.as_str(), tag.value.as_str()]))
}

/// Returns every stat of a cache once, sorted by name.
///
/// Truncated stats are cached under several keys.
fn unique<T: Metric>(cache: &Cache<T>) -> Vec<Arc<T>> {
    let mut metrics: Vec<_> = cache.read().values().cloned().collect();
    metrics.sort_by_cached_key(|metric| (metric.name(), Arc::as_ptr(metric) as usize));
    metrics.dedup_by(|a, b| Arc::ptr_eq(a, b));
    metrics
}

/// Returns all stats of a cache, sorted by name.
fn snapshot<T, D>(cache: &Cache<T>, upcast: fn(Arc<T>) -> Arc<D>) -> Vec<Arc<D>>
where
    T: Metric,
    D: ?Sized,
{
    unique(cache).into_iter().map(upcast).collect()
}

/// A fully qualified lookup with explicit tags.
struct Qualified {
    name: StatNameStorage,
    base: StatNameStorage,
    symbols: StatNameStorage,
    tags: Vec<Tag>,
}

impl Qualified {
    fn lookup(&self) -> Lookup<'_> {
        Lookup {
            name: self.name.stat_name(),
            tagged: Some(TaggedLookup {
                base: self.base.stat_name(),
                symbols: self.symbols.stat_name(),
                tags: &self.tags,
            }),
        }
    }
}

/// A namespace for creating stats.
///
/// All stats created through a scope have the scope's prefix prepended to their name. Scopes can
/// be nested with [`create_scope`](Self::create_scope). Stats are owned by the [`Store`], so
/// dropping a scope never drops the stats created through it.
///
/// Looking up the same name twice returns the same shared container. If the store's
/// [`StatsMatcher`] rejects the name, a shared null container is returned that ignores all
/// updates.
#[derive(Clone)]
pub struct Scope {
    shared: Arc<StoreShared>,
    prefix: StatNameStorage,
}

impl Scope {
    /// Returns the prefix of this scope, without trailing separator.
    pub fn prefix(&self) -> String {
        self.prefix.to_string()
    }

    /// Creates a nested scope with prefix `{prefix}.{name}`.
    ///
    /// A trailing `.` in `name` is ignored.
    pub fn create_scope(&self, name: &str) -> Scope {
        let name = name.strip_suffix(SEPARATOR).unwrap_or(name);
        let table = &self.shared.symbol_table;
        let suffix = table.encode(name);

        Scope {
            shared: Arc::clone(&self.shared),
            prefix: table.join(&[self.prefix.stat_name(), suffix.stat_name()]),
        }
    }

    /// Returns the counter with the given name.
    pub fn counter(&self, name: &str) -> Arc<dyn Counter> {
        let name = self.shared.symbol_table.encode(name);
        self.counter_from_stat_name(name.stat_name())
    }

    /// Returns the counter with the given pre-encoded name.
    pub fn counter_from_stat_name(&self, name: &StatName) -> Arc<dyn Counter> {
        let name = self.qualify(name);
        self.shared.counter(Lookup::plain(name.stat_name()))
    }

    /// Returns the counter with the given name and explicit tags.
    ///
    /// The tags are not extracted from the name. They are sorted by name and appended to it to
    /// form the fully qualified name. The tag-extracted name is the scope prefix plus `name`. If
    /// a tag name repeats, its first value is used.
    ///
    /// Stats with explicit tags are distinct from stats without, even if their fully qualified
    /// names are spelled the same.
    pub fn counter_with_tags(&self, name: &str, tags: &[Tag]) -> Arc<dyn Counter> {
        let qualified = self.qualify_tagged(name, tags);
        self.shared.counter(qualified.lookup())
    }

    /// Returns the gauge with the given name.
    pub fn gauge(&self, name: &str) -> Arc<dyn Gauge> {
        let name = self.shared.symbol_table.encode(name);
        self.gauge_from_stat_name(name.stat_name())
    }

    /// Returns the gauge with the given pre-encoded name.
    pub fn gauge_from_stat_name(&self, name: &StatName) -> Arc<dyn Gauge> {
        let name = self.qualify(name);
        self.shared.gauge(Lookup::plain(name.stat_name()))
    }

    /// Returns the gauge with the given name and explicit tags.
    pub fn gauge_with_tags(&self, name: &str, tags: &[Tag]) -> Arc<dyn Gauge> {
        let qualified = self.qualify_tagged(name, tags);
        self.shared.gauge(qualified.lookup())
    }

    /// Returns the histogram with the given name.
    pub fn histogram(&self, name: &str) -> Arc<dyn Histogram> {
        let name = self.shared.symbol_table.encode(name);
        self.histogram_from_stat_name(name.stat_name())
    }

    /// Returns the histogram with the given pre-encoded name.
    pub fn histogram_from_stat_name(&self, name: &StatName) -> Arc<dyn Histogram> {
        let name = self.qualify(name);
        self.shared.histogram(Lookup::plain(name.stat_name()))
    }

    /// Returns the histogram with the given name and explicit tags.
    pub fn histogram_with_tags(&self, name: &str, tags: &[Tag]) -> Arc<dyn Histogram> {
        let qualified = self.qualify_tagged(name, tags);
        self.shared.histogram(qualified.lookup())
    }

    /// Returns the store's null gauge.
    ///
    /// The name is not looked up or matched. All null gauges of a store are the same instance.
    pub fn null_gauge(&self, _name: &str) -> Arc<dyn Gauge> {
        Arc::clone(&self.shared.null_gauge)
    }

    fn qualify(&self, name: &StatName) -> StatNameStorage {
        self.shared
            .symbol_table
            .join(&[self.prefix.stat_name(), name])
    }

    fn qualify_tagged(&self, name: &str, tags: &[Tag]) -> Qualified {
        let table = &self.shared.symbol_table;
        let suffix = table.encode(name);
        let base = self.qualify(suffix.stat_name());

        let mut unique_tags: Vec<Tag> = Vec::with_capacity(tags.len());
        for tag in tags {
            if !unique_tags.iter().any(|t| t.name == tag.name) {
                unique_tags.push(tag.clone());
            }
        }
        unique_tags.sort_by(|a, b| a.name.cmp(&b.name));

        let mut full_name = table.to_string(base.stat_name());
        for tag in &unique_tags {
            for part in [&tag.name, &tag.value] {
                if !full_name.is_empty() {
                    full_name.push(SEPARATOR);
                }
                full_name.push_str(part);
            }
        }

        Qualified {
            name: table.encode(&full_name),
            base,
            symbols: tag_symbols(table, &unique_tags),
            tags: unique_tags,
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// The owner of all stats.
///
/// The store caches every created stat and hands out shared references. It dereferences to its
/// root [`Scope`], which has an empty prefix, so all lookups are available directly on the store.
///
/// # Example
///
/// ```
/// use tally_stats::{StatsMatcher, StatsOptions, Store, SymbolTable, TagProducer};
///
/// let store = Store::new(
///     SymbolTable::new(),
///     StatsOptions::default(),
///     StatsMatcher::accept_all(),
///     TagProducer::new(),
/// );
///
/// let counter = store.counter("requests.total");
/// counter.add(5);
/// counter.inc();
/// assert_eq!(counter.value(), 6);
/// ```
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
    root: Scope,
}

impl Store {
    /// Creates a new store.
    pub fn new(
        symbol_table: SymbolTable,
        options: StatsOptions,
        matcher: StatsMatcher,
        tag_producer: TagProducer,
    ) -> Self {
        let null_counter = Arc::new(NullCounter::new(&symbol_table));
        let null_gauge = Arc::new(NullGauge::new(&symbol_table));
        let null_histogram = Arc::new(NullHistogram::new(&symbol_table));
        let prefix = symbol_table.encode("");

        let shared = Arc::new(StoreShared {
            symbol_table,
            options,
            matcher: RwLock::new(matcher),
            tag_producer,
            counters: RwLock::default(),
            gauges: RwLock::default(),
            histograms: RwLock::default(),
            rejected: RwLock::default(),
            null_counter,
            null_gauge,
            null_histogram,
            sinks: Arc::default(),
        });

        let root = Scope {
            shared: Arc::clone(&shared),
            prefix,
        };

        Self { shared, root }
    }

    /// Creates a store from configuration.
    ///
    /// Fails if the matcher or the tag specifiers are invalid.
    pub fn from_config(symbol_table: SymbolTable, config: &StatsConfig) -> Result<Self, ConfigError> {
        let matcher = StatsMatcher::new(&config.matcher)?;
        let tag_producer = TagProducer::from_specifiers(&config.tags, config.use_all_default_tags)?;

        tally_log::debug!(
            tags = tag_producer.num_extractors(),
            "creating stats store from config"
        );

        Ok(Self::new(symbol_table, config.options, matcher, tag_producer))
    }

    /// Returns the root scope.
    pub fn root_scope(&self) -> &Scope {
        &self.root
    }

    /// Returns the symbol table of this store.
    pub fn symbol_table(&self) -> &SymbolTable {
        &self.shared.symbol_table
    }

    /// Returns the limits applied to new stats.
    pub fn stats_options(&self) -> &StatsOptions {
        &self.shared.options
    }

    /// Returns all counters, sorted by name.
    pub fn counters(&self) -> Vec<Arc<dyn Counter>> {
        snapshot(&self.shared.counters, |c| c as Arc<dyn Counter>)
    }

    /// Returns all gauges, sorted by name.
    pub fn gauges(&self) -> Vec<Arc<dyn Gauge>> {
        snapshot(&self.shared.gauges, |g| g as Arc<dyn Gauge>)
    }

    /// Returns all histograms, sorted by name.
    pub fn histograms(&self) -> Vec<Arc<dyn ParentHistogram>> {
        snapshot(&self.shared.histograms, |h| h as Arc<dyn ParentHistogram>)
    }

    /// Merges the interval data of all histograms into their cumulative data.
    pub fn merge_histograms(&self) {
        for histogram in unique(&self.shared.histograms) {
            histogram.merge();
        }
    }

    /// Registers a sink.
    pub fn add_sink(&self, sink: Arc<dyn Sink>) {
        self.shared.sinks.add(sink);
    }

    /// Returns the number of registered sinks.
    pub fn num_sinks(&self) -> usize {
        self.shared.sinks.num_sinks()
    }

    /// Returns the number of sink failures since the store was created.
    pub fn sink_errors(&self) -> u64 {
        self.shared.sinks.errors()
    }

    /// Flushes `source` to all sinks.
    ///
    /// Returns the number of sinks and the number of sinks that failed.
    pub fn flush_sinks(&self, source: &mut dyn Source) -> (usize, usize) {
        self.shared.sinks.flush(source)
    }

    /// Delivers a recorded histogram value to all sinks.
    pub fn deliver_histogram_to_sinks(&self, histogram: &dyn Histogram, value: u64) {
        self.shared.sinks.deliver_histogram(histogram, value);
    }

    /// Replaces the stats matcher.
    ///
    /// Stats that already exist are not affected. Names rejected by the previous matcher are
    /// matched again on their next lookup.
    pub fn set_stats_matcher(&self, matcher: StatsMatcher) {
        let mut current = self.shared.matcher.write();
        *current = matcher;
        self.shared.rejected.write().clear();
        tally_log::debug!("stats matcher replaced");
    }

    /// Drops all cached stats and rejected names.
    ///
    /// Subsequent lookups create new stats. Holders of previously returned stats can keep using
    /// them, but they are no longer enumerated by the store.
    pub fn reset(&self) {
        let counters = std::mem::take(&mut *self.shared.counters.write());
        let gauges = std::mem::take(&mut *self.shared.gauges.write());
        let histograms = std::mem::take(&mut *self.shared.histograms.write());
        self.shared.rejected.write().clear();

        tally_log::info!(
            counters = counters.len(),
            gauges = gauges.len(),
            histograms = histograms.len(),
            "stats store reset"
        );
    }
}

impl Deref for Store {
    type Target = Scope;

    fn deref(&self) -> &Self::Target {
        &self.root
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("counters", &unique(&self.shared.counters).len())
            .field("gauges", &unique(&self.shared.gauges).len())
            .field("histograms", &unique(&self.shared.histograms).len())
            .field("sinks", &self.shared.sinks)
            .finish()
    }
}
