//! Stats for a high-throughput proxy.
//!
//! This crate provides the machinery that lets every component cheaply create, update and export
//! counters, gauges and histograms. Stats are identified by a dotted name and a set of tags.
//!
//! # Creating Stats
//!
//! Stats are created through a [`Store`] or one of its [`Scope`]s. A scope prepends its prefix to
//! all names, so components can be handed a scope without knowing where they are mounted:
//!
//! ```
//! use tally_stats::{StatsMatcher, StatsOptions, Store, SymbolTable, TagProducer};
//!
//! let store = Store::new(
//!     SymbolTable::new(),
//!     StatsOptions::default(),
//!     StatsMatcher::accept_all(),
//!     TagProducer::with_default_tags(),
//! );
//!
//! let cluster = store.create_scope("cluster.backend");
//! cluster.counter("upstream_rq_200").inc();
//! cluster.gauge("upstream_cx_active").set(4);
//! cluster.histogram("upstream_rq_time").record_value(12);
//!
//! let counter = store.counter("cluster.backend.upstream_rq_200");
//! assert_eq!(counter.value(), 1);
//! assert_eq!(counter.tag_extracted_name(), "cluster.upstream_rq");
//! ```
//!
//! Looking up a name returns a shared container that is cached by the store. Callers are expected
//! to look up their stats once and keep the returned handles, since updates are much cheaper than
//! lookups.
//!
//! # Names and Symbols
//!
//! Names are interned by a [`SymbolTable`] into [`StatName`]s, sequences of reference counted
//! symbols. The table is passed to the store explicitly and may be shared by several stores.
//!
//! # Filtering
//!
//! A [`StatsMatcher`] decides whether a stat is tracked. Rejected stats are replaced by shared
//! null containers, which bounds memory when names are derived from client input.
//!
//! # Exporting
//!
//! Stats are exported by [`Sink`]s. A [`Flusher`] periodically merges histograms and hands a
//! [`Source`] enumerating all stats to every registered sink. Sinks also receive every value
//! recorded into a histogram through [`Sink::on_histogram_complete`].

#![warn(missing_docs)]

mod config;
mod flush;
mod histogram;
mod matcher;
mod metric;
mod sink;
mod store;
mod symbol;
mod tags;
mod timespan;

pub use crate::config::*;
pub use crate::flush::*;
pub use crate::histogram::{
    HistogramData, HistogramStatistics, DEFAULT_BUCKETS, SUPPORTED_QUANTILES,
};
pub use crate::matcher::*;
pub use crate::metric::{Counter, Gauge, Histogram, Metric, ParentHistogram};
pub use crate::sink::{CounterSnapshot, Sink, SinkError, Source, StoreSource};
pub use crate::store::*;
pub use crate::symbol::*;
pub use crate::tags::*;
pub use crate::timespan::*;
