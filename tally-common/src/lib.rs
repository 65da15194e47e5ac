//! Common functionality shared by the tally crates.
//!
//! This crate holds the small capabilities that the stats core consumes from its host but does
//! not implement itself, most notably the [`TimeSource`] used to timestamp flush cycles and to
//! measure timespans, and the [`Glob`] patterns used to match stat names.

#![warn(missing_docs)]

mod glob;
mod time;

pub use crate::glob::*;
pub use crate::time::*;
