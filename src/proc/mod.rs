//! Record processing helpers
//!
//! Comparators, an external stable sort and a keyed count aggregator, used by
//! import (ordering input by time) and indexing (building per-chunk key
//! tables).

pub mod aggregate;
pub mod compare;
pub mod sort;
pub mod spill;

pub use aggregate::{CountAggregator, COUNT_FIELD, KEY_FIELD};
pub use compare::{by_field, by_ts, RecordCompare};
pub use sort::{sort_reader, Sorter};
pub use spill::{MergeRuns, Spiller};
