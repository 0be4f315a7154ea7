//! Scanners
//!
//! A scanner is a pull-style record source that owns its inputs and releases
//! them on `close`:
//!
//! ```text
//! chunk file ─▶ ReaderScanner (seek, span clamp, filter) ─┐
//! chunk file ─▶ ReaderScanner ────────────────────────────┼─▶ Combiner (k-way merge)
//! chunk file ─▶ ReaderScanner ────────────────────────────┘
//! ```
//!
//! - **scanner**: single-source scanner and the chunk opener
//! - **combiner**: ordered merge of several scanners

pub mod combiner;
pub mod scanner;

pub use combiner::Combiner;
pub use scanner::{open_chunk, ReaderScanner, DEFAULT_BATCH_SIZE};

use crate::error::ZarResult;
use crate::record::Record;
use crate::span::Span;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Records pulled from a scanner in one step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// Point-in-time copy of the progress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub bytes_read: u64,
    pub bytes_matched: u64,
    pub records_read: u64,
    pub records_matched: u64,
}

impl std::ops::Add for ProgressSnapshot {
    type Output = ProgressSnapshot;

    fn add(self, rhs: Self) -> Self {
        Self {
            bytes_read: self.bytes_read + rhs.bytes_read,
            bytes_matched: self.bytes_matched + rhs.bytes_matched,
            records_read: self.records_read + rhs.records_read,
            records_matched: self.records_matched + rhs.records_matched,
        }
    }
}

/// Monotonic counters, readable while the owner is pulling.
#[derive(Debug, Default)]
pub struct Progress {
    bytes_read: AtomicU64,
    bytes_matched: AtomicU64,
    records_read: AtomicU64,
    records_matched: AtomicU64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_read(&self, bytes: u64, records: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.records_read.fetch_add(records, Ordering::Relaxed);
    }

    pub fn add_matched(&self, bytes: u64, records: u64) {
        self.bytes_matched.fetch_add(bytes, Ordering::Relaxed);
        self.records_matched.fetch_add(records, Ordering::Relaxed);
    }

    /// Fold another scanner's totals into these counters.
    pub fn accumulate(&self, other: ProgressSnapshot) {
        self.add_read(other.bytes_read, other.records_read);
        self.add_matched(other.bytes_matched, other.records_matched);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_matched: self.bytes_matched.load(Ordering::Relaxed),
            records_read: self.records_read.load(Ordering::Relaxed),
            records_matched: self.records_matched.load(Ordering::Relaxed),
        }
    }
}

/// Compiled predicate
pub type Filter = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Source form of a predicate, for scanners that evaluate it natively
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpr(Arc<str>);

impl FilterExpr {
    pub fn new(expr: impl AsRef<str>) -> Self {
        Self(Arc::from(expr.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Predicate and time span handed to every source. Cheap to clone.
#[derive(Clone)]
pub struct SourceFilter {
    pub filter: Option<Filter>,
    pub expr: Option<FilterExpr>,
    pub span: Span,
}

impl SourceFilter {
    /// Everything within `span`.
    pub fn new(span: Span) -> Self {
        Self {
            filter: None,
            expr: None,
            span,
        }
    }

    pub fn with_filter(mut self, filter: Filter, expr: Option<FilterExpr>) -> Self {
        self.filter = Some(filter);
        self.expr = expr;
        self
    }

    /// Same predicate over a different span.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            span,
            ..self.clone()
        }
    }

    pub fn matches(&self, rec: &Record) -> bool {
        self.filter.as_ref().map_or(true, |f| f(rec))
    }
}

impl std::fmt::Debug for SourceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFilter")
            .field("filter", &self.filter.is_some())
            .field("expr", &self.expr)
            .field("span", &self.span)
            .finish()
    }
}

/// A pull-style record source
#[async_trait]
pub trait Scanner: Send {
    /// Next batch, or `None` at end of stream.
    async fn pull(&mut self) -> ZarResult<Option<Batch>>;

    fn progress(&self) -> ProgressSnapshot;

    /// Release the scanner's inputs. Safe to call more than once.
    fn close(&mut self) -> ZarResult<()>;

    fn name(&self) -> String;

    /// Whether batches have already been filtered by the source predicate.
    fn applies_filter(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_accumulates() {
        let p = Progress::new();
        p.add_read(100, 4);
        p.add_matched(50, 2);
        let other = ProgressSnapshot {
            bytes_read: 10,
            bytes_matched: 5,
            records_read: 1,
            records_matched: 1,
        };
        p.accumulate(other);
        let snap = p.snapshot();
        assert_eq!(snap.bytes_read, 110);
        assert_eq!(snap.records_matched, 3);
        assert_eq!(snap + other, ProgressSnapshot {
            bytes_read: 120,
            bytes_matched: 60,
            records_read: 6,
            records_matched: 4,
        });
    }

    #[test]
    fn test_source_filter_default_matches() {
        let f = SourceFilter::new(Span::all());
        let zctx = crate::record::TypeContext::new();
        let ty = zctx
            .lookup_record(vec![crate::record::Column::new("x", crate::record::Type::Int64)])
            .unwrap();
        let rec = Record::new(ty, vec![crate::record::Value::Int(1)]).unwrap();
        assert!(f.matches(&rec));
        let f = f.with_filter(Arc::new(|r: &Record| r.int("x") == Some(2)), None);
        assert!(!f.matches(&rec));
    }
}
