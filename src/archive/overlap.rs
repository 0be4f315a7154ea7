//! Chunk overlap merger
//!
//! Sweeps the chunk endpoints of one day partition in direction order and
//! cuts the timeline wherever the set of covering chunks changes:
//!
//! ```text
//! C1  |----------|
//! C2       |-----------|
//! C3                 |------|
//!     [C1 ][C1,C2][C2][C2,C3][C3]
//! ```

use crate::archive::chunk::Chunk;
use crate::span::{Direction, Span, Ts};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// A partition of time and the chunks that have records in it. Records read
/// from the chunks must be clamped to `span`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanInfo {
    pub span: Span,
    pub chunks: Vec<Chunk>,
}

impl SpanInfo {
    /// First tick of the partition under `dir`.
    pub fn first(&self, dir: Direction) -> Ts {
        self.span.first_in(dir)
    }

    pub fn last(&self, dir: Direction) -> Ts {
        self.span.last_in(dir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Start,
    End,
}

/// Partition `chunks` into disjoint spans ordered by `dir`, each clipped to
/// `filter`. Chunks within a `SpanInfo` keep their input order.
pub fn merge_chunks(chunks: &[Chunk], filter: Span, dir: Direction) -> Vec<SpanInfo> {
    let mut events: Vec<(Ts, Edge, usize)> = Vec::with_capacity(chunks.len() * 2);
    for (i, chunk) in chunks.iter().enumerate() {
        let span = chunk.span();
        events.push((span.first_in(dir), Edge::Start, i));
        events.push((span.last_in(dir), Edge::End, i));
    }
    events.sort_by(|a, b| dir.compare(a.0, b.0));

    let mut out = Vec::new();
    let mut active: BTreeSet<usize> = BTreeSet::new();
    let mut prev_cut: Ts = 0;

    let mut emit = |from: Ts, to: Ts, active: &BTreeSet<usize>| {
        // from is past to when the cut already moved beyond this tick
        if active.is_empty() || dir.compare(from, to) == Ordering::Greater {
            return;
        }
        let span = Span::from_first_last(from, to).intersect(&filter);
        if span.is_empty() {
            return;
        }
        out.push(SpanInfo {
            span,
            chunks: active.iter().map(|&i| chunks[i].clone()).collect(),
        });
    };

    let mut i = 0;
    while i < events.len() {
        let ts = events[i].0;
        let mut j = i;
        while j < events.len() && events[j].0 == ts {
            j += 1;
        }
        let group = &events[i..j];

        if group.iter().any(|e| e.1 == Edge::Start) {
            emit(prev_cut, dir.prev_ts(ts), &active);
            active.extend(group.iter().filter(|e| e.1 == Edge::Start).map(|e| e.2));
            prev_cut = ts;
        }
        if group.iter().any(|e| e.1 == Edge::End) {
            emit(prev_cut, ts, &active);
            for e in group.iter().filter(|e| e.1 == Edge::End) {
                active.remove(&e.2);
            }
            prev_cut = dir.next_ts(ts);
        }
        i = j;
    }
    out
}
