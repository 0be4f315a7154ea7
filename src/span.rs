//! Timestamps, spans and sort direction
//!
//! Timestamps are nanoseconds since the Unix epoch. A `Span` is the half-open
//! interval `[ts, ts + dur)`. Chunk bounds are stored Direction-relative
//! (`first` is the first record encountered under the archive's direction)
//! and converted to spans for interval arithmetic.

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Nanosecond timestamp
pub type Ts = i64;

/// Nanoseconds in one day
pub const DAY_NS: i64 = 86_400 * 1_000_000_000;

/// Largest representable timestamp
pub const MAX_TS: Ts = i64::MAX;

/// Sort direction of an archive or index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Direction {
    /// Ascending time
    #[serde(rename = "ascending")]
    Forward,
    /// Descending time: greater timestamps compare less
    #[serde(rename = "descending")]
    #[default]
    Reverse,
}

impl Direction {
    pub fn from_descending(descending: bool) -> Self {
        if descending {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    pub fn is_reverse(self) -> bool {
        self == Direction::Reverse
    }

    /// Order two timestamps under this direction.
    pub fn compare(self, a: Ts, b: Ts) -> Ordering {
        match self {
            Direction::Forward => a.cmp(&b),
            Direction::Reverse => b.cmp(&a),
        }
    }

    /// Apply this direction to an ascending ordering.
    pub fn apply(self, ord: Ordering) -> Ordering {
        match self {
            Direction::Forward => ord,
            Direction::Reverse => ord.reverse(),
        }
    }

    /// One tick further along the direction.
    pub fn next_ts(self, ts: Ts) -> Ts {
        match self {
            Direction::Forward => ts.saturating_add(1),
            Direction::Reverse => ts.saturating_sub(1),
        }
    }

    /// One tick back against the direction.
    pub fn prev_ts(self, ts: Ts) -> Ts {
        match self {
            Direction::Forward => ts.saturating_sub(1),
            Direction::Reverse => ts.saturating_add(1),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Forward => write!(f, "ascending"),
            Direction::Reverse => write!(f, "descending"),
        }
    }
}

/// Half-open time interval `[ts, ts + dur)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub ts: Ts,
    pub dur: i64,
}

impl Span {
    pub fn new(ts: Ts, dur: i64) -> Self {
        Self { ts, dur }
    }

    /// Span covering every non-negative timestamp
    pub fn all() -> Self {
        Self { ts: 0, dur: MAX_TS }
    }

    /// Span covering the inclusive range between two timestamps in either order.
    pub fn from_first_last(first: Ts, last: Ts) -> Self {
        let (lo, hi) = if first <= last {
            (first, last)
        } else {
            (last, first)
        };
        Self {
            ts: lo,
            dur: hi.saturating_sub(lo).saturating_add(1),
        }
    }

    /// Exclusive end
    pub fn end(&self) -> Ts {
        self.ts.saturating_add(self.dur)
    }

    /// Inclusive last tick
    pub fn last(&self) -> Ts {
        self.end() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.dur <= 0
    }

    pub fn contains(&self, ts: Ts) -> bool {
        ts >= self.ts && ts < self.end()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        !self.is_empty() && !other.is_empty() && self.ts < other.end() && other.ts < self.end()
    }

    /// Common part of two spans; empty (zero duration) when disjoint.
    pub fn intersect(&self, other: &Span) -> Span {
        let ts = self.ts.max(other.ts);
        let end = self.end().min(other.end());
        if end <= ts {
            return Span { ts, dur: 0 };
        }
        Span { ts, dur: end - ts }
    }

    /// Smallest span covering both.
    pub fn union(&self, other: &Span) -> Span {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let ts = self.ts.min(other.ts);
        let end = self.end().max(other.end());
        Span { ts, dur: end - ts }
    }

    /// First tick encountered when walking in `dir`.
    pub fn first_in(&self, dir: Direction) -> Ts {
        match dir {
            Direction::Forward => self.ts,
            Direction::Reverse => self.last(),
        }
    }

    /// Last tick encountered when walking in `dir`.
    pub fn last_in(&self, dir: Direction) -> Ts {
        match dir {
            Direction::Forward => self.last(),
            Direction::Reverse => self.ts,
        }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", format_ts(self.ts), format_ts(self.last()))
    }
}

/// The UTC day containing `ts`.
pub fn day_of(ts: Ts) -> Span {
    Span {
        ts: ts.div_euclid(DAY_NS) * DAY_NS,
        dur: DAY_NS,
    }
}

/// Directory name (`YYYYMMDD`) of the UTC day containing `ts`.
pub fn day_dir_name(ts: Ts) -> String {
    Utc.timestamp_nanos(day_of(ts).ts)
        .format("%Y%m%d")
        .to_string()
}

/// Render a timestamp as RFC3339 with nanosecond precision.
pub fn format_ts(ts: Ts) -> String {
    Utc.timestamp_nanos(ts)
        .to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
