//! Chunks and their on-disk names
//!
//! ```text
//! <data_root>/YYYYMMDD/<first_ts>-<uuid>.rec          chunk records
//! <data_root>/YYYYMMDD/<first_ts>-<uuid>.rec.seek     seek index (ts -> offset)
//! <data_root>/YYYYMMDD/<first_ts>-<uuid>.rec.zar/     per-chunk indexes
//! ```

use crate::error::{ZarError, ZarResult};
use crate::span::{day_dir_name, Direction, Span, Ts};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const CHUNK_EXT: &str = "rec";
pub const SEEK_EXT: &str = "seek";
pub const ZAR_DIR_EXT: &str = "zar";

/// Index name that refers to the chunk file itself
pub const SELF_NAME: &str = "_";

fn log_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(\d{8})/(-?\d+)-([0-9a-f]{32})\.rec$").ok())
        .as_ref()
}

/// Path of a chunk relative to the data root, using forward slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(String);

impl LogId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Name a new chunk whose first record has timestamp `first`.
    pub fn for_chunk(first: Ts) -> Self {
        Self(format!(
            "{}/{}-{}.{}",
            day_dir_name(first),
            first,
            uuid::Uuid::new_v4().simple(),
            CHUNK_EXT
        ))
    }

    /// Parse and validate a log id string.
    pub fn parse(s: &str) -> ZarResult<Self> {
        let id = Self(s.to_string());
        id.components()
            .ok_or_else(|| ZarError::Validation(format!("malformed log id \"{}\"", s)))?;
        Ok(id)
    }

    /// Day directory, first timestamp and chunk id.
    pub fn components(&self) -> Option<(&str, Ts, &str)> {
        let caps = log_id_pattern()?.captures(&self.0)?;
        let day = caps.get(1)?.as_str();
        let first = caps.get(2)?.as_str().parse().ok()?;
        let id = caps.get(3)?.as_str();
        Some((day, first, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute path under `data_root`.
    pub fn path(&self, data_root: &Path) -> PathBuf {
        self.0
            .split('/')
            .fold(data_root.to_path_buf(), |p, part| p.join(part))
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chunk of records bounded by `first` and `last`, both inclusive and
/// relative to the archive direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub log_id: LogId,
    pub first: Ts,
    pub last: Ts,
    pub record_count: u64,
}

impl Chunk {
    pub fn new(log_id: LogId, first: Ts, last: Ts, record_count: u64) -> Self {
        Self {
            log_id,
            first,
            last,
            record_count,
        }
    }

    /// Chronological span covered by the chunk.
    pub fn span(&self) -> Span {
        Span::from_first_last(self.first, self.last)
    }

    pub fn path(&self, data_root: &Path) -> PathBuf {
        self.log_id.path(data_root)
    }

    pub fn seek_path(&self, data_root: &Path) -> PathBuf {
        with_suffix(self.path(data_root), SEEK_EXT)
    }

    /// Directory holding this chunk's indexes.
    pub fn zar_dir(&self, data_root: &Path) -> PathBuf {
        with_suffix(self.path(data_root), ZAR_DIR_EXT)
    }

    /// Resolve a name relative to the chunk: `_` is the chunk file, anything
    /// else lives in the zar directory.
    pub fn localize(&self, data_root: &Path, name: &str) -> PathBuf {
        if name == SELF_NAME {
            self.path(data_root)
        } else {
            self.zar_dir(data_root).join(name)
        }
    }

    pub(crate) fn to_entry(&self) -> SpanEntry {
        SpanEntry {
            span: self.span(),
            log_id: self.log_id.clone(),
            record_count: self.record_count,
        }
    }

    pub(crate) fn from_entry(entry: SpanEntry, direction: Direction) -> Self {
        Self {
            first: entry.span.first_in(direction),
            last: entry.span.last_in(direction),
            log_id: entry.log_id,
            record_count: entry.record_count,
        }
    }
}

fn with_suffix(path: PathBuf, ext: &str) -> PathBuf {
    let mut s = path.into_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Persisted form of a chunk in the metadata file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SpanEntry {
    pub span: Span,
    pub log_id: LogId,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub record_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_id_layout() {
        let id = LogId::for_chunk(1_587_517_405_066_655_910);
        let (day, first, uid) = id.components().unwrap();
        assert_eq!(day, "20200422");
        assert_eq!(first, 1_587_517_405_066_655_910);
        assert_eq!(uid.len(), 32);
        assert!(LogId::parse(id.as_str()).is_ok());
        assert!(LogId::parse("../etc/passwd").is_err());
    }

    #[test]
    fn test_chunk_paths() {
        let id = LogId::new("20200422/5-0123456789abcdef0123456789abcdef.rec");
        let chunk = Chunk::new(id, 9, 5, 2);
        let root = Path::new("/data");
        assert_eq!(
            chunk.path(root),
            Path::new("/data/20200422/5-0123456789abcdef0123456789abcdef.rec")
        );
        assert_eq!(
            chunk.seek_path(root),
            Path::new("/data/20200422/5-0123456789abcdef0123456789abcdef.rec.seek")
        );
        assert_eq!(
            chunk.localize(root, "idx:type:int64"),
            Path::new("/data/20200422/5-0123456789abcdef0123456789abcdef.rec.zar/idx:type:int64")
        );
        assert_eq!(chunk.localize(root, "_"), chunk.path(root));
    }

    #[test]
    fn test_entry_direction_relative() {
        let id = LogId::new("20200422/9-0123456789abcdef0123456789abcdef.rec");
        let chunk = Chunk::new(id, 9, 5, 2);
        let entry = chunk.to_entry();
        assert_eq!(entry.span, Span::from_first_last(5, 9));
        assert_eq!(Chunk::from_entry(entry, Direction::Reverse), chunk);
    }
}
