//! Archive error types
//!
//! A single error enum shared by the codec, micro-index, archive and scan
//! layers. Every variant that refers to on-disk state carries the offending
//! path or source name.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur anywhere in the archive
#[derive(Error, Debug)]
pub enum ZarError {
    /// A chunk, index or metadata file is missing
    #[error("not found: {0}")]
    NotFound(String),

    /// Structural validation of stored data failed
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// File lacks a readable micro-index trailer
    #[error("{path}: not a micro-index: {reason}")]
    NotAMicroIndex { path: String, reason: String },

    /// Stored version is outside the supported range
    #[error("{what}: unsupported version {found} (expected {expected})")]
    VersionMismatch {
        what: String,
        found: i64,
        expected: i64,
    },

    /// Operation would violate archive state (frozen view, existing archive)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Root has no readable metadata file
    #[error("{0}: not an archive")]
    NotAnArchive(String),

    /// A log filter selected no chunks
    #[error("no matching logs for filter")]
    NoMatchingLogs,

    /// Driving context was canceled
    #[error("operation canceled")]
    Canceled,

    /// I/O failure with the path that caused it
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure without path context
    #[error("IO error: {0}")]
    RawIo(#[from] std::io::Error),

    /// Malformed query, rule or literal
    #[error("invalid input: {0}")]
    Validation(String),

    /// A field presented differing types during indexing
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Indexing stopped after too many per-chunk failures
    #[error("stopped after {count} errors, last: {last}")]
    TooManyErrors { count: usize, last: Box<ZarError> },

    /// Error raised by a named record source
    #[error("{name}: {source}")]
    Source {
        name: String,
        #[source]
        source: Box<ZarError>,
    },

    /// A background task panicked or was aborted
    #[error("task failed: {0}")]
    Task(String),

    /// Lock acquisition failed
    #[error("lock error: {0}")]
    Lock(String),

    /// Metadata (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ZarError {
    fn from(err: serde_json::Error) -> Self {
        ZarError::Serialization(err.to_string())
    }
}

impl ZarError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        ZarError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Annotate an error with the name of the source that produced it.
    /// Cancellation passes through untouched.
    pub fn in_source(self, name: impl Into<String>) -> Self {
        if self.is_canceled() {
            return self;
        }
        ZarError::Source {
            name: name.into(),
            source: Box::new(self),
        }
    }

    pub fn is_canceled(&self) -> bool {
        match self {
            ZarError::Canceled => true,
            ZarError::Source { source, .. } => source.is_canceled(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ZarError::NotFound(_) => true,
            ZarError::Io { source, .. } | ZarError::RawIo(source) => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            ZarError::Source { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Result type alias for archive operations
pub type ZarResult<T> = Result<T, ZarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ZarError::NotAnArchive("/tmp/x".to_string());
        assert_eq!(err.to_string(), "/tmp/x: not an archive");

        let err = ZarError::VersionMismatch {
            what: "zar.json".to_string(),
            found: 9,
            expected: 1,
        };
        assert_eq!(
            err.to_string(),
            "zar.json: unsupported version 9 (expected 1)"
        );
    }

    #[test]
    fn test_io_error_carries_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = ZarError::io("/data/chunk.rec", io_err);
        assert!(err.to_string().starts_with("/data/chunk.rec"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_source_annotation_keeps_cancel() {
        let err = ZarError::Canceled.in_source("scanner");
        assert!(matches!(err, ZarError::Canceled));

        let err = ZarError::Corrupt("bad opcode".into()).in_source("20200421/a.rec");
        assert_eq!(err.to_string(), "20200421/a.rec: corrupt data: bad opcode");
    }
}
