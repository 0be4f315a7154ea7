//! Micro-index trailer
//!
//! The trailer is the last record of every micro-index file. It is written in
//! its own stream, so the bytes before it are an EOS marker (or the file is
//! nothing but the trailer), and its first two typedefs are always the
//! `sections` array and the `keys` record:
//!
//! ```text
//! EOS | TYPEDEF_ARRAY int64 | TYPEDEF_RECORD keys... | TYPEDEF_RECORD trailer | RECORD
//! ```

use crate::error::{ZarError, ZarResult};
use crate::record::codec::{Reader as StreamReader, OP_EOS, TRAILER_SIGNATURE};
use crate::record::{Column, Record, Type, TypeContext, Value};
use crate::span::Direction;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

pub const MAGIC: &str = "microindex";
pub const VERSION: i32 = 2;

/// Default name of the child-offset column in index sections
pub const CHILD_FIELD: &str = "_child";

/// The trailer is always found within this many bytes of the end of file
pub const TRAILER_MAX_SIZE: u64 = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct Trailer {
    pub magic: String,
    pub version: i32,
    pub descending: bool,
    pub child_field: String,
    pub frame_thresh: i32,
    /// Section lengths in file order: base first, then the root section
    /// down to the section indexing the base
    pub sections: Vec<i64>,
    /// Record type of the key columns
    pub key_type: Type,
}

impl Trailer {
    pub fn new(
        key_type: Type,
        child_field: String,
        frame_thresh: usize,
        direction: Direction,
        sections: Vec<i64>,
    ) -> Self {
        Self {
            magic: MAGIC.to_string(),
            version: VERSION,
            descending: direction.is_reverse(),
            child_field,
            frame_thresh: frame_thresh as i32,
            sections,
            key_type,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_descending(self.descending)
    }

    pub fn key_columns(&self) -> &[Column] {
        self.key_type.columns().unwrap_or(&[])
    }

    pub fn key_names(&self) -> Vec<String> {
        self.key_columns().iter().map(|c| c.name.clone()).collect()
    }

    fn record_type(&self, zctx: &TypeContext) -> ZarResult<Type> {
        zctx.lookup_record(vec![
            Column::new("magic", Type::String),
            Column::new("version", Type::Int32),
            Column::new("descending", Type::Bool),
            Column::new("child_field", Type::String),
            Column::new("frame_thresh", Type::Int32),
            Column::new("sections", zctx.lookup_array(Type::Int64)),
            Column::new("keys", self.key_type.clone()),
        ])
    }

    pub fn to_record(&self, zctx: &TypeContext) -> ZarResult<Record> {
        let nkeys = self.key_columns().len();
        Record::new(
            self.record_type(zctx)?,
            vec![
                Value::String(self.magic.clone()),
                Value::Int(self.version as i64),
                Value::Bool(self.descending),
                Value::String(self.child_field.clone()),
                Value::Int(self.frame_thresh as i64),
                Value::Array(self.sections.iter().map(|s| Value::Int(*s)).collect()),
                Value::Record(vec![Value::Null; nkeys]),
            ],
        )
    }

    pub fn from_record(rec: &Record) -> ZarResult<Self> {
        let bad = |what: &str| ZarError::Corrupt(format!("trailer: {}", what));
        let magic = rec.string("magic").ok_or_else(|| bad("missing magic"))?;
        if magic != MAGIC {
            return Err(bad("bad magic"));
        }
        let version = rec.int("version").ok_or_else(|| bad("missing version"))?;
        if version != VERSION as i64 {
            return Err(ZarError::VersionMismatch {
                what: "micro-index".to_string(),
                found: version,
                expected: VERSION as i64,
            });
        }
        let sections = match rec.field("sections") {
            Some((_, Value::Array(vals))) => vals
                .iter()
                .map(|v| v.as_int().ok_or_else(|| bad("non-integer section size")))
                .collect::<ZarResult<Vec<_>>>()?,
            _ => return Err(bad("missing sections")),
        };
        let key_type = match rec.field("keys") {
            Some((ty, _)) if ty.columns().is_some() => ty.clone(),
            _ => return Err(bad("missing keys")),
        };
        Ok(Self {
            magic: magic.to_string(),
            version: version as i32,
            descending: rec.bool("descending").ok_or_else(|| bad("missing descending"))?,
            child_field: rec
                .string("child_field")
                .ok_or_else(|| bad("missing child_field"))?
                .to_string(),
            frame_thresh: rec
                .int("frame_thresh")
                .ok_or_else(|| bad("missing frame_thresh"))? as i32,
            sections,
            key_type,
        })
    }
}

/// Pick a child-offset column name that does not collide with a key.
pub fn unique_child_field(keys: &[String]) -> String {
    if !keys.iter().any(|k| k == CHILD_FIELD) {
        return CHILD_FIELD.to_string();
    }
    (0..)
        .map(|i| format!("{}_{}", CHILD_FIELD, i))
        .find(|name| !keys.contains(name))
        .unwrap_or_else(|| CHILD_FIELD.to_string())
}

/// Locate and decode the trailer of the micro-index at `path`.
///
/// Returns the trailer and its byte offset.
pub fn read_trailer(zctx: &Arc<TypeContext>, file: &File, path: &Path) -> ZarResult<(Trailer, u64)> {
    let not_index = |reason: &str| ZarError::NotAMicroIndex {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };
    let size = file.metadata().map_err(|e| ZarError::io(path, e))?.len();
    let n = size.min(TRAILER_MAX_SIZE);
    if n < TRAILER_SIGNATURE.len() as u64 {
        return Err(not_index("file too small"));
    }
    let start = size - n;
    let mut buf = vec![0u8; n as usize];
    let mut f = file;
    f.seek(SeekFrom::Start(start))
        .map_err(|e| ZarError::io(path, e))?;
    f.read_exact(&mut buf).map_err(|e| ZarError::io(path, e))?;

    let mut last_err = None;
    for off in (0..=buf.len() - TRAILER_SIGNATURE.len()).rev() {
        if buf[off..off + TRAILER_SIGNATURE.len()] != TRAILER_SIGNATURE {
            continue;
        }
        let at_file_start = start + off as u64 == 0;
        if !at_file_start && (off == 0 || buf[off - 1] != OP_EOS) {
            continue;
        }
        let mut rdr = StreamReader::new(Cursor::new(&buf[off..]), zctx.clone());
        let decoded = rdr.read().and_then(|rec| match rec {
            Some(rec) => Trailer::from_record(&rec),
            None => Err(ZarError::Corrupt("empty trailer stream".into())),
        });
        match decoded {
            Ok(trailer) => return Ok((trailer, start + off as u64)),
            Err(err @ ZarError::VersionMismatch { .. }) => return Err(err),
            Err(err) => last_err = Some(err),
        }
    }
    Err(not_index(&match last_err {
        Some(err) => err.to_string(),
        None => "trailer not found".to_string(),
    }))
}
