//! Self-describing typed records
//!
//! This module provides the record model the archive is built on:
//! - `Type` / `TypeContext`: structural types interned to stable ids
//! - `Value`: typed values with a total order and canonical body bytes
//! - `Record`: a record type plus its column values
//! - `codec`: the binary stream format with sync points
//! - `literal`: type-name and value-literal parsing

pub mod codec;
pub mod data;
pub mod literal;
pub mod types;
pub mod value;
pub mod varint;

pub use codec::{Reader, Writer, WriterOptions};
pub use data::{Record, Walk, TS_FIELD};
pub use types::{Column, Type, TypeContext};
pub use value::{Typed, Value};

use crate::error::ZarResult;
use std::collections::VecDeque;

/// A pull-style source of records
pub trait RecordReader: Send {
    /// Next record, or `None` at end of input.
    fn read(&mut self) -> ZarResult<Option<Record>>;

    /// Bytes consumed from the underlying input, when the source is encoded.
    fn position(&self) -> Option<u64> {
        None
    }
}

/// Reads records from memory.
#[derive(Debug, Default)]
pub struct ArrayReader {
    records: VecDeque<Record>,
}

impl ArrayReader {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into(),
        }
    }
}

impl RecordReader for ArrayReader {
    fn read(&mut self) -> ZarResult<Option<Record>> {
        Ok(self.records.pop_front())
    }
}

/// Drain a reader into a vector.
pub fn read_all(reader: &mut dyn RecordReader) -> ZarResult<Vec<Record>> {
    let mut out = Vec::new();
    while let Some(rec) = reader.read()? {
        out.push(rec);
    }
    Ok(out)
}
