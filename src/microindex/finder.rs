//! Key lookups over a micro-index
//!
//! A probe descends from the root section to the base. In each index section
//! the finder scans forward from the frame chosen one level up and keeps the
//! child offset of the last entry whose key sorts strictly before the probe
//! (or the first entry when none does), so duplicate keys spanning a frame
//! boundary are never skipped. The base frame is then scanned sequentially.

use crate::error::{ZarError, ZarResult};
use crate::microindex::reader::{Reader, SectionReader};
use crate::microindex::trailer::Trailer;
use crate::record::literal::parse_value;
use crate::record::{Record, TypeContext, Value};
use crate::span::Direction;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

/// Orders records against a probe key under the index direction.
#[derive(Debug, Clone)]
pub struct KeyCompare {
    names: Vec<String>,
    direction: Direction,
}

impl KeyCompare {
    pub fn new(trailer: &Trailer) -> Self {
        Self {
            names: trailer.key_names(),
            direction: trailer.direction(),
        }
    }

    /// Compare a record's key with `probe`. A probe shorter than the key
    /// matches on its prefix.
    pub fn compare(&self, rec: &Record, probe: &[Value]) -> Ordering {
        for (name, want) in self.names.iter().zip(probe) {
            let have = rec.field(name).map(|(_, v)| v).unwrap_or(&Value::Null);
            let ord = have.compare(want);
            if ord != Ordering::Equal {
                return self.direction.apply(ord);
            }
        }
        Ordering::Equal
    }
}

/// Answers exact and closest-key lookups. Owned by a single task.
pub struct Finder {
    reader: Reader,
    compare: KeyCompare,
}

impl Finder {
    pub fn open(zctx: Arc<TypeContext>, path: impl AsRef<Path>) -> ZarResult<Self> {
        let reader = Reader::open(zctx, path)?;
        let compare = KeyCompare::new(reader.trailer());
        Ok(Self { reader, compare })
    }

    pub fn reader(&self) -> &Reader {
        &self.reader
    }

    pub fn trailer(&self) -> &Trailer {
        self.reader.trailer()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    /// Parse string patterns against the key columns, in order.
    pub fn parse_keys(&self, patterns: &[&str]) -> ZarResult<Vec<Value>> {
        let cols = self.trailer().key_columns();
        if patterns.len() > cols.len() {
            return Err(ZarError::Validation(format!(
                "{} patterns given but index has {} keys",
                patterns.len(),
                cols.len()
            )));
        }
        cols.iter()
            .zip(patterns)
            .map(|(col, pat)| parse_value(&col.ty, pat))
            .collect()
    }

    fn check_probe(&self, probe: &[Value]) -> ZarResult<()> {
        if probe.is_empty() || probe.len() > self.trailer().key_columns().len() {
            return Err(ZarError::Validation(format!(
                "probe has {} values but index has {} keys",
                probe.len(),
                self.trailer().key_columns().len()
            )));
        }
        Ok(())
    }

    fn child_offset(&self, rec: &Record) -> ZarResult<u64> {
        let field = &self.trailer().child_field;
        rec.int(field)
            .filter(|off| *off >= 0)
            .map(|off| off as u64)
            .ok_or_else(|| {
                ZarError::Corrupt(format!(
                    "{}: index entry lacks child offset \"{}\"",
                    self.reader.path().display(),
                    field
                ))
            })
    }

    /// Walk the index sections and return a base reader positioned at the
    /// frame where `probe` can first appear.
    fn descend(&self, probe: &[Value]) -> ZarResult<Option<SectionReader<'_>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut offset = 0u64;
        // sections 1.. are ordered root first
        for section in 1..self.reader.section_count() {
            let mut rdr = self.reader.section_reader(section, offset)?;
            let mut target = None;
            let mut first = None;
            while let Some(rec) = rdr.read()? {
                let child = self.child_offset(&rec)?;
                first.get_or_insert(child);
                if self.compare.compare(&rec, probe) == Ordering::Less {
                    target = Some(child);
                } else {
                    break;
                }
            }
            offset = target.or(first).unwrap_or(0);
        }
        self.reader.section_reader(0, offset).map(Some)
    }

    /// Record whose key equals `probe`.
    pub fn lookup(&mut self, probe: &[Value]) -> ZarResult<Option<Record>> {
        self.check_probe(probe)?;
        let Some(mut rdr) = self.descend(probe)? else {
            return Ok(None);
        };
        while let Some(rec) = rdr.read()? {
            match self.compare.compare(&rec, probe) {
                Ordering::Less => continue,
                Ordering::Equal => return Ok(Some(rec)),
                Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// First record whose key is at or after `probe` in index order.
    pub fn closest_gte(&mut self, probe: &[Value]) -> ZarResult<Option<Record>> {
        self.check_probe(probe)?;
        let Some(mut rdr) = self.descend(probe)? else {
            return Ok(None);
        };
        while let Some(rec) = rdr.read()? {
            if self.compare.compare(&rec, probe) != Ordering::Less {
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    /// Last record whose key is at or before `probe` in index order.
    pub fn closest_lte(&mut self, probe: &[Value]) -> ZarResult<Option<Record>> {
        self.check_probe(probe)?;
        let Some(mut rdr) = self.descend(probe)? else {
            return Ok(None);
        };
        let mut prev = None;
        while let Some(rec) = rdr.read()? {
            if self.compare.compare(&rec, probe) == Ordering::Greater {
                break;
            }
            prev = Some(rec);
        }
        Ok(prev)
    }

    /// Stream every record whose key equals `probe`.
    pub fn lookup_all(&mut self, probe: Vec<Value>) -> ZarResult<FinderReader<'_>> {
        self.check_probe(&probe)?;
        let this: &Finder = self;
        let rdr = this.descend(&probe)?;
        Ok(FinderReader {
            rdr,
            compare: &this.compare,
            probe,
            matching: false,
        })
    }
}

/// Iterates over all records matching a probe.
pub struct FinderReader<'a> {
    rdr: Option<SectionReader<'a>>,
    compare: &'a KeyCompare,
    probe: Vec<Value>,
    matching: bool,
}

impl FinderReader<'_> {
    pub fn read(&mut self) -> ZarResult<Option<Record>> {
        let Some(rdr) = self.rdr.as_mut() else {
            return Ok(None);
        };
        while let Some(rec) = rdr.read()? {
            match self.compare.compare(&rec, &self.probe) {
                Ordering::Equal => {
                    self.matching = true;
                    return Ok(Some(rec));
                }
                Ordering::Less if !self.matching => continue,
                _ => break,
            }
        }
        self.rdr = None;
        Ok(None)
    }
}
