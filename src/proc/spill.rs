//! Sorted runs spilled to disk and merged back
//!
//! Helpers that hold more records than fit in memory write sorted runs into a
//! private temporary directory. `MergeRuns` k-way merges any number of sorted
//! sources; ties go to the lowest source index, so merging runs in creation
//! order keeps a sort stable.

use crate::error::{ZarError, ZarResult};
use crate::proc::compare::RecordCompare;
use crate::record::{Reader, Record, RecordReader, TypeContext, Writer, WriterOptions};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const SPILL_LZ4_BLOCK: usize = 64 * 1024;

/// Owns a temporary directory of sorted runs; removed on drop.
pub struct Spiller {
    dir: PathBuf,
    runs: Vec<PathBuf>,
}

impl Spiller {
    pub fn new(parent: Option<&Path>) -> ZarResult<Self> {
        let base = match parent {
            Some(p) => p.to_path_buf(),
            None => std::env::temp_dir(),
        };
        let dir = base.join(format!("zar-spill-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&dir).map_err(|e| ZarError::io(&dir, e))?;
        Ok(Self {
            dir,
            runs: Vec::new(),
        })
    }

    /// Write one already-sorted run.
    pub fn spill(&mut self, records: &[Record]) -> ZarResult<()> {
        let path = self.dir.join(format!("run-{:05}", self.runs.len()));
        let file = File::create(&path).map_err(|e| ZarError::io(&path, e))?;
        let mut w = Writer::with_options(
            BufWriter::new(file),
            WriterOptions {
                lz4_block_size: SPILL_LZ4_BLOCK,
                stream_records_max: 0,
            },
        );
        for rec in records {
            w.write(rec)?;
        }
        w.end_stream()?;
        w.into_inner()?;
        debug!(path = %path.display(), records = records.len(), "spilled sorted run");
        self.runs.push(path);
        Ok(())
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Open every run as a record source, in creation order.
    pub fn open_runs(&self, zctx: &Arc<TypeContext>) -> ZarResult<Vec<Box<dyn RecordReader>>> {
        self.runs
            .iter()
            .map(|path| {
                let file = File::open(path).map_err(|e| ZarError::io(path, e))?;
                Ok(Box::new(Reader::new(BufReader::new(file), zctx.clone())) as Box<dyn RecordReader>)
            })
            .collect()
    }
}

impl Drop for Spiller {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// K-way merge of sorted record sources.
pub struct MergeRuns {
    sources: Vec<Box<dyn RecordReader>>,
    heads: Vec<Option<Record>>,
    compare: RecordCompare,
    primed: bool,
    _spiller: Option<Spiller>,
}

impl MergeRuns {
    pub fn new(sources: Vec<Box<dyn RecordReader>>, compare: RecordCompare) -> Self {
        let heads = sources.iter().map(|_| None).collect();
        Self {
            sources,
            heads,
            compare,
            primed: false,
            _spiller: None,
        }
    }

    /// Keep the spill directory alive for as long as the merge reads it.
    pub fn holding(mut self, spiller: Spiller) -> Self {
        self._spiller = Some(spiller);
        self
    }
}

impl RecordReader for MergeRuns {
    fn read(&mut self) -> ZarResult<Option<Record>> {
        if !self.primed {
            for (src, head) in self.sources.iter_mut().zip(self.heads.iter_mut()) {
                *head = src.read()?;
            }
            self.primed = true;
        }
        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(rec) = head else { continue };
            best = match best {
                Some(b) => match &self.heads[b] {
                    Some(cur) if (self.compare)(rec, cur).is_lt() => Some(i),
                    _ => Some(b),
                },
                None => Some(i),
            };
        }
        let Some(i) = best else {
            return Ok(None);
        };
        let next = self.sources[i].read()?;
        Ok(std::mem::replace(&mut self.heads[i], next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::compare::by_field;
    use crate::record::{read_all, ArrayReader, Column, Type, Value};
    use crate::span::Direction;
    use tempfile::tempdir;

    #[test]
    fn test_merge_is_stable() {
        let zctx = Arc::new(TypeContext::new());
        let ty = zctx
            .lookup_record(vec![Column::new("k", Type::Int64), Column::new("src", Type::Int64)])
            .unwrap();
        let rec = |k, src| Record::new(ty.clone(), vec![Value::Int(k), Value::Int(src)]).unwrap();
        let a = ArrayReader::new(vec![rec(1, 0), rec(3, 0), rec(3, 0)]);
        let b = ArrayReader::new(vec![rec(2, 1), rec(3, 1)]);
        let mut merged = MergeRuns::new(
            vec![Box::new(a), Box::new(b)],
            by_field("k", Direction::Forward),
        );
        let out: Vec<(i64, i64)> = read_all(&mut merged)
            .unwrap()
            .iter()
            .map(|r| (r.int("k").unwrap(), r.int("src").unwrap()))
            .collect();
        assert_eq!(out, vec![(1, 0), (2, 1), (3, 0), (3, 0), (3, 1)]);
    }

    #[test]
    fn test_spill_dir_removed() {
        let dir = tempdir().unwrap();
        let zctx = Arc::new(TypeContext::new());
        let ty = zctx
            .lookup_record(vec![Column::new("k", Type::Int64)])
            .unwrap();
        let recs: Vec<Record> = (0..10)
            .map(|i| Record::new(ty.clone(), vec![Value::Int(i)]).unwrap())
            .collect();
        let mut spiller = Spiller::new(Some(dir.path())).unwrap();
        spiller.spill(&recs).unwrap();
        let runs = spiller.open_runs(&zctx).unwrap();
        let mut merged = MergeRuns::new(runs, by_field("k", Direction::Forward)).holding(spiller);
        assert_eq!(read_all(&mut merged).unwrap(), recs);
        drop(merged);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
