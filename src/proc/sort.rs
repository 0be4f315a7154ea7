//! External stable sort of records

use crate::error::ZarResult;
use crate::proc::compare::RecordCompare;
use crate::proc::spill::{MergeRuns, Spiller};
use crate::record::{ArrayReader, Record, RecordReader, TypeContext};
use std::path::PathBuf;
use std::sync::Arc;

/// Default number of records held in memory before spilling a run
pub const DEFAULT_SORT_MEM_RECORDS: usize = 500_000;

/// Accumulates records and yields them in comparator order.
pub struct Sorter {
    zctx: Arc<TypeContext>,
    compare: RecordCompare,
    mem_records: usize,
    spill_dir: Option<PathBuf>,
    buffer: Vec<Record>,
    spiller: Option<Spiller>,
}

impl Sorter {
    pub fn new(zctx: Arc<TypeContext>, compare: RecordCompare) -> Self {
        Self {
            zctx,
            compare,
            mem_records: DEFAULT_SORT_MEM_RECORDS,
            spill_dir: None,
            buffer: Vec::new(),
            spiller: None,
        }
    }

    pub fn mem_records(mut self, n: usize) -> Self {
        self.mem_records = n.max(1);
        self
    }

    /// Directory under which spill runs are created (defaults to the system
    /// temp dir).
    pub fn spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    pub fn push(&mut self, rec: Record) -> ZarResult<()> {
        self.buffer.push(rec);
        if self.buffer.len() >= self.mem_records {
            self.spill()?;
        }
        Ok(())
    }

    fn sort_buffer(&mut self) {
        let compare = self.compare.clone();
        self.buffer.sort_by(|a, b| compare(a, b));
    }

    fn spill(&mut self) -> ZarResult<()> {
        self.sort_buffer();
        if self.spiller.is_none() {
            self.spiller = Some(Spiller::new(self.spill_dir.as_deref())?);
        }
        if let Some(spiller) = self.spiller.as_mut() {
            spiller.spill(&self.buffer)?;
        }
        self.buffer.clear();
        Ok(())
    }

    /// Sorted output. The in-memory tail is merged after the spilled runs so
    /// equal records keep their input order.
    pub fn finish(mut self) -> ZarResult<Box<dyn RecordReader>> {
        self.sort_buffer();
        let tail = ArrayReader::new(std::mem::take(&mut self.buffer));
        match self.spiller.take() {
            None => Ok(Box::new(tail)),
            Some(spiller) => {
                let mut sources = spiller.open_runs(&self.zctx)?;
                sources.push(Box::new(tail));
                Ok(Box::new(MergeRuns::new(sources, self.compare.clone()).holding(spiller)))
            }
        }
    }
}

/// Sort everything `input` yields.
pub fn sort_reader(
    zctx: Arc<TypeContext>,
    input: &mut dyn RecordReader,
    compare: RecordCompare,
    mem_records: usize,
) -> ZarResult<Box<dyn RecordReader>> {
    let mut sorter = Sorter::new(zctx, compare).mem_records(mem_records);
    while let Some(rec) = input.read()? {
        sorter.push(rec)?;
    }
    sorter.finish()
}
