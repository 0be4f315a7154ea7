//! Keyed count aggregation
//!
//! Collects key values, counting occurrences of each distinct key. Rows are
//! deduplicated on the key's encoded bytes. When the table grows past its
//! row limit it is sorted and spilled; `finish` merges the runs and combines
//! counts of equal keys, yielding `{key, count}` records in ascending key
//! order.

use crate::error::{ZarError, ZarResult};
use crate::proc::compare::by_field;
use crate::proc::spill::{MergeRuns, Spiller};
use crate::record::{ArrayReader, Column, Record, RecordReader, Type, TypeContext, Value};
use crate::span::Direction;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub const KEY_FIELD: &str = "key";
pub const COUNT_FIELD: &str = "count";

/// Default number of distinct keys held in memory before spilling
pub const DEFAULT_AGG_ROWS: usize = 1_000_000;

pub struct CountAggregator {
    zctx: Arc<TypeContext>,
    name: String,
    key_type: Option<Type>,
    mismatch: Option<String>,
    rows: HashMap<Vec<u8>, (Value, u64)>,
    limit: usize,
    spill_dir: Option<PathBuf>,
    spiller: Option<Spiller>,
}

impl CountAggregator {
    /// `name` identifies the key source in error messages.
    pub fn new(zctx: Arc<TypeContext>, name: impl Into<String>) -> Self {
        Self {
            zctx,
            name: name.into(),
            key_type: None,
            mismatch: None,
            rows: HashMap::new(),
            limit: DEFAULT_AGG_ROWS,
            spill_dir: None,
            spiller: None,
        }
    }

    pub fn limit(mut self, rows: usize) -> Self {
        self.limit = rows.max(1);
        self
    }

    pub fn spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    pub fn key_type(&self) -> Option<&Type> {
        self.key_type.as_ref()
    }

    /// Count one key occurrence. Null keys are ignored. A key whose type
    /// differs from earlier keys is remembered and reported by `finish`.
    pub fn add(&mut self, ty: &Type, value: &Value) -> ZarResult<()> {
        if value.is_null() {
            return Ok(());
        }
        match &self.key_type {
            None => self.key_type = Some(ty.clone()),
            Some(kt) if kt != ty => {
                if self.mismatch.is_none() {
                    self.mismatch = Some(format!(
                        "{}: values of type {} and {}",
                        self.name, kt, ty
                    ));
                }
                return Ok(());
            }
            Some(_) => {}
        }
        let entry = self
            .rows
            .entry(value.payload())
            .or_insert_with(|| (value.clone(), 0));
        entry.1 += 1;
        if self.rows.len() >= self.limit {
            self.spill()?;
        }
        Ok(())
    }

    fn row_type(&self) -> ZarResult<Type> {
        let key_type = self.key_type.clone().unwrap_or(Type::Null);
        self.zctx.lookup_record(vec![
            Column::new(KEY_FIELD, key_type),
            Column::new(COUNT_FIELD, Type::Uint64),
        ])
    }

    fn drain_sorted(&mut self) -> ZarResult<Vec<Record>> {
        let ty = self.row_type()?;
        let mut rows: Vec<(Value, u64)> = self.rows.drain().map(|(_, row)| row).collect();
        rows.sort_by(|a, b| a.0.compare(&b.0));
        rows.into_iter()
            .map(|(key, count)| Record::new(ty.clone(), vec![key, Value::Uint(count)]))
            .collect()
    }

    fn spill(&mut self) -> ZarResult<()> {
        let recs = self.drain_sorted()?;
        if self.spiller.is_none() {
            self.spiller = Some(Spiller::new(self.spill_dir.as_deref())?);
        }
        if let Some(spiller) = self.spiller.as_mut() {
            spiller.spill(&recs)?;
        }
        Ok(())
    }

    /// Sorted `{key, count}` rows.
    pub fn finish(mut self) -> ZarResult<Box<dyn RecordReader>> {
        if let Some(msg) = self.mismatch.take() {
            return Err(ZarError::TypeMismatch(msg));
        }
        let tail = ArrayReader::new(self.drain_sorted()?);
        match self.spiller.take() {
            None => Ok(Box::new(tail)),
            Some(spiller) => {
                let mut sources = spiller.open_runs(&self.zctx)?;
                sources.push(Box::new(tail));
                let merged = MergeRuns::new(sources, by_field(KEY_FIELD, Direction::Forward))
                    .holding(spiller);
                Ok(Box::new(CombineCounts {
                    input: Box::new(merged),
                    pending: None,
                }))
            }
        }
    }
}

/// Sums the counts of adjacent rows with equal keys.
struct CombineCounts {
    input: Box<dyn RecordReader>,
    pending: Option<Record>,
}

impl RecordReader for CombineCounts {
    fn read(&mut self) -> ZarResult<Option<Record>> {
        let mut current = match self.pending.take() {
            Some(rec) => rec,
            None => match self.input.read()? {
                Some(rec) => rec,
                None => return Ok(None),
            },
        };
        while let Some(next) = self.input.read()? {
            let same = match (current.field(KEY_FIELD), next.field(KEY_FIELD)) {
                (Some((_, a)), Some((_, b))) => a.compare(b) == Ordering::Equal,
                _ => false,
            };
            if !same {
                self.pending = Some(next);
                break;
            }
            let total = current.uint(COUNT_FIELD).unwrap_or(0) + next.uint(COUNT_FIELD).unwrap_or(0);
            let ty = current.ty().clone();
            let mut values = current.into_values();
            values[1] = Value::Uint(total);
            current = Record::new(ty, values)?;
        }
        Ok(Some(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::read_all;
    use tempfile::tempdir;

    fn counts(reader: &mut dyn RecordReader) -> Vec<(i64, u64)> {
        read_all(reader)
            .unwrap()
            .iter()
            .map(|r| (r.int(KEY_FIELD).unwrap(), r.uint(COUNT_FIELD).unwrap()))
            .collect()
    }

    #[test]
    fn test_counts_sorted() {
        let zctx = Arc::new(TypeContext::new());
        let mut agg = CountAggregator::new(zctx, "field-v");
        for v in [5i64, 3, 5, 9, 3, 5] {
            agg.add(&Type::Int64, &Value::Int(v)).unwrap();
        }
        agg.add(&Type::Int64, &Value::Null).unwrap();
        let mut out = agg.finish().unwrap();
        assert_eq!(counts(out.as_mut()), vec![(3, 2), (5, 3), (9, 1)]);
    }

    #[test]
    fn test_spilled_counts_combined() {
        let dir = tempdir().unwrap();
        let zctx = Arc::new(TypeContext::new());
        let mut agg = CountAggregator::new(zctx, "type-int64")
            .limit(4)
            .spill_dir(dir.path());
        for i in 0..100i64 {
            agg.add(&Type::Int64, &Value::Int(i % 7)).unwrap();
        }
        let mut out = agg.finish().unwrap();
        let rows = counts(out.as_mut());
        assert_eq!(rows.len(), 7);
        assert_eq!(rows.iter().map(|r| r.1).sum::<u64>(), 100);
        assert_eq!(rows[0], (0, 15));
    }

    #[test]
    fn test_type_mismatch_surfaces_at_finish() {
        let zctx = Arc::new(TypeContext::new());
        let mut agg = CountAggregator::new(zctx, "field-v");
        agg.add(&Type::Int64, &Value::Int(1)).unwrap();
        agg.add(&Type::String, &Value::String("x".into())).unwrap();
        assert!(matches!(agg.finish(), Err(ZarError::TypeMismatch(_))));
    }
}
