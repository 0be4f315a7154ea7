//! Ordered merge of worker outputs
//!
//! Each worker emits batches that are sorted on the group's sort field, so
//! a merge over the current head of every worker yields a globally ordered
//! stream. Equal field values are ordered by their encoded bytes and then by
//! worker index, which makes the output order total.

use crate::error::{ZarError, ZarResult};
use crate::record::{Record, Value};
use crate::scan::Batch;
use std::cmp::Ordering;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Order two records on `field`, descending when `reversed`.
pub fn compare_ordered(a: &Record, b: &Record, field: &str, reversed: bool) -> Ordering {
    let av = a.field(field).map(|(_, v)| v).unwrap_or(&Value::Null);
    let bv = b.field(field).map(|(_, v)| v).unwrap_or(&Value::Null);
    let ord = av.compare(bv);
    let ord = if reversed { ord.reverse() } else { ord };
    ord.then_with(|| av.payload().cmp(&bv.payload()))
}

struct MergeInput {
    rx: mpsc::Receiver<Batch>,
    head: VecDeque<Record>,
    done: bool,
}

pub struct OrderedMerge {
    inputs: Vec<MergeInput>,
    field: String,
    reversed: bool,
    batch_size: usize,
}

impl OrderedMerge {
    pub fn new(
        inputs: Vec<mpsc::Receiver<Batch>>,
        field: impl Into<String>,
        reversed: bool,
        batch_size: usize,
    ) -> Self {
        Self {
            inputs: inputs
                .into_iter()
                .map(|rx| MergeInput {
                    rx,
                    head: VecDeque::new(),
                    done: false,
                })
                .collect(),
            field: field.into(),
            reversed,
            batch_size: batch_size.max(1),
        }
    }

    async fn fill(&mut self, cancel: &CancellationToken) -> ZarResult<()> {
        for input in &mut self.inputs {
            while input.head.is_empty() && !input.done {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ZarError::Canceled),
                    batch = input.rx.recv() => match batch {
                        Some(batch) => input.head.extend(batch.into_records()),
                        None => input.done = true,
                    },
                }
            }
        }
        Ok(())
    }

    fn least(&self) -> Option<usize> {
        let mut best: Option<(usize, &Record)> = None;
        for (i, input) in self.inputs.iter().enumerate() {
            let Some(rec) = input.head.front() else {
                continue;
            };
            match best {
                Some((_, b)) if compare_ordered(rec, b, &self.field, self.reversed) != Ordering::Less => {}
                _ => best = Some((i, rec)),
            }
        }
        best.map(|(i, _)| i)
    }

    /// Next merged batch, or `None` once every input is exhausted.
    pub async fn pull(&mut self, cancel: &CancellationToken) -> ZarResult<Option<Batch>> {
        let mut out = Vec::with_capacity(self.batch_size);
        while out.len() < self.batch_size {
            self.fill(cancel).await?;
            let Some(i) = self.least() else {
                break;
            };
            if let Some(rec) = self.inputs[i].head.pop_front() {
                out.push(rec);
            }
        }
        if out.is_empty() {
            return Ok(None);
        }
        Ok(Some(Batch::new(out)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Column, Type, TypeContext};

    fn batch(zctx: &TypeContext, stamps: &[i64]) -> Batch {
        let ty = zctx.lookup_record(vec![Column::new("ts", Type::Time)]).unwrap();
        Batch::new(
            stamps
                .iter()
                .map(|ts| Record::new(ty.clone(), vec![Value::Time(*ts)]).unwrap())
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_reverse_merge() {
        let zctx = TypeContext::new();
        let (tx0, rx0) = mpsc::channel(4);
        let (tx1, rx1) = mpsc::channel(4);
        tx0.send(batch(&zctx, &[90, 70])).await.unwrap();
        tx0.send(batch(&zctx, &[20])).await.unwrap();
        tx1.send(batch(&zctx, &[80, 70, 10])).await.unwrap();
        drop((tx0, tx1));

        let mut merge = OrderedMerge::new(vec![rx0, rx1], "ts", true, 4);
        let cancel = CancellationToken::new();
        let mut got = Vec::new();
        while let Some(b) = merge.pull(&cancel).await.unwrap() {
            got.extend(b.records().iter().map(|r| r.ts().unwrap()));
        }
        assert_eq!(got, vec![90, 80, 70, 70, 20, 10]);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let (_tx, rx) = mpsc::channel::<Batch>(1);
        let mut merge = OrderedMerge::new(vec![rx], "ts", false, 4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(merge.pull(&cancel).await.unwrap_err().is_canceled());
    }

    #[test]
    fn test_compare_missing_field_first() {
        let zctx = TypeContext::new();
        let with = batch(&zctx, &[5]).into_records().remove(0);
        let ty = zctx.lookup_record(vec![Column::new("x", Type::Int64)]).unwrap();
        let without = Record::new(ty, vec![Value::Int(1)]).unwrap();
        assert_eq!(compare_ordered(&without, &with, "ts", false), Ordering::Less);
    }
}
