//! K-way merge of scanners
//!
//! Every input must already be sorted under the combiner's comparator. The
//! combiner keeps the pending batch of each input and repeatedly emits the
//! least head record; ties go to the input listed first.

use crate::error::{ZarError, ZarResult};
use crate::proc::RecordCompare;
use crate::record::Record;
use crate::scan::{Batch, ProgressSnapshot, Scanner, DEFAULT_BATCH_SIZE};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

struct Input {
    scanner: Box<dyn Scanner>,
    head: VecDeque<Record>,
    done: bool,
    // progress of the scanner when it was closed
    closed: Option<ProgressSnapshot>,
}

pub struct Combiner {
    inputs: Vec<Input>,
    compare: RecordCompare,
    batch_size: usize,
    cancel: CancellationToken,
}

impl Combiner {
    pub fn new(scanners: Vec<Box<dyn Scanner>>, compare: RecordCompare) -> Self {
        Self {
            inputs: scanners
                .into_iter()
                .map(|scanner| Input {
                    scanner,
                    head: VecDeque::new(),
                    done: false,
                    closed: None,
                })
                .collect(),
            compare,
            batch_size: DEFAULT_BATCH_SIZE,
            cancel: CancellationToken::new(),
        }
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn close_all(&mut self) -> ZarResult<()> {
        let mut first_err = None;
        for input in &mut self.inputs {
            if input.closed.is_none() {
                let snapshot = input.scanner.progress();
                if let Err(e) = input.scanner.close() {
                    first_err.get_or_insert(e.in_source(input.scanner.name()));
                }
                input.closed = Some(snapshot);
            }
            input.done = true;
            input.head.clear();
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Pull until every live input has a head record.
    async fn fill(&mut self) -> ZarResult<()> {
        for input in &mut self.inputs {
            while input.head.is_empty() && !input.done {
                if self.cancel.is_cancelled() {
                    return Err(ZarError::Canceled);
                }
                match input.scanner.pull().await {
                    Ok(Some(batch)) => input.head.extend(batch.into_records()),
                    Ok(None) => {
                        input.done = true;
                        let snapshot = input.scanner.progress();
                        input
                            .scanner
                            .close()
                            .map_err(|e| e.in_source(input.scanner.name()))?;
                        input.closed = Some(snapshot);
                    }
                    Err(e) => return Err(e.in_source(input.scanner.name())),
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
                Some((_, b)) if (self.compare)(rec, b) != Ordering::Less => {}
                _ => best = Some((i, rec)),
            }
        }
        best.map(|(i, _)| i)
    }
}

#[async_trait]
impl Scanner for Combiner {
    async fn pull(&mut self) -> ZarResult<Option<Batch>> {
        let mut out = Vec::with_capacity(self.batch_size);
        while out.len() < self.batch_size {
            if let Err(e) = self.fill().await {
                let _ = self.close_all();
                return Err(e);
            }
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

    fn progress(&self) -> ProgressSnapshot {
        self.inputs
            .iter()
            .map(|input| input.closed.unwrap_or_else(|| input.scanner.progress()))
            .fold(ProgressSnapshot::default(), |acc, p| acc + p)
    }

    fn close(&mut self) -> ZarResult<()> {
        self.close_all()
    }

    fn name(&self) -> String {
        let names: Vec<String> = self.inputs.iter().map(|i| i.scanner.name()).collect();
        format!("combiner[{}]", names.join(","))
    }

    fn applies_filter(&self) -> bool {
        self.inputs.iter().all(|i| i.scanner.applies_filter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::by_ts;
    use crate::record::{ArrayReader, Column, Type, TypeContext, Value};
    use crate::scan::{ReaderScanner, SourceFilter};
    use crate::span::{Direction, Span};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn scanner(zctx: &TypeContext, tag: i64, stamps: &[i64]) -> Box<dyn Scanner> {
        let ty = zctx
            .lookup_record(vec![Column::new("ts", Type::Time), Column::new("src", Type::Int64)])
            .unwrap();
        let recs = stamps
            .iter()
            .map(|ts| Record::new(ty.clone(), vec![Value::Time(*ts), Value::Int(tag)]).unwrap())
            .collect();
        Box::new(
            ReaderScanner::new(
                format!("s{}", tag),
                Box::new(ArrayReader::new(recs)),
                SourceFilter::new(Span::all()),
                Direction::Forward,
            )
            .batch_size(2),
        )
    }

    #[tokio::test]
    async fn test_merge_order_and_ties() {
        let zctx = TypeContext::new();
        let mut comb = Combiner::new(
            vec![
                scanner(&zctx, 0, &[1, 4, 4, 9]),
                scanner(&zctx, 1, &[2, 4, 8]),
                scanner(&zctx, 2, &[]),
            ],
            by_ts(Direction::Forward),
        )
        .batch_size(3);
        let mut got = Vec::new();
        while let Some(batch) = comb.pull().await.unwrap() {
            assert!(batch.len() <= 3);
            got.extend(
                batch
                    .into_records()
                    .into_iter()
                    .map(|r| (r.ts().unwrap(), r.int("src").unwrap())),
            );
        }
        assert_eq!(
            got,
            vec![(1, 0), (2, 1), (4, 0), (4, 0), (4, 1), (8, 1), (9, 0)]
        );
        assert_eq!(comb.progress().records_read, 7);
    }

    struct Failing {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Scanner for Failing {
        async fn pull(&mut self) -> ZarResult<Option<Batch>> {
            Err(ZarError::Corrupt("bad frame".into()))
        }
        fn progress(&self) -> ProgressSnapshot {
            ProgressSnapshot::default()
        }
        fn close(&mut self) -> ZarResult<()> {
            self.closes.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
        fn name(&self) -> String {
            "broken".into()
        }
    }

    #[tokio::test]
    async fn test_error_names_source_and_closes() {
        let zctx = TypeContext::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let mut comb = Combiner::new(
            vec![
                scanner(&zctx, 0, &[1]),
                Box::new(Failing {
                    closes: closes.clone(),
                }),
            ],
            by_ts(Direction::Forward),
        );
        let err = comb.pull().await.unwrap_err();
        assert!(err.to_string().starts_with("broken: "));
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);
        comb.close().unwrap();
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_closes_inputs() {
        let zctx = TypeContext::new();
        let token = CancellationToken::new();
        let mut comb = Combiner::new(vec![scanner(&zctx, 0, &[1, 2])], by_ts(Direction::Forward))
            .cancel_on(token.clone());
        token.cancel();
        assert!(comb.pull().await.unwrap_err().is_canceled());
        assert!(comb.inputs.iter().all(|i| i.closed.is_some()));
    }
}
