//! Parallel scan group
//!
//! A fixed pool of workers pulls openers from one bounded channel fed by the
//! source's dispatcher. The dispatcher starts on the first pull of any
//! worker, never twice. Each worker drains one scanner at a time and hands
//! its batches to the merge; the first error any worker or the dispatcher
//! hits cancels the rest of the group and is the one reported.

use crate::driver::merge::OrderedMerge;
use crate::driver::{MultiSource, OrderInfo, SourceOpener};
use crate::error::{ZarError, ZarResult};
use crate::scan::{Batch, Progress, ProgressSnapshot, Scanner, SourceFilter, DEFAULT_BATCH_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Workers per group
pub const DEFAULT_PARALLELISM: usize = 4;

// batches buffered per worker ahead of the merge
const WORKER_CHANNEL_CAPACITY: usize = 2;

struct Shared {
    source: Arc<dyn MultiSource>,
    filter: SourceFilter,
    cancel: CancellationToken,
    dispatched: AtomicBool,
    opener_tx: Mutex<Option<mpsc::Sender<SourceOpener>>>,
    openers: tokio::sync::Mutex<mpsc::Receiver<SourceOpener>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    first_error: Mutex<Option<ZarError>>,
    progress: Progress,
}

impl Shared {
    /// Record `err` unless an error is already held, then cancel the group.
    fn fail(&self, err: ZarError) {
        if !err.is_canceled() {
            match self.first_error.lock() {
                Ok(mut slot) => {
                    if slot.is_none() {
                        tracing::warn!("Scan group failed: {}", err);
                        *slot = Some(err);
                    }
                }
                Err(_) => tracing::error!("Error slot poisoned, dropping: {}", err),
            }
        }
        self.cancel.cancel();
    }

    fn take_error(&self) -> Option<ZarError> {
        self.first_error.lock().ok().and_then(|mut slot| slot.take())
    }

    fn start_dispatcher(self: &Arc<Self>) {
        if self
            .dispatched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let Some(tx) = self.opener_tx.lock().ok().and_then(|mut slot| slot.take()) else {
            return;
        };
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tracing::debug!("Dispatcher started");
            let result = shared
                .source
                .send_sources(shared.cancel.clone(), shared.filter.clone(), tx)
                .await;
            if let Err(e) = result {
                shared.fail(e);
            }
        });
        match self.dispatcher.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(_) => handle.abort(),
        }
    }

    async fn next_opener(&self) -> Option<SourceOpener> {
        let mut rx = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            rx = self.openers.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            opener = rx.recv() => opener,
        }
    }
}

/// One worker's view of the group: the scanner it is currently draining.
struct Head {
    id: usize,
    shared: Arc<Shared>,
    active: Option<Box<dyn Scanner>>,
}

impl Head {
    async fn pull(&mut self) -> ZarResult<Option<Batch>> {
        self.shared.start_dispatcher();
        let cancel = self.shared.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                self.release()?;
                return Err(ZarError::Canceled);
            }
            if self.active.is_none() {
                let Some(opener) = self.shared.next_opener().await else {
                    if cancel.is_cancelled() {
                        return Err(ZarError::Canceled);
                    }
                    return Ok(None);
                };
                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ZarError::Canceled),
                    opened = opener() => opened,
                };
                match opened? {
                    Some(scanner) => {
                        tracing::debug!("Worker {} opened {}", self.id, scanner.name());
                        self.active = Some(scanner);
                    }
                    None => continue,
                }
            }
            let Some(scanner) = self.active.as_mut() else {
                continue;
            };
            let filtered = scanner.applies_filter();
            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ZarError::Canceled),
                pulled = scanner.pull() => pulled,
            };
            match pulled {
                Ok(Some(batch)) => {
                    let batch = if filtered {
                        batch
                    } else {
                        let mut records = batch.into_records();
                        records.retain(|rec| self.shared.filter.matches(rec));
                        Batch::new(records)
                    };
                    if !batch.is_empty() {
                        return Ok(Some(batch));
                    }
                }
                Ok(None) => self.release()?,
                Err(e) => {
                    let name = scanner.name();
                    let _ = self.release();
                    return Err(match e {
                        ZarError::Source { .. } => e,
                        e => e.in_source(name),
                    });
                }
            }
        }
    }

    /// Close the active scanner and fold its progress into the group.
    fn release(&mut self) -> ZarResult<()> {
        if let Some(mut scanner) = self.active.take() {
            self.shared.progress.accumulate(scanner.progress());
            let name = scanner.name();
            tracing::debug!("Worker {} closing {}", self.id, name);
            scanner.close().map_err(|e| e.in_source(name))?;
        }
        Ok(())
    }
}

async fn run_worker(mut head: Head, out: mpsc::Sender<Batch>) {
    let cancel = head.shared.cancel.clone();
    loop {
        match head.pull().await {
            Ok(Some(batch)) => {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    sent = out.send(batch) => sent.is_ok(),
                };
                if !sent {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                head.shared.fail(e);
                break;
            }
        }
    }
    if let Err(e) = head.release() {
        head.shared.fail(e);
    }
    tracing::debug!("Worker {} exiting", head.id);
}

enum Merge {
    Unordered(mpsc::Receiver<Batch>),
    Ordered(OrderedMerge),
}

/// Scans every source of a [`MultiSource`] with a pool of workers.
///
/// Output follows the source's sort order when it declares one, otherwise
/// batches are delivered as workers produce them.
pub struct ParallelGroup {
    shared: Arc<Shared>,
    parallelism: usize,
    order: Option<OrderInfo>,
    batch_size: usize,
    workers: Vec<JoinHandle<()>>,
    merge: Option<Merge>,
    done: bool,
}

impl ParallelGroup {
    pub fn new(
        source: Arc<dyn MultiSource>,
        filter: SourceFilter,
        parallelism: usize,
        cancel: CancellationToken,
    ) -> Self {
        let parallelism = parallelism.max(1);
        let (tx, rx) = mpsc::channel(parallelism);
        let order = source.order_info();
        Self {
            shared: Arc::new(Shared {
                source,
                filter,
                cancel,
                dispatched: AtomicBool::new(false),
                opener_tx: Mutex::new(Some(tx)),
                openers: tokio::sync::Mutex::new(rx),
                dispatcher: Mutex::new(None),
                first_error: Mutex::new(None),
                progress: Progress::new(),
            }),
            parallelism,
            order,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: Vec::new(),
            merge: None,
            done: false,
        }
    }

    /// Records per merged batch in ordered mode.
    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Totals of every scanner the group has closed so far.
    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.progress.snapshot()
    }

    fn start(&mut self) {
        tracing::debug!("Starting scan group with {} workers", self.parallelism);
        let heads = (0..self.parallelism).map(|id| Head {
            id,
            shared: Arc::clone(&self.shared),
            active: None,
        });
        self.merge = Some(match &self.order {
            Some(order) => {
                let mut inputs = Vec::with_capacity(self.parallelism);
                for head in heads {
                    let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
                    self.workers.push(tokio::spawn(run_worker(head, tx)));
                    inputs.push(rx);
                }
                Merge::Ordered(OrderedMerge::new(
                    inputs,
                    order.field.clone(),
                    order.reversed,
                    self.batch_size,
                ))
            }
            None => {
                let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY * self.parallelism);
                for head in heads {
                    self.workers.push(tokio::spawn(run_worker(head, tx.clone())));
                }
                Merge::Unordered(rx)
            }
        });
    }

    /// Next batch, or `None` once every source has been drained.
    pub async fn pull(&mut self) -> ZarResult<Option<Batch>> {
        if self.done {
            return Ok(None);
        }
        if self.merge.is_none() {
            self.start();
        }
        let cancel = self.shared.cancel.clone();
        let result = match self.merge.as_mut() {
            Some(Merge::Unordered(rx)) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ZarError::Canceled),
                batch = rx.recv() => Ok(batch),
            },
            Some(Merge::Ordered(merge)) => merge.pull(&cancel).await,
            None => Ok(None),
        };
        match result {
            Ok(Some(batch)) => Ok(Some(batch)),
            Ok(None) => {
                self.shutdown().await?;
                match self.shared.take_error() {
                    Some(e) => Err(e),
                    None => Ok(None),
                }
            }
            Err(e) => {
                let _ = self.shutdown().await;
                Err(self.shared.take_error().unwrap_or(e))
            }
        }
    }

    /// Cancel outstanding work and wait until every scanner is closed.
    pub async fn close(&mut self) -> ZarResult<()> {
        self.shared.cancel.cancel();
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> ZarResult<()> {
        self.done = true;
        self.merge = None;
        let mut joined = Ok(());
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                joined = Err(ZarError::Task(e.to_string()));
            }
        }
        // workers are gone, so nothing is left to consume openers
        self.shared.cancel.cancel();
        let dispatcher = self.shared.dispatcher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                joined = Err(ZarError::Task(e.to_string()));
            }
        }
        joined
    }
}

impl Drop for ParallelGroup {
    fn drop(&mut self) {
        if !self.done {
            self.shared.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ArrayReader, Column, Record, Type, TypeContext, Value};
    use crate::scan::ReaderScanner;
    use crate::span::{Direction, Span};
    use async_trait::async_trait;
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct Counters {
        invoked: AtomicUsize,
        opened: AtomicUsize,
        closes: AtomicUsize,
        double_closes: AtomicUsize,
    }

    struct Tracked {
        inner: ReaderScanner,
        closed: bool,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Scanner for Tracked {
        async fn pull(&mut self) -> ZarResult<Option<Batch>> {
            self.inner.pull().await
        }
        fn progress(&self) -> ProgressSnapshot {
            self.inner.progress()
        }
        fn close(&mut self) -> ZarResult<()> {
            if self.closed {
                self.counters.double_closes.fetch_add(1, Ordering::SeqCst);
            }
            self.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close()
        }
        fn name(&self) -> String {
            self.inner.name()
        }
        fn applies_filter(&self) -> bool {
            true
        }
    }

    struct TestSource {
        zctx: Arc<TypeContext>,
        sources: Vec<Vec<i64>>,
        order: Option<OrderInfo>,
        gate: Option<Arc<Semaphore>>,
        fail_at: Option<usize>,
        counters: Arc<Counters>,
    }

    impl TestSource {
        fn new(sources: Vec<Vec<i64>>) -> Self {
            Self {
                zctx: Arc::new(TypeContext::new()),
                sources,
                order: None,
                gate: None,
                fail_at: None,
                counters: Arc::new(Counters::default()),
            }
        }
    }

    #[async_trait]
    impl MultiSource for TestSource {
        fn order_info(&self) -> Option<OrderInfo> {
            self.order.clone()
        }

        async fn send_sources(
            &self,
            cancel: CancellationToken,
            filter: SourceFilter,
            out: mpsc::Sender<SourceOpener>,
        ) -> ZarResult<()> {
            let ty = self
                .zctx
                .lookup_record(vec![Column::new("ts", Type::Time)])
                .map_err(|e| ZarError::Validation(e.to_string()))?;
            let dir = match &self.order {
                Some(o) => Direction::from_descending(o.reversed),
                None => Direction::Forward,
            };
            for (i, stamps) in self.sources.iter().enumerate() {
                if self.fail_at == Some(i) {
                    return Err(ZarError::Corrupt(format!("source {} unreadable", i)));
                }
                let recs: Vec<Record> = stamps
                    .iter()
                    .map(|ts| Record::new(ty.clone(), vec![Value::Time(*ts)]))
                    .collect::<ZarResult<_>>()?;
                let gate = self.gate.clone();
                let counters = self.counters.clone();
                let filter = filter.clone();
                let opener: SourceOpener = Box::new(move || {
                    async move {
                        counters.invoked.fetch_add(1, Ordering::SeqCst);
                        if let Some(gate) = gate {
                            let permit = gate
                                .acquire()
                                .await
                                .map_err(|e| ZarError::Task(e.to_string()))?;
                            permit.forget();
                        }
                        counters.opened.fetch_add(1, Ordering::SeqCst);
                        let inner = ReaderScanner::new(
                            format!("source-{}", i),
                            Box::new(ArrayReader::new(recs)),
                            filter,
                            dir,
                        );
                        let scanner: Box<dyn Scanner> = Box::new(Tracked {
                            inner,
                            closed: false,
                            counters,
                        });
                        Ok(Some(scanner))
                    }
                    .boxed()
                });
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = out.send(opener) => if sent.is_err() { return Ok(()) },
                }
            }
            Ok(())
        }
    }

    async fn drain(group: &mut ParallelGroup) -> ZarResult<Vec<i64>> {
        let mut out = Vec::new();
        while let Some(batch) = group.pull().await? {
            out.extend(batch.records().iter().filter_map(|r| r.ts()));
        }
        Ok(out)
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_ordered_output_across_workers() {
        let mut source = TestSource::new(vec![
            vec![100, 95, 90],
            vec![80, 80, 71],
            vec![],
            vec![60],
            vec![55, 40, 39, 38, 1],
        ]);
        source.order = Some(OrderInfo {
            field: "ts".into(),
            reversed: true,
        });
        let counters = source.counters.clone();
        let mut group = ParallelGroup::new(
            Arc::new(source),
            SourceFilter::new(Span::all()),
            3,
            CancellationToken::new(),
        )
        .batch_size(4);
        let got = drain(&mut group).await.unwrap();
        assert_eq!(got, vec![100, 95, 90, 80, 80, 71, 60, 55, 40, 39, 38, 1]);
        assert_eq!(group.progress().records_read, 12);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 5);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 5);
        assert!(group.pull().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unordered_delivers_everything() {
        let source = TestSource::new((0..10).map(|i| vec![i * 10, i * 10 + 1]).collect());
        let filter = SourceFilter::new(Span::from_first_last(0, 49));
        let mut group = ParallelGroup::new(Arc::new(source), filter, 4, CancellationToken::new());
        let mut got = drain(&mut group).await.unwrap();
        got.sort();
        assert_eq!(got, vec![0, 1, 10, 11, 20, 21, 30, 31, 40, 41]);
    }

    #[tokio::test]
    async fn test_dispatcher_error_is_reported() {
        let mut source = TestSource::new(vec![vec![1], vec![2], vec![3]]);
        source.fail_at = Some(2);
        let counters = source.counters.clone();
        let mut group = ParallelGroup::new(
            Arc::new(source),
            SourceFilter::new(Span::all()),
            2,
            CancellationToken::new(),
        );
        let err = drain(&mut group).await.unwrap_err();
        assert!(matches!(err, ZarError::Corrupt(_)), "{}", err);
        assert_eq!(
            counters.opened.load(Ordering::SeqCst),
            counters.closes.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_cancel_closes_every_opened_scanner() {
        let gate = Arc::new(Semaphore::new(0));
        let mut source = TestSource::new((0..10).map(|i| vec![i * 3, i * 3 + 1, i * 3 + 2]).collect());
        source.gate = Some(gate.clone());
        let counters = source.counters.clone();
        let token = CancellationToken::new();
        let mut group = ParallelGroup::new(
            Arc::new(source),
            SourceFilter::new(Span::all()),
            4,
            token.clone(),
        );

        let puller = drain(&mut group);
        let controller = async {
            wait_for(|| counters.invoked.load(Ordering::SeqCst) == 4).await;
            gate.add_permits(2);
            // the two released workers finish and block on their next openers
            wait_for(|| {
                counters.closes.load(Ordering::SeqCst) == 2
                    && counters.invoked.load(Ordering::SeqCst) == 6
            })
            .await;
            token.cancel();
            counters.invoked.load(Ordering::SeqCst)
        };
        let (result, invoked_at_cancel) = tokio::join!(puller, controller);

        assert!(result.unwrap_err().is_canceled());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
        assert_eq!(counters.double_closes.load(Ordering::SeqCst), 0);
        assert_eq!(counters.invoked.load(Ordering::SeqCst), invoked_at_cancel);
        assert_eq!(group.progress().records_read, 6);
        group.close().await.unwrap();
    }
}
