//! Archive as a multi-source
//!
//! Every span partition of the archive becomes one source. A partition
//! backed by a single chunk is scanned directly; overlapping chunks are
//! merged on `ts` so that each source stays sorted in archive direction.
//! Chunk files are opened on the blocking pool.

use crate::archive::metadata::Archive;
use crate::archive::overlap::SpanInfo;
use crate::driver::{MultiSource, OrderInfo, SourceOpener};
use crate::error::{ZarError, ZarResult};
use crate::proc::by_ts;
use crate::record::TypeContext;
use crate::scan::{open_chunk, Combiner, Scanner, SourceFilter, DEFAULT_BATCH_SIZE};
use crate::span::Direction;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Counts of chunk files opened by the source's scanners
#[derive(Debug, Default)]
pub struct ChunkStats {
    pub chunks_opened: AtomicU64,
    pub bytes_opened: AtomicU64,
}

pub struct ArchiveSource {
    archive: Arc<Archive>,
    zctx: Arc<TypeContext>,
    batch_size: usize,
    stats: Arc<ChunkStats>,
}

impl ArchiveSource {
    pub fn new(archive: Arc<Archive>, zctx: Arc<TypeContext>) -> Self {
        Self {
            archive,
            zctx,
            batch_size: DEFAULT_BATCH_SIZE,
            stats: Arc::new(ChunkStats::default()),
        }
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn stats(&self) -> Arc<ChunkStats> {
        self.stats.clone()
    }

    fn opener(&self, info: SpanInfo, filter: SourceFilter, cancel: CancellationToken) -> SourceOpener {
        let zctx = self.zctx.clone();
        let data_root: PathBuf = self.archive.data_root().to_path_buf();
        let dir = self.archive.direction();
        let batch_size = self.batch_size;
        let stats = self.stats.clone();
        Box::new(move || {
            async move {
                tokio::task::spawn_blocking(move || {
                    open_span(zctx, data_root, info, filter, dir, batch_size, cancel, &stats)
                })
                .await
                .map_err(|e| ZarError::Task(e.to_string()))?
            }
            .boxed()
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn open_span(
    zctx: Arc<TypeContext>,
    data_root: PathBuf,
    info: SpanInfo,
    filter: SourceFilter,
    dir: Direction,
    batch_size: usize,
    cancel: CancellationToken,
    stats: &ChunkStats,
) -> ZarResult<Option<Box<dyn Scanner>>> {
    let filter = filter.with_span(info.span);
    let mut scanners: Vec<Box<dyn Scanner>> = Vec::with_capacity(info.chunks.len());
    for chunk in &info.chunks {
        if cancel.is_cancelled() {
            for mut s in scanners {
                let _ = s.close();
            }
            return Err(ZarError::Canceled);
        }
        let scanner = match open_chunk(zctx.clone(), &data_root, chunk, filter.clone(), dir) {
            Ok(s) => s,
            Err(e) => {
                for mut s in scanners {
                    let _ = s.close();
                }
                return Err(e.in_source(chunk.log_id.to_string()));
            }
        };
        stats.chunks_opened.fetch_add(1, Ordering::Relaxed);
        if let Ok(meta) = std::fs::metadata(chunk.path(&data_root)) {
            stats.bytes_opened.fetch_add(meta.len(), Ordering::Relaxed);
        }
        scanners.push(Box::new(
            scanner.batch_size(batch_size).cancel_on(cancel.clone()),
        ));
    }
    match scanners.len() {
        0 => Ok(None),
        1 => Ok(scanners.pop()),
        _ => Ok(Some(Box::new(
            Combiner::new(scanners, by_ts(dir))
                .batch_size(batch_size)
                .cancel_on(cancel),
        ))),
    }
}

#[async_trait]
impl MultiSource for ArchiveSource {
    fn order_info(&self) -> Option<OrderInfo> {
        Some(OrderInfo {
            field: "ts".to_string(),
            reversed: self.archive.direction().is_reverse(),
        })
    }

    async fn send_sources(
        &self,
        cancel: CancellationToken,
        filter: SourceFilter,
        out: mpsc::Sender<SourceOpener>,
    ) -> ZarResult<()> {
        let infos = self.archive.span_walk(filter.span)?;
        tracing::debug!(
            "Dispatching {} spans from {}",
            infos.len(),
            self.archive.root().display()
        );
        for info in infos {
            let opener = self.opener(info, filter.clone(), cancel.clone());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = out.send(opener) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::chunk::{Chunk, LogId};
    use crate::archive::import::{import, ImportOptions};
    use crate::archive::metadata::CreateOptions;
    use crate::archive::testutil::sample_archive;
    use crate::driver::ParallelGroup;
    use crate::record::{ArrayReader, Column, Record, Type, Value};
    use crate::span::Span;
    use tempfile::tempdir;

    async fn scan_ts(group: &mut ParallelGroup) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(batch) = group.pull().await.unwrap() {
            out.extend(batch.records().iter().filter_map(|r| r.ts()));
        }
        out
    }

    #[tokio::test]
    async fn test_parallel_scan_in_archive_order() {
        let dir = tempdir().unwrap();
        let zctx = Arc::new(TypeContext::new());
        let archive = Arc::new(sample_archive(dir.path(), &zctx));
        assert!(archive.chunks().unwrap().len() > 1);

        let source = ArchiveSource::new(archive.clone(), zctx.clone());
        let mut group = ParallelGroup::new(
            Arc::new(source),
            SourceFilter::new(Span::all()),
            3,
            CancellationToken::new(),
        );
        let got = scan_ts(&mut group).await;
        assert_eq!(
            got,
            vec![
                1_587_517_405_066_655_910,
                1_587_517_149_063_044_070,
                1_587_509_168_067_598_390,
                1_587_508_830_068_523_240,
            ]
        );
        assert_eq!(group.progress().records_matched, 4);
    }

    #[tokio::test]
    async fn test_overlapping_chunks_are_combined() {
        let dir = tempdir().unwrap();
        let zctx = Arc::new(TypeContext::new());
        let archive = Arc::new(
            Archive::create(dir.path(), CreateOptions::default().direction(Direction::Forward))
                .unwrap(),
        );
        let ty = zctx
            .lookup_record(vec![Column::new("ts", Type::Time), Column::new("n", Type::Int64)])
            .unwrap();
        let base = 1_587_427_200_000_000_000i64;
        // two imports over interleaving stamps give overlapping chunks
        for offset in [0i64, 5] {
            let recs: Vec<Record> = (0..5)
                .map(|i| {
                    let ts = base + offset + i * 10;
                    Record::new(ty.clone(), vec![Value::Time(ts), Value::Int(ts - base)]).unwrap()
                })
                .collect();
            import(
                &archive,
                zctx.clone(),
                &mut ArrayReader::new(recs),
                &ImportOptions::default(),
                &CancellationToken::new(),
            )
            .unwrap();
        }
        assert_eq!(archive.chunks().unwrap().len(), 2);

        let source = ArchiveSource::new(archive.clone(), zctx.clone());
        let stats = source.stats();
        let filter = SourceFilter::new(Span::from_first_last(base + 12, base + 44))
            .with_filter(Arc::new(|r: &Record| r.int("n") != Some(25)), None);
        let mut group = ParallelGroup::new(Arc::new(source), filter, 2, CancellationToken::new());
        let got: Vec<i64> = scan_ts(&mut group).await.into_iter().map(|ts| ts - base).collect();
        assert_eq!(got, vec![15, 20, 30, 35, 40]);
        assert!(stats.chunks_opened.load(Ordering::Relaxed) >= 2);
        assert!(stats.bytes_opened.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_missing_chunk_fails_scan() {
        let dir = tempdir().unwrap();
        let zctx = Arc::new(TypeContext::new());
        let archive = Archive::create(dir.path(), CreateOptions::default()).unwrap();
        let first = 1_587_427_200_000_000_000i64;
        archive
            .append_chunks(vec![Chunk::new(LogId::for_chunk(first), first, first + 10, 1)])
            .unwrap();
        let source = ArchiveSource::new(Arc::new(archive), zctx);
        let mut group = ParallelGroup::new(
            Arc::new(source),
            SourceFilter::new(Span::all()),
            2,
            CancellationToken::new(),
        );
        let err = group.pull().await.unwrap_err();
        assert!(err.is_not_found(), "{}", err);
    }
}
