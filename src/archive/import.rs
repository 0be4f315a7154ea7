//! Import of records into chunks
//!
//! ```text
//! input -> sort by ts (spilling) -> chunk writer -> <day>/<first>-<id>.rec
//!                                        |               + .rec.seek
//!                                        +-> append_chunks on close
//! ```
//!
//! A chunk is closed when the day changes or its size reaches the archive's
//! log size threshold. Within a chunk a stream is ended whenever the bytes
//! since the last sync point reach `stream_bytes_max`; every stream start is
//! recorded in the seek index.

use crate::archive::chunk::{Chunk, LogId};
use crate::archive::metadata::Archive;
use crate::archive::seek::{write_seek_index, SeekEntry};
use crate::error::{ZarError, ZarResult};
use crate::microindex::DEFAULT_FRAME_THRESH;
use crate::proc::sort::DEFAULT_SORT_MEM_RECORDS;
use crate::proc::{by_ts, Sorter};
use crate::record::{codec, Record, RecordReader, TypeContext, WriterOptions};
use crate::span::{day_of, Span, Ts};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default bytes per chunk stream
pub const DEFAULT_STREAM_BYTES_MAX: u64 = 64 * 1024;

/// Default LZ4 block size for chunk streams
pub const DEFAULT_LZ4_BLOCK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// End a stream after this many bytes
    pub stream_bytes_max: u64,
    /// End a stream after this many records (0 = unbounded)
    pub stream_records_max: usize,
    /// LZ4 block size (0 disables compression)
    pub lz4_block_size: usize,
    /// Records sorted in memory before spilling a run
    pub sort_mem_records: usize,
    /// Frame threshold of the seek index
    pub seek_frame_thresh: usize,
    /// Where sort runs are spilled (system temp dir if unset)
    pub spill_dir: Option<PathBuf>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            stream_bytes_max: DEFAULT_STREAM_BYTES_MAX,
            stream_records_max: 0,
            lz4_block_size: DEFAULT_LZ4_BLOCK_SIZE,
            sort_mem_records: DEFAULT_SORT_MEM_RECORDS,
            seek_frame_thresh: DEFAULT_FRAME_THRESH,
            spill_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub records: u64,
    pub chunks: usize,
    pub bytes: u64,
}

struct ChunkWriter {
    log_id: LogId,
    path: PathBuf,
    writer: codec::Writer<BufWriter<File>>,
    day: Span,
    first: Ts,
    last: Ts,
    records: u64,
    seeks: Vec<SeekEntry>,
}

impl ChunkWriter {
    fn create(data_root: &Path, first: Ts, opts: &ImportOptions) -> ZarResult<Self> {
        let log_id = LogId::for_chunk(first);
        let path = log_id.path(data_root);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| ZarError::io(dir, e))?;
        }
        let file = File::create(&path).map_err(|e| ZarError::io(&path, e))?;
        let writer = codec::Writer::with_options(
            BufWriter::new(file),
            WriterOptions {
                lz4_block_size: opts.lz4_block_size,
                stream_records_max: opts.stream_records_max,
            },
        );
        tracing::debug!("Opened chunk {}", log_id);
        Ok(Self {
            log_id,
            path,
            writer,
            day: day_of(first),
            first,
            last: first,
            records: 0,
            seeks: Vec::new(),
        })
    }

    /// Bytes written including data still waiting to be compressed.
    fn size(&self) -> u64 {
        self.writer.position() + self.writer.buffered() as u64
    }

    fn write(&mut self, rec: &Record, ts: Ts, stream_bytes_max: u64) -> ZarResult<()> {
        if self.writer.stream_records() == 0 {
            self.seeks.push(SeekEntry {
                ts,
                offset: self.writer.last_sync(),
            });
        }
        self.writer
            .write(rec)
            .map_err(|e| e.in_source(self.log_id.to_string()))?;
        self.last = ts;
        self.records += 1;
        if self.writer.stream_records() > 0 && self.size() - self.writer.last_sync() >= stream_bytes_max
        {
            self.writer.end_stream()?;
        }
        Ok(())
    }

    fn close(mut self) -> ZarResult<(Chunk, Vec<SeekEntry>, u64)> {
        if self.writer.stream_records() > 0 {
            self.writer.end_stream()?;
        }
        let size = self.writer.position();
        let buf = self.writer.into_inner()?;
        let file = buf
            .into_inner()
            .map_err(|e| ZarError::io(&self.path, e.into_error()))?;
        file.sync_all().map_err(|e| ZarError::io(&self.path, e))?;
        let chunk = Chunk::new(self.log_id, self.first, self.last, self.records);
        Ok((chunk, self.seeks, size))
    }

    fn abort(self) {
        let path = self.path.clone();
        drop(self);
        let _ = fs::remove_file(&path);
    }
}

/// Writes records, already sorted in archive order, into chunks.
pub struct ChunkImporter<'a> {
    archive: &'a Archive,
    zctx: Arc<TypeContext>,
    opts: ImportOptions,
    current: Option<ChunkWriter>,
    stats: ImportStats,
}

impl<'a> ChunkImporter<'a> {
    pub fn new(archive: &'a Archive, zctx: Arc<TypeContext>, opts: ImportOptions) -> Self {
        Self {
            archive,
            zctx,
            opts,
            current: None,
            stats: ImportStats::default(),
        }
    }

    pub fn write(&mut self, rec: &Record) -> ZarResult<()> {
        let ts = rec
            .ts()
            .ok_or_else(|| ZarError::Validation(format!("record has no ts field: {}", rec)))?;
        let threshold = self.archive.log_size_threshold().max(1) as u64;
        let rotate = match &self.current {
            Some(cw) => {
                !cw.day.contains(ts)
                    || cw.size() >= threshold
                    || self.archive.direction().compare(ts, cw.last) == std::cmp::Ordering::Less
            }
            None => false,
        };
        if rotate {
            self.close_current()?;
        }
        if self.current.is_none() {
            self.current = Some(ChunkWriter::create(
                self.archive.data_root(),
                ts,
                &self.opts,
            )?);
        }
        if let Some(cw) = self.current.as_mut() {
            cw.write(rec, ts, self.opts.stream_bytes_max.max(1))?;
        }
        self.stats.records += 1;
        Ok(())
    }

    fn close_current(&mut self) -> ZarResult<()> {
        let Some(cw) = self.current.take() else {
            return Ok(());
        };
        let (chunk, seeks, size) = cw.close()?;
        let data_root = self.archive.data_root();
        write_seek_index(
            self.zctx.clone(),
            &chunk.seek_path(data_root),
            &seeks,
            self.archive.direction(),
            self.opts.seek_frame_thresh,
        )?;
        tracing::info!(
            "Wrote chunk {} ({} records, {} bytes, {} streams)",
            chunk.log_id,
            chunk.record_count,
            size,
            seeks.len()
        );
        self.archive.append_chunks(vec![chunk])?;
        self.stats.chunks += 1;
        self.stats.bytes += size;
        Ok(())
    }

    /// Close the open chunk and return the totals.
    pub fn finish(mut self) -> ZarResult<ImportStats> {
        self.close_current()?;
        Ok(std::mem::take(&mut self.stats))
    }

    /// Discard the open chunk. Chunks already closed stay in the archive.
    pub fn abort(mut self) {
        if let Some(cw) = self.current.take() {
            tracing::warn!("Discarding partial chunk {}", cw.log_id);
            cw.abort();
        }
    }
}

/// Sort `input` by time in the archive direction and write it into chunks.
pub fn import(
    archive: &Archive,
    zctx: Arc<TypeContext>,
    input: &mut dyn RecordReader,
    opts: &ImportOptions,
    cancel: &CancellationToken,
) -> ZarResult<ImportStats> {
    let mut sorter = Sorter::new(zctx.clone(), by_ts(archive.direction()))
        .mem_records(opts.sort_mem_records);
    if let Some(dir) = &opts.spill_dir {
        sorter = sorter.spill_dir(dir);
    }
    while let Some(rec) = input.read()? {
        if cancel.is_cancelled() {
            return Err(ZarError::Canceled);
        }
        if rec.ts().is_none() {
            return Err(ZarError::Validation(format!("record has no ts field: {}", rec)));
        }
        sorter.push(rec)?;
    }
    let mut sorted = sorter.finish()?;

    let mut importer = ChunkImporter::new(archive, zctx, opts.clone());
    loop {
        if cancel.is_cancelled() {
            importer.abort();
            return Err(ZarError::Canceled);
        }
        let rec = match sorted.read() {
            Ok(Some(rec)) => rec,
            Ok(None) => break,
            Err(e) => {
                importer.abort();
                return Err(e);
            }
        };
        if let Err(e) = importer.write(&rec) {
            importer.abort();
            return Err(e);
        }
    }
    let stats = importer.finish()?;
    tracing::info!(
        "Imported {} records into {} chunks",
        stats.records,
        stats.chunks
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::metadata::CreateOptions;
    use crate::archive::seek::lookup_seek;
    use crate::archive::testutil::sample_records;
    use crate::record::{read_all, ArrayReader, Column, Reader, Type, Value};
    use crate::span::Direction;
    use tempfile::tempdir;

    #[test]
    fn test_import_splits_by_day_and_sorts() {
        let dir = tempdir().unwrap();
        let archive = Archive::create(
            dir.path(),
            CreateOptions::default().log_size_threshold(1000),
        )
        .unwrap();
        let zctx = Arc::new(TypeContext::new());
        let mut input = ArrayReader::new(sample_records(&zctx));
        let stats = import(
            &archive,
            zctx.clone(),
            &mut input,
            &ImportOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(stats.records, 4);
        assert_eq!(stats.chunks, 2);

        let chunks = archive.chunks().unwrap();
        assert_eq!(chunks[0].first, 1_587_517_405_066_655_910);
        assert_eq!(chunks[0].last, 1_587_517_149_063_044_070);
        assert_eq!(chunks[1].first, 1_587_509_168_067_598_390);
        assert_eq!(chunks[1].record_count, 2);

        let file = File::open(chunks[0].path(archive.data_root())).unwrap();
        let mut rdr = Reader::new(std::io::BufReader::new(file), zctx);
        let recs = read_all(&mut rdr).unwrap();
        assert_eq!(recs.len(), 2);
        assert!(recs[0].ts() > recs[1].ts());
        assert!(chunks[0].seek_path(archive.data_root()).exists());
    }

    #[test]
    fn test_size_threshold_split() {
        let dir = tempdir().unwrap();
        let archive = Archive::create(
            dir.path(),
            CreateOptions::default()
                .log_size_threshold(200)
                .direction(Direction::Forward),
        )
        .unwrap();
        let zctx = Arc::new(TypeContext::new());
        let ty = zctx
            .lookup_record(vec![
                Column::new("ts", Type::Time),
                Column::new("pad", Type::String),
            ])
            .unwrap();
        let base = 1_587_427_200_000_000_000i64;
        let recs: Vec<Record> = (0..20)
            .map(|i| {
                Record::new(
                    ty.clone(),
                    vec![Value::Time(base + i), Value::String("x".repeat(40))],
                )
                .unwrap()
            })
            .collect();
        let opts = ImportOptions {
            lz4_block_size: 0,
            ..Default::default()
        };
        let stats = import(
            &archive,
            zctx,
            &mut ArrayReader::new(recs),
            &opts,
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(stats.chunks > 1);
        let chunks = archive.chunks().unwrap();
        assert_eq!(chunks.iter().map(|c| c.record_count).sum::<u64>(), 20);
        assert!(chunks.windows(2).all(|w| w[0].last < w[1].first));
    }

    #[test]
    fn test_seek_index_per_stream() {
        let dir = tempdir().unwrap();
        let archive = Archive::create(
            dir.path(),
            CreateOptions::default().direction(Direction::Forward),
        )
        .unwrap();
        let zctx = Arc::new(TypeContext::new());
        let ty = zctx
            .lookup_record(vec![Column::new("ts", Type::Time), Column::new("n", Type::Int64)])
            .unwrap();
        let stamps = [
            1_587_508_830_068_523_240i64,
            1_587_508_840_062_981_120,
            1_587_508_850_064_660_320,
            1_587_508_860_063_444_500,
            1_587_508_870_069_118_900,
        ];
        let recs: Vec<Record> = stamps
            .iter()
            .enumerate()
            .map(|(i, ts)| Record::new(ty.clone(), vec![Value::Time(*ts), Value::Int(i as i64)]).unwrap())
            .collect();
        let opts = ImportOptions {
            stream_records_max: 1,
            lz4_block_size: 0,
            ..Default::default()
        };
        import(
            &archive,
            zctx.clone(),
            &mut ArrayReader::new(recs),
            &opts,
            &CancellationToken::new(),
        )
        .unwrap();

        let chunk = archive.chunks().unwrap().remove(0);
        let entry = lookup_seek(zctx.clone(), archive.data_root(), &chunk, 1_587_508_851_000_000_000)
            .unwrap()
            .unwrap();
        assert_eq!(entry.ts, 1_587_508_850_064_660_320);
        assert!(entry.offset > 0);

        // the offset is a sync point where the third record starts
        let mut file = File::open(chunk.path(archive.data_root())).unwrap();
        std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(entry.offset)).unwrap();
        let mut rdr = Reader::new(file, zctx.clone()).with_offset(entry.offset);
        assert_eq!(rdr.read().unwrap().unwrap().int("n"), Some(2));

        let first = lookup_seek(zctx, archive.data_root(), &chunk, stamps[0]).unwrap().unwrap();
        assert_eq!(first.offset, 0);
    }

    #[test]
    fn test_canceled_import_writes_nothing() {
        let dir = tempdir().unwrap();
        let archive = Archive::create(dir.path(), CreateOptions::default()).unwrap();
        let zctx = Arc::new(TypeContext::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = import(
            &archive,
            zctx.clone(),
            &mut ArrayReader::new(sample_records(&zctx)),
            &ImportOptions::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(err.is_canceled());
        assert!(archive.chunks().unwrap().is_empty());
    }

    #[test]
    fn test_record_without_ts_rejected() {
        let dir = tempdir().unwrap();
        let archive = Archive::create(dir.path(), CreateOptions::default()).unwrap();
        let zctx = Arc::new(TypeContext::new());
        let ty = zctx.lookup_record(vec![Column::new("v", Type::Int64)]).unwrap();
        let rec = Record::new(ty, vec![Value::Int(1)]).unwrap();
        let err = import(
            &archive,
            zctx,
            &mut ArrayReader::new(vec![rec]),
            &ImportOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ZarError::Validation(_)));
    }
}
