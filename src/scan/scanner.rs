//! Single-source scanner
//!
//! Reads records from one input in direction order, drops those outside the
//! filter span and those the predicate rejects, and stops as soon as a
//! record lies past the end of the span.

use crate::archive::chunk::Chunk;
use crate::archive::seek::lookup_seek;
use crate::error::{ZarError, ZarResult};
use crate::record::{Reader, Record, RecordReader, TypeContext};
use crate::scan::{Batch, Progress, ProgressSnapshot, Scanner, SourceFilter};
use crate::span::Direction;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Records per batch
pub const DEFAULT_BATCH_SIZE: usize = 100;

pub struct ReaderScanner {
    name: String,
    reader: Option<Box<dyn RecordReader>>,
    filter: SourceFilter,
    direction: Direction,
    batch_size: usize,
    cancel: CancellationToken,
    progress: Arc<Progress>,
    last_pos: u64,
}

/// State a blocking read needs, detached from the scanner for one pull.
struct Fill {
    name: String,
    filter: SourceFilter,
    direction: Direction,
    batch_size: usize,
    cancel: CancellationToken,
    progress: Arc<Progress>,
    last_pos: u64,
}

impl Fill {
    /// Read up to one batch. The flag is true once the input is exhausted
    /// or a record lies past the end of the span.
    fn run(&mut self, reader: &mut dyn RecordReader) -> ZarResult<(Vec<Record>, bool)> {
        let span = self.filter.span;
        let dir = self.direction;
        let (start, end) = (span.first_in(dir), span.last_in(dir));
        let mut out = Vec::with_capacity(self.batch_size);
        if span.is_empty() {
            return Ok((out, true));
        }

        while out.len() < self.batch_size {
            if self.cancel.is_cancelled() {
                return Err(ZarError::Canceled);
            }
            let Some(rec) = reader.read().map_err(|e| e.in_source(self.name.clone()))? else {
                return Ok((out, true));
            };
            let size = match reader.position() {
                Some(pos) => {
                    let delta = pos.saturating_sub(self.last_pos);
                    self.last_pos = pos;
                    delta
                }
                None => rec.bytes().len() as u64,
            };
            self.progress.add_read(size, 1);
            let Some(ts) = rec.ts() else {
                continue;
            };
            if dir.compare(ts, start) == Ordering::Less {
                continue;
            }
            if dir.compare(ts, end) == Ordering::Greater {
                return Ok((out, true));
            }
            if !self.filter.matches(&rec) {
                continue;
            }
            self.progress.add_matched(size, 1);
            out.push(rec);
        }
        Ok((out, false))
    }
}

impl ReaderScanner {
    pub fn new(
        name: impl Into<String>,
        reader: Box<dyn RecordReader>,
        filter: SourceFilter,
        direction: Direction,
    ) -> Self {
        let last_pos = reader.position().unwrap_or(0);
        Self {
            name: name.into(),
            reader: Some(reader),
            filter,
            direction,
            batch_size: DEFAULT_BATCH_SIZE,
            cancel: CancellationToken::new(),
            progress: Arc::new(Progress::new()),
            last_pos,
        }
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    /// Fail pulls once `token` is canceled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

#[async_trait]
impl Scanner for ReaderScanner {
    /// Decoding runs on the blocking pool. If the pull is dropped midway the
    /// reader is released when the blocking read returns.
    async fn pull(&mut self) -> ZarResult<Option<Batch>> {
        let Some(mut reader) = self.reader.take() else {
            return Ok(None);
        };
        let mut fill = Fill {
            name: self.name.clone(),
            filter: self.filter.clone(),
            direction: self.direction,
            batch_size: self.batch_size,
            cancel: self.cancel.clone(),
            progress: Arc::clone(&self.progress),
            last_pos: self.last_pos,
        };
        let (reader, last_pos, filled) = tokio::task::spawn_blocking(move || {
            let filled = fill.run(reader.as_mut());
            (reader, fill.last_pos, filled)
        })
        .await
        .map_err(|e| ZarError::Task(e.to_string()))?;
        self.last_pos = last_pos;

        let (out, finished) = match filled {
            Ok(filled) => filled,
            Err(e) => {
                self.reader = Some(reader);
                return Err(e);
            }
        };
        if !finished {
            self.reader = Some(reader);
        }
        if out.is_empty() {
            return Ok(None);
        }
        Ok(Some(Batch::new(out)))
    }

    fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    fn close(&mut self) -> ZarResult<()> {
        self.reader = None;
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn applies_filter(&self) -> bool {
        true
    }
}

/// Open a scanner over one chunk, starting at the seek-index entry nearest
/// the start of the filter span when the chunk has one.
pub fn open_chunk(
    zctx: Arc<TypeContext>,
    data_root: &Path,
    chunk: &Chunk,
    filter: SourceFilter,
    direction: Direction,
) -> ZarResult<ReaderScanner> {
    let path = chunk.path(data_root);
    let file = File::open(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ZarError::NotFound(path.display().to_string())
        } else {
            ZarError::io(&path, e)
        }
    })?;
    let mut reader = Reader::new(BufReader::new(file), zctx.clone());

    let start = filter.span.first_in(direction);
    if direction.compare(start, chunk.first) == Ordering::Greater {
        match lookup_seek(zctx, data_root, chunk, start) {
            Ok(Some(entry)) if entry.offset > 0 => {
                tracing::debug!("Seeking {} to offset {}", chunk.log_id, entry.offset);
                reader.seek(entry.offset)?;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Seek index for {} unusable: {}", chunk.log_id, e),
        }
    }
    Ok(ReaderScanner::new(
        chunk.log_id.to_string(),
        Box::new(reader),
        filter,
        direction,
    ))
}
