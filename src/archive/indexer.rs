//! Indexing driver
//!
//! Builds one micro-index per rule for every chunk. Each chunk is read once;
//! every record is handed to one worker thread per rule, whose aggregator
//! counts distinct keys. The sorted `{key, count}` rows are then written to
//! `<chunk>.zar/idx:<kind>:<arg>`.

use crate::archive::chunk::Chunk;
use crate::archive::metadata::{Archive, IndexInfo};
use crate::error::{ZarError, ZarResult};
use crate::microindex::{self, DEFAULT_FRAME_THRESH};
use crate::proc::aggregate::DEFAULT_AGG_ROWS;
use crate::proc::{CountAggregator, KEY_FIELD};
use crate::record::literal::parse_type;
use crate::record::{Reader, Record, RecordReader, Type, TypeContext, Walk};
use crate::span::Direction;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const INDEX_PREFIX: &str = "idx";

/// Default number of tolerated per-chunk failures
pub const DEFAULT_MAX_ERRORS: usize = 10;

// records buffered ahead of each rule worker
const RULE_CHANNEL_CAPACITY: usize = 1024;

/// Key extraction rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Every value of this type anywhere in the record
    ByType(Type),
    /// Value of the named (dotted) field
    ByField(String),
}

impl Rule {
    /// `:<type>` indexes values by type, anything else names a field.
    pub fn parse(zctx: &TypeContext, pattern: &str) -> ZarResult<Rule> {
        let pattern = pattern.trim();
        if let Some(type_name) = pattern.strip_prefix(':') {
            let ty = parse_type(zctx, type_name)?;
            if !ty.underlying().is_primitive() {
                return Err(ZarError::Validation(format!(
                    "type rule needs a primitive type: {}",
                    pattern
                )));
            }
            return Ok(Rule::ByType(ty.underlying().clone()));
        }
        if pattern.is_empty() || pattern.contains(char::is_whitespace) {
            return Err(ZarError::Validation(format!(
                "invalid index rule \"{}\"",
                pattern
            )));
        }
        Ok(Rule::ByField(pattern.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Rule::ByType(_) => "type",
            Rule::ByField(_) => "field",
        }
    }

    /// Index file name within a chunk's zar directory
    pub fn path(&self) -> String {
        match self {
            Rule::ByType(ty) => format!("{}:type:{}", INDEX_PREFIX, ty),
            Rule::ByField(field) => format!("{}:field:{}", INDEX_PREFIX, field),
        }
    }

    pub fn info(&self) -> IndexInfo {
        IndexInfo::new(self.kind(), self.path())
    }

    /// Feed the keys of `rec` to `agg`.
    fn extract(&self, rec: &Record, agg: &mut CountAggregator) -> ZarResult<()> {
        match self {
            Rule::ByField(field) => match rec.field(field) {
                Some((ty, val)) => agg.add(ty.underlying(), val),
                None => Ok(()),
            },
            Rule::ByType(want) => rec.walk(&mut |ty, val| {
                if ty.underlying() == want {
                    agg.add(want, val)?;
                    return Ok(Walk::SkipChildren);
                }
                Ok(Walk::Continue)
            }),
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path())
    }
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub frame_thresh: usize,
    /// Stop after this many chunk failures
    pub max_errors: usize,
    /// Distinct keys per rule held in memory before spilling
    pub agg_rows: usize,
    pub spill_dir: Option<PathBuf>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            frame_thresh: DEFAULT_FRAME_THRESH,
            max_errors: DEFAULT_MAX_ERRORS,
            agg_rows: DEFAULT_AGG_ROWS,
            spill_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub chunks: usize,
    pub indexes: usize,
    pub errors: usize,
}

fn aggregator(zctx: &Arc<TypeContext>, rule: &Rule, chunk: &Chunk, opts: &IndexOptions) -> CountAggregator {
    let agg = CountAggregator::new(zctx.clone(), format!("{} {}", chunk.log_id, rule))
        .limit(opts.agg_rows);
    match &opts.spill_dir {
        Some(dir) => agg.spill_dir(dir),
        None => agg,
    }
}

fn write_index(
    zctx: &Arc<TypeContext>,
    path: &Path,
    agg: CountAggregator,
    frame_thresh: usize,
) -> ZarResult<u64> {
    let mut rows = agg.finish()?;
    let mut writer = microindex::Writer::new(zctx.clone(), path, vec![KEY_FIELD.to_string()])
        .direction(Direction::Forward)
        .frame_thresh(frame_thresh);
    loop {
        let rec = match rows.read() {
            Ok(Some(rec)) => rec,
            Ok(None) => break,
            Err(e) => {
                writer.abort();
                return Err(e);
            }
        };
        if let Err(e) = writer.write(&rec) {
            writer.abort();
            return Err(e);
        }
    }
    let n = writer.records();
    writer.close()?;
    Ok(n)
}

/// Feed every record of `reader` to each rule worker. Returns false when a
/// worker hung up early, which means it failed and will report why.
fn feed(
    reader: &mut dyn RecordReader,
    workers: &[SyncSender<Arc<Record>>],
    cancel: &CancellationToken,
) -> ZarResult<bool> {
    while let Some(rec) = reader.read()? {
        if cancel.is_cancelled() {
            return Err(ZarError::Canceled);
        }
        let rec = Arc::new(rec);
        for tx in workers {
            if tx.send(Arc::clone(&rec)).is_err() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Build the micro-indexes for `rules` over one chunk.
///
/// The chunk is decoded once on the calling thread and each record is
/// shared with one worker thread per rule. Index files are only written
/// when every record reached every worker.
pub fn index_chunk(
    zctx: &Arc<TypeContext>,
    data_root: &Path,
    chunk: &Chunk,
    rules: &[Rule],
    opts: &IndexOptions,
    cancel: &CancellationToken,
) -> ZarResult<()> {
    let path = chunk.path(data_root);
    let file = File::open(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ZarError::NotFound(path.display().to_string())
        } else {
            ZarError::io(&path, e)
        }
    })?;
    let mut reader = Reader::new(BufReader::new(file), zctx.clone());
    let aborted = AtomicBool::new(false);

    std::thread::scope(|s| {
        let mut senders = Vec::with_capacity(rules.len());
        let mut handles = Vec::with_capacity(rules.len());
        for rule in rules {
            let (tx, rx) = sync_channel::<Arc<Record>>(RULE_CHANNEL_CAPACITY);
            let mut agg = aggregator(zctx, rule, chunk, opts);
            let aborted = &aborted;
            senders.push(tx);
            handles.push(s.spawn(move || -> ZarResult<()> {
                for rec in rx {
                    rule.extract(&rec, &mut agg)?;
                }
                if aborted.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let index_path = chunk.localize(data_root, &rule.path());
                let n = write_index(zctx, &index_path, agg, opts.frame_thresh)?;
                tracing::debug!("Wrote {} keys to {:?}", n, index_path);
                Ok(())
            }));
        }

        let fed = feed(&mut reader, &senders, cancel);
        if !matches!(fed, Ok(true)) {
            aborted.store(true, Ordering::SeqCst);
        }
        drop(senders);

        let mut worker_err = None;
        for handle in handles {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(ZarError::Task("index worker panicked".to_string())));
            if let Err(e) = result {
                worker_err.get_or_insert(e);
            }
        }
        match fed {
            Err(e) => Err(e),
            Ok(_) => worker_err.map_or(Ok(()), Err),
        }
    })
}

/// Index every chunk of the archive. Per-chunk failures are logged and
/// tolerated until `max_errors` is reached. Progress messages are sent
/// without blocking; they are dropped when the channel is full.
pub fn index_archive(
    archive: &Archive,
    zctx: Arc<TypeContext>,
    rules: &[Rule],
    opts: &IndexOptions,
    progress: Option<&mpsc::Sender<String>>,
    cancel: &CancellationToken,
) -> ZarResult<IndexStats> {
    if rules.is_empty() {
        return Err(ZarError::Validation("no index rules given".to_string()));
    }
    archive.update_check()?;
    let chunks = archive.chunks()?;
    let data_root = archive.data_root();
    let mut stats = IndexStats::default();
    let mut last_err: Option<ZarError> = None;

    let report = |msg: String| {
        if let Some(tx) = progress {
            let _ = tx.try_send(msg);
        }
    };

    for chunk in &chunks {
        if cancel.is_cancelled() {
            return Err(ZarError::Canceled);
        }
        match index_chunk(&zctx, data_root, chunk, rules, opts, cancel) {
            Ok(()) => {
                stats.chunks += 1;
                stats.indexes += rules.len();
                report(format!("{}: {} indexes created", chunk.log_id, rules.len()));
            }
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                let e = e.in_source(chunk.log_id.to_string());
                tracing::warn!("Indexing failed: {}", e);
                report(format!("error: {}", e));
                stats.errors += 1;
                if stats.errors >= opts.max_errors.max(1) {
                    return Err(ZarError::TooManyErrors {
                        count: stats.errors,
                        last: Box::new(e),
                    });
                }
                last_err = Some(e);
            }
        }
    }
    if let Some(e) = &last_err {
        tracing::warn!("Indexing finished with {} errors, last: {}", stats.errors, e);
    }

    archive.add_indexes(rules.iter().map(Rule::info).collect())?;
    tracing::info!(
        "Indexed {} chunks with {} rules",
        stats.chunks,
        rules.len()
    );
    Ok(stats)
}
