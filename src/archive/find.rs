//! Find driver
//!
//! Probes one micro-index per chunk and streams the matching rows, each
//! optionally extended with the chunk it came from:
//!
//! ```text
//! {key: 336, count: 1 (uint64), _log: "20200422/...rec" (zfile), first: <time>, last: <time>}
//! ```

use crate::archive::chunk::Chunk;
use crate::archive::indexer::Rule;
use crate::archive::metadata::Archive;
use crate::error::{ZarError, ZarResult};
use crate::microindex::Finder;
use crate::record::{Column, Record, Type, TypeContext, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const LOG_FIELD: &str = "_log";
pub const LOG_ALIAS: &str = "zfile";
pub const FIRST_FIELD: &str = "first";
pub const LAST_FIELD: &str = "last";

const FIND_CHANNEL_CAPACITY: usize = 64;

/// An index name and the key patterns to probe it with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    pub index: String,
    pub patterns: Vec<String>,
}

impl IndexQuery {
    pub fn new(index: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            index: index.into(),
            patterns,
        }
    }

    /// Parse the shorthand `:<type>=<value>` or `<field>=<value>`.
    pub fn parse(zctx: &TypeContext, query: &str) -> ZarResult<Self> {
        let (rule, value) = query.split_once('=').ok_or_else(|| {
            ZarError::Validation(format!("index query must be rule=value: \"{}\"", query))
        })?;
        let rule = Rule::parse(zctx, rule)?;
        let value = value.trim();
        if value.is_empty() {
            return Err(ZarError::Validation(format!(
                "index query has no value: \"{}\"",
                query
            )));
        }
        Ok(Self::new(rule.path(), vec![value.to_string()]))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FindOptions {
    /// Treat chunks without the index as empty instead of failing
    pub skip_missing: bool,
    /// Add `_log`, `first` and `last` to each hit
    pub add_path: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            skip_missing: true,
            add_path: true,
        }
    }
}

fn annotate(zctx: &TypeContext, rec: Record, chunk: &Chunk) -> ZarResult<Record> {
    let mut cols = rec.columns().to_vec();
    cols.push(Column::new(
        LOG_FIELD,
        zctx.lookup_alias(LOG_ALIAS, Type::String),
    ));
    cols.push(Column::new(FIRST_FIELD, Type::Time));
    cols.push(Column::new(LAST_FIELD, Type::Time));
    let ty = zctx.lookup_record(cols)?;
    let mut values = rec.into_values();
    values.push(Value::String(chunk.log_id.to_string()));
    values.push(Value::Time(chunk.first));
    values.push(Value::Time(chunk.last));
    Record::new(ty, values)
}

/// Matching rows of one chunk's index.
pub fn find_chunk(
    zctx: &Arc<TypeContext>,
    data_root: &Path,
    chunk: &Chunk,
    query: &IndexQuery,
    opts: &FindOptions,
) -> ZarResult<Vec<Record>> {
    let path = chunk.localize(data_root, &query.index);
    let mut finder = match Finder::open(zctx.clone(), &path) {
        Ok(finder) => finder,
        Err(e) if e.is_not_found() && opts.skip_missing => {
            tracing::debug!("No index {} for {}", query.index, chunk.log_id);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    if finder.is_empty() {
        return Ok(Vec::new());
    }
    let patterns: Vec<&str> = query.patterns.iter().map(String::as_str).collect();
    let keys = finder.parse_keys(&patterns)?;
    let mut hits = Vec::new();
    let mut rdr = finder.lookup_all(keys)?;
    while let Some(rec) = rdr.read()? {
        hits.push(if opts.add_path {
            annotate(zctx, rec, chunk)?
        } else {
            rec
        });
    }
    Ok(hits)
}

/// Walk the archive and send every hit to `out` in archive order.
pub async fn find(
    archive: &Archive,
    zctx: Arc<TypeContext>,
    query: &IndexQuery,
    opts: &FindOptions,
    out: &mpsc::Sender<Record>,
    cancel: &CancellationToken,
) -> ZarResult<()> {
    archive.update_check()?;
    let data_root = archive.data_root();
    for chunk in archive.chunks()? {
        if cancel.is_cancelled() {
            return Err(ZarError::Canceled);
        }
        let hits = find_chunk(&zctx, data_root, &chunk, query, opts)
            .map_err(|e| e.in_source(chunk.log_id.to_string()))?;
        for hit in hits {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ZarError::Canceled),
                sent = out.send(hit) => sent.map_err(|_| ZarError::Canceled)?,
            }
        }
    }
    Ok(())
}

/// Streams find results produced by a background task. Dropping or closing
/// the reader cancels the search.
pub struct FindReader {
    rx: mpsc::Receiver<Record>,
    handle: Option<JoinHandle<ZarResult<()>>>,
    cancel: CancellationToken,
}

impl FindReader {
    pub fn spawn(
        archive: Arc<Archive>,
        zctx: Arc<TypeContext>,
        query: IndexQuery,
        opts: FindOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(FIND_CHANNEL_CAPACITY);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            find(&archive, zctx, &query, &opts, &tx, &task_cancel).await
        });
        Self {
            rx,
            handle: Some(handle),
            cancel,
        }
    }

    /// Next hit, or `None` once the search completed. Errors from the search
    /// surface after the hits sent before them.
    pub async fn read(&mut self) -> ZarResult<Option<Record>> {
        if let Some(rec) = self.rx.recv().await {
            return Ok(Some(rec));
        }
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result.map(|_| None),
                Err(e) => Err(ZarError::Task(e.to_string())),
            },
            None => Ok(None),
        }
    }

    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }
}

impl Drop for FindReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Collect every hit.
pub async fn find_all(
    archive: Arc<Archive>,
    zctx: Arc<TypeContext>,
    query: IndexQuery,
    opts: FindOptions,
) -> ZarResult<Vec<Record>> {
    let mut reader = FindReader::spawn(archive, zctx, query, opts, CancellationToken::new());
    let mut hits = Vec::new();
    while let Some(rec) = reader.read().await? {
        hits.push(rec);
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::indexer::{index_archive, IndexOptions};
    use crate::archive::testutil::sample_archive;
    use tempfile::tempdir;

    fn indexed_archive(root: &Path, zctx: &Arc<TypeContext>) -> Arc<Archive> {
        let archive = sample_archive(root, zctx);
        index_archive(
            &archive,
            zctx.clone(),
            &[Rule::parse(zctx, ":int64").unwrap()],
            &IndexOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .unwrap();
        Arc::new(archive)
    }

    #[test]
    fn test_query_parse() {
        let zctx = TypeContext::new();
        let q = IndexQuery::parse(&zctx, ":int64=336").unwrap();
        assert_eq!(q, IndexQuery::new("idx:type:int64", vec!["336".into()]));
        let q = IndexQuery::parse(&zctx, "id.orig_h=10.0.0.1").unwrap();
        assert_eq!(q.index, "idx:field:id.orig_h");
        assert!(IndexQuery::parse(&zctx, ":int64").is_err());
        assert!(IndexQuery::parse(&zctx, "v=").is_err());
    }

    #[tokio::test]
    async fn test_find_one_row_per_chunk() {
        let dir = tempdir().unwrap();
        let zctx = Arc::new(TypeContext::new());
        let archive = indexed_archive(dir.path(), &zctx);
        let chunks = archive.chunks().unwrap();

        let query = IndexQuery::parse(&zctx, ":int64=336").unwrap();
        let hits = find_all(archive.clone(), zctx.clone(), query, FindOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        for (hit, chunk) in hits.iter().zip(&chunks) {
            assert_eq!(hit.int("key"), Some(336));
            assert_eq!(hit.uint("count"), Some(1));
            assert_eq!(hit.string(LOG_FIELD), Some(chunk.log_id.as_str()));
            assert_eq!(hit.time(FIRST_FIELD), Some(chunk.first));
            assert_eq!(hit.time(LAST_FIELD), Some(chunk.last));
        }
        let (log_ty, _) = hits[0].field(LOG_FIELD).unwrap();
        assert_eq!(log_ty.to_string(), LOG_ALIAS);
    }

    #[tokio::test]
    async fn test_find_with_log_filter() {
        let dir = tempdir().unwrap();
        let zctx = Arc::new(TypeContext::new());
        let archive = indexed_archive(dir.path(), &zctx);
        let target = archive.chunks().unwrap()[1].log_id.clone();

        let filtered = Arc::new(Archive::open_with_filter(dir.path(), &[target.clone()]).unwrap());
        let query = IndexQuery::parse(&zctx, ":int64=336").unwrap();
        let hits = find_all(filtered, zctx.clone(), query, FindOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].string(LOG_FIELD), Some(target.as_str()));
    }

    #[tokio::test]
    async fn test_missing_index() {
        let dir = tempdir().unwrap();
        let zctx = Arc::new(TypeContext::new());
        let archive = indexed_archive(dir.path(), &zctx);
        let query = IndexQuery::parse(&zctx, "msg=x").unwrap();

        let hits = find_all(archive.clone(), zctx.clone(), query.clone(), FindOptions::default())
            .await
            .unwrap();
        assert!(hits.is_empty());

        let strict = FindOptions {
            skip_missing: false,
            add_path: false,
        };
        let err = find_all(archive, zctx, query, strict).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_no_hit_and_no_annotation() {
        let dir = tempdir().unwrap();
        let zctx = Arc::new(TypeContext::new());
        let archive = indexed_archive(dir.path(), &zctx);
        let opts = FindOptions {
            skip_missing: true,
            add_path: false,
        };
        let hits = find_all(
            archive.clone(),
            zctx.clone(),
            IndexQuery::parse(&zctx, ":int64=7").unwrap(),
            opts,
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(!hits[0].has_field(LOG_FIELD));

        let none = find_all(
            archive,
            zctx.clone(),
            IndexQuery::parse(&zctx, ":int64=12345").unwrap(),
            opts,
        )
        .await
        .unwrap();
        assert!(none.is_empty());
    }
}
