//! Per-chunk seek index
//!
//! A micro-index keyed on `ts` whose rows carry the byte `offset` of the sync
//! point where a stream starting with that timestamp begins. It is written
//! after its chunk is complete, so a seek index older than its chunk is stale
//! and ignored.

use crate::archive::chunk::Chunk;
use crate::error::{ZarError, ZarResult};
use crate::microindex::{self, Finder};
use crate::record::{Column, Record, Type, TypeContext, Value, TS_FIELD};
use crate::span::{Direction, Ts};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const OFFSET_FIELD: &str = "offset";

/// A stream boundary: first timestamp of the stream and its sync offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekEntry {
    pub ts: Ts,
    pub offset: u64,
}

/// Write the seek index for a freshly written chunk.
pub fn write_seek_index(
    zctx: Arc<TypeContext>,
    path: &Path,
    entries: &[SeekEntry],
    direction: Direction,
    frame_thresh: usize,
) -> ZarResult<()> {
    let ty = zctx.lookup_record(vec![
        Column::new(TS_FIELD, Type::Time),
        Column::new(OFFSET_FIELD, Type::Int64),
    ])?;
    let mut writer = microindex::Writer::new(zctx, path, vec![TS_FIELD.to_string()])
        .direction(direction)
        .frame_thresh(frame_thresh);
    for entry in entries {
        let rec = Record::new(
            ty.clone(),
            vec![Value::Time(entry.ts), Value::Int(entry.offset as i64)],
        )?;
        if let Err(e) = writer.write(&rec) {
            writer.abort();
            return Err(e);
        }
    }
    writer.close()
}

fn is_stale(chunk_path: &Path, seek_path: &Path) -> ZarResult<bool> {
    let chunk_mtime = fs::metadata(chunk_path)
        .and_then(|m| m.modified())
        .map_err(|e| ZarError::io(chunk_path, e))?;
    let seek_mtime = fs::metadata(seek_path)
        .and_then(|m| m.modified())
        .map_err(|e| ZarError::io(seek_path, e))?;
    Ok(seek_mtime < chunk_mtime)
}

/// The stream boundary at or before `probe` in `direction`, if the chunk has
/// a usable seek index.
pub fn lookup_seek(
    zctx: Arc<TypeContext>,
    data_root: &Path,
    chunk: &Chunk,
    probe: Ts,
) -> ZarResult<Option<SeekEntry>> {
    let seek_path = chunk.seek_path(data_root);
    if !seek_path.exists() {
        return Ok(None);
    }
    if is_stale(&chunk.path(data_root), &seek_path)? {
        tracing::warn!("Ignoring stale seek index {:?}", seek_path);
        return Ok(None);
    }
    let mut finder = Finder::open(zctx, &seek_path)?;
    let Some(rec) = finder.closest_lte(&[Value::Time(probe)])? else {
        return Ok(None);
    };
    match (rec.time(TS_FIELD), rec.int(OFFSET_FIELD)) {
        (Some(ts), Some(offset)) if offset >= 0 => Ok(Some(SeekEntry {
            ts,
            offset: offset as u64,
        })),
        _ => Err(ZarError::Corrupt(format!(
            "{}: malformed seek entry {}",
            seek_path.display(),
            rec
        ))),
    }
}
