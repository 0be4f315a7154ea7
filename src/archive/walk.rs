//! Day-partitioned traversal of an archive
//!
//! Chunks are grouped by their day directory, days are visited in archive
//! direction, and the overlap merger runs within each day.

use crate::archive::chunk::Chunk;
use crate::archive::metadata::Archive;
use crate::archive::overlap::{merge_chunks, SpanInfo};
use crate::error::ZarResult;
use crate::span::{day_dir_name, Direction, Span};
use std::collections::BTreeMap;

fn day_key(chunk: &Chunk) -> String {
    chunk
        .log_id
        .components()
        .map(|(day, _, _)| day.to_string())
        .unwrap_or_else(|| day_dir_name(chunk.first))
}

/// Group chunks overlapping `filter` by day, in `dir` order.
pub fn chunks_by_day(chunks: &[Chunk], filter: Span, dir: Direction) -> Vec<(String, Vec<Chunk>)> {
    let mut days: BTreeMap<String, Vec<Chunk>> = BTreeMap::new();
    for chunk in chunks.iter().filter(|c| c.span().overlaps(&filter)) {
        days.entry(day_key(chunk)).or_default().push(chunk.clone());
    }
    let mut out: Vec<(String, Vec<Chunk>)> = days.into_iter().collect();
    if dir.is_reverse() {
        out.reverse();
    }
    out
}

/// All span partitions of `chunks` intersecting `filter`, in `dir` order.
pub fn span_infos(chunks: &[Chunk], filter: Span, dir: Direction) -> Vec<SpanInfo> {
    chunks_by_day(chunks, filter, dir)
        .into_iter()
        .flat_map(|(day, chunks)| {
            let infos = merge_chunks(&chunks, filter, dir);
            tracing::debug!("Day {}: {} chunks, {} spans", day, chunks.len(), infos.len());
            infos
        })
        .collect()
}

impl Archive {
    /// Chunks overlapping `filter` in archive order.
    pub fn chunk_walk(&self, filter: Span) -> ZarResult<Vec<Chunk>> {
        self.update_check()?;
        Ok(self
            .chunks()?
            .into_iter()
            .filter(|c| c.span().overlaps(&filter))
            .collect())
    }

    /// Span partitions intersecting `filter` in archive order.
    pub fn span_walk(&self, filter: Span) -> ZarResult<Vec<SpanInfo>> {
        self.update_check()?;
        Ok(span_infos(&self.chunks()?, filter, self.direction()))
    }
}
