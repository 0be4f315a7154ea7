//! Time-partitioned log archive
//!
//! ```text
//! <root>/
//! ├── zar.json                         metadata: version, direction, spans, indexes
//! └── <data>/
//!     └── 20200422/                    one directory per UTC day
//!         ├── 1587517405066655910-<id>.rec     chunk, sorted in archive direction
//!         ├── 1587517405066655910-<id>.seek    ts → offset micro-index
//!         └── 1587517405066655910-<id>.zar/
//!             └── idx:type:int64               per-chunk micro-indexes
//! ```
//!
//! - **metadata**: loading, creating and updating `zar.json`
//! - **chunk**: log ids and chunk descriptors
//! - **overlap**: partitioning overlapping chunks into disjoint spans
//! - **walk**: day-ordered traversal
//! - **import**: writing records into chunks
//! - **seek**: per-chunk seek indexes
//! - **indexer**: building micro-indexes for every chunk
//! - **find**: probing micro-indexes across the archive
//! - **source**: the archive as a parallel scan source

pub mod chunk;
pub mod find;
pub mod import;
pub mod indexer;
pub mod metadata;
pub mod overlap;
pub mod seek;
pub mod source;
pub mod walk;

#[cfg(test)]
pub(crate) mod testutil;

pub use chunk::{Chunk, LogId};
pub use find::{find, find_all, FindOptions, FindReader, IndexQuery};
pub use import::{import, ChunkImporter, ImportOptions, ImportStats};
pub use indexer::{index_archive, index_chunk, IndexOptions, IndexStats, Rule};
pub use metadata::{Archive, CreateOptions, IndexInfo};
pub use overlap::{merge_chunks, SpanInfo};
pub use source::ArchiveSource;
