//! # Zar
//!
//! A time-partitioned, append-oriented log archive. Records are written into
//! immutable chunk files grouped by UTC day, sorted by `ts` in the archive's
//! direction. Each chunk can carry sorted micro-indexes for fast key lookup,
//! and scans fan out over disjoint time spans with a pool of workers while
//! still producing globally ordered output.
//!
//! ## Modules
//!
//! - [`record`]: typed records and the binary stream codec
//! - [`microindex`]: sorted, hierarchically sectioned key indexes
//! - [`archive`]: metadata, import, indexing and find
//! - [`scan`]: single-chunk scanners and the k-way combiner
//! - [`driver`]: multi-source parallel scanning
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use zar::archive::{Archive, ArchiveSource, CreateOptions};
//! use zar::driver::ParallelGroup;
//! use zar::record::TypeContext;
//! use zar::scan::SourceFilter;
//! use zar::span::Span;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let archive = Arc::new(Archive::open("/var/lib/zar/logs")?);
//!     let zctx = Arc::new(TypeContext::new());
//!
//!     let source = ArchiveSource::new(archive, zctx);
//!     let mut group = ParallelGroup::new(
//!         Arc::new(source),
//!         SourceFilter::new(Span::all()),
//!         4,
//!         CancellationToken::new(),
//!     );
//!     while let Some(batch) = group.pull().await? {
//!         for rec in batch.records() {
//!             println!("{}", rec);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod driver;
pub mod error;
pub mod microindex;
pub mod proc;
pub mod record;
pub mod scan;
pub mod span;

pub use archive::{
    Archive, ArchiveSource, Chunk, CreateOptions, FindOptions, ImportOptions, IndexOptions,
    IndexQuery, LogId, Rule,
};
pub use config::{Config, ConfigError};
pub use driver::{MultiSource, ParallelGroup};
pub use error::{ZarError, ZarResult};
pub use record::{Record, Type, TypeContext, Value};
pub use scan::{Batch, Scanner, SourceFilter};
pub use span::{Direction, Span, Ts};
