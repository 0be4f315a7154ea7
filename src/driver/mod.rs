//! Multi-source scan driver
//!
//! ```text
//! MultiSource::send_sources ──openers──▶ [bounded channel]
//!                                            │
//!              ┌──────────────┬──────────────┼──────────────┐
//!              ▼              ▼              ▼              ▼
//!           worker 0       worker 1       worker 2  …   worker P-1
//!              └──────────────┴──── merge ───┴──────────────┘
//!                          (ordered by sort field, or as ready)
//! ```
//!
//! - **parallel**: the worker pool and its lazily started dispatcher
//! - **merge**: ordered and unordered merging of worker outputs

pub mod merge;
pub mod parallel;

pub use merge::{compare_ordered, OrderedMerge};
pub use parallel::{ParallelGroup, DEFAULT_PARALLELISM};

use crate::error::ZarResult;
use crate::scan::{Scanner, SourceFilter};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opens one source when invoked. `None` means the source is empty.
pub type SourceOpener =
    Box<dyn FnOnce() -> BoxFuture<'static, ZarResult<Option<Box<dyn Scanner>>>> + Send>;

/// Field the sources are sorted on and whether the order is descending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderInfo {
    pub field: String,
    pub reversed: bool,
}

/// A set of record sources enumerated lazily as openers
#[async_trait]
pub trait MultiSource: Send + Sync {
    /// Sort order shared by all sources, if any. When defined, openers are
    /// sent in that order and each source yields records in that order.
    fn order_info(&self) -> Option<OrderInfo>;

    /// Send one opener per source to `out`, stopping early on cancellation.
    async fn send_sources(
        &self,
        cancel: CancellationToken,
        filter: SourceFilter,
        out: mpsc::Sender<SourceOpener>,
    ) -> ZarResult<()>;
}
