//! Micro-index files
//!
//! A micro-index is an immutable, self-contained file of key-sorted records
//! with a constant-depth B-tree built in one sequential pass.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ BASE                                    │
//! │   key-sorted records, framed by EOS     │
//! ├─────────────────────────────────────────┤
//! │ ROOT SECTION (level n)                  │
//! │   (keys..., _child) per level n-1 frame │
//! ├─────────────────────────────────────────┤
//! │ ...                                     │
//! ├─────────────────────────────────────────┤
//! │ LEVEL 1 SECTION                         │
//! │   (keys..., _child) per base frame      │
//! ├─────────────────────────────────────────┤
//! │ TRAILER                                 │
//! │   magic, version, descending,           │
//! │   child_field, frame_thresh,            │
//! │   sections: [base, root, ..., level 1], │
//! │   keys: record[...]                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Every frame starts at a sync point, and the key promoted for a frame is
//! that frame's first key.

pub mod finder;
pub mod reader;
pub mod trailer;
pub mod writer;

pub use finder::{Finder, FinderReader, KeyCompare};
pub use reader::{Reader, SectionReader};
pub use trailer::{Trailer, CHILD_FIELD, MAGIC, TRAILER_MAX_SIZE, VERSION};
pub use writer::{Writer, DEFAULT_FRAME_THRESH, FRAME_MAX_SIZE, MAX_LEVELS};
