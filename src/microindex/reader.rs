//! Micro-index reader
//!
//! Opens a micro-index file, locates its trailer and presents each section
//! (the base records or one B-tree level) as an independent record stream.

use crate::error::{ZarError, ZarResult};
use crate::microindex::trailer::{read_trailer, Trailer};
use crate::record::{Reader as StreamReader, TypeContext};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Record stream over one section of a micro-index file
pub type SectionReader<'a> = StreamReader<Take<BufReader<&'a File>>>;

pub struct Reader {
    zctx: Arc<TypeContext>,
    path: PathBuf,
    file: File,
    trailer: Trailer,
    trailer_offset: u64,
    ranges: Vec<(u64, u64)>,
}

impl Reader {
    pub fn open(zctx: Arc<TypeContext>, path: impl AsRef<Path>) -> ZarResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ZarError::NotFound(path.display().to_string())
            } else {
                ZarError::io(&path, e)
            }
        })?;
        let (trailer, trailer_offset) = read_trailer(&zctx, &file, &path)?;

        let mut ranges = Vec::with_capacity(trailer.sections.len());
        let mut start = 0u64;
        for &len in &trailer.sections {
            if len < 0 {
                return Err(ZarError::Corrupt(format!(
                    "{}: negative section size",
                    path.display()
                )));
            }
            ranges.push((start, start + len as u64));
            start += len as u64;
        }
        if start > trailer_offset {
            return Err(ZarError::Corrupt(format!(
                "{}: sections overrun trailer",
                path.display()
            )));
        }
        Ok(Self {
            zctx,
            path,
            file,
            trailer,
            trailer_offset,
            ranges,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    pub fn context(&self) -> &Arc<TypeContext> {
        &self.zctx
    }

    /// True for an index written with no records.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of sections including the base.
    pub fn section_count(&self) -> usize {
        self.ranges.len()
    }

    /// Byte range `[start, end)` of a section.
    pub fn section_range(&self, section: usize) -> ZarResult<(u64, u64)> {
        self.ranges.get(section).copied().ok_or_else(|| {
            ZarError::NotFound(format!("{}: no section {}", self.path.display(), section))
        })
    }

    /// Offset of the trailer record.
    pub fn trailer_offset(&self) -> u64 {
        self.trailer_offset
    }

    /// Stream the records of `section` starting at `offset`, which must be a
    /// sync point relative to the section start. Positions reported by the
    /// returned reader are section-relative.
    pub fn section_reader(&self, section: usize, offset: u64) -> ZarResult<SectionReader<'_>> {
        let (start, end) = self.section_range(section)?;
        if start + offset > end {
            return Err(ZarError::Corrupt(format!(
                "{}: offset {} beyond section {}",
                self.path.display(),
                offset,
                section
            )));
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(start + offset))
            .map_err(|e| ZarError::io(&self.path, e))?;
        let input = BufReader::new(file).take(end - start - offset);
        Ok(StreamReader::new(input, self.zctx.clone()).with_offset(offset))
    }

    /// Stream the base records from the start.
    pub fn base_reader(&self) -> ZarResult<SectionReader<'_>> {
        self.section_reader(0, 0)
    }
}
