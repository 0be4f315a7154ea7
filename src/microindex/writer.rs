//! Single-pass micro-index writer
//!
//! Records arrive already sorted by key. The base level streams them into the
//! destination file, ending a frame (EOS) whenever the bytes written since the
//! previous sync point reach the frame threshold. Each finished frame promotes
//! its first key and start offset to a parent level, which is itself framed
//! the same way and may promote to a grandparent, up to `MAX_LEVELS`.
//!
//! Parent levels are written to temporary files beside the destination. On
//! close they are appended to the base file from the root down and the
//! trailer is written last.

use crate::error::{ZarError, ZarResult};
use crate::microindex::trailer::{unique_child_field, Trailer};
use crate::record::{Column, Record, Type, TypeContext, Value, Writer as StreamWriter};
use crate::span::Direction;
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default frame threshold in bytes
pub const DEFAULT_FRAME_THRESH: usize = 32 * 1024;

/// Largest allowed frame threshold
pub const FRAME_MAX_SIZE: usize = 20 * 1024 * 1024;

/// Maximum depth of the index tree, base level included
pub const MAX_LEVELS: usize = 6;

struct Level {
    writer: StreamWriter<BufWriter<File>>,
    path: PathBuf,
    frame_start: u64,
    frame_key: Option<Vec<Value>>,
}

impl Level {
    fn create(path: PathBuf) -> ZarResult<Self> {
        let file = File::create(&path).map_err(|e| ZarError::io(&path, e))?;
        Ok(Self {
            writer: StreamWriter::new(BufWriter::new(file)),
            path,
            frame_start: 0,
            frame_key: None,
        })
    }
}

/// Builds a micro-index file from key-sorted records.
pub struct Writer {
    zctx: Arc<TypeContext>,
    path: PathBuf,
    keys: Vec<String>,
    frame_thresh: usize,
    direction: Direction,
    levels: Vec<Level>,
    key_type: Option<Type>,
    parent_type: Option<Type>,
    child_field: String,
    last_key: Option<Vec<Value>>,
    tmp_prefix: String,
    records: u64,
}

impl Writer {
    /// Start a writer for `path` keyed on the given field paths.
    pub fn new(zctx: Arc<TypeContext>, path: impl AsRef<Path>, keys: Vec<String>) -> Self {
        let path = path.as_ref().to_path_buf();
        let child_field = unique_child_field(&keys);
        let tmp_prefix = format!(
            "{}.{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            zctx,
            path,
            keys,
            frame_thresh: DEFAULT_FRAME_THRESH,
            direction: Direction::Forward,
            levels: Vec::new(),
            key_type: None,
            parent_type: None,
            child_field,
            last_key: None,
            tmp_prefix,
            records: 0,
        }
    }

    pub fn frame_thresh(mut self, bytes: usize) -> Self {
        self.frame_thresh = bytes;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written to the base level so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    fn extract_key(&self, rec: &Record) -> ZarResult<Vec<(Type, Value)>> {
        self.keys
            .iter()
            .map(|name| {
                rec.field(name)
                    .map(|(ty, v)| (ty.clone(), v.clone()))
                    .ok_or_else(|| {
                        ZarError::Validation(format!(
                            "{}: key field \"{}\" missing from record",
                            self.path.display(),
                            name
                        ))
                    })
            })
            .collect()
    }

    fn open(&mut self, key: &[(Type, Value)]) -> ZarResult<()> {
        if self.keys.is_empty() {
            return Err(ZarError::Validation("micro-index needs at least one key".into()));
        }
        if self.frame_thresh == 0 || self.frame_thresh > FRAME_MAX_SIZE {
            return Err(ZarError::Validation(format!(
                "frame threshold {} outside 1..={}",
                self.frame_thresh, FRAME_MAX_SIZE
            )));
        }
        let mut cols = Vec::with_capacity(key.len());
        for (name, (ty, _)) in self.keys.iter().zip(key) {
            if !ty.is_primitive() {
                return Err(ZarError::Validation(format!(
                    "key field \"{}\" has non-primitive type {}",
                    name, ty
                )));
            }
            cols.push(Column::new(name.clone(), ty.clone()));
        }
        let key_type = self.zctx.lookup_record(cols.clone())?;
        cols.push(Column::new(self.child_field.clone(), Type::Int64));
        self.parent_type = Some(self.zctx.lookup_record(cols)?);
        self.key_type = Some(key_type);
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| ZarError::io(dir, e))?;
        }
        self.levels.push(Level::create(self.path.clone())?);
        Ok(())
    }

    fn compare_keys(&self, a: &[Value], b: &[Value]) -> Ordering {
        for (x, y) in a.iter().zip(b) {
            let ord = x.compare(y);
            if ord != Ordering::Equal {
                return self.direction.apply(ord);
            }
        }
        Ordering::Equal
    }

    /// Append a record. Records must arrive in key order.
    pub fn write(&mut self, rec: &Record) -> ZarResult<()> {
        let typed_key = self.extract_key(rec)?;
        if self.levels.is_empty() {
            self.open(&typed_key)?;
        } else if let Some(cols) = self.key_type.as_ref().and_then(|t| t.columns()) {
            for (col, (ty, _)) in cols.iter().zip(&typed_key) {
                if col.ty != *ty && *ty != Type::Null {
                    return Err(ZarError::TypeMismatch(format!(
                        "key field \"{}\" is {} but earlier records had {}",
                        col.name, ty, col.ty
                    )));
                }
            }
        }
        let key: Vec<Value> = typed_key.into_iter().map(|(_, v)| v).collect();
        if let Some(prev) = &self.last_key {
            if self.compare_keys(prev, &key) == Ordering::Greater {
                return Err(ZarError::Validation(format!(
                    "{}: records out of key order",
                    self.path.display()
                )));
            }
        }
        self.write_level(0, rec, key.clone())?;
        self.last_key = Some(key);
        self.records += 1;
        Ok(())
    }

    fn write_level(&mut self, level: usize, rec: &Record, key: Vec<Value>) -> ZarResult<()> {
        let thresh = self.frame_thresh as u64;
        let lvl = &mut self.levels[level];
        if lvl.frame_key.is_some() && lvl.writer.position() - lvl.frame_start >= thresh {
            let frame_key = lvl.frame_key.take().unwrap_or_default();
            let frame_start = lvl.frame_start;
            lvl.writer.end_stream()?;
            lvl.frame_start = lvl.writer.position();
            self.add_to_parent(level, frame_key, frame_start)?;
        }
        let lvl = &mut self.levels[level];
        if lvl.frame_key.is_none() {
            lvl.frame_key = Some(key);
        }
        lvl.writer.write(rec)
    }

    fn add_to_parent(&mut self, level: usize, key: Vec<Value>, offset: u64) -> ZarResult<()> {
        let parent = level + 1;
        if parent >= self.levels.len() {
            if parent >= MAX_LEVELS {
                return Err(ZarError::Validation(format!(
                    "{}: too many index levels",
                    self.path.display()
                )));
            }
            let tmp = self.tmp_path(parent);
            debug!(path = %tmp.display(), level = parent, "adding micro-index level");
            self.levels.push(Level::create(tmp)?);
        }
        let parent_type = self
            .parent_type
            .clone()
            .ok_or_else(|| ZarError::Validation("parent type not initialized".into()))?;
        let mut values = key.clone();
        values.push(Value::Int(offset as i64));
        let rec = Record::new(parent_type, values)?;
        self.write_level(parent, &rec, key)
    }

    fn tmp_path(&self, level: usize) -> PathBuf {
        let name = format!("{}.{}.tmp", self.tmp_prefix, level);
        match self.path.parent() {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Finish the index: close every level, append the parent sections to the
    /// base file and write the trailer. On failure all output is removed.
    pub fn close(mut self) -> ZarResult<()> {
        let result = self.finalize();
        if result.is_err() {
            self.remove_files(true);
        }
        result
    }

    /// Discard everything written so far.
    pub fn abort(mut self) {
        self.remove_files(true);
    }

    fn finalize(&mut self) -> ZarResult<()> {
        if self.levels.is_empty() {
            return self.write_empty();
        }
        let mut levels = std::mem::take(&mut self.levels);
        for lvl in levels.iter_mut() {
            if lvl.writer.position() > lvl.frame_start {
                lvl.writer.end_stream()?;
            }
            lvl.writer.flush()?;
        }
        let mut base = levels.remove(0);
        let mut sections = vec![base.writer.position() as i64];
        // parents in file order: root first
        while let Some(parent) = levels.pop() {
            let Level { writer, path, .. } = parent;
            drop(writer.into_inner()?);
            let file = File::open(&path).map_err(|e| ZarError::io(&path, e))?;
            let n = base.writer.append_raw(&mut BufReader::new(file))?;
            sections.push(n as i64);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove temporary level file");
            }
        }
        let key_type = self
            .key_type
            .clone()
            .ok_or_else(|| ZarError::Validation("key type not initialized".into()))?;
        let trailer = Trailer::new(
            key_type,
            self.child_field.clone(),
            self.frame_thresh,
            self.direction,
            sections,
        );
        base.writer.write(&trailer.to_record(&self.zctx)?)?;
        let out = base.writer.into_inner()?;
        let file = out
            .into_inner()
            .map_err(|e| ZarError::io(&self.path, e.into_error()))?;
        file.sync_all().map_err(|e| ZarError::io(&self.path, e))?;
        debug!(
            path = %self.path.display(),
            records = self.records,
            sections = trailer.sections.len(),
            "micro-index written"
        );
        Ok(())
    }

    fn write_empty(&mut self) -> ZarResult<()> {
        let cols = self
            .keys
            .iter()
            .map(|k| Column::new(k.clone(), Type::Null))
            .collect();
        let key_type = self.zctx.lookup_record(cols)?;
        let trailer = Trailer::new(
            key_type,
            self.child_field.clone(),
            self.frame_thresh,
            self.direction,
            Vec::new(),
        );
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| ZarError::io(dir, e))?;
        }
        let file = File::create(&self.path).map_err(|e| ZarError::io(&self.path, e))?;
        let mut w = StreamWriter::new(BufWriter::new(file));
        w.write(&trailer.to_record(&self.zctx)?)?;
        w.into_inner()?
            .into_inner()
            .map_err(|e| ZarError::io(&self.path, e.into_error()))?
            .sync_all()
            .map_err(|e| ZarError::io(&self.path, e))?;
        Ok(())
    }

    fn remove_files(&mut self, destination: bool) {
        for (i, lvl) in self.levels.drain(..).enumerate() {
            if i > 0 {
                let _ = fs::remove_file(&lvl.path);
            }
        }
        for level in 1..MAX_LEVELS {
            let _ = fs::remove_file(self.tmp_path(level));
        }
        if destination {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.levels.is_empty() {
            self.remove_files(false);
        }
    }
}
