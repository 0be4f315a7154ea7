//! Archive metadata
//!
//! The archive descriptor lives in `<root>/zar.json` and is the
//! synchronization point between processes. Every write goes to a temp file
//! in the root and is renamed over the old descriptor, so readers see either
//! the previous or the next version. In-process access is guarded by a
//! reader-writer lock around the cached view.
//!
//! ```text
//! { "version": 1,
//!   "data_path": ".",
//!   "log_size_threshold": 524288000,
//!   "data_sort_direction": "descending",
//!   "spans": [ { "span": {"ts":..,"dur":..}, "log_id": "20200422/<ts>-<id>.rec" } ],
//!   "indexes": { "idx:type:int64": {"type": "type", "path": "idx:type:int64"} } }
//! ```

use crate::archive::chunk::{Chunk, LogId, SpanEntry};
use crate::error::{ZarError, ZarResult};
use crate::span::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

pub const METADATA_FILE: &str = "zar.json";
pub const METADATA_VERSION: i64 = 1;

/// Default chunk split target: 500 MiB
pub const DEFAULT_LOG_SIZE_THRESHOLD: i64 = 500 * 1024 * 1024;

/// `data_path` value meaning "the archive root itself"
pub const SELF_RELATIVE: &str = ".";

const LOAD_ATTEMPTS: usize = 3;
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(20);

/// A kind of micro-index attached to every chunk of the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Rule kind (`type` or `field`)
    #[serde(rename = "type")]
    pub kind: String,
    /// File name within each chunk's zar directory
    pub path: String,
}

impl IndexInfo {
    pub fn new(kind: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    version: i64,
    data_path: String,
    log_size_threshold: i64,
    data_sort_direction: Direction,
    #[serde(default)]
    spans: Vec<SpanEntry>,
    #[serde(default)]
    indexes: BTreeMap<String, IndexInfo>,
}

/// Options for [`Archive::create`]
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub log_size_threshold: i64,
    pub direction: Direction,
    pub data_path: String,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            log_size_threshold: DEFAULT_LOG_SIZE_THRESHOLD,
            direction: Direction::Reverse,
            data_path: SELF_RELATIVE.to_string(),
        }
    }
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_size_threshold(mut self, bytes: i64) -> Self {
        self.log_size_threshold = bytes;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn data_path(mut self, path: impl Into<String>) -> Self {
        self.data_path = path.into();
        self
    }
}

/// Identity of the metadata file on disk. Any difference means another
/// writer replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    inode: u64,
}

impl FileStamp {
    fn of(path: &Path) -> ZarResult<Self> {
        let md = fs::metadata(path).map_err(|e| ZarError::io(path, e))?;
        #[cfg(unix)]
        let inode = std::os::unix::fs::MetadataExt::ino(&md);
        #[cfg(not(unix))]
        let inode = 0;
        Ok(Self {
            modified: md.modified().ok(),
            len: md.len(),
            inode,
        })
    }
}

#[derive(Debug)]
struct ArchiveState {
    chunks: Vec<Chunk>,
    indexes: BTreeMap<String, IndexInfo>,
    stamp: Option<FileStamp>,
    update_count: u64,
}

/// An open archive
#[derive(Debug)]
pub struct Archive {
    root: PathBuf,
    data_root: PathBuf,
    data_path: String,
    direction: Direction,
    log_size_threshold: i64,
    log_filter: Option<HashSet<LogId>>,
    state: RwLock<ArchiveState>,
}

fn resolve_data_path(root: &Path, data_path: &str) -> PathBuf {
    if data_path.is_empty() || data_path == SELF_RELATIVE {
        return root.to_path_buf();
    }
    let path = Path::new(data_path.strip_prefix("file://").unwrap_or(data_path));
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn metadata_path(root: &Path) -> PathBuf {
    root.join(METADATA_FILE)
}

/// Write `md` to a fresh temp file in `root` and return its path.
fn write_temp(root: &Path, md: &Metadata) -> ZarResult<PathBuf> {
    let tmp = root.join(format!(
        ".{}.{}.tmp",
        METADATA_FILE,
        uuid::Uuid::new_v4().simple()
    ));
    let content = serde_json::to_vec_pretty(md)?;
    let mut file = File::create(&tmp).map_err(|e| ZarError::io(&tmp, e))?;
    file.write_all(&content)
        .and_then(|_| file.sync_all())
        .map_err(|e| {
            let _ = fs::remove_file(&tmp);
            ZarError::io(&tmp, e)
        })?;
    Ok(tmp)
}

/// Read and parse the metadata file, retrying reads that fail to parse in
/// case they raced a concurrent replacement.
fn load(root: &Path) -> ZarResult<(Metadata, FileStamp)> {
    let path = metadata_path(root);
    let mut last_err = String::new();
    for attempt in 0..LOAD_ATTEMPTS {
        if attempt > 0 {
            std::thread::sleep(LOAD_RETRY_DELAY);
        }
        let stamp = match FileStamp::of(&path) {
            Ok(stamp) => stamp,
            Err(e) if e.is_not_found() => {
                return Err(ZarError::NotAnArchive(root.display().to_string()))
            }
            Err(e) => return Err(e),
        };
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ZarError::NotAnArchive(root.display().to_string()))
            }
            Err(e) => return Err(ZarError::io(&path, e)),
        };
        match serde_json::from_slice::<Metadata>(&content) {
            Ok(md) => {
                if md.version != METADATA_VERSION {
                    return Err(ZarError::VersionMismatch {
                        what: path.display().to_string(),
                        found: md.version,
                        expected: METADATA_VERSION,
                    });
                }
                return Ok((md, stamp));
            }
            Err(e) => {
                tracing::debug!("Metadata read attempt {} failed: {}", attempt + 1, e);
                last_err = e.to_string();
            }
        }
    }
    tracing::warn!("Giving up on {:?}: {}", path, last_err);
    Err(ZarError::NotAnArchive(root.display().to_string()))
}

impl Archive {
    /// Create a new archive at `root`. Fails with `Conflict` if one exists.
    pub fn create(root: impl AsRef<Path>, opts: CreateOptions) -> ZarResult<Self> {
        let root = root.as_ref();
        if opts.log_size_threshold <= 0 {
            return Err(ZarError::Validation(format!(
                "log size threshold must be positive: {}",
                opts.log_size_threshold
            )));
        }
        fs::create_dir_all(root).map_err(|e| ZarError::io(root, e))?;
        let path = metadata_path(root);
        if path.exists() {
            return Err(ZarError::Conflict(format!(
                "archive already exists at {}",
                root.display()
            )));
        }

        let md = Metadata {
            version: METADATA_VERSION,
            data_path: opts.data_path.clone(),
            log_size_threshold: opts.log_size_threshold,
            data_sort_direction: opts.direction,
            spans: Vec::new(),
            indexes: BTreeMap::new(),
        };
        let tmp = write_temp(root, &md)?;
        // hard_link refuses to replace an existing file, which makes
        // creation atomic against a concurrent create.
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ZarError::Conflict(format!(
                    "archive already exists at {}",
                    root.display()
                )))
            }
            Err(e) => return Err(ZarError::io(&path, e)),
        }

        let data_root = resolve_data_path(root, &opts.data_path);
        fs::create_dir_all(&data_root).map_err(|e| ZarError::io(&data_root, e))?;
        tracing::info!(
            "Created archive at {:?} ({}, threshold {} bytes)",
            root,
            opts.direction,
            opts.log_size_threshold
        );
        Self::open(root)
    }

    pub fn open(root: impl AsRef<Path>) -> ZarResult<Self> {
        Self::open_with_filter(root, &[])
    }

    /// Open an archive, optionally restricted to the chunks named in
    /// `log_filter`. A filtered archive is frozen: it rejects new chunks and
    /// never reloads its metadata.
    pub fn open_with_filter(root: impl AsRef<Path>, log_filter: &[LogId]) -> ZarResult<Self> {
        let root = root.as_ref().to_path_buf();
        let (md, stamp) = load(&root)?;
        let direction = md.data_sort_direction;
        let mut chunks: Vec<Chunk> = md
            .spans
            .into_iter()
            .map(|entry| Chunk::from_entry(entry, direction))
            .collect();

        let log_filter = if log_filter.is_empty() {
            None
        } else {
            let filter: HashSet<LogId> = log_filter.iter().cloned().collect();
            chunks.retain(|c| filter.contains(&c.log_id));
            if chunks.is_empty() {
                return Err(ZarError::NoMatchingLogs);
            }
            Some(filter)
        };

        tracing::info!("Opened archive {:?} with {} chunks", root, chunks.len());
        Ok(Self {
            data_root: resolve_data_path(&root, &md.data_path),
            data_path: md.data_path,
            direction,
            log_size_threshold: md.log_size_threshold,
            log_filter,
            state: RwLock::new(ArchiveState {
                chunks,
                indexes: md.indexes,
                stamp: Some(stamp),
                update_count: 0,
            }),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that chunk log ids are relative to
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn log_size_threshold(&self) -> i64 {
        self.log_size_threshold
    }

    pub fn is_filtered(&self) -> bool {
        self.log_filter.is_some()
    }

    pub fn metadata_path(&self) -> PathBuf {
        metadata_path(&self.root)
    }

    fn read_state(&self) -> ZarResult<RwLockReadGuard<'_, ArchiveState>> {
        self.state
            .read()
            .map_err(|e| ZarError::Lock(format!("Failed to read archive state: {}", e)))
    }

    fn write_state(&self) -> ZarResult<RwLockWriteGuard<'_, ArchiveState>> {
        self.state
            .write()
            .map_err(|e| ZarError::Lock(format!("Failed to lock archive state: {}", e)))
    }

    /// Snapshot of the chunk list in archive order.
    pub fn chunks(&self) -> ZarResult<Vec<Chunk>> {
        Ok(self.read_state()?.chunks.clone())
    }

    pub fn indexes(&self) -> ZarResult<Vec<IndexInfo>> {
        Ok(self.read_state()?.indexes.values().cloned().collect())
    }

    /// Number of metadata changes seen by this handle.
    pub fn update_count(&self) -> ZarResult<u64> {
        Ok(self.read_state()?.update_count)
    }

    fn sort_chunks(&self, chunks: &mut [Chunk]) {
        let dir = self.direction;
        chunks.sort_by(|a, b| dir.compare(a.first, b.first));
    }

    /// Replace the cached view with the file contents if it changed on disk.
    fn reload_if_changed(&self, state: &mut ArchiveState) -> ZarResult<bool> {
        let current = FileStamp::of(&self.metadata_path())?;
        if state.stamp.as_ref() == Some(&current) {
            return Ok(false);
        }
        let (md, stamp) = load(&self.root)?;
        let mut chunks: Vec<Chunk> = md
            .spans
            .into_iter()
            .map(|entry| Chunk::from_entry(entry, self.direction))
            .collect();
        self.sort_chunks(&mut chunks);
        tracing::debug!(
            "Reloaded metadata for {:?}: {} chunks",
            self.root,
            chunks.len()
        );
        state.chunks = chunks;
        state.indexes = md.indexes;
        state.stamp = Some(stamp);
        state.update_count += 1;
        Ok(true)
    }

    fn save(&self, state: &mut ArchiveState) -> ZarResult<()> {
        let spans = state.chunks.iter().map(Chunk::to_entry).collect();
        let indexes = state.indexes.clone();
        self.write_metadata(state, spans, indexes)
    }

    fn write_metadata(
        &self,
        state: &mut ArchiveState,
        spans: Vec<SpanEntry>,
        indexes: BTreeMap<String, IndexInfo>,
    ) -> ZarResult<()> {
        let md = Metadata {
            version: METADATA_VERSION,
            data_path: self.data_path.clone(),
            log_size_threshold: self.log_size_threshold,
            data_sort_direction: self.direction,
            spans,
            indexes,
        };
        let path = self.metadata_path();
        let tmp = write_temp(&self.root, &md)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(ZarError::io(&path, e));
        }
        state.stamp = Some(FileStamp::of(&path)?);
        state.update_count += 1;
        Ok(())
    }

    /// Add newly written chunks and persist the descriptor.
    pub fn append_chunks(&self, chunks: Vec<Chunk>) -> ZarResult<u64> {
        if self.is_filtered() {
            return Err(ZarError::Conflict(
                "cannot add chunks to a log-filtered archive".to_string(),
            ));
        }
        let mut state = self.write_state()?;
        self.reload_if_changed(&mut state)?;
        let added = chunks.len();
        state.chunks.extend(chunks);
        self.sort_chunks(&mut state.chunks);
        self.save(&mut state)?;
        tracing::info!(
            "Added {} chunks to {:?} ({} total)",
            added,
            self.root,
            state.chunks.len()
        );
        Ok(state.update_count)
    }

    /// Attach index kinds, replacing existing entries with the same path.
    ///
    /// A log-filtered handle only holds part of the span list, so it merges
    /// the new entries into the file's current contents and leaves the
    /// spans on disk as they are.
    pub fn add_indexes(&self, infos: Vec<IndexInfo>) -> ZarResult<u64> {
        let mut state = self.write_state()?;
        if !self.is_filtered() {
            self.reload_if_changed(&mut state)?;
            for info in infos {
                state.indexes.insert(info.path.clone(), info);
            }
            self.save(&mut state)?;
            return Ok(state.update_count);
        }

        let (md, _) = load(&self.root)?;
        let mut indexes = md.indexes;
        for info in infos {
            indexes.insert(info.path.clone(), info.clone());
            state.indexes.insert(info.path.clone(), info);
        }
        self.write_metadata(&mut state, md.spans, indexes)?;
        Ok(state.update_count)
    }

    /// Pick up changes made by other writers. Returns the update count.
    pub fn update_check(&self) -> ZarResult<u64> {
        if self.is_filtered() {
            return self.update_count();
        }
        {
            let state = self.read_state()?;
            let current = FileStamp::of(&self.metadata_path())?;
            if state.stamp.as_ref() == Some(&current) {
                return Ok(state.update_count);
            }
        }
        let mut state = self.write_state()?;
        self.reload_if_changed(&mut state)?;
        Ok(state.update_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn chunk(first: i64, last: i64) -> Chunk {
        Chunk::new(LogId::for_chunk(first), first, last, 1)
    }

    #[test]
    fn test_create_defaults() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("arch");
        let archive = Archive::create(&root, CreateOptions::default()).unwrap();
        assert_eq!(archive.direction(), Direction::Reverse);
        assert_eq!(archive.log_size_threshold(), DEFAULT_LOG_SIZE_THRESHOLD);
        assert_eq!(archive.data_root(), root.as_path());
        assert!(archive.chunks().unwrap().is_empty());

        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(root.join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["data_path"], ".");
        assert_eq!(json["data_sort_direction"], "descending");
    }

    #[test]
    fn test_create_twice_conflicts() {
        let dir = tempdir().unwrap();
        Archive::create(dir.path(), CreateOptions::default()).unwrap();
        let err = Archive::create(dir.path(), CreateOptions::default()).unwrap_err();
        assert!(matches!(err, ZarError::Conflict(_)));
    }

    #[test]
    fn test_open_missing_or_malformed() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Archive::open(dir.path()),
            Err(ZarError::NotAnArchive(_))
        ));
        fs::write(dir.path().join(METADATA_FILE), b"{not json").unwrap();
        assert!(matches!(
            Archive::open(dir.path()),
            Err(ZarError::NotAnArchive(_))
        ));
    }

    #[test]
    fn test_unknown_version_fails_closed() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(METADATA_FILE),
            br#"{"version":9,"data_path":".","log_size_threshold":10,"data_sort_direction":"ascending"}"#,
        )
        .unwrap();
        assert!(matches!(
            Archive::open(dir.path()),
            Err(ZarError::VersionMismatch { found: 9, .. })
        ));
    }

    #[test]
    fn test_append_keeps_direction_order() {
        let dir = tempdir().unwrap();
        let archive = Archive::create(dir.path(), CreateOptions::default()).unwrap();
        archive.append_chunks(vec![chunk(20, 15), chunk(50, 40)]).unwrap();
        archive.append_chunks(vec![chunk(30, 25)]).unwrap();
        let firsts: Vec<i64> = archive.chunks().unwrap().iter().map(|c| c.first).collect();
        assert_eq!(firsts, vec![50, 30, 20]);

        // durable across a fresh open
        let reopened = Archive::open(dir.path()).unwrap();
        assert_eq!(reopened.chunks().unwrap(), archive.chunks().unwrap());
    }

    #[test]
    fn test_update_check_sees_other_writer() {
        let dir = tempdir().unwrap();
        let opts = CreateOptions::default().direction(Direction::Forward);
        let writer = Archive::create(dir.path(), opts).unwrap();
        let reader = Archive::open(dir.path()).unwrap();
        assert_eq!(reader.update_check().unwrap(), 0);

        writer.append_chunks(vec![chunk(1, 5)]).unwrap();
        let count = reader.update_check().unwrap();
        assert_eq!(count, 1);
        assert_eq!(reader.chunks().unwrap().len(), 1);
        assert_eq!(reader.update_check().unwrap(), count);

        // reader's own append merges with the writer's chunk
        reader.append_chunks(vec![chunk(0, 2)]).unwrap();
        writer.update_check().unwrap();
        let firsts: Vec<i64> = writer.chunks().unwrap().iter().map(|c| c.first).collect();
        assert_eq!(firsts, vec![0, 1]);
    }

    #[test]
    fn test_log_filter() {
        let dir = tempdir().unwrap();
        let archive = Archive::create(dir.path(), CreateOptions::default()).unwrap();
        let a = chunk(10, 5);
        let b = chunk(30, 20);
        archive.append_chunks(vec![a.clone(), b]).unwrap();

        let filtered = Archive::open_with_filter(dir.path(), &[a.log_id.clone()]).unwrap();
        assert!(filtered.is_filtered());
        assert_eq!(filtered.chunks().unwrap(), vec![a]);
        assert!(matches!(
            filtered.append_chunks(vec![chunk(40, 35)]),
            Err(ZarError::Conflict(_))
        ));

        let missing = LogId::for_chunk(99);
        assert!(matches!(
            Archive::open_with_filter(dir.path(), &[missing]),
            Err(ZarError::NoMatchingLogs)
        ));
    }

    #[test]
    fn test_add_indexes_upserts() {
        let dir = tempdir().unwrap();
        let archive = Archive::create(dir.path(), CreateOptions::default()).unwrap();
        archive
            .add_indexes(vec![
                IndexInfo::new("type", "idx:type:int64"),
                IndexInfo::new("field", "idx:field:v"),
            ])
            .unwrap();
        archive
            .add_indexes(vec![IndexInfo::new("type", "idx:type:int64")])
            .unwrap();
        let reopened = Archive::open(dir.path()).unwrap();
        assert_eq!(reopened.indexes().unwrap().len(), 2);
    }

    #[test]
    fn test_filtered_add_indexes_keeps_hidden_chunks() {
        let dir = tempdir().unwrap();
        let archive = Archive::create(dir.path(), CreateOptions::default()).unwrap();
        let a = chunk(10, 5);
        let b = chunk(30, 20);
        archive.append_chunks(vec![a.clone(), b.clone()]).unwrap();
        archive
            .add_indexes(vec![IndexInfo::new("field", "idx:field:v")])
            .unwrap();

        let filtered = Archive::open_with_filter(dir.path(), &[a.log_id.clone()]).unwrap();
        filtered
            .add_indexes(vec![IndexInfo::new("type", "idx:type:ip")])
            .unwrap();
        assert_eq!(filtered.chunks().unwrap(), vec![a.clone()]);

        let reopened = Archive::open(dir.path()).unwrap();
        assert_eq!(reopened.chunks().unwrap(), vec![b, a]);
        let mut paths: Vec<String> = reopened
            .indexes()
            .unwrap()
            .into_iter()
            .map(|info| info.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["idx:field:v", "idx:type:ip"]);
    }

    #[test]
    fn test_filtered_add_indexes_merges_concurrent_writer() {
        let dir = tempdir().unwrap();
        let writer = Archive::create(dir.path(), CreateOptions::default()).unwrap();
        let a = chunk(10, 5);
        writer.append_chunks(vec![a.clone()]).unwrap();
        let filtered = Archive::open_with_filter(dir.path(), &[a.log_id]).unwrap();

        // chunk added after the filtered handle took its snapshot
        writer.append_chunks(vec![chunk(30, 20)]).unwrap();
        filtered
            .add_indexes(vec![IndexInfo::new("type", "idx:type:int64")])
            .unwrap();

        writer.update_check().unwrap();
        assert_eq!(writer.chunks().unwrap().len(), 2);
        assert_eq!(writer.indexes().unwrap().len(), 1);
    }

    #[test]
    fn test_separate_data_path() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let opts = CreateOptions::default().data_path(data.display().to_string());
        let archive = Archive::create(dir.path().join("meta"), opts).unwrap();
        assert_eq!(archive.data_root(), data.as_path());
        assert!(data.is_dir());
    }
}
