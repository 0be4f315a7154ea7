//! Configuration System
//!
//! Loads configuration from a TOML file and applies environment variable
//! overrides. Every field has a default, so an empty file is valid.

use crate::archive::import::{DEFAULT_LZ4_BLOCK_SIZE, DEFAULT_STREAM_BYTES_MAX};
use crate::archive::indexer::DEFAULT_MAX_ERRORS;
use crate::archive::metadata::{DEFAULT_LOG_SIZE_THRESHOLD, SELF_RELATIVE};
use crate::archive::{CreateOptions, ImportOptions, IndexOptions};
use crate::driver::DEFAULT_PARALLELISM;
use crate::microindex::DEFAULT_FRAME_THRESH;
use crate::proc::sort::DEFAULT_SORT_MEM_RECORDS;
use crate::scan::DEFAULT_BATCH_SIZE;
use crate::span::Direction;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub import: ImportConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Archive location and creation settings
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Archive root used when a command is given none
    pub root: Option<String>,

    #[serde(default = "default_log_size_threshold")]
    pub log_size_threshold: i64,

    #[serde(default = "default_sort_direction")]
    pub sort_direction: String,

    #[serde(default = "default_data_path")]
    pub data_path: String,
}

fn default_log_size_threshold() -> i64 {
    DEFAULT_LOG_SIZE_THRESHOLD
}

fn default_sort_direction() -> String {
    "descending".to_string()
}

fn default_data_path() -> String {
    SELF_RELATIVE.to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: None,
            log_size_threshold: default_log_size_threshold(),
            sort_direction: default_sort_direction(),
            data_path: default_data_path(),
        }
    }
}

impl ArchiveConfig {
    pub fn direction(&self) -> Result<Direction, ConfigError> {
        match self.sort_direction.as_str() {
            "descending" | "desc" => Ok(Direction::Reverse),
            "ascending" | "asc" => Ok(Direction::Forward),
            other => Err(ConfigError::Invalid {
                key: "archive.sort_direction".to_string(),
                error: format!("expected ascending or descending, got \"{}\"", other),
            }),
        }
    }

    pub fn create_options(&self) -> Result<CreateOptions, ConfigError> {
        Ok(CreateOptions::new()
            .log_size_threshold(self.log_size_threshold)
            .direction(self.direction()?)
            .data_path(self.data_path.clone()))
    }
}

/// Chunk writing settings
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_stream_bytes_max")]
    pub stream_bytes_max: u64,

    #[serde(default)]
    pub stream_records_max: usize,

    #[serde(default = "default_lz4_block_size")]
    pub lz4_block_size: usize,

    #[serde(default = "default_sort_mem_records")]
    pub sort_mem_records: usize,
}

fn default_stream_bytes_max() -> u64 {
    DEFAULT_STREAM_BYTES_MAX
}

fn default_lz4_block_size() -> usize {
    DEFAULT_LZ4_BLOCK_SIZE
}

fn default_sort_mem_records() -> usize {
    DEFAULT_SORT_MEM_RECORDS
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            stream_bytes_max: default_stream_bytes_max(),
            stream_records_max: 0,
            lz4_block_size: default_lz4_block_size(),
            sort_mem_records: default_sort_mem_records(),
        }
    }
}

impl ImportConfig {
    pub fn options(&self) -> ImportOptions {
        ImportOptions {
            stream_bytes_max: self.stream_bytes_max,
            stream_records_max: self.stream_records_max,
            lz4_block_size: self.lz4_block_size,
            sort_mem_records: self.sort_mem_records,
            ..ImportOptions::default()
        }
    }
}

/// Micro-index build settings
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_frame_thresh")]
    pub frame_thresh: usize,

    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
}

fn default_frame_thresh() -> usize {
    DEFAULT_FRAME_THRESH
}

fn default_max_errors() -> usize {
    DEFAULT_MAX_ERRORS
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            frame_thresh: default_frame_thresh(),
            max_errors: default_max_errors(),
        }
    }
}

impl IndexConfig {
    pub fn options(&self) -> IndexOptions {
        IndexOptions {
            frame_thresh: self.frame_thresh,
            max_errors: self.max_errors,
            ..IndexOptions::default()
        }
    }
}

/// Parallel scan settings
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            batch_size: default_batch_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("zar").join("config.toml"))
    }

    /// Load from the default location, falling back to defaults. Environment
    /// overrides apply either way.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path().filter(|p| p.exists()) {
            let config = Self::load_with_env(&path)?;
            tracing::debug!("Loaded config from {:?}", path);
            return Ok(config);
        }
        let mut config = Config::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `ZAR_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("ZAR_ROOT") {
            self.archive.root = Some(root);
        }
        if let Some(v) = lookup("ZAR_LOG_SIZE_THRESHOLD") {
            self.archive.log_size_threshold = parse_env("ZAR_LOG_SIZE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("ZAR_PARALLELISM") {
            self.scan.parallelism = parse_env("ZAR_PARALLELISM", &v)?;
        }
        if let Some(v) = lookup("ZAR_BATCH_SIZE") {
            self.scan.batch_size = parse_env("ZAR_BATCH_SIZE", &v)?;
        }
        if let Some(level) = lookup("ZAR_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        error: e.to_string(),
    })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid value for {key}: {error}")]
    Invalid { key: String, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    format!(
        r#"# Zar Configuration
#
# Environment variables override these settings:
# - ZAR_ROOT
# - ZAR_LOG_SIZE_THRESHOLD
# - ZAR_PARALLELISM
# - ZAR_BATCH_SIZE
# - ZAR_LOG_LEVEL

[archive]
# Archive root used when no -R is given
# root = "/var/lib/zar/logs"

# Start a new chunk once the current one reaches this many bytes
log_size_threshold = {threshold}

# Order of records within chunks: ascending or descending
sort_direction = "descending"

# Where chunk files live, relative to the archive root
data_path = "."

[import]
# End a stream (and record a seek point) after this many bytes
stream_bytes_max = {stream_bytes}

# End a stream after this many records (0 = unbounded)
stream_records_max = 0

# LZ4 block size for chunk streams (0 disables compression)
lz4_block_size = {lz4}

# Records sorted in memory before spilling to disk
sort_mem_records = {sort_mem}

[index]
# Micro-index frame size in bytes
frame_thresh = {frame}

# Give up after this many chunks fail to index
max_errors = {max_errors}

[scan]
# Scan workers
parallelism = {parallelism}

# Records per batch
batch_size = {batch}

# Buffered output records
channel_capacity = 64

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Emit JSON lines instead of human-readable logs
json = false
"#,
        threshold = DEFAULT_LOG_SIZE_THRESHOLD,
        stream_bytes = DEFAULT_STREAM_BYTES_MAX,
        lz4 = DEFAULT_LZ4_BLOCK_SIZE,
        sort_mem = DEFAULT_SORT_MEM_RECORDS,
        frame = DEFAULT_FRAME_THRESH,
        max_errors = DEFAULT_MAX_ERRORS,
        parallelism = DEFAULT_PARALLELISM,
        batch = DEFAULT_BATCH_SIZE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_generated_config_parses_to_defaults() {
        let config = Config::parse(&generate_default_config()).unwrap();
        assert_eq!(config.archive.log_size_threshold, DEFAULT_LOG_SIZE_THRESHOLD);
        assert_eq!(config.archive.direction().unwrap(), Direction::Reverse);
        assert_eq!(config.import.stream_bytes_max, DEFAULT_STREAM_BYTES_MAX);
        assert_eq!(config.index.max_errors, DEFAULT_MAX_ERRORS);
        assert_eq!(config.scan.parallelism, DEFAULT_PARALLELISM);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_partial_file() {
        let config = Config::parse("[scan]\nparallelism = 9\n[archive]\nsort_direction = \"ascending\"\n")
            .unwrap();
        assert_eq!(config.scan.parallelism, 9);
        assert_eq!(config.scan.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.archive.direction().unwrap(), Direction::Forward);

        let bad = Config::parse("[archive]\nsort_direction = \"sideways\"\n").unwrap();
        assert!(bad.archive.direction().is_err());
        assert!(Config::parse("[scan]\nparallelism = \"many\"\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ZAR_ROOT", "/tmp/logs"),
            ("ZAR_PARALLELISM", "2"),
            ("ZAR_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.archive.root.as_deref(), Some("/tmp/logs"));
        assert_eq!(config.scan.parallelism, 2);
        assert_eq!(config.logging.level, "debug");

        let err = config
            .apply_overrides(|k| (k == "ZAR_BATCH_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[index]\nmax_errors = 3\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.index.options().max_errors, 3);
        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
