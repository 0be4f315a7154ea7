//! Zar CLI
//!
//! Command-line interface for zar archives:
//! - Create an archive and import records into it
//! - List chunks and indexes
//! - Build micro-indexes and search them
//! - Scan a time range in parallel

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zar::archive::seek::lookup_seek;
use zar::archive::{
    find, import, index_archive, Archive, ArchiveSource, FindOptions, IndexQuery, LogId, Rule,
};
use zar::config::{generate_default_config, Config};
use zar::driver::ParallelGroup;
use zar::record::{literal, Reader, Record, TypeContext};
use zar::scan::{Filter, FilterExpr, SourceFilter};
use zar::span::{format_ts, Direction, Span};

#[derive(Parser)]
#[command(name = "zar")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Time-partitioned log archive with micro-indexes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Archive root (default: archive.root from config or ZAR_ROOT)
    #[arg(short = 'R', long, global = true)]
    pub root: Option<PathBuf>,

    /// Config file (default: ~/.config/zar/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an empty archive
    Create {
        /// Chunk size threshold in bytes
        #[arg(long)]
        threshold: Option<i64>,
        /// Sort chunks by ascending time instead of descending
        #[arg(long)]
        ascending: bool,
        /// Directory for chunk files, relative to the root
        #[arg(long)]
        data_path: Option<String>,
    },

    /// Import record streams ("-" reads stdin)
    Import {
        inputs: Vec<PathBuf>,
    },

    /// List chunks and attached indexes
    Ls {
        /// Print JSON lines
        #[arg(long)]
        json: bool,
        /// Only these log ids
        #[arg(short, long)]
        log: Vec<String>,
    },

    /// Build micro-indexes, e.g. ":int64" or "uid"
    Index {
        rules: Vec<String>,
        /// Only these log ids
        #[arg(short, long)]
        log: Vec<String>,
    },

    /// Search an index, e.g. ":int64=336" or "uid=C3p9"
    Find {
        query: String,
        /// Fail on chunks missing the index
        #[arg(long)]
        strict: bool,
        /// Omit _log, first and last from hits
        #[arg(long)]
        no_path: bool,
        /// Only these log ids
        #[arg(short, long)]
        log: Vec<String>,
    },

    /// Scan records in archive order
    Scan {
        /// Earliest time (seconds or RFC3339)
        #[arg(long)]
        from: Option<String>,
        /// Latest time, inclusive
        #[arg(long)]
        to: Option<String>,
        /// Keep records whose field equals a literal, e.g. "v=336"
        #[arg(short, long)]
        r#match: Option<String>,
        /// Scan workers
        #[arg(short = 'P', long)]
        parallelism: Option<usize>,
        /// Print scan progress to stderr when done
        #[arg(long)]
        stats: bool,
    },

    /// Show the seek offset for a time in each covering chunk
    Seek {
        time: String,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("zar={}", config.logging.level)));
    let json = config.logging.json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn archive_root(cli_root: Option<PathBuf>, config: &Config) -> anyhow::Result<PathBuf> {
    cli_root
        .or_else(|| config.archive.root.as_ref().map(PathBuf::from))
        .context("no archive root: pass -R or set ZAR_ROOT")
}

/// Open the archive, restricted to `logs` when any are given.
fn open_archive(root: &Path, logs: &[String]) -> anyhow::Result<Archive> {
    if logs.is_empty() {
        return Ok(Archive::open(root)?);
    }
    let ids: Vec<LogId> = logs.iter().map(|s| LogId::parse(s)).collect::<Result<_, _>>()?;
    Ok(Archive::open_with_filter(root, &ids)?)
}

fn parse_time(s: &str) -> anyhow::Result<i64> {
    literal::parse_time(s).with_context(|| format!("invalid time \"{}\"", s))
}

fn match_filter(expr: &str) -> anyhow::Result<Filter> {
    let (field, want) = expr
        .split_once('=')
        .with_context(|| format!("match must be field=value: \"{}\"", expr))?;
    let field = field.trim().to_string();
    let want = want.trim().to_string();
    Ok(Arc::new(move |rec: &Record| {
        rec.field(&field)
            .and_then(|(ty, v)| {
                literal::parse_value(ty, &want)
                    .ok()
                    .map(|w| v.compare(&w) == Ordering::Equal)
            })
            .unwrap_or(false)
    }))
}

fn open_input(path: &Path) -> anyhow::Result<Box<dyn Read + Send>> {
    if path == Path::new("-") {
        return Ok(Box::new(std::io::stdin()));
    }
    let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
    Ok(Box::new(file))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, canceling");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default()?,
    };
    init_logging(&config);

    let cli_root = cli.root;
    let root = || archive_root(cli_root.clone(), &config);
    let zctx = Arc::new(TypeContext::new());
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match cli.command {
        Commands::Create {
            threshold,
            ascending,
            data_path,
        } => {
            let mut opts = config.archive.create_options()?;
            if let Some(bytes) = threshold {
                opts = opts.log_size_threshold(bytes);
            }
            if ascending {
                opts = opts.direction(Direction::Forward);
            }
            if let Some(path) = data_path {
                opts = opts.data_path(path);
            }
            let archive = Archive::create(root()?, opts)?;
            writeln!(out, "created {} ({})", archive.root().display(), archive.direction())?;
        }

        Commands::Import { inputs } => {
            if inputs.is_empty() {
                bail!("no inputs given");
            }
            let cancel = cancel_on_ctrl_c();
            let opts = config.import.options();
            let root = root()?;
            let stats = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                let archive = Archive::open(&root)?;
                let mut total = zar::archive::ImportStats::default();
                for path in &inputs {
                    let mut reader = Reader::new(BufReader::new(open_input(path)?), zctx.clone());
                    let stats = import(&archive, zctx.clone(), &mut reader, &opts, &cancel)
                        .with_context(|| format!("importing {:?}", path))?;
                    total.records += stats.records;
                    total.chunks += stats.chunks;
                    total.bytes += stats.bytes;
                }
                Ok(total)
            })
            .await??;
            writeln!(
                out,
                "imported {} records into {} chunks ({} bytes)",
                stats.records, stats.chunks, stats.bytes
            )?;
        }

        Commands::Ls { json, log } => {
            let archive = open_archive(&root()?, &log)?;
            for chunk in archive.chunks()? {
                if json {
                    let line = serde_json::json!({
                        "log_id": chunk.log_id,
                        "first": chunk.first,
                        "last": chunk.last,
                        "record_count": chunk.record_count,
                    });
                    writeln!(out, "{}", line)?;
                } else {
                    writeln!(
                        out,
                        "{}\t{}\t{}\t{}",
                        chunk.log_id,
                        format_ts(chunk.first),
                        format_ts(chunk.last),
                        chunk.record_count
                    )?;
                }
            }
            if !json {
                for index in archive.indexes()? {
                    writeln!(out, "index {}\t{}", index.kind, index.path)?;
                }
            }
        }

        Commands::Index { rules, log } => {
            let rules: Vec<Rule> = rules
                .iter()
                .map(|r| Rule::parse(&zctx, r))
                .collect::<Result<_, _>>()?;
            let cancel = cancel_on_ctrl_c();
            let opts = config.index.options();
            let root = root()?;
            let (tx, mut rx) = mpsc::channel::<String>(config.scan.channel_capacity.max(1));
            let reporter = tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    tracing::info!("{}", msg);
                }
            });
            let stats = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                let archive = open_archive(&root, &log)?;
                Ok(index_archive(&archive, zctx, &rules, &opts, Some(&tx), &cancel)?)
            })
            .await??;
            reporter.await?;
            writeln!(
                out,
                "indexed {} chunks, wrote {} indexes, {} errors",
                stats.chunks, stats.indexes, stats.errors
            )?;
        }

        Commands::Find {
            query,
            strict,
            no_path,
            log,
        } => {
            let archive = open_archive(&root()?, &log)?;
            let query = IndexQuery::parse(&zctx, &query)?;
            let opts = FindOptions {
                skip_missing: !strict,
                add_path: !no_path,
            };
            let cancel = cancel_on_ctrl_c();
            let (tx, mut rx) = mpsc::channel(config.scan.channel_capacity.max(1));
            let search = async {
                let result = find(&archive, zctx.clone(), &query, &opts, &tx, &cancel).await;
                drop(tx);
                result
            };
            let print = async {
                let mut printed = 0u64;
                while let Some(rec) = rx.recv().await {
                    writeln!(out, "{}", rec)?;
                    printed += 1;
                }
                anyhow::Ok(printed)
            };
            let (result, printed) = tokio::join!(search, print);
            result?;
            tracing::debug!("Found {} hits", printed?);
        }

        Commands::Scan {
            from,
            to,
            r#match,
            parallelism,
            stats,
        } => {
            let archive = Arc::new(Archive::open(root()?)?);
            let span = match (from.as_deref(), to.as_deref()) {
                (None, None) => Span::all(),
                (from, to) => {
                    let lo = from.map(parse_time).transpose()?.unwrap_or(0);
                    let hi = to.map(parse_time).transpose()?.unwrap_or(i64::MAX - 1);
                    if hi < lo {
                        bail!("--to is before --from");
                    }
                    Span::from_first_last(lo, hi)
                }
            };
            let mut filter = SourceFilter::new(span);
            if let Some(expr) = r#match {
                filter = filter.with_filter(match_filter(&expr)?, Some(FilterExpr::new(&expr)));
            }
            let source = ArchiveSource::new(archive, zctx).batch_size(config.scan.batch_size);
            let mut group = ParallelGroup::new(
                Arc::new(source),
                filter,
                parallelism.unwrap_or(config.scan.parallelism),
                cancel_on_ctrl_c(),
            )
            .batch_size(config.scan.batch_size);
            while let Some(batch) = group.pull().await? {
                for rec in batch.records() {
                    writeln!(out, "{}", rec)?;
                }
            }
            if stats {
                eprintln!("{}", serde_json::to_string(&group.progress())?);
            }
        }

        Commands::Seek { time } => {
            let archive = Archive::open(root()?)?;
            let ts = parse_time(&time)?;
            for chunk in archive.chunk_walk(Span::from_first_last(ts, ts))? {
                match lookup_seek(zctx.clone(), archive.data_root(), &chunk, ts)? {
                    Some(entry) => writeln!(
                        out,
                        "{}\t{}\t{}",
                        chunk.log_id,
                        format_ts(entry.ts),
                        entry.offset
                    )?,
                    None => writeln!(out, "{}\t-\t0", chunk.log_id)?,
                }
            }
        }

        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content).with_context(|| format!("writing {:?}", path))?;
                    writeln!(out, "Wrote default config to {:?}", path)?;
                }
                None => write!(out, "{}", content)?,
            }
        }
    }

    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use zar::archive::{Chunk, CreateOptions};

    #[test]
    fn test_log_flag_repeats() {
        let cli = Cli::try_parse_from(["zar", "find", "-l", "a", "--log", "b", "v=1"]).unwrap();
        match cli.command {
            Commands::Find { query, log, .. } => {
                assert_eq!(query, "v=1");
                assert_eq!(log, vec!["a", "b"]);
            }
            _ => panic!("expected find"),
        }
        let cli = Cli::try_parse_from(["zar", "index", ":int64", "--log", "a"]).unwrap();
        assert!(matches!(cli.command, Commands::Index { log, .. } if log == vec!["a"]));
    }

    #[test]
    fn test_open_archive_with_logs() {
        let dir = tempdir().unwrap();
        let archive = Archive::create(dir.path(), CreateOptions::default()).unwrap();
        let first = 1_587_427_200_000_000_000i64;
        let a = Chunk::new(LogId::for_chunk(first), first + 10, first, 1);
        let b = Chunk::new(LogId::for_chunk(first + 100), first + 110, first + 100, 1);
        archive.append_chunks(vec![a.clone(), b]).unwrap();

        assert_eq!(open_archive(dir.path(), &[]).unwrap().chunks().unwrap().len(), 2);
        let filtered = open_archive(dir.path(), &[a.log_id.to_string()]).unwrap();
        assert!(filtered.is_filtered());
        assert_eq!(filtered.chunks().unwrap(), vec![a]);
        assert!(open_archive(dir.path(), &["bogus".to_string()]).is_err());
    }
}
