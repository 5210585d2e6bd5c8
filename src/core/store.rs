//! Incremental result store.
//!
//! One JSON record per line, in fixed positions:
//!
//! ```text
//! {"record":"source", ...}
//! {"record":"target", ...}
//! {"record":"extensions", ...}
//! {"record":"cluster", ...}      zero or more
//! {"record":"stats", ...}        trailer, written last
//! ```
//!
//! Clusters are appended from pool tasks, so their order follows task
//! completion and not discovery. A store without its trailer comes from an
//! interrupted run and does not load.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use crate::core::catalog::{Cluster, DirectoryStats};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Malformed record at {path}:{line}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unexpected record at {path}:{line}, expected {expected}")]
    OutOfOrder {
        path: PathBuf,
        line: usize,
        expected: &'static str,
    },

    #[error("Cluster at {path}:{line} has fewer than two entries")]
    Singleton { path: PathBuf, line: usize },

    #[error("Store {path} is truncated, expected {expected}")]
    Truncated {
        path: PathBuf,
        expected: &'static str,
    },
}

/// Run context written ahead of the clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub extensions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    Source { path: PathBuf },
    Target { path: Option<PathBuf> },
    Extensions { extensions: Vec<String> },
    Cluster { entries: Cluster },
    Stats { directories: DirectoryStats },
}

/// Everything a finished store holds.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    pub header: StoreHeader,
    pub clusters: Vec<Cluster>,
    pub stats: DirectoryStats,
}

impl StoredRun {
    pub fn clustered_files(&self) -> usize {
        self.clusters.iter().map(Cluster::len).sum()
    }
}

/// Thread-safe writer for one run.
pub struct ResultStore {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    appended: AtomicUsize,
}

impl ResultStore {
    /// Create (or truncate) the store and write the header records.
    pub fn create(path: impl AsRef<Path>, header: &StoreHeader) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = File::create(&path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);

        for record in [
            Record::Source {
                path: header.source.clone(),
            },
            Record::Target {
                path: header.target.clone(),
            },
            Record::Extensions {
                extensions: header.extensions.clone(),
            },
        ] {
            write_record(&mut writer, &record).map_err(|e| e.at(&path))?;
        }
        writer.flush().map_err(io_err)?;

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            appended: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one cluster. Safe to call from several threads; the record is
    /// flushed to the file before this returns.
    pub fn append(&self, cluster: Cluster) -> Result<(), StoreError> {
        let line = serde_json::to_string(&Record::Cluster { entries: cluster })?;

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}")
            .and_then(|_| writer.flush())
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;

        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of clusters written so far.
    pub fn appended(&self) -> usize {
        self.appended.load(Ordering::Relaxed)
    }

    /// Write the stats trailer and close the store.
    pub fn finish(self, stats: &DirectoryStats) -> Result<PathBuf, StoreError> {
        let path = self.path;
        let mut writer = self.writer.into_inner().unwrap_or_else(PoisonError::into_inner);

        write_record(
            &mut writer,
            &Record::Stats {
                directories: stats.clone(),
            },
        )
        .map_err(|e| e.at(&path))?;

        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        writer.flush().map_err(io_err)?;
        writer.get_ref().sync_all().map_err(io_err)?;
        Ok(path)
    }
}

enum WriteError {
    Io(std::io::Error),
    Encode(serde_json::Error),
}

impl WriteError {
    fn at(self, path: &Path) -> StoreError {
        match self {
            WriteError::Io(source) => StoreError::Io {
                path: path.to_path_buf(),
                source,
            },
            WriteError::Encode(err) => StoreError::Encode(err),
        }
    }
}

fn write_record(writer: &mut impl Write, record: &Record) -> Result<(), WriteError> {
    serde_json::to_writer(&mut *writer, record).map_err(WriteError::Encode)?;
    writer.write_all(b"\n").map_err(WriteError::Io)
}

/// Read a finished store back.
///
/// Blank lines are ignored. Anything else out of place is an error: the
/// store is either complete and well-formed or unusable.
pub fn load(path: impl AsRef<Path>) -> Result<StoredRun, StoreError> {
    let path = path.as_ref().to_path_buf();
    let file = File::open(&path).map_err(|source| StoreError::Io {
        path: path.clone(),
        source,
    })?;

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record =
            serde_json::from_str(&line).map_err(|source| StoreError::Malformed {
                path: path.clone(),
                line: index + 1,
                source,
            })?;
        records.push((index + 1, record));
    }

    let out_of_order = |line: usize, expected: &'static str| StoreError::OutOfOrder {
        path: path.clone(),
        line,
        expected,
    };
    let truncated = |expected: &'static str| StoreError::Truncated {
        path: path.clone(),
        expected,
    };

    let mut records = records.into_iter();

    let source = match records.next() {
        Some((_, Record::Source { path })) => path,
        Some((line, _)) => return Err(out_of_order(line, "source")),
        None => return Err(truncated("source")),
    };
    let target = match records.next() {
        Some((_, Record::Target { path })) => path,
        Some((line, _)) => return Err(out_of_order(line, "target")),
        None => return Err(truncated("target")),
    };
    let extensions = match records.next() {
        Some((_, Record::Extensions { extensions })) => extensions,
        Some((line, _)) => return Err(out_of_order(line, "extensions")),
        None => return Err(truncated("extensions")),
    };

    let mut clusters = Vec::new();
    let stats = loop {
        match records.next() {
            Some((line, Record::Cluster { entries })) => {
                if !entries.is_active() {
                    return Err(StoreError::Singleton {
                        path: path.clone(),
                        line,
                    });
                }
                clusters.push(entries);
            }
            Some((_, Record::Stats { directories })) => break directories,
            Some((line, _)) => return Err(out_of_order(line, "cluster or stats")),
            None => return Err(truncated("stats trailer")),
        }
    };

    if let Some((line, _)) = records.next() {
        return Err(out_of_order(line, "end of store"));
    }

    Ok(StoredRun {
        header: StoreHeader {
            source,
            target,
            extensions,
        },
        clusters,
        stats,
    })
}
