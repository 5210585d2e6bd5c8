use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::store::StoredRun;

/// Ordering of the per-directory lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SortKey {
    /// Most clustered files first
    #[default]
    Count,
    /// Alphabetical by directory
    Path,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryLine {
    /// Relative to the scanned root where possible.
    pub directory: PathBuf,
    pub clustered: usize,
    pub total: u64,
    pub duplicates: u64,
    pub ratio: f64,
}

/// Summary of a persisted run.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub clusters: usize,
    pub clustered_files: usize,
    pub directories: Vec<DirectoryLine>,
}

fn relative_to(path: &Path, roots: &[&Path]) -> PathBuf {
    roots
        .iter()
        .filter_map(|root| path.strip_prefix(root).ok())
        .min_by_key(|rel| rel.components().count())
        .map(|rel| {
            if rel.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                rel.to_path_buf()
            }
        })
        .unwrap_or_else(|| path.to_path_buf())
}

/// Group a run's clusters by directory. Directories without clustered
/// files are left out.
pub fn summarize(run: &StoredRun, sort: SortKey) -> Report {
    let mut clustered: BTreeMap<&Path, usize> = BTreeMap::new();
    for entry in run.clusters.iter().flat_map(|c| c.iter()) {
        *clustered.entry(entry.parent()).or_default() += 1;
    }

    let mut roots: Vec<&Path> = vec![run.header.source.as_path()];
    if let Some(target) = &run.header.target {
        roots.push(target.as_path());
    }

    let mut directories: Vec<DirectoryLine> = clustered
        .into_iter()
        .map(|(dir, count)| {
            let stats = run.stats.get(dir).copied().unwrap_or_default();
            DirectoryLine {
                directory: relative_to(dir, &roots),
                clustered: count,
                total: stats.total,
                duplicates: stats.duplicates,
                ratio: stats.ratio(),
            }
        })
        .collect();

    match sort {
        SortKey::Count => directories.sort_by(|a, b| {
            b.clustered
                .cmp(&a.clustered)
                .then_with(|| a.directory.cmp(&b.directory))
        }),
        SortKey::Path => directories.sort_by(|a, b| a.directory.cmp(&b.directory)),
    }

    Report {
        source: run.header.source.clone(),
        target: run.header.target.clone(),
        clusters: run.clusters.len(),
        clustered_files: run.clustered_files(),
        directories,
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "🗂️  Source: {}", self.source.display())?;
        if let Some(target) = &self.target {
            writeln!(f, "🎯 Target: {}", target.display())?;
        }
        writeln!(
            f,
            "✨ {} cluster(s), {} clustered file(s)",
            self.clusters, self.clustered_files
        )?;
        for line in &self.directories {
            writeln!(
                f,
                "   {:>5}  {:>6.1}% ({}/{})  {}",
                line.clustered,
                line.ratio * 100.0,
                line.duplicates,
                line.total,
                line.directory.display()
            )?;
        }
        Ok(())
    }
}
