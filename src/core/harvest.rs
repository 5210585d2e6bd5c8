use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::core::catalog::{CatalogEntry, DirectoryStats};

pub const DEFAULT_EXTENSIONS: [&str; 4] = [".jpg", ".png", ".webp", ".gif"];

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Directory does not exist: {path}")]
    MissingRoot { path: PathBuf },

    #[error("Not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Case-sensitive suffix allow-list. Items may be given with or without
/// the leading dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionFilter {
    suffixes: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<S: AsRef<str>>(extensions: &[S]) -> Self {
        let suffixes = extensions
            .iter()
            .map(|ext| {
                let ext = ext.as_ref();
                if ext.starts_with('.') {
                    ext.to_string()
                } else {
                    format!(".{ext}")
                }
            })
            .collect();
        Self { suffixes }
    }

    pub fn matches(&self, path: &Path) -> bool {
        match path.extension() {
            Some(ext) => {
                let suffix = format!(".{}", ext.to_string_lossy());
                self.suffixes.iter().any(|s| *s == suffix)
            }
            None => false,
        }
    }

    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }
}

impl Default for ExtensionFilter {
    fn default() -> Self {
        Self::new(&DEFAULT_EXTENSIONS)
    }
}

/// Matching files under one root, sorted by path.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
    pub dirs: DirectoryStats,
}

/// Pivot and candidate pools for a run. `others` is `None` when only one
/// tree was given and the targets double as candidates.
#[derive(Debug, Clone, Default)]
pub struct Harvest {
    pub targets: Vec<CatalogEntry>,
    pub others: Option<Vec<CatalogEntry>>,
    pub dirs: DirectoryStats,
}

impl Harvest {
    pub fn file_count(&self) -> usize {
        self.targets.len() + self.others.as_ref().map_or(0, Vec::len)
    }
}

/// Fail before any work if `root` is unusable.
pub fn check_root(root: &Path) -> Result<PathBuf, HarvestError> {
    if !root.exists() {
        return Err(HarvestError::MissingRoot {
            path: root.to_path_buf(),
        });
    }
    if !root.is_dir() {
        return Err(HarvestError::NotADirectory {
            path: root.to_path_buf(),
        });
    }
    Ok(std::path::absolute(root)?)
}

/// Walk `root` and collect every file the filter accepts.
///
/// Symbolic links are not followed. Unreadable entries are logged and
/// skipped. Every directory reached gets a stats record, empty or not.
pub fn harvest(root: &Path, filter: &ExtensionFilter) -> Result<Catalog, HarvestError> {
    let root = check_root(root)?;
    let mut catalog = Catalog::default();

    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("Skipping unreadable entry under {}: {}", root.display(), err);
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            catalog.dirs.visit_dir(entry.path());
        } else if file_type.is_file() && filter.matches(entry.path()) {
            let path = entry.into_path();
            if let Some(parent) = path.parent() {
                catalog.dirs.record_file(parent);
            }
            catalog.entries.push(CatalogEntry::new(path));
        }
    }

    catalog.entries.sort_by(|a, b| a.path.cmp(&b.path));
    log::debug!(
        "Harvested {} files in {} directories under {}",
        catalog.entries.len(),
        catalog.dirs.len(),
        root.display()
    );
    Ok(catalog)
}

/// Build the pools for a run over `source`, optionally pivoting on a
/// separate `target` tree. A file found by both walks is never compared
/// with itself: it is first dropped from the targets, then the corpus is
/// cleared of whatever targets remain. Shared files therefore end up as
/// candidates, and only target-only files act as pivots.
pub fn harvest_roots(
    source: &Path,
    target: Option<&Path>,
    filter: &ExtensionFilter,
) -> Result<Harvest, HarvestError> {
    let Some(target) = target else {
        let catalog = harvest(source, filter)?;
        return Ok(Harvest {
            targets: catalog.entries,
            others: None,
            dirs: catalog.dirs,
        });
    };

    let targets = harvest(target, filter)?;
    let corpus = harvest(source, filter)?;

    let corpus_paths: HashSet<&Path> = corpus.entries.iter().map(|e| e.path.as_path()).collect();
    let target_entries: Vec<CatalogEntry> = targets
        .entries
        .into_iter()
        .filter(|e| !corpus_paths.contains(e.path.as_path()))
        .collect();

    let target_paths: HashSet<&Path> = target_entries.iter().map(|e| e.path.as_path()).collect();
    let others: Vec<CatalogEntry> = corpus
        .entries
        .iter()
        .filter(|e| !target_paths.contains(e.path.as_path()))
        .cloned()
        .collect();

    if target_entries.is_empty() {
        log::warn!(
            "Every file under {} is also under {}; nothing to pivot on",
            target.display(),
            source.display()
        );
    }

    let mut dirs = targets.dirs;
    dirs.merge(corpus.dirs);

    Ok(Harvest {
        targets: target_entries,
        others: Some(others),
        dirs,
    })
}
