use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::core::vision::Signature;

/// Decoded image dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub height: u32,
    pub width: u32,
    pub channels: u8,
}

impl Shape {
    pub fn new(height: u32, width: u32, channels: u8) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Height over width, rounded to four decimal places.
    pub fn aspect_ratio(&self) -> f64 {
        let ratio = self.height as f64 / self.width.max(1) as f64;
        (ratio * 10_000.0).round() / 10_000.0
    }
}

/// One candidate file. The signature lives only between extraction and
/// the end of its clustering pass and is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Shape>,
    #[serde(skip)]
    pub signature: Option<Signature>,
    #[serde(default)]
    pub target: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<f64>,
}

impl CatalogEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            shape: None,
            signature: None,
            target: false,
            diff: None,
        }
    }

    /// Directory that holds the file.
    pub fn parent(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }
}

/// A group of entries judged similar to a single pivot.
///
/// Clusters come out of the match engine pivot-first. Once loaded for
/// triage they are kept in path order so positional references and undo
/// reinsertion agree with each other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cluster {
    entries: Vec<CatalogEntry>,
}

impl Cluster {
    pub fn new(mut pivot: CatalogEntry) -> Self {
        pivot.target = true;
        pivot.diff = None;
        Self {
            entries: vec![pivot],
        }
    }

    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, entry: CatalogEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A cluster with a single remaining entry offers nothing to act on.
    pub fn is_active(&self) -> bool {
        self.entries.len() > 1
    }

    pub fn pivot(&self) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.target)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&CatalogEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    pub fn position_of(&self, path: &Path) -> Option<usize> {
        self.entries.iter().position(|e| e.path == path)
    }

    pub fn remove(&mut self, index: usize) -> CatalogEntry {
        self.entries.remove(index)
    }

    pub fn sort_by_path(&mut self) {
        self.entries.sort_by(|a, b| a.path.cmp(&b.path));
    }

    /// Insert keeping path order; returns the index used.
    pub fn insert_sorted(&mut self, entry: CatalogEntry) -> usize {
        let index = self.entries.partition_point(|e| e.path < entry.path);
        self.entries.insert(index, entry);
        index
    }

    /// Drop entries whose file no longer exists, returning their paths.
    pub fn prune_missing(&mut self) -> Vec<PathBuf> {
        let mut missing = Vec::new();
        self.entries.retain(|e| {
            let exists = e.path.exists();
            if !exists {
                missing.push(e.path.clone());
            }
            exists
        });
        missing
    }

    pub fn into_entries(self) -> Vec<CatalogEntry> {
        self.entries
    }
}

/// Directory identity after lexical normalization (`.` dropped, `..`
/// folded into its parent). Symlinks are not resolved.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirKey(PathBuf);

impl DirKey {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut normalized = PathBuf::new();
        for component in path.as_ref().components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        normalized.push(component);
                    }
                }
                other => normalized.push(other),
            }
        }
        Self(normalized)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl From<&Path> for DirKey {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryCount {
    pub total: u64,
    pub duplicates: u64,
}

impl DirectoryCount {
    /// Share of this directory's files that landed in a cluster.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.duplicates as f64 / self.total as f64
        }
    }
}

/// Per-directory file and duplicate counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectoryStats(BTreeMap<DirKey, DirectoryCount>);

impl DirectoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a directory even if it ends up holding no matching files.
    pub fn visit_dir(&mut self, dir: &Path) {
        self.0.entry(DirKey::new(dir)).or_default();
    }

    pub fn record_file(&mut self, dir: &Path) {
        self.0.entry(DirKey::new(dir)).or_default().total += 1;
    }

    /// Count one clustered entry against its directory. Directories that
    /// were never harvested are ignored so `duplicates <= total` holds.
    pub fn record_duplicate(&mut self, dir: &Path) {
        match self.0.get_mut(&DirKey::new(dir)) {
            Some(count) if count.duplicates < count.total => count.duplicates += 1,
            Some(_) => log::debug!("duplicate count for {} already at total", dir.display()),
            None => log::debug!("no harvest record for {}", dir.display()),
        }
    }

    pub fn get(&self, dir: &Path) -> Option<&DirectoryCount> {
        self.0.get(&DirKey::new(dir))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &DirectoryCount)> {
        self.0.iter().map(|(k, v)| (k.as_path(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Union of two maps. A directory already present keeps its record,
    /// which is what nested roots need since both walks counted it.
    pub fn merge(&mut self, other: DirectoryStats) {
        for (key, count) in other.0 {
            self.0.entry(key).or_insert(count);
        }
    }
}

#[derive(Serialize, Deserialize)]
struct FailureRecord {
    recorded_at: DateTime<Utc>,
    paths: Vec<PathBuf>,
}

/// Paths that could not be decoded or compared during a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureList {
    paths: Vec<PathBuf>,
}

impl FailureList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn extend(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        self.paths.extend(paths);
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let record = FailureRecord {
            recorded_at: Utc::now(),
            paths: self.paths.clone(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        fs::write(path, json)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let record: FailureRecord = serde_json::from_slice(&fs::read(path)?)?;
        Ok(Self {
            paths: record.paths,
        })
    }
}
