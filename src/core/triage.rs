use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::catalog::{CatalogEntry, Cluster};
use crate::core::fsops::{move_file, unique_destination};
use crate::core::ledger::{LedgerError, LedgerFile, LedgerLine};

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} -> {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot derive a file name from {path}")]
    NoFileName { path: PathBuf },

    #[error("{path} is not valid UTF-8 and cannot be recorded")]
    NonUtf8Path { path: PathBuf },

    #[error("Cannot move back to {path}: a file is already there")]
    Occupied { path: PathBuf },
}

/// Position of an entry in the session's cluster list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryRef {
    pub cluster: usize,
    pub entry: usize,
}

impl EntryRef {
    pub fn new(cluster: usize, entry: usize) -> Self {
        Self { cluster, entry }
    }
}

/// In-memory mirror of one ledger line. `origin` is `None` for replayed
/// moves whose source is not part of the loaded clusters.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub origin: Option<EntryRef>,
    pub entry: CatalogEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMove {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub origin: EntryRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversedMove {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Where the entry went back, if it did.
    pub reinserted: Option<EntryRef>,
    /// False when the moved file had vanished and nothing was moved back.
    pub restored: bool,
}

/// Operator session over a loaded cluster list.
///
/// Clusters are never removed from the list, so indices stay valid for the
/// whole session; a cluster left with one entry is simply inactive.
pub struct Triage {
    clusters: Vec<Cluster>,
    output_dir: PathBuf,
    ledger: LedgerFile,
    records: Vec<LedgerRecord>,
}

impl Triage {
    /// Start a session. Moves already in the ledger are replayed onto the
    /// clusters so they can still be undone, then entries whose files
    /// disappeared since the scan are pruned.
    pub fn open(
        clusters: Vec<Cluster>,
        output_dir: impl Into<PathBuf>,
        ledger: LedgerFile,
    ) -> Result<Self, TriageError> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(|source| TriageError::OutputDir {
            path: output_dir.clone(),
            source,
        })?;

        let mut triage = Self {
            clusters,
            output_dir,
            ledger,
            records: Vec::new(),
        };
        for cluster in &mut triage.clusters {
            cluster.sort_by_path();
        }

        triage.replay()?;

        for cluster in &mut triage.clusters {
            for path in cluster.prune_missing() {
                log::warn!("not exist: {}", path.display());
            }
        }

        Ok(triage)
    }

    fn replay(&mut self) -> Result<(), TriageError> {
        for line in self.ledger.read()? {
            let found = self
                .clusters
                .iter()
                .enumerate()
                .find_map(|(ci, c)| c.position_of(&line.source).map(|ei| EntryRef::new(ci, ei)));

            let record = match found {
                Some(origin) => LedgerRecord {
                    entry: self.clusters[origin.cluster].remove(origin.entry),
                    source: line.source,
                    destination: line.destination,
                    origin: Some(origin),
                },
                None => {
                    log::debug!("ledger move of {} is outside this store", line.source.display());
                    LedgerRecord {
                        entry: CatalogEntry::new(&line.source),
                        source: line.source,
                        destination: line.destination,
                        origin: None,
                    }
                }
            };
            self.records.push(record);
        }
        if !self.records.is_empty() {
            log::info!("Replayed {} moves from {}", self.records.len(), self.ledger.path().display());
        }
        Ok(())
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Indices of clusters that still have something to act on.
    pub fn active(&self) -> Vec<usize> {
        self.clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_active())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn records(&self) -> &[LedgerRecord] {
        &self.records
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn ledger(&self) -> &LedgerFile {
        &self.ledger
    }

    /// Move the selected entries into the output directory.
    ///
    /// References are resolved against the cluster list as it is when the
    /// call starts; within each cluster they are applied from the highest
    /// index down so earlier removals do not shift later ones.
    pub fn perform(&mut self, selection: &[EntryRef]) -> Result<Vec<AppliedMove>, TriageError> {
        let mut checked: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for reference in selection {
            let in_range = self
                .clusters
                .get(reference.cluster)
                .is_some_and(|c| reference.entry < c.len());
            if in_range {
                checked
                    .entry(reference.cluster)
                    .or_default()
                    .insert(reference.entry);
            } else {
                log::warn!(
                    "Ignoring selection {}:{} outside the cluster list",
                    reference.cluster,
                    reference.entry
                );
            }
        }

        let mut applied = Vec::new();
        for (cluster_index, entries) in checked {
            for entry_index in entries.into_iter().rev() {
                let origin = EntryRef::new(cluster_index, entry_index);
                if let Some(moved) = self.move_out(origin)? {
                    applied.push(moved);
                }
            }
        }
        Ok(applied)
    }

    fn move_out(&mut self, origin: EntryRef) -> Result<Option<AppliedMove>, TriageError> {
        let cluster = &mut self.clusters[origin.cluster];
        let source = cluster.entries()[origin.entry].path.clone();

        if !source.exists() {
            log::warn!("not exist: {}", source.display());
            cluster.remove(origin.entry);
            return Ok(None);
        }

        let name = source.file_name().ok_or_else(|| TriageError::NoFileName {
            path: source.clone(),
        })?;
        let destination = unique_destination(&self.output_dir, Path::new(name));
        for path in [&source, &destination] {
            if path.to_str().is_none() {
                return Err(TriageError::NonUtf8Path { path: path.clone() });
            }
        }

        move_file(&source, &destination).map_err(|err| TriageError::Move {
            from: source.clone(),
            to: destination.clone(),
            source: err,
        })?;
        log::info!("{}\n    -> {}", source.display(), destination.display());

        // An unrecorded move could not be undone; put the file back.
        if let Err(err) = self.ledger.append(&LedgerLine::new(&source, &destination)) {
            match move_file(&destination, &source) {
                Ok(()) => log::warn!("Ledger write failed, moved {} back", source.display()),
                Err(back) => log::error!(
                    "Ledger write failed and {} could not be moved back to {}: {}",
                    destination.display(),
                    source.display(),
                    back
                ),
            }
            return Err(err.into());
        }

        let entry = cluster.remove(origin.entry);
        self.records.push(LedgerRecord {
            source: source.clone(),
            destination: destination.clone(),
            origin: Some(origin),
            entry,
        });

        Ok(Some(AppliedMove {
            source,
            destination,
            origin,
        }))
    }

    /// Reverse the most recent move of the whole session.
    pub fn undo(&mut self) -> Result<Option<ReversedMove>, TriageError> {
        let Some(record) = self.records.pop() else {
            return Ok(None);
        };

        let restored = if record.destination.exists() {
            if record.source.exists() {
                log::warn!(
                    "{} is occupied, leaving {} where it is",
                    record.source.display(),
                    record.destination.display()
                );
                let error = TriageError::Occupied {
                    path: record.source.clone(),
                };
                self.records.push(record);
                return Err(error);
            }
            if let Err(err) = move_file(&record.destination, &record.source) {
                let error = TriageError::Move {
                    from: record.destination.clone(),
                    to: record.source.clone(),
                    source: err,
                };
                self.records.push(record);
                return Err(error);
            }
            true
        } else {
            log::warn!(
                "{} no longer exists, nothing to move back",
                record.destination.display()
            );
            false
        };

        match self.ledger.pop()? {
            Some(line) if line.source == record.source && line.destination == record.destination => {}
            other => log::warn!(
                "Ledger {} was out of step with the session (last line: {:?})",
                self.ledger.path().display(),
                other
            ),
        }

        let reinserted = match (restored, record.origin) {
            (true, Some(origin)) => self.clusters.get_mut(origin.cluster).map(|cluster| {
                let index = cluster.insert_sorted(record.entry);
                EntryRef::new(origin.cluster, index)
            }),
            _ => None,
        };

        Ok(Some(ReversedMove {
            source: record.source,
            destination: record.destination,
            reinserted,
            restored,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        root: PathBuf,
        out: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path().join("photos");
            let out = temp_dir.path().join("output");
            fs::create_dir_all(&root).unwrap();
            Self {
                _temp_dir: temp_dir,
                root,
                out,
            }
        }

        fn file(&self, rel: &str) -> PathBuf {
            let path = self.root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, rel.as_bytes()).unwrap();
            path
        }

        fn cluster(&self, rels: &[&str]) -> Cluster {
            let mut entries = rels.iter().map(|r| CatalogEntry::new(self.file(r)));
            let mut cluster = Cluster::new(entries.next().unwrap());
            for entry in entries {
                cluster.push(entry);
            }
            cluster
        }

        fn ledger(&self) -> LedgerFile {
            LedgerFile::new(self.out.join("record.txt"))
        }

        fn open(&self, clusters: Vec<Cluster>) -> Triage {
            Triage::open(clusters, &self.out, self.ledger()).unwrap()
        }
    }

    #[test]
    fn test_perform_then_undo_restores_everything() {
        let fx = Fixture::new();
        let mut triage = fx.open(vec![fx.cluster(&["a.jpg", "b.jpg", "c.jpg"])]);
        let before = triage.clusters().to_vec();

        let applied = triage.perform(&[EntryRef::new(0, 1)]).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].destination, fx.out.join("b.jpg"));
        assert!(!fx.root.join("b.jpg").exists());
        assert!(fx.out.join("b.jpg").exists());
        assert_eq!(triage.clusters()[0].len(), 2);
        assert_eq!(triage.ledger().read().unwrap().len(), 1);

        let reversed = triage.undo().unwrap().unwrap();
        assert!(reversed.restored);
        assert_eq!(reversed.reinserted, Some(EntryRef::new(0, 1)));
        assert!(fx.root.join("b.jpg").exists());
        assert!(!fx.out.join("b.jpg").exists());
        assert_eq!(triage.clusters(), before.as_slice());
        assert!(triage.ledger().read().unwrap().is_empty());

        assert_eq!(triage.undo().unwrap(), None);
    }

    #[test]
    fn test_two_member_cluster_goes_inert_and_comes_back() {
        let fx = Fixture::new();
        let mut triage = fx.open(vec![fx.cluster(&["a.jpg", "b.jpg"])]);
        assert_eq!(triage.active(), vec![0]);

        triage.perform(&[EntryRef::new(0, 0)]).unwrap();
        assert!(triage.active().is_empty());
        assert_eq!(triage.clusters().len(), 1);
        assert_eq!(triage.clusters()[0].len(), 1);

        triage.undo().unwrap();
        assert_eq!(triage.active(), vec![0]);
        assert_eq!(triage.clusters()[0].len(), 2);
    }

    #[test]
    fn test_batch_removal_uses_descending_indices() {
        let fx = Fixture::new();
        let mut triage = fx.open(vec![
            fx.cluster(&["a.jpg", "b.jpg", "c.jpg", "d.jpg"]),
            fx.cluster(&["e.jpg", "f.jpg"]),
        ]);

        let applied = triage
            .perform(&[
                EntryRef::new(0, 1),
                EntryRef::new(0, 3),
                EntryRef::new(1, 0),
                EntryRef::new(0, 1),
                EntryRef::new(7, 0),
            ])
            .unwrap();

        let moved: Vec<&str> = applied
            .iter()
            .map(|m| m.source.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(moved, vec!["d.jpg", "b.jpg", "e.jpg"]);

        let left: Vec<PathBuf> = triage.clusters()[0].iter().map(|e| e.path.clone()).collect();
        assert_eq!(left, vec![fx.root.join("a.jpg"), fx.root.join("c.jpg")]);

        // LIFO across clusters.
        assert_eq!(triage.undo().unwrap().unwrap().source, fx.root.join("e.jpg"));
        assert_eq!(triage.undo().unwrap().unwrap().source, fx.root.join("b.jpg"));
        assert_eq!(triage.undo().unwrap().unwrap().source, fx.root.join("d.jpg"));
        let restored: Vec<PathBuf> = triage.clusters()[0].iter().map(|e| e.path.clone()).collect();
        assert_eq!(
            restored,
            vec![
                fx.root.join("a.jpg"),
                fx.root.join("b.jpg"),
                fx.root.join("c.jpg"),
                fx.root.join("d.jpg"),
            ]
        );
    }

    #[test]
    fn test_same_basename_does_not_overwrite() {
        let fx = Fixture::new();
        let mut triage = fx.open(vec![fx.cluster(&["x/cat.jpg", "y/cat.jpg", "z/cat.jpg"])]);

        let applied = triage
            .perform(&[EntryRef::new(0, 0), EntryRef::new(0, 1)])
            .unwrap();
        let destinations: Vec<PathBuf> = applied.iter().map(|m| m.destination.clone()).collect();
        assert_eq!(
            destinations,
            vec![fx.out.join("cat.jpg"), fx.out.join("cat#01.jpg")]
        );
        assert_eq!(fs::read(fx.out.join("cat.jpg")).unwrap(), b"y/cat.jpg");
        assert_eq!(fs::read(fx.out.join("cat#01.jpg")).unwrap(), b"x/cat.jpg");
    }

    #[test]
    fn test_missing_source_is_skipped() {
        let fx = Fixture::new();
        let mut triage = fx.open(vec![fx.cluster(&["a.jpg", "b.jpg", "c.jpg"])]);
        fs::remove_file(fx.root.join("b.jpg")).unwrap();

        let applied = triage.perform(&[EntryRef::new(0, 1)]).unwrap();
        assert!(applied.is_empty());
        assert!(triage.records().is_empty());
        assert_eq!(triage.clusters()[0].len(), 2);
    }

    #[test]
    fn test_undo_when_destination_vanished() {
        let fx = Fixture::new();
        let mut triage = fx.open(vec![fx.cluster(&["a.jpg", "b.jpg", "c.jpg"])]);
        triage.perform(&[EntryRef::new(0, 2)]).unwrap();
        fs::remove_file(fx.out.join("c.jpg")).unwrap();

        let reversed = triage.undo().unwrap().unwrap();
        assert!(!reversed.restored);
        assert_eq!(reversed.reinserted, None);
        assert_eq!(triage.clusters()[0].len(), 2);
        assert!(triage.ledger().read().unwrap().is_empty());
    }

    #[test]
    fn test_undo_refuses_an_occupied_source() {
        let fx = Fixture::new();
        let mut triage = fx.open(vec![fx.cluster(&["a.jpg", "b.jpg", "c.jpg"])]);
        triage.perform(&[EntryRef::new(0, 1)]).unwrap();
        fs::write(fx.root.join("b.jpg"), b"NEW FILE").unwrap();

        let result = triage.undo();
        assert!(matches!(
            result,
            Err(TriageError::Occupied { path }) if path == fx.root.join("b.jpg")
        ));
        assert_eq!(fs::read(fx.root.join("b.jpg")).unwrap(), b"NEW FILE");
        assert_eq!(fs::read(fx.out.join("b.jpg")).unwrap(), b"b.jpg");
        assert_eq!(triage.records().len(), 1);
        assert_eq!(triage.ledger().read().unwrap().len(), 1);
        assert_eq!(triage.clusters()[0].len(), 2);

        fs::remove_file(fx.root.join("b.jpg")).unwrap();
        let reversed = triage.undo().unwrap().unwrap();
        assert!(reversed.restored);
        assert_eq!(fs::read(fx.root.join("b.jpg")).unwrap(), b"b.jpg");
        assert!(triage.ledger().read().unwrap().is_empty());
    }

    #[test]
    fn test_failed_ledger_write_puts_the_file_back() {
        let fx = Fixture::new();
        let mut triage = fx.open(vec![fx.cluster(&["a.jpg", "b.jpg", "c.jpg"])]);
        // A directory where the ledger file should be makes every append fail.
        fs::create_dir_all(triage.ledger().path()).unwrap();

        let result = triage.perform(&[EntryRef::new(0, 2)]);
        assert!(matches!(result, Err(TriageError::Ledger(_))));
        assert_eq!(fs::read(fx.root.join("c.jpg")).unwrap(), b"c.jpg");
        assert!(!fx.out.join("c.jpg").exists());
        assert_eq!(triage.clusters()[0].len(), 3);
        assert!(triage.records().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_source_is_not_moved() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let fx = Fixture::new();
        let bad = fx.root.join(OsStr::from_bytes(b"bad\xff.jpg"));
        fs::write(&bad, b"bad").unwrap();
        let mut cluster = fx.cluster(&["a.jpg"]);
        cluster.push(CatalogEntry::new(&bad));
        let mut triage = fx.open(vec![cluster]);
        let index = triage.clusters()[0].position_of(&bad).unwrap();

        let result = triage.perform(&[EntryRef::new(0, index)]);
        assert!(matches!(result, Err(TriageError::NonUtf8Path { path }) if path == bad));
        assert!(bad.exists());
        assert_eq!(triage.clusters()[0].len(), 2);
        assert!(!triage.ledger().path().exists());
    }

    #[test]
    fn test_reopen_replays_the_ledger() {
        let fx = Fixture::new();
        let clusters = vec![fx.cluster(&["a.jpg", "b.jpg", "c.jpg"])];

        {
            let mut triage = fx.open(clusters.clone());
            triage.perform(&[EntryRef::new(0, 0)]).unwrap();
        }

        let mut triage = fx.open(clusters);
        assert_eq!(triage.records().len(), 1);
        assert_eq!(triage.records()[0].origin, Some(EntryRef::new(0, 0)));
        assert_eq!(triage.clusters()[0].len(), 2);

        let reversed = triage.undo().unwrap().unwrap();
        assert_eq!(reversed.reinserted, Some(EntryRef::new(0, 0)));
        assert!(fx.root.join("a.jpg").exists());
        assert_eq!(triage.clusters()[0].len(), 3);
    }

    #[test]
    fn test_open_prunes_vanished_files() {
        let fx = Fixture::new();
        let clusters = vec![fx.cluster(&["a.jpg", "b.jpg", "c.jpg"])];
        fs::remove_file(fx.root.join("a.jpg")).unwrap();

        let triage = fx.open(clusters);
        assert_eq!(triage.clusters()[0].len(), 2);
        assert_eq!(triage.clusters()[0].entries()[0].path, fx.root.join("b.jpg"));
    }
}
