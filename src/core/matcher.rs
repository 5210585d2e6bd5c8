//! Greedy pairwise reduction.
//!
//! Each pass pops one pivot from the target pool and compares it against
//! a snapshot of the candidate pool. Candidates within both thresholds
//! join the pivot's cluster and leave the pool for good. Membership is
//! decided by direct comparison with the current pivot only: if A~B and
//! B~C but not A~C, and B is consumed by an earlier pivot, A and C are
//! never merged. Clustering is therefore not transitive.

use indicatif::ProgressBar;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::core::catalog::{CatalogEntry, Cluster, DirectoryStats};
use crate::core::vision::Vision;

/// Dual thresholds for a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchParams {
    /// Maximum signature distance, in the method's own units.
    pub threshold: f64,
    /// Maximum absolute difference of height/width ratios.
    pub aspect_tolerance: f64,
}

/// Entries to cluster. With a single tree the targets are their own
/// candidates; with two trees only `others` is ever consumed by matches.
#[derive(Debug, Clone)]
pub enum Pools {
    Single(Vec<CatalogEntry>),
    Split {
        targets: Vec<CatalogEntry>,
        others: Vec<CatalogEntry>,
    },
}

impl Pools {
    pub fn new(targets: Vec<CatalogEntry>, others: Option<Vec<CatalogEntry>>) -> Self {
        match others {
            Some(others) => Pools::Split { targets, others },
            None => Pools::Single(targets),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Same(f64),
    Different(f64),
    /// Distance could not be computed.
    Failed,
}

#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub clusters: usize,
    pub clustered_entries: usize,
    /// Entries dropped because they could not be compared.
    pub failures: Vec<PathBuf>,
}

/// One pivot/candidate pair and its distance, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct PairDistance {
    pub pivot: PathBuf,
    pub other: PathBuf,
    pub distance: Option<f64>,
}

pub struct MatchEngine<'a> {
    vision: &'a dyn Vision,
    params: MatchParams,
}

impl<'a> MatchEngine<'a> {
    pub fn new(vision: &'a dyn Vision, params: MatchParams) -> Self {
        Self { vision, params }
    }

    pub fn params(&self) -> MatchParams {
        self.params
    }

    pub fn compare(&self, pivot: &CatalogEntry, other: &CatalogEntry) -> Verdict {
        let (Some(a), Some(b)) = (&pivot.signature, &other.signature) else {
            return Verdict::Failed;
        };
        let (Some(shape_a), Some(shape_b)) = (pivot.shape, other.shape) else {
            return Verdict::Failed;
        };
        let Some(distance) = self.vision.distance(a, b) else {
            return Verdict::Failed;
        };

        let aspect_gap = (shape_a.aspect_ratio() - shape_b.aspect_ratio()).abs();
        if distance <= self.params.threshold && aspect_gap <= self.params.aspect_tolerance {
            Verdict::Same(distance)
        } else {
            Verdict::Different(distance)
        }
    }

    /// Cluster the pools. Every cluster with more than one member is handed
    /// to `sink` as soon as its pass ends; singletons are dropped.
    pub fn run<F>(
        &self,
        pools: Pools,
        stats: &mut DirectoryStats,
        progress: &ProgressBar,
        mut sink: F,
    ) -> MatchOutcome
    where
        F: FnMut(Cluster),
    {
        let (mut arena, mut targets, mut others, shared) = into_arena(pools);
        let mut outcome = MatchOutcome::default();

        progress.set_length(targets.len() as u64);
        progress.set_position(0);

        while let Some(pivot_index) = targets.pop() {
            progress.inc(1);
            let Some(mut pivot) = arena[pivot_index].take() else {
                continue;
            };
            if pivot.signature.is_none() || pivot.shape.is_none() {
                outcome.failures.push(pivot.path);
                continue;
            }
            progress.set_message(display_name(&pivot));

            // The popped pivot is already gone from a shared pool, so it
            // never meets itself.
            let candidates = if shared { &mut targets } else { &mut others };

            let mut matched: Vec<(usize, f64)> = Vec::new();
            let mut failed: Vec<usize> = Vec::new();
            for &index in candidates.iter() {
                let Some(other) = arena[index].as_ref() else {
                    continue;
                };
                match self.compare(&pivot, other) {
                    Verdict::Same(distance) => matched.push((index, distance)),
                    Verdict::Failed => failed.push(index),
                    Verdict::Different(_) => {}
                }
            }

            if !matched.is_empty() || !failed.is_empty() {
                let consumed: HashSet<usize> = matched
                    .iter()
                    .map(|(index, _)| *index)
                    .chain(failed.iter().copied())
                    .collect();
                candidates.retain(|index| !consumed.contains(index));
            }

            pivot.signature = None;
            let mut cluster = Cluster::new(pivot);
            for (index, distance) in matched {
                if let Some(mut other) = arena[index].take() {
                    other.signature = None;
                    other.target = false;
                    other.diff = Some(distance);
                    stats.record_duplicate(other.parent());
                    cluster.push(other);
                }
            }
            for index in failed {
                if let Some(entry) = arena[index].take() {
                    log::warn!("Could not compare {}", entry.path.display());
                    outcome.failures.push(entry.path);
                }
            }

            if cluster.is_active() {
                if let Some(pivot) = cluster.pivot() {
                    stats.record_duplicate(pivot.parent());
                }
                log::debug!(
                    "Cluster of {} around {}",
                    cluster.len(),
                    cluster.pivot().map(display_name).unwrap_or_default()
                );
                outcome.clusters += 1;
                outcome.clustered_entries += cluster.len();
                sink(cluster);
            }
        }

        outcome
    }

    /// Distance of every pivot/candidate pair in pass order, without
    /// clustering anything.
    pub fn distances(&self, pools: &Pools) -> Vec<PairDistance> {
        let pair = |pivot: &CatalogEntry, other: &CatalogEntry| PairDistance {
            pivot: pivot.path.clone(),
            other: other.path.clone(),
            distance: match (&pivot.signature, &other.signature) {
                (Some(a), Some(b)) => self.vision.distance(a, b),
                _ => None,
            },
        };

        let mut result = Vec::new();
        match pools {
            Pools::Single(entries) => {
                for (i, pivot) in entries.iter().enumerate().rev() {
                    result.extend(entries[..i].iter().map(|other| pair(pivot, other)));
                }
            }
            Pools::Split { targets, others } => {
                for pivot in targets.iter().rev() {
                    result.extend(others.iter().map(|other| pair(pivot, other)));
                }
            }
        }
        result
    }
}

fn into_arena(pools: Pools) -> (Vec<Option<CatalogEntry>>, Vec<usize>, Vec<usize>, bool) {
    match pools {
        Pools::Single(entries) => {
            let targets = (0..entries.len()).collect();
            let arena = entries.into_iter().map(Some).collect();
            (arena, targets, Vec::new(), true)
        }
        Pools::Split { targets, others } => {
            let split = targets.len();
            let total = split + others.len();
            let arena = targets.into_iter().chain(others).map(Some).collect();
            (arena, (0..split).collect(), (split..total).collect(), false)
        }
    }
}

fn display_name(entry: &CatalogEntry) -> String {
    let parent = entry
        .parent()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = entry
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{parent} {name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::Shape;
    use crate::core::vision::Signature;
    use image::DynamicImage;
    use std::path::Path;

    /// Signatures are single numbers; distance is their absolute gap.
    struct LineVision;

    impl Vision for LineVision {
        fn compute_signature(&self, _image: &DynamicImage) -> Option<Signature> {
            None
        }

        fn distance(&self, a: &Signature, b: &Signature) -> Option<f64> {
            match (a, b) {
                (Signature::Tiles(a), Signature::Tiles(b)) if !a.is_empty() && !b.is_empty() => {
                    Some((a[0] - b[0]).abs() as f64)
                }
                _ => None,
            }
        }
    }

    fn entry(path: &str, value: f32) -> CatalogEntry {
        shaped(path, value, Shape::new(100, 100, 3))
    }

    fn shaped(path: &str, value: f32, shape: Shape) -> CatalogEntry {
        let mut entry = CatalogEntry::new(path);
        entry.shape = Some(shape);
        entry.signature = Some(Signature::Tiles(vec![value]));
        entry
    }

    fn stats_for(entries: &[CatalogEntry]) -> DirectoryStats {
        let mut stats = DirectoryStats::new();
        for e in entries {
            stats.record_file(e.parent());
        }
        stats
    }

    fn params(threshold: f64) -> MatchParams {
        MatchParams {
            threshold,
            aspect_tolerance: 0.2,
        }
    }

    fn membership(clusters: &[Cluster]) -> Vec<Vec<PathBuf>> {
        let mut groups: Vec<Vec<PathBuf>> = clusters
            .iter()
            .map(|c| {
                let mut paths: Vec<PathBuf> = c.iter().map(|e| e.path.clone()).collect();
                paths.sort();
                paths
            })
            .collect();
        groups.sort();
        groups
    }

    fn run(entries: Vec<CatalogEntry>, threshold: f64) -> (Vec<Cluster>, MatchOutcome, DirectoryStats) {
        let mut stats = stats_for(&entries);
        let engine = MatchEngine::new(&LineVision, params(threshold));
        let mut clusters = Vec::new();
        let outcome = engine.run(
            Pools::Single(entries),
            &mut stats,
            &ProgressBar::hidden(),
            |c| clusters.push(c),
        );
        (clusters, outcome, stats)
    }

    #[test]
    fn test_two_pairs_and_a_loner() {
        let entries = vec![
            entry("/p/a.jpg", 0.0),
            entry("/p/b.jpg", 2.0),
            entry("/p/c.jpg", 20.0),
            entry("/p/d.jpg", 23.0),
            entry("/p/e.jpg", 63.0),
        ];
        let (clusters, outcome, stats) = run(entries, 4.0);

        assert_eq!(
            membership(&clusters),
            vec![
                vec![PathBuf::from("/p/a.jpg"), PathBuf::from("/p/b.jpg")],
                vec![PathBuf::from("/p/c.jpg"), PathBuf::from("/p/d.jpg")],
            ]
        );
        assert_eq!(outcome.clusters, 2);
        assert_eq!(outcome.clustered_entries, 4);
        assert!(outcome.failures.is_empty());

        let count = stats.get(Path::new("/p")).unwrap();
        assert_eq!(count.total, 5);
        assert_eq!(count.duplicates, 4);
    }

    #[test]
    fn test_cluster_shape_pivot_first_with_diffs() {
        let (clusters, _, _) = run(vec![entry("/p/a.jpg", 0.0), entry("/p/b.jpg", 3.0)], 4.0);
        assert_eq!(clusters.len(), 1);

        let members = clusters[0].entries();
        // The last entry is popped first.
        assert_eq!(members[0].path, PathBuf::from("/p/b.jpg"));
        assert!(members[0].target);
        assert_eq!(members[0].diff, None);
        assert_eq!(members[1].diff, Some(3.0));
        assert!(!members[1].target);
        assert!(members.iter().all(|e| e.signature.is_none()));
    }

    #[test]
    fn test_clustering_is_not_transitive() {
        // c is popped first and takes b; a is only close to b, so it is left alone.
        let entries = vec![
            entry("/p/a.jpg", 0.0),
            entry("/p/b.jpg", 3.0),
            entry("/p/c.jpg", 6.0),
        ];
        let (clusters, _, _) = run(entries, 4.0);
        assert_eq!(
            membership(&clusters),
            vec![vec![PathBuf::from("/p/b.jpg"), PathBuf::from("/p/c.jpg")]]
        );
    }

    #[test]
    fn test_entries_belong_to_at_most_one_cluster() {
        let entries: Vec<CatalogEntry> = (0..30)
            .map(|i| entry(&format!("/p/{i:02}.jpg"), (i % 7) as f32 * 1.5))
            .collect();
        let (clusters, _, _) = run(entries, 2.0);

        let mut seen = HashSet::new();
        for cluster in &clusters {
            assert!(cluster.len() > 1);
            for e in cluster.iter() {
                assert!(seen.insert(e.path.clone()), "{} clustered twice", e.path.display());
            }
        }
    }

    #[test]
    fn test_membership_is_deterministic() {
        let make = || -> Vec<CatalogEntry> {
            (0..20)
                .map(|i| entry(&format!("/p/{i:02}.jpg"), ((i * 7) % 11) as f32))
                .collect()
        };
        let (first, _, _) = run(make(), 1.0);
        let (second, _, _) = run(make(), 1.0);
        assert_eq!(membership(&first), membership(&second));
    }

    #[test]
    fn test_aspect_ratio_gate() {
        let entries = vec![
            shaped("/p/square.jpg", 0.0, Shape::new(100, 100, 3)),
            shaped("/p/wide.jpg", 0.0, Shape::new(50, 100, 3)),
        ];
        let (clusters, _, _) = run(entries, 4.0);
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_incomparable_candidates_become_failures() {
        let mut broken = CatalogEntry::new("/p/broken.jpg");
        broken.shape = Some(Shape::new(100, 100, 3));
        broken.signature = Some(Signature::Tiles(Vec::new()));

        let entries = vec![broken, entry("/p/b.jpg", 1.0), entry("/p/c.jpg", 2.0)];
        let (clusters, outcome, _) = run(entries, 4.0);

        assert_eq!(outcome.failures, vec![PathBuf::from("/p/broken.jpg")]);
        assert_eq!(
            membership(&clusters),
            vec![vec![PathBuf::from("/p/b.jpg"), PathBuf::from("/p/c.jpg")]]
        );
    }

    #[test]
    fn test_split_pools_only_consume_others() {
        let targets = vec![entry("/t/x.jpg", 0.0), entry("/t/y.jpg", 0.5)];
        let others = vec![
            entry("/c/x.jpg", 0.0),
            entry("/c/y.jpg", 0.4),
            entry("/c/far.jpg", 50.0),
        ];
        let mut stats = stats_for(&targets);
        stats.merge(stats_for(&others));

        let engine = MatchEngine::new(&LineVision, params(1.0));
        let mut clusters = Vec::new();
        engine.run(
            Pools::Split { targets, others },
            &mut stats,
            &ProgressBar::hidden(),
            |c| clusters.push(c),
        );

        // y pivots first and claims both close candidates; x finds nothing left.
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].entries()[0].path, PathBuf::from("/t/y.jpg"));
        assert_eq!(
            membership(&clusters),
            vec![vec![
                PathBuf::from("/c/x.jpg"),
                PathBuf::from("/c/y.jpg"),
                PathBuf::from("/t/y.jpg"),
            ]]
        );
        assert_eq!(stats.get(Path::new("/t")).unwrap().duplicates, 1);
        assert_eq!(stats.get(Path::new("/c")).unwrap().duplicates, 2);
    }

    #[test]
    fn test_distances_cover_every_pair_once() {
        let pools = Pools::Single(vec![
            entry("/p/a.jpg", 0.0),
            entry("/p/b.jpg", 2.0),
            entry("/p/c.jpg", 5.0),
        ]);
        let engine = MatchEngine::new(&LineVision, params(1.0));
        let pairs = engine.distances(&pools);
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].pivot, PathBuf::from("/p/c.jpg"));
        assert_eq!(pairs[0].distance, Some(5.0));
    }
}
