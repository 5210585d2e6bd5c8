use indicatif::ProgressBar;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;

use crate::core::catalog::FailureList;
use crate::core::extract::Extractor;
use crate::core::harvest::{ExtensionFilter, HarvestError, check_root, harvest_roots};
use crate::core::matcher::{MatchEngine, MatchParams, PairDistance, Pools};
use crate::core::store::{ResultStore, StoreError, StoreHeader};
use crate::core::vision::Method;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Harvest(#[from] HarvestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("{count} cluster(s) could not be persisted, first error: {source}")]
    Append {
        count: usize,
        #[source]
        source: StoreError,
    },

    #[error("Failed to write failure list {path}: {source}")]
    FailureList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a scan needs.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub store_path: PathBuf,
    pub failed_path: PathBuf,
    pub method: Method,
    pub params: MatchParams,
    pub extensions: Vec<String>,
}

impl ScanRequest {
    /// Request with the store and failure list placed in `source`.
    pub fn new(
        source: impl Into<PathBuf>,
        method: Method,
        params: MatchParams,
        extensions: Vec<String>,
    ) -> Self {
        let source = source.into();
        let (store_path, failed_path) = default_outputs(&source);
        Self {
            source,
            target: None,
            store_path,
            failed_path,
            method,
            params,
            extensions,
        }
    }
}

/// `simcull_<dir>.jsonl` and `failed_<dir>.json` inside `source`.
pub fn default_outputs(source: &Path) -> (PathBuf, PathBuf) {
    let absolute = std::path::absolute(source).unwrap_or_else(|_| source.to_path_buf());
    let name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    (
        source.join(format!("simcull_{name}.jsonl")),
        source.join(format!("failed_{name}.json")),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSummary {
    pub store: PathBuf,
    pub files: usize,
    pub clusters: usize,
    pub clustered_files: usize,
    pub failures: usize,
    /// Written only when something failed.
    pub failed_list: Option<PathBuf>,
}

/// Run `f`, log how long it took under `label`, and return its result.
pub fn timed<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    log::info!("{} took {:.2?}", label, start.elapsed());
    result
}

fn build_pool() -> Result<ThreadPool, PipelineError> {
    let threads = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("simcull-worker-{i}"))
        .build()?;
    log::debug!("Worker pool with {threads} threads");
    Ok(pool)
}

/// Harvest, extract and cluster, persisting clusters as they are found.
///
/// Cluster appends run on the worker pool while the engine keeps going;
/// the stats trailer is written only after every append has finished.
pub fn run_scan(request: &ScanRequest, progress: &ProgressBar) -> Result<ScanSummary, PipelineError> {
    let source = check_root(&request.source)?;
    let target = request.target.as_deref().map(check_root).transpose()?;

    let filter = ExtensionFilter::new(&request.extensions);
    let store = ResultStore::create(
        &request.store_path,
        &StoreHeader {
            source: source.clone(),
            target: target.clone(),
            extensions: filter.suffixes().to_vec(),
        },
    )?;

    progress.set_message("harvesting");
    let harvest = timed("harvest", || harvest_roots(&source, target.as_deref(), &filter))?;
    let files = harvest.file_count();
    log::info!(
        "Found {} files in {} directories",
        files,
        harvest.dirs.len()
    );

    let pool = build_pool()?;
    let vision = request.method.vision();
    let extractor = Extractor::new(vision.as_ref(), &pool);
    let mut failures = FailureList::new();

    progress.set_message(format!("extracting ({})", request.method));
    let (targets, others) = timed("extraction", || {
        let targets = extractor.extract_all(harvest.targets, &mut failures, progress);
        let others = harvest
            .others
            .map(|others| extractor.extract_all(others, &mut failures, progress));
        (targets, others)
    });

    let engine = MatchEngine::new(vision.as_ref(), request.params);
    let mut stats = harvest.dirs;
    let append_errors: Mutex<Vec<StoreError>> = Mutex::new(Vec::new());

    progress.set_message("clustering");
    let outcome = timed("clustering", || {
        pool.in_place_scope(|scope| {
            let store = &store;
            let append_errors = &append_errors;
            engine.run(Pools::new(targets, others), &mut stats, progress, |cluster| {
                scope.spawn(move |_| {
                    if let Err(err) = store.append(cluster) {
                        log::error!("{err}");
                        append_errors
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(err);
                    }
                });
            })
        })
    });

    let append_errors = append_errors
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner);
    let count = append_errors.len();
    if let Some(source) = append_errors.into_iter().next() {
        return Err(PipelineError::Append { count, source });
    }

    let store = store.finish(&stats)?;
    failures.extend(outcome.failures);

    let failed_list = if failures.is_empty() {
        None
    } else {
        failures
            .save(&request.failed_path)
            .map_err(|source| PipelineError::FailureList {
                path: request.failed_path.clone(),
                source,
            })?;
        log::warn!(
            "{} file(s) could not be processed, see {}",
            failures.len(),
            request.failed_path.display()
        );
        Some(request.failed_path.clone())
    };

    log::info!(
        "{} clusters, {} clustered files, stored in {}",
        outcome.clusters,
        outcome.clustered_entries,
        store.display()
    );

    Ok(ScanSummary {
        store,
        files,
        clusters: outcome.clusters,
        clustered_files: outcome.clustered_entries,
        failures: failures.len(),
        failed_list,
    })
}

/// Signature distance of every pivot/candidate pair, without clustering.
pub fn measure_distances(
    source: &Path,
    target: Option<&Path>,
    method: Method,
    extensions: &[String],
    progress: &ProgressBar,
) -> Result<Vec<PairDistance>, PipelineError> {
    let filter = ExtensionFilter::new(extensions);
    let harvest = harvest_roots(source, target, &filter)?;

    let pool = build_pool()?;
    let vision = method.vision();
    let extractor = Extractor::new(vision.as_ref(), &pool);
    let mut failures = FailureList::new();

    let targets = extractor.extract_all(harvest.targets, &mut failures, progress);
    let others = harvest
        .others
        .map(|others| extractor.extract_all(others, &mut failures, progress));
    for path in failures.paths() {
        log::warn!("Skipped {}", path.display());
    }

    let params = MatchParams {
        threshold: 0.0,
        aspect_tolerance: 0.0,
    };
    Ok(MatchEngine::new(vision.as_ref(), params).distances(&Pools::new(targets, others)))
}
