use image::{DynamicImage, GenericImageView, ImageReader};
use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::ThreadPool;
use rayon::prelude::*;
use std::path::Path;

use crate::core::catalog::{CatalogEntry, FailureList, Shape};
use crate::core::vision::Vision;

/// Decodes images and attaches shape and signature on a bounded pool.
pub struct Extractor<'a> {
    vision: &'a dyn Vision,
    pool: &'a ThreadPool,
}

impl<'a> Extractor<'a> {
    pub fn new(vision: &'a dyn Vision, pool: &'a ThreadPool) -> Self {
        Self { vision, pool }
    }

    /// Enrich one entry. The flag is false when the file could not be
    /// decoded or produced no signature; the entry is then returned as is.
    pub fn extract(&self, mut entry: CatalogEntry) -> (bool, CatalogEntry) {
        let Some(image) = decode(&entry.path) else {
            return (false, entry);
        };

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            log::warn!("Empty image: {}", entry.path.display());
            return (false, entry);
        }

        match self.vision.compute_signature(&image) {
            Some(signature) => {
                entry.shape = Some(Shape::new(height, width, image.color().channel_count()));
                entry.signature = Some(signature);
                (true, entry)
            }
            None => {
                log::warn!("No signature for {}", entry.path.display());
                (false, entry)
            }
        }
    }

    /// Extract a whole pool and wait for every task before returning.
    /// Entries keep their input order; failed paths go to `failures`.
    pub fn extract_all(
        &self,
        entries: Vec<CatalogEntry>,
        failures: &mut FailureList,
        progress: &ProgressBar,
    ) -> Vec<CatalogEntry> {
        progress.set_length(entries.len() as u64);
        progress.set_position(0);

        let results: Vec<(bool, CatalogEntry)> = self.pool.install(|| {
            entries
                .into_par_iter()
                .progress_with(progress.clone())
                .map(|entry| self.extract(entry))
                .collect()
        });

        let mut extracted = Vec::with_capacity(results.len());
        for (success, entry) in results {
            if success {
                extracted.push(entry);
            } else {
                failures.push(entry.path);
            }
        }
        extracted
    }
}

fn decode(path: &Path) -> Option<DynamicImage> {
    let reader = match ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
        Ok(reader) => reader,
        Err(err) => {
            log::warn!("Failed to open {}: {}", path.display(), err);
            return None;
        }
    };
    match reader.decode() {
        Ok(image) => Some(image),
        Err(err) => {
            log::warn!("Failed to decode {}: {}", path.display(), err);
            None
        }
    }
}
