//! Orchestration of one indexing run.
//!
//! root check -> lock -> path set -> load -> diff -> parallel extraction ->
//! remove deleted -> aggregate -> save. The store is written exactly once,
//! at the end; a cancelled or failed run leaves it untouched.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::Config;
use crate::error::{IndexError, Result};
use crate::index::{now_millis, Index, IndexStore, IndexedFile, LoadStatus, STORE_FILENAME};
use crate::indexer::aggregator::{repair_entries, GraphAggregator};
use crate::indexer::change::ChangeDetector;
use crate::indexer::summary::{FileWarning, Summary};
use crate::indexer::walker::{self, FileStat};
use crate::languages::ExtractorRegistry;

enum Outcome {
    Extracted(IndexedFile),
    /// Content hash matched the stored entry
    Reused(IndexedFile),
    Skipped(FileWarning),
    Failed(FileWarning),
    Cancelled,
}

pub struct Indexer {
    root: PathBuf,
    config: Config,
    registry: ExtractorRegistry,
    full: bool,
}

impl Indexer {
    pub fn new(root: &Path, config: Config) -> Self {
        let registry = crate::REGISTRY.with_categories(&config.categories);
        Self {
            root: root.to_path_buf(),
            config,
            registry,
            full: false,
        }
    }

    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Re-extract unchanged files too.
    pub fn full(mut self, full: bool) -> Self {
        self.full = full;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run(&self) -> Result<Summary> {
        self.run_with_cancel(&AtomicBool::new(false))
    }

    pub fn run_with_cancel(&self, cancel: &AtomicBool) -> Result<Summary> {
        let started = Instant::now();
        if !self.root.is_dir() {
            return Err(IndexError::RootNotFound(self.root.clone()));
        }

        let store = IndexStore::new(&self.root);
        let _lock = store.lock()?;

        let mut paths = walker::resolve(&self.root, &self.config)?;
        paths.retain(|stat| self.registry.supports(&stat.relative_path));
        let mut warnings = std::mem::take(&mut paths.warnings);

        let (mut index, status) = store.load();
        if let LoadStatus::Reset(reason) = status {
            warnings.push(FileWarning::new(
                STORE_FILENAME,
                format!("index reset: {}", reason),
            ));
        }

        let snapshot = self.config.snapshot();
        let config_changed = !index.is_empty()
            && (index.config.scope != snapshot.scope
                || index.config.categories != snapshot.categories);
        if config_changed {
            info!("Scope or category mapping changed, re-extracting every file");
        }
        let force = self.full || config_changed;

        let mut changes = ChangeDetector::diff(&paths, &index);
        if force {
            changes = changes.force_all();
        }
        debug!(
            "{} new, {} modified, {} unchanged, {} deleted",
            changes.new.len(),
            changes.modified.len(),
            changes.unchanged.len(),
            changes.deleted.len()
        );
        check_cancel(cancel)?;

        let now = now_millis();
        let changed: Vec<&FileStat> = changes.changed().collect();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs())
            .build()
            .map_err(|e| IndexError::Io(std::io::Error::other(e.to_string())))?;
        let outcomes: Vec<(String, Outcome)> = pool.install(|| {
            changed
                .par_iter()
                .map(|stat| {
                    let outcome = self.process(stat, &index, now, force, cancel);
                    (stat.relative_path.clone(), outcome)
                })
                .collect()
        });

        let mut failed = Vec::new();
        let mut unindexed = BTreeSet::new();
        let mut reused = 0;
        for (path, outcome) in outcomes {
            match outcome {
                Outcome::Extracted(entry) => store.update(&mut index, &path, entry),
                Outcome::Reused(entry) => {
                    reused += 1;
                    store.update(&mut index, &path, entry);
                }
                Outcome::Skipped(warning) => {
                    unindexed.insert(path);
                    warnings.push(warning);
                }
                Outcome::Failed(warning) => {
                    unindexed.insert(path.clone());
                    failed.push(path);
                    warnings.push(warning);
                }
                Outcome::Cancelled => return Err(IndexError::Cancelled),
            }
        }
        // skipped and failed files are reported through warnings only
        changes.new.retain(|stat| !unindexed.contains(&stat.relative_path));
        changes.modified.retain(|stat| !unindexed.contains(&stat.relative_path));

        for path in &changes.deleted {
            store.remove(&mut index, path);
        }
        check_cancel(cancel)?;

        let aggregator = GraphAggregator::new(&self.config);
        let previous = std::mem::take(&mut index.graph);
        let (graph, report) = aggregator.aggregate(&index.files, Some(&previous), &failed);
        let repaired = repair_entries(&mut index.files, &report);
        if repaired > 0 {
            debug!("Rewrote {} recovered references in stored entries", repaired);
        }

        index.graph = graph;
        index.config = snapshot;
        index.last_run_at = now;
        index.project_root = self.root.display().to_string();

        check_cancel(cancel)?;
        store.save(&index)?;

        let summary = Summary {
            store_path: store.path().to_path_buf(),
            new: changes.new.len(),
            modified: changes.modified.len(),
            unchanged: changes.unchanged.len(),
            deleted: changes.deleted.len(),
            reused,
            failed: failed.len(),
            elements: index.graph.elements.len(),
            edges: index.graph.edges.len(),
            full: force,
            duration_ms: started.elapsed().as_millis() as u64,
            warnings,
            report,
        };

        info!(
            "Indexed {} ({} new, {} modified, {} deleted): {} elements, {} edges in {}ms",
            self.root.display(),
            summary.new,
            summary.modified,
            summary.deleted,
            summary.elements,
            summary.edges,
            summary.duration_ms
        );
        Ok(summary)
    }

    fn jobs(&self) -> usize {
        self.config.jobs.filter(|jobs| *jobs > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    fn process(
        &self,
        stat: &FileStat,
        index: &Index,
        now: u64,
        force: bool,
        cancel: &AtomicBool,
    ) -> Outcome {
        if cancel.load(Ordering::Relaxed) {
            return Outcome::Cancelled;
        }

        let path = &stat.relative_path;
        if stat.size_bytes > self.config.hard_max_file_size {
            warn!("Skipping {}: {} bytes", path, stat.size_bytes);
            return Outcome::Skipped(FileWarning::new(
                path,
                format!(
                    "{} bytes exceeds the hard size limit of {} bytes",
                    stat.size_bytes, self.config.hard_max_file_size
                ),
            ));
        }

        let Some(extractor) = self.registry.get_for_path(path) else {
            return Outcome::Skipped(FileWarning::new(path, "no extraction strategy"));
        };

        let full_path = self.root.join(path);
        let bytes = match read_file(&full_path, stat.size_bytes, self.config.max_file_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read {}: {}", path, e);
                return Outcome::Failed(FileWarning::new(path, e.to_string()));
            }
        };

        let content_hash = self
            .config
            .content_hash
            .then(|| format!("{:016x}", xxh3_64(&bytes)));

        if !force {
            if let (Some(hash), Some(previous)) = (&content_hash, index.files.get(path)) {
                if previous.content_hash.as_ref() == Some(hash)
                    && previous.strategy.as_deref() == Some(extractor.name())
                {
                    debug!("Content of {} unchanged, reusing extraction", path);
                    let mut entry = previous.clone();
                    entry.last_indexed_at = now;
                    entry.file_modified_at = stat.modified_at;
                    entry.size_bytes = stat.size_bytes;
                    return Outcome::Reused(entry);
                }
            }
        }

        let content = String::from_utf8_lossy(&bytes);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            extractor.extract(&self.config.scope, path, &content)
        }));

        match result {
            Ok(Ok(extraction)) => {
                debug!(
                    "Extracted {} elements, {} edges from {} ({})",
                    extraction.elements.len(),
                    extraction.local_edges.len(),
                    path,
                    extractor.name()
                );
                Outcome::Extracted(IndexedFile {
                    relative_path: path.clone(),
                    last_indexed_at: now,
                    file_modified_at: stat.modified_at,
                    size_bytes: stat.size_bytes,
                    strategy: Some(extractor.name().to_string()),
                    content_hash,
                    elements: extraction.elements,
                    local_edges: extraction.local_edges,
                    imports: extraction.imports,
                    usages: extraction.usages,
                })
            }
            Ok(Err(e)) => {
                warn!("Extraction failed for {}: {}", path, e);
                Outcome::Failed(FileWarning::new(path, format!("extraction failed: {}", e)))
            }
            Err(_) => {
                warn!("Extractor {} panicked on {}", extractor.name(), path);
                Outcome::Failed(FileWarning::new(path, "extractor panicked"))
            }
        }
    }
}

pub fn run(root: &Path, config: &Config) -> Result<Summary> {
    Indexer::new(root, config.clone()).run()
}

pub fn run_with_cancel(root: &Path, config: &Config, cancel: &AtomicBool) -> Result<Summary> {
    Indexer::new(root, config.clone()).run_with_cancel(cancel)
}

fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        info!("Run cancelled, index left untouched");
        return Err(IndexError::Cancelled);
    }
    Ok(())
}

/// Reads the whole file, in `chunk`-sized reads once it is larger than one chunk.
fn read_file(path: &Path, size: u64, chunk: u64) -> std::io::Result<Vec<u8>> {
    if size <= chunk {
        return fs::read(path);
    }

    let mut file = File::open(path)?;
    let chunk = usize::try_from(chunk.max(1)).unwrap_or(1 << 20);
    let mut bytes = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    let mut buffer = vec![0u8; chunk];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => bytes.extend_from_slice(&buffer[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(bytes)
}
