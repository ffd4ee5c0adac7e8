//! Modification-time based change detection.
//!
//! Compares the resolved path set with the stored index entries. No file
//! content is read here; the content-hash fallback lives in the pipeline.

use crate::index::{Index, IndexedFile};
use crate::indexer::walker::{FileStat, PathSet};

/// Classification of every path seen by a run, each list sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub new: Vec<FileStat>,
    pub modified: Vec<FileStat>,
    pub unchanged: Vec<FileStat>,
    /// Indexed paths no longer present on disk
    pub deleted: Vec<String>,
}

impl ChangeSet {
    /// Files that need extraction.
    pub fn changed(&self) -> impl Iterator<Item = &FileStat> {
        self.new.iter().chain(self.modified.iter())
    }

    pub fn changed_count(&self) -> usize {
        self.new.len() + self.modified.len()
    }

    pub fn is_clean(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Reclassifies unchanged files as modified so everything is re-extracted.
    pub fn force_all(mut self) -> Self {
        self.modified.append(&mut self.unchanged);
        self.modified.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        self
    }
}

pub struct ChangeDetector;

impl ChangeDetector {
    pub fn diff(paths: &PathSet, index: &Index) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for stat in &paths.files {
            match index.files.get(&stat.relative_path) {
                None => changes.new.push(stat.clone()),
                Some(entry) if Self::is_unchanged(stat, entry) => {
                    changes.unchanged.push(stat.clone())
                }
                Some(_) => changes.modified.push(stat.clone()),
            }
        }

        // BTreeMap iteration keeps deleted paths sorted
        changes.deleted = index
            .files
            .keys()
            .filter(|path| paths.get(path).is_none())
            .cloned()
            .collect();

        changes
    }

    /// A file is unchanged when it has not been touched since it was last
    /// indexed and its observed metadata still matches the recorded entry.
    pub fn is_unchanged(stat: &FileStat, entry: &IndexedFile) -> bool {
        stat.modified_at <= entry.last_indexed_at
            && stat.modified_at == entry.file_modified_at
            && stat.size_bytes == entry.size_bytes
    }
}
