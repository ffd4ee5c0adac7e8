//! Persistence of the index document.
//!
//! The store is a single pretty-printed JSON file in the indexed root. It is
//! written exactly once per run, atomically, and a missing or unreadable
//! document degrades to a fresh index rather than failing the run.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{IndexError, Result};
use crate::index::models::{now_millis, Index, IndexedFile, STORE_VERSION};

pub const STORE_FILENAME: &str = ".graph-index.json";
pub const TEMP_FILENAME: &str = ".graph-index.json.tmp";
pub const LOCK_FILENAME: &str = ".graph-index.lock";

/// How `IndexStore::load` obtained its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// No document existed yet
    Fresh,
    Loaded,
    /// A document existed but could not be used
    Reset(String),
}

pub struct IndexStore {
    root: PathBuf,
    path: PathBuf,
}

impl IndexStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            path: root.join(STORE_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> (Index, LoadStatus) {
        let fresh = || Index::new(self.root.display().to_string(), now_millis());

        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return (fresh(), LoadStatus::Fresh),
            Err(e) => {
                tracing::warn!("Cannot read index {}: {}; re-indexing", self.path.display(), e);
                return (fresh(), LoadStatus::Reset(e.to_string()));
            }
        };

        match serde_json::from_str::<Index>(&json) {
            Ok(index) if index.version == STORE_VERSION => {
                tracing::debug!(
                    "Loaded index with {} files from {}",
                    index.files.len(),
                    self.path.display()
                );
                (index, LoadStatus::Loaded)
            }
            Ok(index) => {
                let reason = format!(
                    "store version {} does not match {}",
                    index.version, STORE_VERSION
                );
                tracing::warn!("{}; re-indexing", reason);
                (fresh(), LoadStatus::Reset(reason))
            }
            Err(e) => {
                tracing::warn!("Malformed index {}: {}; re-indexing", self.path.display(), e);
                (fresh(), LoadStatus::Reset(e.to_string()))
            }
        }
    }

    /// Writes the document to a temporary file, then renames it over the
    /// store so a crash never leaves a half-written index behind.
    pub fn save(&self, index: &Index) -> Result<()> {
        let json = serde_json::to_vec_pretty(index)?;
        let temp_path = self.root.join(TEMP_FILENAME);
        let unwritable = |source: std::io::Error| IndexError::StoreUnwritable {
            path: self.path.clone(),
            source,
        };

        let mut file = File::create(&temp_path).map_err(unwritable)?;
        file.write_all(&json).map_err(unwritable)?;
        file.sync_all().map_err(unwritable)?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(unwritable(e));
        }

        tracing::debug!("Saved index ({} bytes) to {}", json.len(), self.path.display());
        Ok(())
    }

    pub fn update(&self, index: &mut Index, path: &str, file: IndexedFile) {
        index.files.insert(path.to_string(), file);
    }

    pub fn remove(&self, index: &mut Index, path: &str) -> Option<IndexedFile> {
        index.files.remove(path)
    }

    /// Takes the single-writer lock for this root.
    ///
    /// Fails with `Locked` while another run holds it, and with
    /// `StoreUnwritable` when the root does not accept new files.
    pub fn lock(&self) -> Result<StoreLock> {
        let lock_path = self.root.join(LOCK_FILENAME);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(StoreLock { path: lock_path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(IndexError::Locked(lock_path)),
            Err(source) => Err(IndexError::StoreUnwritable {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Removes the lock file when dropped.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_file(path: &str) -> IndexedFile {
        IndexedFile {
            relative_path: path.to_string(),
            last_indexed_at: 2_000,
            file_modified_at: 1_000,
            size_bytes: 10,
            strategy: Some("blueprint".to_string()),
            content_hash: None,
            elements: Vec::new(),
            local_edges: Vec::new(),
            imports: Vec::new(),
            usages: Vec::new(),
        }
    }

    #[test]
    fn test_load_missing_is_fresh() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path());

        let (index, status) = store.load();
        assert_eq!(status, LoadStatus::Fresh);
        assert!(index.is_empty());
        assert_eq!(index.version, STORE_VERSION);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path());

        let (mut index, _) = store.load();
        store.update(&mut index, "a.bp", sample_file("a.bp"));
        store.save(&index).unwrap();

        assert!(dir.path().join(STORE_FILENAME).exists());
        assert!(!dir.path().join(TEMP_FILENAME).exists());

        let (loaded, status) = store.load();
        assert_eq!(status, LoadStatus::Loaded);
        assert_eq!(loaded, index);
    }

    #[test]
    fn test_malformed_store_resets() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STORE_FILENAME), "{ not json").unwrap();

        let (index, status) = IndexStore::new(dir.path()).load();
        assert!(matches!(status, LoadStatus::Reset(_)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_version_mismatch_resets() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path());
        let mut index = Index::new("root", 1);
        index.version = STORE_VERSION + 1;
        store.update(&mut index, "a.bp", sample_file("a.bp"));
        store.save(&index).unwrap();

        let (loaded, status) = store.load();
        assert!(matches!(status, LoadStatus::Reset(_)));
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_remove_entry() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path());
        let mut index = Index::new("root", 1);
        store.update(&mut index, "a.bp", sample_file("a.bp"));

        assert!(store.remove(&mut index, "a.bp").is_some());
        assert!(store.remove(&mut index, "a.bp").is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::new(dir.path());

        let guard = store.lock().unwrap();
        assert!(matches!(store.lock(), Err(IndexError::Locked(_))));
        drop(guard);

        assert!(!dir.path().join(LOCK_FILENAME).exists());
        assert!(store.lock().is_ok());
    }
}
