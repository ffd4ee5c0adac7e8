use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};

use crate::config::Config;
use crate::error::{IndexError, Result};
use crate::index::{LOCK_FILENAME, STORE_FILENAME, TEMP_FILENAME};
use crate::indexer::pipeline::Indexer;
use crate::indexer::summary::Summary;

const DEBOUNCE: Duration = Duration::from_millis(500);

pub struct FileWatcher {
    root: PathBuf,
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    receiver: Receiver<std::result::Result<Vec<DebouncedEvent>, notify::Error>>,
}

impl FileWatcher {
    pub fn new(root: &Path) -> Result<Self> {
        // events arrive with absolute paths
        let root = root.canonicalize()?;
        let (tx, rx) = channel();

        let mut debouncer =
            new_debouncer(DEBOUNCE, tx).map_err(|e| IndexError::Watcher(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| IndexError::Watcher(e.to_string()))?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            receiver: rx,
        })
    }

    /// Blocks for the next debounced batch of relevant paths. Returns `None`
    /// once the watcher is gone; a batch may be empty when only the run's own
    /// files changed.
    pub fn recv(&self) -> Option<Vec<PathBuf>> {
        match self.receiver.recv() {
            Ok(Ok(events)) => Some(
                events
                    .into_iter()
                    .map(|e| e.path)
                    .filter(|path| is_relevant(&self.root, path))
                    .collect(),
            ),
            Ok(Err(e)) => {
                tracing::warn!("Watch error: {}", e);
                Some(Vec::new())
            }
            Err(_) => None,
        }
    }
}

/// Whether a changed path can affect the index; the run's own store, temp
/// and lock files never do.
pub fn is_relevant(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    let relative = relative.to_string_lossy().replace('\\', "/");
    if relative.is_empty() {
        return false;
    }
    !(relative == STORE_FILENAME
        || relative == TEMP_FILENAME
        || relative == LOCK_FILENAME
        || relative == ".git"
        || relative.starts_with(".git/"))
}

/// Runs once, then again after every relevant batch of changes until the
/// watcher stops. The configuration is reloaded before each rerun; a broken
/// edit keeps the previous one.
pub fn watch<F>(root: &Path, config: Config, full: bool, mut on_run: F) -> Result<()>
where
    F: FnMut(&Result<Summary>),
{
    let watcher = FileWatcher::new(root)?;
    let mut config = config;
    on_run(&Indexer::new(root, config.clone()).full(full).run());

    tracing::info!("Watching {} for changes", root.display());
    while let Some(paths) = watcher.recv() {
        if paths.is_empty() {
            continue;
        }
        tracing::debug!("{} paths changed", paths.len());

        match Config::load(root) {
            Ok(reloaded) => config = reloaded,
            Err(e) => tracing::warn!("Keeping previous configuration: {}", e),
        }
        on_run(&Indexer::new(root, config.clone()).run());
    }
    Ok(())
}
