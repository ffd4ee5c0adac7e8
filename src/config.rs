//! Optional per-root configuration file.
//!
//! Looked up in the indexed root as `.graph-indexer.yml`, `.graph-indexer.yaml`
//! or `.graph-indexer.json` (JSON parses as YAML). Every field is optional:
//!
//! ```yaml
//! include: ["src/**"]
//! exclude: ["src/legacy/**"]
//! maxFileSize: 1048576
//! skipGenerated: true
//! followSymlinks: false
//! scope: shop
//! categories:
//!   x: blueprint
//! resolve:
//!   aliases:
//!     "@/": "src/"
//! edgeRules:
//!   - kind: Table
//!     usage: query
//!     edgeType: flows-to
//!     direction: targetToUser
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::index::StoredConfig;
use crate::indexer::aggregator::EdgeRule;
use crate::indexer::import_resolver::ResolveConfig;

/// Names looked up in the root, first match wins
pub const CONFIG_FILENAMES: [&str; 3] = [
    ".graph-indexer.yml",
    ".graph-indexer.yaml",
    ".graph-indexer.json",
];

pub const DEFAULT_SCOPE: &str = "local";

const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;
const DEFAULT_HARD_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Binary and media extensions never handed to an extractor
pub const DEFAULT_EXCLUDED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "psd", "mp3", "mp4", "mov",
    "avi", "mkv", "wav", "flac", "ogg", "webm", "pdf", "zip", "gz", "tgz", "bz2", "xz", "7z",
    "rar", "tar", "jar", "war", "class", "exe", "dll", "so", "dylib", "a", "o", "obj", "bin",
    "wasm", "woff", "woff2", "ttf", "otf", "eot", "sqlite", "db", "lock",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Files above this size are read in chunks of this size
    pub max_file_size: u64,
    /// Files above this size are skipped
    pub hard_max_file_size: u64,
    pub skip_generated: bool,
    /// Walk into symlinked files and directories
    pub follow_symlinks: bool,
    /// Replaces the default binary/media extension list when set
    pub exclude_extensions: Option<Vec<String>>,
    /// Scope tag embedded in every identifier
    pub scope: String,
    /// Extension to strategy name overrides
    pub categories: BTreeMap<String, String>,
    /// Extraction worker count (defaults to available parallelism)
    pub jobs: Option<usize>,
    /// Skip re-extraction of touched files whose content hash is unchanged
    pub content_hash: bool,
    pub resolve: ResolveConfig,
    /// Added to (or replacing entries of) the default edge rule table
    pub edge_rules: Vec<EdgeRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            include: vec!["**/*".to_string()],
            exclude: vec![
                "**/node_modules/**".to_string(),
                "**/.git/**".to_string(),
                "**/target/**".to_string(),
                "**/dist/**".to_string(),
                "**/build/**".to_string(),
            ],
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            hard_max_file_size: DEFAULT_HARD_MAX_FILE_SIZE,
            skip_generated: true,
            follow_symlinks: false,
            exclude_extensions: None,
            scope: DEFAULT_SCOPE.to_string(),
            categories: BTreeMap::new(),
            jobs: None,
            content_hash: true,
            resolve: ResolveConfig::default(),
            edge_rules: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the configuration file from `root`, or defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        match Self::find(root) {
            Some(path) => {
                let content = std::fs::read_to_string(&path)?;
                let config = Self::parse(&content, &path)?;
                tracing::debug!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn find(root: &Path) -> Option<PathBuf> {
        CONFIG_FILENAMES
            .iter()
            .map(|name| root.join(name))
            .find(|p| p.is_file())
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(content).map_err(|e| IndexError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let fail = |message: String| {
            Err(IndexError::Config {
                path: path.to_path_buf(),
                message,
            })
        };

        if self.scope.is_empty() || self.scope.contains(':') {
            return fail(format!("scope must be non-empty and free of ':' (got {:?})", self.scope));
        }
        if self.max_file_size == 0 {
            return fail("maxFileSize must be positive".to_string());
        }
        if self.hard_max_file_size < self.max_file_size {
            return fail("hardMaxFileSize must not be below maxFileSize".to_string());
        }
        if self.jobs == Some(0) {
            return fail("jobs must be at least 1".to_string());
        }
        for pattern in self.include.iter().chain(&self.exclude) {
            if let Err(e) = glob::Pattern::new(pattern) {
                return fail(format!("invalid pattern {:?}: {}", pattern, e));
            }
        }
        Ok(())
    }

    pub fn excluded_extensions(&self) -> Vec<String> {
        match &self.exclude_extensions {
            Some(list) => list
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            None => DEFAULT_EXCLUDED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// The part of the configuration that shapes stored entries.
    pub fn snapshot(&self) -> StoredConfig {
        StoredConfig {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            scope: self.scope.clone(),
            categories: self.categories.clone(),
        }
    }
}
