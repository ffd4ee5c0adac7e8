use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use glob::{MatchOptions, Pattern};
use ignore::WalkBuilder;

use crate::config::{Config, CONFIG_FILENAMES};
use crate::error::{IndexError, Result};
use crate::index::models::unix_millis;
use crate::index::store::{LOCK_FILENAME, STORE_FILENAME, TEMP_FILENAME};
use crate::indexer::summary::FileWarning;

/// Bytes inspected for generated markers and binary content
const HEADER_BYTES: u64 = 1024;

const GENERATED_MARKERS: &[&str] = &[
    "@generated",
    "DO NOT EDIT",
    "auto-generated",
    "autogenerated",
    "Code generated by",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A candidate file with the metadata change detection needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub relative_path: String,
    pub modified_at: u64,
    pub size_bytes: u64,
}

/// The resolved candidate files of one root, sorted by path.
#[derive(Debug, Default)]
pub struct PathSet {
    pub files: Vec<FileStat>,
    pub warnings: Vec<FileWarning>,
}

impl PathSet {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileStat> {
        self.files
            .binary_search_by(|f| f.relative_path.as_str().cmp(relative_path))
            .ok()
            .map(|i| &self.files[i])
    }

    /// Keeps only files accepted by `keep`.
    pub fn retain<F: FnMut(&FileStat) -> bool>(&mut self, keep: F) {
        self.files.retain(keep);
    }
}

pub struct FileWalker {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    excluded_extensions: HashSet<String>,
    skip_generated: bool,
    follow_symlinks: bool,
}

impl FileWalker {
    pub fn new(config: &Config) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    Pattern::new(p)
                        .map_err(|e| IndexError::Parse(format!("Invalid pattern {:?}: {}", p, e)))
                })
                .collect()
        };

        Ok(Self {
            include: compile(&config.include)?,
            exclude: compile(&config.exclude)?,
            excluded_extensions: config.excluded_extensions().into_iter().collect(),
            skip_generated: config.skip_generated,
            follow_symlinks: config.follow_symlinks,
        })
    }

    /// Walks `root` honoring ignore files, patterns and content filters.
    pub fn walk(&self, root: &Path) -> Result<PathSet> {
        if !root.is_dir() {
            return Err(IndexError::RootNotFound(root.to_path_buf()));
        }

        let mut set = PathSet::default();

        let walker = WalkBuilder::new(root)
            .follow_links(self.follow_symlinks)
            .hidden(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .ignore(true)
            .require_git(false)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    set.warnings.push(FileWarning::new("", e.to_string()));
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            let path = entry.path();
            let Some(relative) = relative_path(root, path) else {
                continue;
            };
            if !self.is_candidate(&relative) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", relative, e);
                    set.warnings.push(FileWarning::new(&relative, e.to_string()));
                    continue;
                }
            };

            if self.is_excluded_by_content(path) {
                tracing::debug!("Skipping generated or binary file {}", relative);
                continue;
            }

            set.files.push(FileStat {
                relative_path: relative,
                modified_at: metadata.modified().map(unix_millis).unwrap_or(0),
                size_bytes: metadata.len(),
            });
        }

        set.files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(set)
    }

    /// Pattern and extension policy for a `/`-separated relative path.
    /// Exclusions always win over inclusions.
    pub fn is_candidate(&self, relative: &str) -> bool {
        if is_internal_file(relative) {
            return false;
        }
        if let Some(ext) = Path::new(relative).extension().and_then(|e| e.to_str()) {
            if self.excluded_extensions.contains(&ext.to_ascii_lowercase()) {
                return false;
            }
        }
        if self.exclude.iter().any(|p| p.matches_with(relative, MATCH_OPTIONS)) {
            return false;
        }
        self.include.iter().any(|p| p.matches_with(relative, MATCH_OPTIONS))
    }

    fn is_excluded_by_content(&self, path: &Path) -> bool {
        let mut header = Vec::with_capacity(HEADER_BYTES as usize);
        match File::open(path).and_then(|f| f.take(HEADER_BYTES).read_to_end(&mut header)) {
            Ok(_) => {}
            // unreadable files stay in the set; extraction reports them
            Err(_) => return false,
        }

        if header.contains(&0) {
            return true;
        }
        if self.skip_generated {
            let text = String::from_utf8_lossy(&header);
            return GENERATED_MARKERS.iter().any(|m| text.contains(m));
        }
        false
    }
}

/// Resolves the candidate files of `root` under `config`.
pub fn resolve(root: &Path, config: &Config) -> Result<PathSet> {
    FileWalker::new(config)?.walk(root)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn is_internal_file(relative: &str) -> bool {
    relative == STORE_FILENAME
        || relative == TEMP_FILENAME
        || relative == LOCK_FILENAME
        || CONFIG_FILENAMES.contains(&relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn paths(set: &PathSet) -> Vec<&str> {
        set.files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn test_walk_sorted_relative_paths() {
        let dir = TempDir::new().unwrap();
        create_file(dir.path(), "src/b.bp", "data B");
        create_file(dir.path(), "src/a.bp", "data A");
        create_file(dir.path(), "root.sql", "");

        let set = resolve(dir.path(), &Config::default()).unwrap();
        assert_eq!(paths(&set), vec!["root.sql", "src/a.bp", "src/b.bp"]);
        assert_eq!(set.get("src/a.bp").unwrap().size_bytes, 6);
        assert!(set.get("src/a.bp").unwrap().modified_at > 0);
    }

    #[test]
    fn test_walk_missing_root() {
        let dir = TempDir::new().unwrap();
        let err = resolve(&dir.path().join("missing"), &Config::default()).unwrap_err();
        assert!(matches!(err, IndexError::RootNotFound(_)));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let dir = TempDir::new().unwrap();
        create_file(dir.path(), "src/keep.bp", "");
        create_file(dir.path(), "src/legacy/old.bp", "");
        create_file(dir.path(), "other/x.bp", "");

        let config = Config {
            include: vec!["src/**".to_string()],
            exclude: vec!["src/legacy/**".to_string()],
            ..Default::default()
        };
        let set = resolve(dir.path(), &config).unwrap();
        assert_eq!(paths(&set), vec!["src/keep.bp"]);
    }

    #[test]
    fn test_default_excludes_dependencies() {
        let dir = TempDir::new().unwrap();
        create_file(dir.path(), "app.ts", "");
        create_file(dir.path(), "node_modules/lib/index.js", "");
        create_file(dir.path(), "web/node_modules/lib/index.js", "");

        let set = resolve(dir.path(), &Config::default()).unwrap();
        assert_eq!(paths(&set), vec!["app.ts"]);
    }

    #[test]
    fn test_gitignore_rules_win() {
        let dir = TempDir::new().unwrap();
        create_file(dir.path(), ".gitignore", "generated/\n*.draft.bp\n");
        create_file(dir.path(), "main.bp", "");
        create_file(dir.path(), "notes.draft.bp", "");
        create_file(dir.path(), "generated/out.bp", "");

        let set = resolve(dir.path(), &Config::default()).unwrap();
        assert_eq!(paths(&set), vec!["main.bp"]);
    }

    #[test]
    fn test_binary_extensions_excluded_by_default() {
        let dir = TempDir::new().unwrap();
        create_file(dir.path(), "logo.png", "not really a png");
        create_file(dir.path(), "form.bp", "");

        let set = resolve(dir.path(), &Config::default()).unwrap();
        assert_eq!(paths(&set), vec!["form.bp"]);

        let config = Config {
            exclude_extensions: Some(Vec::new()),
            ..Default::default()
        };
        let set = resolve(dir.path(), &config).unwrap();
        assert_eq!(paths(&set), vec!["form.bp", "logo.png"]);
    }

    #[test]
    fn test_binary_content_excluded() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("blob.bp"), [0u8, 1, 2, 3]).unwrap();
        create_file(dir.path(), "text.bp", "data A");

        let set = resolve(dir.path(), &Config::default()).unwrap();
        assert_eq!(paths(&set), vec!["text.bp"]);
    }

    #[test]
    fn test_generated_marker() {
        let dir = TempDir::new().unwrap();
        create_file(dir.path(), "gen.ts", "// @generated by protoc\nexport const x = 1;\n");
        create_file(dir.path(), "hand.ts", "export const y = 2;\n");

        let set = resolve(dir.path(), &Config::default()).unwrap();
        assert_eq!(paths(&set), vec!["hand.ts"]);

        let config = Config {
            skip_generated: false,
            ..Default::default()
        };
        let set = resolve(dir.path(), &config).unwrap();
        assert_eq!(paths(&set), vec!["gen.ts", "hand.ts"]);
    }

    #[test]
    fn test_internal_files_never_candidates() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            exclude_extensions: Some(Vec::new()),
            ..Default::default()
        };
        let walker = FileWalker::new(&config).unwrap();

        assert!(!walker.is_candidate(STORE_FILENAME));
        assert!(!walker.is_candidate(LOCK_FILENAME));
        assert!(!walker.is_candidate(".graph-indexer.yml"));
        assert!(walker.is_candidate("nested/.graph-index.json"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_entry_skipped_with_warning() {
        let dir = TempDir::new().unwrap();
        create_file(dir.path(), "form.bp", "data A");
        std::os::unix::fs::symlink(dir.path().join("missing"), dir.path().join("dangling.bp"))
            .unwrap();

        // not followed: the link is not a file and is ignored
        let set = resolve(dir.path(), &Config::default()).unwrap();
        assert_eq!(paths(&set), vec!["form.bp"]);
        assert!(set.warnings.is_empty());

        let config = Config {
            follow_symlinks: true,
            ..Default::default()
        };
        let set = resolve(dir.path(), &config).unwrap();
        assert_eq!(paths(&set), vec!["form.bp"]);
        assert_eq!(set.warnings.len(), 1);
        assert!(set.warnings[0].reason.contains("dangling.bp"));
    }

    #[test]
    fn test_hidden_files_skipped() {
        let dir = TempDir::new().unwrap();
        create_file(dir.path(), "visible.bp", "");
        create_file(dir.path(), ".hidden.bp", "");

        let set = resolve(dir.path(), &Config::default()).unwrap();
        assert_eq!(paths(&set), vec!["visible.bp"]);
    }
}
