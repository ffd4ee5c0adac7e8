//! Import path resolution.
//!
//! Maps the module specifier of an import-like statement to an indexed file:
//! - `./x`, `../x`: relative to the importing file's directory
//! - `/x`: relative to the project root
//! - alias prefixes such as `@/x` (configurable)
//! - extension-less specifiers and directory (barrel) index files
//!
//! Bare specifiers (`react`, `lodash/fp`) name external packages and stay
//! unresolved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolveConfig {
    /// Specifier prefix to root-relative directory
    pub aliases: BTreeMap<String, String>,
    /// Extensions tried for extension-less specifiers, in order
    pub extensions: Vec<String>,
    /// Stems of directory index files
    pub index_files: Vec<String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        let mut aliases = BTreeMap::new();
        aliases.insert("@/".to_string(), "src/".to_string());
        aliases.insert("~/".to_string(), "src/".to_string());

        Self {
            aliases,
            extensions: ["ts", "tsx", "js", "jsx", "bp", "blueprint", "sql"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            index_files: vec!["index".to_string()],
        }
    }
}

pub struct ImportResolver {
    /// Longest prefix first
    aliases: Vec<(String, String)>,
    extensions: Vec<String>,
    index_files: Vec<String>,
}

impl ImportResolver {
    pub fn new(config: &ResolveConfig) -> Self {
        let mut aliases: Vec<(String, String)> = config
            .aliases
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        aliases.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            aliases,
            extensions: config.extensions.clone(),
            index_files: config.index_files.clone(),
        }
    }

    /// Resolves `source` as written in `importer` to a known file path.
    pub fn resolve<F>(&self, importer: &str, source: &str, exists: F) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        let base = self.base_path(importer, source)?;
        self.candidates(&base).into_iter().find(|c| exists(c))
    }

    /// True when the specifier names something outside the project.
    pub fn is_external(&self, source: &str) -> bool {
        !(is_relative(source)
            || source.starts_with('/')
            || self.aliases.iter().any(|(prefix, _)| source.starts_with(prefix.as_str())))
    }

    fn base_path(&self, importer: &str, source: &str) -> Option<String> {
        if is_relative(source) {
            let dir = match importer.rfind('/') {
                Some(i) => &importer[..i],
                None => "",
            };
            return normalize(&format!("{}/{}", dir, source));
        }
        if let Some(rest) = source.strip_prefix('/') {
            return normalize(rest);
        }
        for (prefix, target) in &self.aliases {
            if let Some(rest) = source.strip_prefix(prefix.as_str()) {
                return normalize(&format!("{}/{}", target, rest));
            }
        }
        None
    }

    fn candidates(&self, base: &str) -> Vec<String> {
        let mut candidates = Vec::new();
        if !base.is_empty() {
            candidates.push(base.to_string());
            for ext in &self.extensions {
                candidates.push(format!("{}.{}", base, ext));
            }
        }
        for stem in &self.index_files {
            for ext in &self.extensions {
                if base.is_empty() {
                    candidates.push(format!("{}.{}", stem, ext));
                } else {
                    candidates.push(format!("{}/{}.{}", base, stem, ext));
                }
            }
        }
        candidates
    }
}

fn is_relative(source: &str) -> bool {
    source == "." || source == ".." || source.starts_with("./") || source.starts_with("../")
}

/// Collapses `.` and `..` segments; `None` when the path escapes the root.
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}
