pub mod blueprint;
pub mod sql;
pub mod typescript;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use tree_sitter::Node;

use crate::indexer::extractor::Extractor;

/// Strategy name that disables extraction for an extension
pub const DISABLED: &str = "none";

#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn Extractor>>,
    extension_map: HashMap<String, String>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register(Arc::new(blueprint::BlueprintExtractor));
        registry.register(Arc::new(typescript::TypeScriptExtractor));
        registry.register(Arc::new(sql::SqlExtractor));

        registry
    }

    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
            extension_map: HashMap::new(),
        }
    }

    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        let name = extractor.name().to_string();
        for ext in extractor.file_extensions() {
            self.extension_map.insert(ext.to_string(), name.clone());
        }
        self.extractors.insert(name, extractor);
    }

    /// A copy of this registry with `ext -> strategy` overrides applied.
    /// Overrides naming an unknown strategy are ignored with a warning.
    pub fn with_categories(&self, categories: &BTreeMap<String, String>) -> Self {
        let mut registry = self.clone();
        for (ext, strategy) in categories {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            if strategy == DISABLED {
                registry.extension_map.remove(&ext);
            } else if registry.extractors.contains_key(strategy) {
                registry.extension_map.insert(ext, strategy.clone());
            } else {
                tracing::warn!("Unknown strategy {:?} for extension {:?}, ignoring", strategy, ext);
            }
        }
        registry
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Extractor>> {
        self.extractors.get(name).cloned()
    }

    pub fn get_by_extension(&self, ext: &str) -> Option<Arc<dyn Extractor>> {
        self.extension_map
            .get(&ext.to_ascii_lowercase())
            .and_then(|name| self.extractors.get(name))
            .cloned()
    }

    /// Strategy for a `/`-separated relative path.
    pub fn get_for_path(&self, relative_path: &str) -> Option<Arc<dyn Extractor>> {
        Path::new(relative_path)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.get_by_extension(ext))
    }

    pub fn supports(&self, relative_path: &str) -> bool {
        self.get_for_path(relative_path).is_some()
    }

    pub fn supported_extensions(&self) -> Vec<&str> {
        let mut exts: Vec<&str> = self.extension_map.keys().map(|s| s.as_str()).collect();
        exts.sort_unstable();
        exts
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Descendants of `node` (itself included) of the given kinds, in source order.
pub(crate) fn collect_kind<'t>(node: Node<'t>, kinds: &[&str]) -> Vec<Node<'t>> {
    let mut found = Vec::new();
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        if kinds.contains(&current.kind()) {
            found.push(current);
        }
        let mut cursor = current.walk();
        let children: Vec<Node> = current.named_children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    found
}
