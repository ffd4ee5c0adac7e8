use std::collections::BTreeMap;

use crate::error::Result;
use crate::index::{
    Edge, EdgeType, Element, ElementId, ElementKind, ElementPayload, Import, Usage,
};

/// Everything one file contributes to the graph.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Elements in discovery order
    pub elements: Vec<Element>,
    pub local_edges: Vec<Edge>,
    pub imports: Vec<Import>,
    pub usages: Vec<Usage>,
}

/// A per-category extraction strategy.
///
/// Implementations must be pure: the same `(path, content)` always yields the
/// same extraction, ordinals included. Build results with
/// [`ExtractionBuilder`] to get ordinal assignment right.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn file_extensions(&self) -> &[&'static str];

    fn extract(&self, scope: &str, path: &str, content: &str) -> Result<Extraction>;
}

/// Assigns per-kind ordinals in discovery order and collects edges,
/// imports and usages for one file.
pub struct ExtractionBuilder {
    scope: String,
    path: String,
    counters: BTreeMap<ElementKind, u32>,
    elements: Vec<Element>,
    edges: Vec<Edge>,
    imports: Vec<Import>,
    usages: Vec<Usage>,
}

impl ExtractionBuilder {
    pub fn new(scope: &str, path: &str) -> Self {
        Self {
            scope: scope.to_string(),
            path: path.to_string(),
            counters: BTreeMap::new(),
            elements: Vec::new(),
            edges: Vec::new(),
            imports: Vec::new(),
            usages: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn push(&mut self, label: impl Into<String>, payload: ElementPayload) -> ElementId {
        let kind = payload.kind();
        let counter = self.counters.entry(kind).or_insert(0);
        let id = ElementId::new(self.scope.clone(), self.path.clone(), kind, *counter);
        *counter += 1;

        self.elements.push(Element {
            id: id.clone(),
            label: label.into(),
            payload,
        });
        id
    }

    pub fn element_mut(&mut self, id: &ElementId) -> Option<&mut Element> {
        self.elements.iter_mut().find(|e| &e.id == id)
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// First element whose label matches case-insensitively.
    pub fn find_label(&self, label: &str) -> Option<ElementId> {
        self.elements
            .iter()
            .find(|e| e.label.eq_ignore_ascii_case(label))
            .map(|e| e.id.clone())
    }

    pub fn find_label_of_kind(&self, kind: ElementKind, label: &str) -> Option<ElementId> {
        self.elements
            .iter()
            .find(|e| e.kind() == kind && e.label.eq_ignore_ascii_case(label))
            .map(|e| e.id.clone())
    }

    /// Parses an explicit `path#Kind:ordinal` reference in this file's scope.
    pub fn explicit_id(&self, token: &str) -> Option<ElementId> {
        if !token.contains('#') {
            return None;
        }
        format!("{}:{}", self.scope, token).parse().ok()
    }

    pub fn edge(
        &mut self,
        from: ElementId,
        to: ElementId,
        edge_type: EdgeType,
        label: Option<String>,
    ) {
        let mut edge = Edge::new(from, to, edge_type);
        edge.label = label;
        self.edges.push(edge);
    }

    pub fn import(&mut self, import: Import) {
        self.imports.push(import);
    }

    pub fn usage(&mut self, usage: Usage) {
        self.usages.push(usage);
    }

    /// Finalizes the extraction; payload-implied edges come first, in
    /// element order, followed by explicitly declared edges.
    pub fn finish(self) -> Extraction {
        let mut local_edges: Vec<Edge> = self
            .elements
            .iter()
            .flat_map(|e| e.payload_edges())
            .collect();
        local_edges.extend(self.edges);

        Extraction {
            elements: self.elements,
            local_edges,
            imports: self.imports,
            usages: self.usages,
        }
    }
}
