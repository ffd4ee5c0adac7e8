//! Project graph aggregation.
//!
//! Merges the per-file extraction results into one graph in five phases:
//! 1. collect elements and local edges of every file, repairing stale
//!    payload references
//! 2. resolve each file's imports into a reference graph
//! 3. match used imported names to elements of the referenced files
//! 4. synthesize cross-file edges from a `(kind, usage)` rule table
//! 5. validate endpoints (with label-based recovery) and deduplicate
//!
//! Aggregation is pure and only depends on the file map, never on the order
//! in which files were extracted. Import cycles are fine: barrel traversal
//! tracks visited files and nothing requires a topological order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::index::{
    Edge, EdgeType, Element, ElementId, ElementKind, Graph, GraphMetadata, IndexedFile,
    UsageKind,
};
use crate::indexer::import_resolver::ImportResolver;

// =====================================================
// Edge rules
// =====================================================

/// Which way a synthesized edge points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// From the using element to the imported one
    UserToTarget,
    /// From the imported element to the using one
    TargetToUser,
    /// From every argument of the use to the imported element
    ArgumentsToTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRule {
    /// Kind of the imported element
    pub kind: ElementKind,
    pub usage: UsageKind,
    pub edge_type: EdgeType,
    pub direction: Direction,
}

impl EdgeRule {
    pub fn new(
        kind: ElementKind,
        usage: UsageKind,
        edge_type: EdgeType,
        direction: Direction,
    ) -> Self {
        Self {
            kind,
            usage,
            edge_type,
            direction,
        }
    }
}

/// The `(kind, usage) -> edge` table driving edge synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRules {
    rules: BTreeMap<(ElementKind, UsageKind), EdgeRule>,
}

impl EdgeRules {
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    pub fn defaults() -> Self {
        use Direction::*;
        use ElementKind as K;
        use UsageKind as U;

        let mut rules = Self::empty();
        for rule in [
            EdgeRule::new(K::Component, U::Render, EdgeType::Contains, UserToTarget),
            EdgeRule::new(K::Image, U::Render, EdgeType::Contains, UserToTarget),
            EdgeRule::new(K::Screen, U::Render, EdgeType::Contains, UserToTarget),
            EdgeRule::new(K::Transform, U::Invoke, EdgeType::Transforms, ArgumentsToTarget),
            EdgeRule::new(K::Table, U::Query, EdgeType::FlowsTo, TargetToUser),
            EdgeRule::new(K::Table, U::Mutate, EdgeType::FlowsTo, UserToTarget),
            EdgeRule::new(K::DataPoint, U::Capture, EdgeType::FlowsTo, UserToTarget),
            EdgeRule::new(K::DataPoint, U::Display, EdgeType::FlowsTo, TargetToUser),
            EdgeRule::new(K::DataPoint, U::Input, EdgeType::Transforms, TargetToUser),
            EdgeRule::new(K::DataPoint, U::Output, EdgeType::DerivesFrom, UserToTarget),
        ] {
            rules.insert(rule);
        }
        rules
    }

    /// Defaults with `overrides` added, replacing entries with the same key.
    pub fn with_overrides(overrides: &[EdgeRule]) -> Self {
        let mut rules = Self::defaults();
        for rule in overrides {
            rules.insert(rule.clone());
        }
        rules
    }

    pub fn insert(&mut self, rule: EdgeRule) {
        self.rules.insert((rule.kind, rule.usage), rule);
    }

    pub fn get(&self, kind: ElementKind, usage: UsageKind) -> Option<&EdgeRule> {
        self.rules.get(&(kind, usage))
    }
}

// =====================================================
// Reference graph
// =====================================================

/// An imported name resolved to the file that should define it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedReference {
    pub file: String,
    pub name: String,
    pub local: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reexport: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceGraph {
    /// Importing file to the references it declares
    pub references: BTreeMap<String, Vec<ResolvedReference>>,
    /// Imports naming external packages
    pub external: usize,
    /// Project imports whose target file is not indexed
    pub unresolved: Vec<UnresolvedImport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedImport {
    pub file: String,
    pub source: String,
}

impl ReferenceGraph {
    /// The reference a local name of `file` is bound to.
    fn binding(&self, file: &str, local: &str) -> Option<&ResolvedReference> {
        self.references
            .get(file)?
            .iter()
            .find(|r| r.local == local)
    }

    fn reexports<'a>(&'a self, file: &str) -> impl Iterator<Item = &'a ResolvedReference> + 'a {
        self.references
            .get(file)
            .into_iter()
            .flatten()
            .filter(|r| r.reexport)
    }
}

// =====================================================
// Report
// =====================================================

/// A stale identifier rewritten to the element now carrying its label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredReference {
    pub old: ElementId,
    pub new: ElementId,
    pub label: String,
    /// `edge` or the payload field holding the reference
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedEdge {
    pub edge: Edge,
    pub missing: ElementId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousRecovery {
    pub stale: ElementId,
    pub chosen: ElementId,
    pub candidates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleReference {
    pub element: ElementId,
    pub field: String,
    pub target: ElementId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationReport {
    pub elements_added: BTreeMap<ElementKind, usize>,
    pub elements_removed: BTreeMap<ElementKind, usize>,
    pub edges_added: usize,
    pub edges_removed: usize,
    pub cross_file_edges: usize,
    pub recovered: Vec<RecoveredReference>,
    pub dropped_edges: Vec<DroppedEdge>,
    pub ambiguous: Vec<AmbiguousRecovery>,
    pub stale_references: Vec<StaleReference>,
    pub duplicate_edges: usize,
    pub self_edges: usize,
    pub duplicate_elements: usize,
    pub external_imports: usize,
    pub unresolved_imports: Vec<UnresolvedImport>,
    /// Usages whose target kind has no edge rule
    pub unhandled_usages: usize,
    pub failed_files: Vec<String>,
}

impl AggregationReport {
    pub fn recovered_edges(&self) -> usize {
        self.recovered.iter().filter(|r| r.context == "edge").count()
    }
}

// =====================================================
// Aggregator
// =====================================================

pub struct GraphAggregator {
    resolver: ImportResolver,
    rules: EdgeRules,
}

impl GraphAggregator {
    pub fn new(config: &Config) -> Self {
        Self::with_rules(
            ImportResolver::new(&config.resolve),
            EdgeRules::with_overrides(&config.edge_rules),
        )
    }

    pub fn with_rules(resolver: ImportResolver, rules: EdgeRules) -> Self {
        Self { resolver, rules }
    }

    /// Builds the project graph from every indexed file.
    ///
    /// `previous` supplies the last known labels for label-based recovery and
    /// the baseline for the added/removed counts.
    pub fn aggregate(
        &self,
        files: &BTreeMap<String, IndexedFile>,
        previous: Option<&Graph>,
        failed_files: &[String],
    ) -> (Graph, AggregationReport) {
        let mut report = AggregationReport {
            failed_files: failed_files.to_vec(),
            ..Default::default()
        };

        // Phase 1: collect
        let mut elements: BTreeMap<ElementId, Element> = BTreeMap::new();
        // local edges keep the path of the entry that recorded them
        let mut edges: Vec<(Edge, Option<&str>)> = Vec::new();
        for (path, file) in files {
            for element in &file.elements {
                if elements.contains_key(&element.id) {
                    report.duplicate_elements += 1;
                    continue;
                }
                elements.insert(element.id.clone(), element.clone());
            }
            edges.extend(file.local_edges.iter().map(|e| (e.clone(), Some(path.as_str()))));
        }

        // stored payload references are repaired before this run's bindings
        // are added, which always name current elements
        let labels = previous.map(Graph::labels).unwrap_or_default();
        let mut recovery = Recovery::new(&labels);
        self.repair_payloads(&mut elements, &mut recovery, &mut report);

        // Phase 2: reference graph
        let references = self.build_reference_graph(files);
        report.external_imports = references.external;
        report.unresolved_imports = references.unresolved.clone();

        // Phases 3 and 4: match usages, synthesize edges
        let cross = self.synthesize(files, &references, &mut elements, &mut report);
        report.cross_file_edges = cross.len();
        edges.extend(cross.into_iter().map(|e| (e, None)));

        // Phase 5: validate and deduplicate
        let mut edges = self.validate_edges(edges, &elements, &mut recovery, &mut report);
        report.ambiguous = recovery.ambiguous;

        edges.sort_by(|a, b| {
            (&a.from, &a.to, a.edge_type).cmp(&(&b.from, &b.to, b.edge_type))
        });

        let mut counts: BTreeMap<ElementKind, usize> =
            ElementKind::ALL.iter().map(|k| (*k, 0)).collect();
        for id in elements.keys() {
            *counts.entry(id.kind).or_insert(0) += 1;
        }

        let graph = Graph {
            elements: elements.into_values().collect(),
            metadata: GraphMetadata {
                counts,
                total_edges: edges.len(),
                source_files: files.len(),
            },
            edges,
        };

        let empty = Graph::default();
        diff_against(previous.unwrap_or(&empty), &graph, &mut report);

        tracing::debug!(
            "Aggregated {} elements and {} edges ({} cross-file) from {} files",
            graph.elements.len(),
            graph.edges.len(),
            report.cross_file_edges,
            files.len()
        );

        (graph, report)
    }

    /// Resolves every import of every file to an indexed file.
    pub fn build_reference_graph(&self, files: &BTreeMap<String, IndexedFile>) -> ReferenceGraph {
        let mut graph = ReferenceGraph::default();

        for (path, file) in files {
            let mut refs = Vec::new();
            for import in &file.imports {
                match self
                    .resolver
                    .resolve(path, &import.source, |p| files.contains_key(p))
                {
                    Some(target) => {
                        for name in &import.names {
                            refs.push(ResolvedReference {
                                file: target.clone(),
                                name: name.name.clone(),
                                local: name.local.clone(),
                                reexport: import.reexport,
                            });
                        }
                    }
                    None if self.resolver.is_external(&import.source) => graph.external += 1,
                    None => graph.unresolved.push(UnresolvedImport {
                        file: path.clone(),
                        source: import.source.clone(),
                    }),
                }
            }
            if !refs.is_empty() {
                graph.references.insert(path.clone(), refs);
            }
        }

        graph
    }

    fn synthesize(
        &self,
        files: &BTreeMap<String, IndexedFile>,
        references: &ReferenceGraph,
        elements: &mut BTreeMap<ElementId, Element>,
        report: &mut AggregationReport,
    ) -> Vec<Edge> {
        let mut by_file: BTreeMap<&str, Vec<&Element>> = BTreeMap::new();
        for element in elements.values() {
            by_file.entry(element.id.path.as_str()).or_default().push(element);
        }

        let mut matches: Vec<(ElementId, UsageKind, ElementId, Vec<ElementId>)> = Vec::new();
        for (path, file) in files {
            for usage in &file.usages {
                let Some((target_file, name)) = bound_name(references, path, &usage.local) else {
                    continue;
                };
                let mut visited = BTreeSet::new();
                let candidates =
                    find_export(references, &by_file, &target_file, &name, &mut visited);
                let chosen = candidates
                    .iter()
                    .find(|e| self.rules.get(e.kind(), usage.usage).is_some())
                    .or_else(|| candidates.first());
                if let Some(target) = chosen {
                    matches.push((
                        usage.site.clone(),
                        usage.usage,
                        target.id.clone(),
                        usage.arguments.clone(),
                    ));
                }
            }
        }

        let mut edges = Vec::new();
        for (site, usage, target, arguments) in matches {
            let Some(rule) = self.rules.get(target.kind, usage) else {
                report.unhandled_usages += 1;
                continue;
            };
            match rule.direction {
                Direction::UserToTarget => {
                    edges.push(Edge::new(site.clone(), target.clone(), rule.edge_type))
                }
                Direction::TargetToUser => {
                    edges.push(Edge::new(target.clone(), site.clone(), rule.edge_type))
                }
                Direction::ArgumentsToTarget => {
                    for arg in &arguments {
                        edges.push(Edge::new(arg.clone(), target.clone(), rule.edge_type));
                    }
                }
            }
            if let Some(element) = elements.get_mut(&site) {
                element.bind(usage, &target);
            }
        }
        edges
    }

    fn repair_payloads(
        &self,
        elements: &mut BTreeMap<ElementId, Element>,
        recovery: &mut Recovery,
        report: &mut AggregationReport,
    ) {
        // plan first: recovery needs the element map unborrowed
        let mut plan: BTreeMap<ElementId, BTreeMap<ElementId, Option<ElementId>>> = BTreeMap::new();
        for element in elements.values() {
            for (field, target) in element.references() {
                if !recovery.is_stale(target, Some(element.id.path.as_str()), elements) {
                    continue;
                }
                let replacement = recovery.recover(target, elements);
                match &replacement {
                    Some(new) => report.recovered.push(RecoveredReference {
                        old: target.clone(),
                        new: new.clone(),
                        label: recovery.label_of(target).unwrap_or_default(),
                        context: format!("{}.{}", element.kind(), field),
                    }),
                    None => report.stale_references.push(StaleReference {
                        element: element.id.clone(),
                        field: field.to_string(),
                        target: target.clone(),
                    }),
                }
                plan.entry(element.id.clone())
                    .or_default()
                    .insert(target.clone(), replacement);
            }
        }

        for (id, fixes) in plan {
            if let Some(element) = elements.get_mut(&id) {
                element.retain_references(|_, target| match fixes.get(target) {
                    Some(Some(new)) => {
                        *target = new.clone();
                        true
                    }
                    Some(None) => false,
                    None => true,
                });
            }
        }
    }

    fn validate_edges(
        &self,
        edges: Vec<(Edge, Option<&str>)>,
        elements: &BTreeMap<ElementId, Element>,
        recovery: &mut Recovery,
        report: &mut AggregationReport,
    ) -> Vec<Edge> {
        let mut seen = BTreeSet::new();
        let mut kept = Vec::with_capacity(edges.len());

        'edges: for (mut edge, owner) in edges {
            if edge.from == edge.to {
                report.self_edges += 1;
                continue;
            }

            let mut missing = None;
            for endpoint in [&mut edge.from, &mut edge.to] {
                if !recovery.is_stale(endpoint, owner, elements) {
                    continue;
                }
                match recovery.recover(endpoint, elements) {
                    Some(new) => {
                        report.recovered.push(RecoveredReference {
                            old: endpoint.clone(),
                            new: new.clone(),
                            label: recovery.label_of(endpoint).unwrap_or_default(),
                            context: "edge".to_string(),
                        });
                        *endpoint = new;
                    }
                    None => {
                        missing = Some(endpoint.clone());
                        break;
                    }
                }
            }
            if let Some(missing) = missing {
                report.dropped_edges.push(DroppedEdge { edge, missing });
                continue 'edges;
            }

            if edge.from == edge.to {
                report.self_edges += 1;
                continue;
            }
            if !seen.insert(edge.key()) {
                report.duplicate_edges += 1;
                continue;
            }
            kept.push(edge);
        }

        kept
    }
}

/// Resolves a usage's local name through the importing file's bindings.
fn bound_name(references: &ReferenceGraph, file: &str, local: &str) -> Option<(String, String)> {
    if let Some(binding) = references.binding(file, local) {
        if binding.name != "*" {
            return Some((binding.file.clone(), binding.name.clone()));
        }
    }
    let (namespace, member) = local.split_once('.')?;
    let binding = references.binding(file, namespace)?;
    (binding.name == "*").then(|| (binding.file.clone(), member.to_string()))
}

/// Elements of `file` labelled `name`, following re-exports transitively.
fn find_export<'a>(
    references: &ReferenceGraph,
    by_file: &BTreeMap<&str, Vec<&'a Element>>,
    file: &str,
    name: &str,
    visited: &mut BTreeSet<String>,
) -> Vec<&'a Element> {
    if !visited.insert(file.to_string()) {
        return Vec::new();
    }

    let local: Vec<&Element> = by_file
        .get(file)
        .into_iter()
        .flatten()
        .copied()
        .filter(|e| e.label.eq_ignore_ascii_case(name))
        .collect();
    if !local.is_empty() {
        return local;
    }

    for reexport in references.reexports(file) {
        let found = if reexport.name == "*" {
            find_export(references, by_file, &reexport.file, name, visited)
        } else if reexport.local.eq_ignore_ascii_case(name) {
            find_export(references, by_file, &reexport.file, &reexport.name, visited)
        } else {
            continue;
        };
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

fn diff_against(previous: &Graph, current: &Graph, report: &mut AggregationReport) {
    let before: BTreeSet<&ElementId> = previous.elements.iter().map(|e| &e.id).collect();
    let after: BTreeSet<&ElementId> = current.elements.iter().map(|e| &e.id).collect();

    for id in after.difference(&before) {
        *report.elements_added.entry(id.kind).or_insert(0) += 1;
    }
    for id in before.difference(&after) {
        *report.elements_removed.entry(id.kind).or_insert(0) += 1;
    }

    let before: BTreeSet<_> = previous.edges.iter().map(Edge::key).collect();
    let after: BTreeSet<_> = current.edges.iter().map(Edge::key).collect();
    report.edges_added = after.difference(&before).count();
    report.edges_removed = before.difference(&after).count();
}

/// Writes the outcome of validation back into the stored entries so the next
/// run starts from repaired references: recovered ids are rewritten and ids
/// that could not be recovered are removed. Only ids pointing into other
/// files are touched, since an entry is always consistent with itself.
/// Returns the number of rewritten or removed ids.
pub fn repair_entries(
    files: &mut BTreeMap<String, IndexedFile>,
    report: &AggregationReport,
) -> usize {
    let substitutions: BTreeMap<&ElementId, &ElementId> =
        report.recovered.iter().map(|r| (&r.old, &r.new)).collect();
    let lost: BTreeSet<&ElementId> = report
        .dropped_edges
        .iter()
        .map(|d| &d.missing)
        .chain(report.stale_references.iter().map(|s| &s.target))
        .collect();
    if substitutions.is_empty() && lost.is_empty() {
        return 0;
    }

    let mut changed = 0;
    for (path, entry) in files.iter_mut() {
        let foreign = |id: &ElementId| id.path != *path;

        let before = entry.local_edges.len();
        entry
            .local_edges
            .retain(|e| ![&e.from, &e.to].iter().any(|id| foreign(id) && lost.contains(*id)));
        changed += before - entry.local_edges.len();

        for edge in &mut entry.local_edges {
            for end in [&mut edge.from, &mut edge.to] {
                if !foreign(end) {
                    continue;
                }
                if let Some(new) = substitutions.get(&*end) {
                    *end = (*new).clone();
                    changed += 1;
                }
            }
        }
        for element in &mut entry.elements {
            element.retain_references(|_, id| {
                if !foreign(id) {
                    return true;
                }
                if lost.contains(&*id) {
                    changed += 1;
                    return false;
                }
                if let Some(new) = substitutions.get(&*id) {
                    *id = (*new).clone();
                    changed += 1;
                }
                true
            });
        }
    }
    changed
}

/// Label-based repair of identifiers that no longer resolve.
struct Recovery<'a> {
    labels: &'a BTreeMap<ElementId, String>,
    memo: BTreeMap<ElementId, Option<ElementId>>,
    ambiguous: Vec<AmbiguousRecovery>,
}

impl<'a> Recovery<'a> {
    fn new(labels: &'a BTreeMap<ElementId, String>) -> Self {
        Self {
            labels,
            memo: BTreeMap::new(),
            ambiguous: Vec::new(),
        }
    }

    fn label_of(&self, id: &ElementId) -> Option<String> {
        self.labels.get(id).cloned()
    }

    /// Whether `id` no longer names the element it named in the previous
    /// graph. An id recorded by `owner` into another file goes stale when that
    /// file shifts its ordinals, even though the id still resolves.
    fn is_stale(
        &self,
        id: &ElementId,
        owner: Option<&str>,
        elements: &BTreeMap<ElementId, Element>,
    ) -> bool {
        let Some(current) = elements.get(id) else {
            return true;
        };
        let foreign = owner.is_some_and(|owner| owner != id.path);
        foreign && self.labels.get(id).is_some_and(|label| label != &current.label)
    }

    /// Finds the element of the same file and kind carrying the stale id's
    /// last known label. Several candidates resolve to the lowest ordinal and
    /// are reported as ambiguous.
    fn recover(
        &mut self,
        stale: &ElementId,
        elements: &BTreeMap<ElementId, Element>,
    ) -> Option<ElementId> {
        if let Some(known) = self.memo.get(stale) {
            return known.clone();
        }

        let labels = self.labels;
        let result = labels.get(stale).and_then(|label| {
            let start = ElementId::new(stale.scope.clone(), stale.path.clone(), stale.kind, 0);
            let end = ElementId::new(stale.scope.clone(), stale.path.clone(), stale.kind, u32::MAX);
            let candidates: Vec<&ElementId> = elements
                .range(start..=end)
                .filter(|(_, e)| &e.label == label)
                .map(|(id, _)| id)
                .collect();

            let chosen = candidates.first().map(|id| (*id).clone())?;
            if candidates.len() > 1 {
                self.ambiguous.push(AmbiguousRecovery {
                    stale: stale.clone(),
                    chosen: chosen.clone(),
                    candidates: candidates.len(),
                });
            }
            Some(chosen)
        });

        self.memo.insert(stale.clone(), result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{
        Component, DataPoint, ElementPayload, Import, ImportedName, Table, Transform, Usage,
    };

    fn id(path: &str, kind: ElementKind, ordinal: u32) -> ElementId {
        ElementId::new("local", path, kind, ordinal)
    }

    fn data(path: &str, ordinal: u32, label: &str) -> Element {
        Element {
            id: id(path, ElementKind::DataPoint, ordinal),
            label: label.to_string(),
            payload: ElementPayload::DataPoint(DataPoint::default()),
        }
    }

    fn file(path: &str, elements: Vec<Element>, local_edges: Vec<Edge>) -> IndexedFile {
        IndexedFile {
            relative_path: path.to_string(),
            last_indexed_at: 1,
            file_modified_at: 1,
            size_bytes: 1,
            strategy: None,
            content_hash: None,
            elements,
            local_edges,
            imports: Vec::new(),
            usages: Vec::new(),
        }
    }

    fn files(list: Vec<IndexedFile>) -> BTreeMap<String, IndexedFile> {
        list.into_iter().map(|f| (f.relative_path.clone(), f)).collect()
    }

    fn aggregator() -> GraphAggregator {
        GraphAggregator::new(&Config::default())
    }

    fn import(source: &str, names: &[&str]) -> Import {
        Import {
            source: source.to_string(),
            names: names.iter().map(|n| ImportedName::new(*n, *n)).collect(),
            reexport: false,
        }
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let a = data("a.bp", 0, "A");
        let b = data("a.bp", 1, "B");
        let edge = Edge::new(a.id.clone(), b.id.clone(), EdgeType::FlowsTo);
        let set = files(vec![file(
            "a.bp",
            vec![a, b],
            vec![edge.clone().with_label("first"), edge.with_label("second")],
        )]);

        let (graph, report) = aggregator().aggregate(&set, None, &[]);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].label.as_deref(), Some("first"));
        assert_eq!(report.duplicate_edges, 1);
    }

    #[test]
    fn test_self_edges_dropped() {
        let a = data("a.bp", 0, "A");
        let edge = Edge::new(a.id.clone(), a.id.clone(), EdgeType::FlowsTo);
        let set = files(vec![file("a.bp", vec![a], vec![edge])]);

        let (graph, report) = aggregator().aggregate(&set, None, &[]);
        assert!(graph.edges.is_empty());
        assert_eq!(report.self_edges, 1);
    }

    #[test]
    fn test_dangling_edge_without_history_is_dropped() {
        let a = data("a.bp", 0, "A");
        let ghost = id("b.bp", ElementKind::DataPoint, 7);
        let edge = Edge::new(a.id.clone(), ghost.clone(), EdgeType::FlowsTo);
        let set = files(vec![file("a.bp", vec![a], vec![edge])]);

        let (graph, report) = aggregator().aggregate(&set, None, &[]);
        assert!(graph.edges.is_empty());
        assert_eq!(report.dropped_edges.len(), 1);
        assert_eq!(report.dropped_edges[0].missing, ghost);
    }

    #[test]
    fn test_dangling_edge_recovered_by_label() {
        let a = data("a.bp", 0, "A");
        let old_target = id("b.bp", ElementKind::DataPoint, 1);
        let edge = Edge::new(a.id.clone(), old_target.clone(), EdgeType::FlowsTo);

        let previous = Graph {
            elements: vec![a.clone(), data("b.bp", 0, "Tax"), data("b.bp", 1, "Total")],
            ..Default::default()
        };
        // "Tax" was removed, so "Total" moved from ordinal 1 to ordinal 0
        let set = files(vec![
            file("a.bp", vec![a.clone()], vec![edge]),
            file("b.bp", vec![data("b.bp", 0, "Total")], vec![]),
        ]);

        let (graph, report) = aggregator().aggregate(&set, Some(&previous), &[]);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].to, id("b.bp", ElementKind::DataPoint, 0));
        assert_eq!(report.recovered_edges(), 1);
        assert_eq!(report.recovered[0].old, old_target);
        assert_eq!(report.recovered[0].label, "Total");
    }

    #[test]
    fn test_repair_entries_persists_recovery() {
        let a = data("a.bp", 0, "A");
        let old_target = id("b.bp", ElementKind::DataPoint, 1);
        let edge = Edge::new(a.id.clone(), old_target.clone(), EdgeType::FlowsTo);
        let previous = Graph {
            elements: vec![a.clone(), data("b.bp", 0, "Tax"), data("b.bp", 1, "Total")],
            ..Default::default()
        };
        let mut set = files(vec![
            file("a.bp", vec![a.clone()], vec![edge]),
            file("b.bp", vec![data("b.bp", 0, "Total")], vec![]),
        ]);

        let (graph, report) = aggregator().aggregate(&set, Some(&previous), &[]);
        assert_eq!(repair_entries(&mut set, &report), 1);
        assert_eq!(set["a.bp"].local_edges[0].to, id("b.bp", ElementKind::DataPoint, 0));

        // a second run without history yields the same graph
        let (again, report) = aggregator().aggregate(&set, Some(&graph), &[]);
        assert_eq!(again, graph);
        assert!(report.recovered.is_empty());
        assert_eq!(repair_entries(&mut set, &report), 0);
    }

    #[test]
    fn test_dangling_edge_dropped_when_label_changed() {
        let a = data("a.bp", 0, "A");
        let target = id("b.bp", ElementKind::DataPoint, 1);
        let edge = Edge::new(a.id.clone(), target, EdgeType::FlowsTo);
        let previous = Graph {
            elements: vec![a.clone(), data("b.bp", 0, "Tax"), data("b.bp", 1, "Total")],
            ..Default::default()
        };
        let set = files(vec![
            file("a.bp", vec![a], vec![edge]),
            file("b.bp", vec![data("b.bp", 0, "Grand total")], vec![]),
        ]);

        let (graph, report) = aggregator().aggregate(&set, Some(&previous), &[]);
        assert!(graph.edges.is_empty());
        assert_eq!(report.dropped_edges.len(), 1);
        assert!(report.recovered.is_empty());
    }

    #[test]
    fn test_shifted_target_is_recovered_not_retargeted() {
        let a = data("a.bp", 0, "A");
        let target = id("b.bp", ElementKind::DataPoint, 1);
        let edge = Edge::new(a.id.clone(), target, EdgeType::FlowsTo);
        let previous = Graph {
            elements: vec![a.clone(), data("b.bp", 0, "Tax"), data("b.bp", 1, "Total")],
            ..Default::default()
        };
        // "Fee" inserted first: ordinal 1 now belongs to "Tax"
        let set = files(vec![
            file("a.bp", vec![a], vec![edge]),
            file(
                "b.bp",
                vec![data("b.bp", 0, "Fee"), data("b.bp", 1, "Tax"), data("b.bp", 2, "Total")],
                vec![],
            ),
        ]);

        let (graph, report) = aggregator().aggregate(&set, Some(&previous), &[]);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].to, id("b.bp", ElementKind::DataPoint, 2));
        assert_eq!(report.recovered_edges(), 1);
        assert_eq!(report.recovered[0].label, "Total");
    }

    #[test]
    fn test_shifted_payload_reference_is_recovered() {
        let c = Element {
            id: id("a.bp", ElementKind::Component, 0),
            label: "Form".to_string(),
            payload: ElementPayload::Component(Component {
                captures: vec![id("b.bp", ElementKind::DataPoint, 0)],
                ..Default::default()
            }),
        };
        let previous = Graph {
            elements: vec![data("b.bp", 0, "Email")],
            ..Default::default()
        };
        let set = files(vec![
            file("a.bp", vec![c], vec![]),
            file("b.bp", vec![data("b.bp", 0, "Name"), data("b.bp", 1, "Email")], vec![]),
        ]);

        let (graph, report) = aggregator().aggregate(&set, Some(&previous), &[]);
        let form = graph.elements.iter().find(|e| e.label == "Form").unwrap();
        let expected = id("b.bp", ElementKind::DataPoint, 1);
        assert_eq!(form.references(), vec![("captures", &expected)]);
        assert_eq!(report.recovered.len(), 1);
        assert_eq!(report.recovered[0].context, "Component.captures");
    }

    #[test]
    fn test_relabelled_local_target_is_kept() {
        let a = data("a.bp", 0, "A");
        let b = data("a.bp", 1, "Renamed");
        let edge = Edge::new(a.id.clone(), b.id.clone(), EdgeType::FlowsTo);
        let previous = Graph {
            elements: vec![data("a.bp", 0, "A"), data("a.bp", 1, "B")],
            ..Default::default()
        };
        let set = files(vec![file("a.bp", vec![a, b], vec![edge])]);

        let (graph, report) = aggregator().aggregate(&set, Some(&previous), &[]);
        assert_eq!(graph.edges.len(), 1);
        assert!(report.recovered.is_empty());
        assert!(report.dropped_edges.is_empty());
    }

    #[test]
    fn test_ambiguous_recovery_prefers_lowest_ordinal() {
        let a = data("a.bp", 0, "A");
        let target = id("b.bp", ElementKind::DataPoint, 5);
        let edge = Edge::new(a.id.clone(), target, EdgeType::FlowsTo);
        let previous = Graph {
            elements: vec![data("b.bp", 5, "Total")],
            ..Default::default()
        };
        let set = files(vec![
            file("a.bp", vec![a], vec![edge]),
            file("b.bp", vec![data("b.bp", 0, "Total"), data("b.bp", 1, "Total")], vec![]),
        ]);

        let (graph, report) = aggregator().aggregate(&set, Some(&previous), &[]);
        assert_eq!(graph.edges[0].to, id("b.bp", ElementKind::DataPoint, 0));
        assert_eq!(report.ambiguous.len(), 1);
        assert_eq!(report.ambiguous[0].candidates, 2);
    }

    #[test]
    fn test_stale_payload_reference_removed() {
        let ghost = id("b.bp", ElementKind::DataPoint, 3);
        let c = Element {
            id: id("a.bp", ElementKind::Component, 0),
            label: "Form".to_string(),
            payload: ElementPayload::Component(Component {
                captures: vec![ghost.clone()],
                ..Default::default()
            }),
        };
        let set = files(vec![file("a.bp", vec![c], vec![])]);

        let (graph, report) = aggregator().aggregate(&set, None, &[]);
        assert!(graph.elements[0].references().is_empty());
        assert_eq!(report.stale_references.len(), 1);
        assert_eq!(report.stale_references[0].field, "captures");
        assert_eq!(report.stale_references[0].target, ghost);
    }

    #[test]
    fn test_cross_file_render_contains() {
        let header = Element {
            id: id("src/header.bp", ElementKind::Component, 0),
            label: "Header".to_string(),
            payload: ElementPayload::Component(Component::default()),
        };
        let page = Element {
            id: id("src/page.bp", ElementKind::Component, 0),
            label: "Page".to_string(),
            payload: ElementPayload::Component(Component::default()),
        };
        let mut page_file = file("src/page.bp", vec![page.clone()], vec![]);
        page_file.imports.push(import("./header", &["Header"]));
        page_file.usages.push(Usage {
            local: "Header".to_string(),
            usage: UsageKind::Render,
            site: page.id.clone(),
            arguments: Vec::new(),
        });
        let set = files(vec![file("src/header.bp", vec![header.clone()], vec![]), page_file]);

        let (graph, report) = aggregator().aggregate(&set, None, &[]);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].from, page.id);
        assert_eq!(graph.edges[0].to, header.id);
        assert_eq!(graph.edges[0].edge_type, EdgeType::Contains);
        assert_eq!(report.cross_file_edges, 1);

        let page_after = graph.element(&page.id).unwrap();
        match &page_after.payload {
            ElementPayload::Component(c) => assert_eq!(c.children, vec![header.id.clone()]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_invoke_links_arguments_to_transform() {
        let total = Element {
            id: id("calc.bp", ElementKind::Transform, 0),
            label: "computeTotal".to_string(),
            payload: ElementPayload::Transform(Transform::default()),
        };
        let price = data("form.bp", 0, "price");
        let qty = data("form.bp", 1, "qty");
        let form = Element {
            id: id("form.bp", ElementKind::Component, 0),
            label: "Order".to_string(),
            payload: ElementPayload::Component(Component::default()),
        };
        let mut form_file = file("form.bp", vec![price.clone(), qty.clone(), form.clone()], vec![]);
        form_file.imports.push(import("./calc", &["ComputeTotal"]));
        form_file.usages.push(Usage {
            local: "ComputeTotal".to_string(),
            usage: UsageKind::Invoke,
            site: form.id.clone(),
            arguments: vec![price.id.clone(), qty.id.clone()],
        });
        let set = files(vec![file("calc.bp", vec![total.clone()], vec![]), form_file]);

        let (graph, _) = aggregator().aggregate(&set, None, &[]);
        let transforms: Vec<_> = graph
            .edges
            .iter()
            .filter(|e| e.edge_type == EdgeType::Transforms)
            .collect();
        assert_eq!(transforms.len(), 2);
        assert!(transforms.iter().all(|e| e.to == total.id));
    }

    #[test]
    fn test_query_flows_from_table() {
        let orders = Element {
            id: id("db/schema.sql", ElementKind::Table, 0),
            label: "orders".to_string(),
            payload: ElementPayload::Table(Table::default()),
        };
        let list = Element {
            id: id("ui/list.bp", ElementKind::Component, 0),
            label: "OrderList".to_string(),
            payload: ElementPayload::Component(Component::default()),
        };
        let mut list_file = file("ui/list.bp", vec![list.clone()], vec![]);
        list_file.imports.push(import("/db/schema", &["Orders"]));
        list_file.usages.push(Usage {
            local: "Orders".to_string(),
            usage: UsageKind::Query,
            site: list.id.clone(),
            arguments: Vec::new(),
        });
        let set = files(vec![file("db/schema.sql", vec![orders.clone()], vec![]), list_file]);

        let (graph, _) = aggregator().aggregate(&set, None, &[]);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].from, orders.id);
        assert_eq!(graph.edges[0].to, list.id);
        assert_eq!(graph.edges[0].edge_type, EdgeType::FlowsTo);
    }

    #[test]
    fn test_barrel_reexport_cycle_is_tolerated() {
        let button = Element {
            id: id("ui/button.bp", ElementKind::Component, 0),
            label: "Button".to_string(),
            payload: ElementPayload::Component(Component::default()),
        };
        let page = Element {
            id: id("page.bp", ElementKind::Component, 0),
            label: "Page".to_string(),
            payload: ElementPayload::Component(Component::default()),
        };

        // ui/index re-exports everything from ./button and from itself via ./other,
        // and ./other re-exports ./index back
        let mut index_file = file("ui/index.bp", vec![], vec![]);
        index_file.imports.push(Import {
            source: "./other".to_string(),
            names: vec![ImportedName::new("*", "*")],
            reexport: true,
        });
        index_file.imports.push(Import {
            source: "./button".to_string(),
            names: vec![ImportedName::new("*", "*")],
            reexport: true,
        });
        let mut other_file = file("ui/other.bp", vec![], vec![]);
        other_file.imports.push(Import {
            source: "./index".to_string(),
            names: vec![ImportedName::new("*", "*")],
            reexport: true,
        });
        let mut page_file = file("page.bp", vec![page.clone()], vec![]);
        page_file.imports.push(import("./ui", &["Button"]));
        page_file.usages.push(Usage {
            local: "Button".to_string(),
            usage: UsageKind::Render,
            site: page.id.clone(),
            arguments: Vec::new(),
        });

        let set = files(vec![
            file("ui/button.bp", vec![button.clone()], vec![]),
            index_file,
            other_file,
            page_file,
        ]);

        let (graph, _) = aggregator().aggregate(&set, None, &[]);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].to, button.id);
    }

    #[test]
    fn test_namespace_import_member() {
        let users = Element {
            id: id("db.sql", ElementKind::Table, 0),
            label: "users".to_string(),
            payload: ElementPayload::Table(Table::default()),
        };
        let form = Element {
            id: id("form.bp", ElementKind::Component, 0),
            label: "Signup".to_string(),
            payload: ElementPayload::Component(Component::default()),
        };
        let mut form_file = file("form.bp", vec![form.clone()], vec![]);
        form_file.imports.push(Import {
            source: "./db".to_string(),
            names: vec![ImportedName::new("*", "db")],
            reexport: false,
        });
        form_file.usages.push(Usage {
            local: "db.users".to_string(),
            usage: UsageKind::Mutate,
            site: form.id.clone(),
            arguments: Vec::new(),
        });
        let set = files(vec![file("db.sql", vec![users.clone()], vec![]), form_file]);

        let (graph, _) = aggregator().aggregate(&set, None, &[]);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].from, form.id);
        assert_eq!(graph.edges[0].to, users.id);
    }

    #[test]
    fn test_unresolved_and_external_imports_reported() {
        let mut f = file("a.bp", vec![], vec![]);
        f.imports.push(import("react", &["useState"]));
        f.imports.push(import("./missing", &["X"]));
        let set = files(vec![f]);

        let (_, report) = aggregator().aggregate(&set, None, &[]);
        assert_eq!(report.external_imports, 1);
        assert_eq!(report.unresolved_imports.len(), 1);
        assert_eq!(report.unresolved_imports[0].source, "./missing");
    }

    #[test]
    fn test_rule_override() {
        let orders = Element {
            id: id("schema.sql", ElementKind::Table, 0),
            label: "orders".to_string(),
            payload: ElementPayload::Table(Table::default()),
        };
        let list = Element {
            id: id("list.bp", ElementKind::Component, 0),
            label: "List".to_string(),
            payload: ElementPayload::Component(Component::default()),
        };
        let mut list_file = file("list.bp", vec![list.clone()], vec![]);
        list_file.imports.push(import("./schema", &["orders"]));
        list_file.usages.push(Usage {
            local: "orders".to_string(),
            usage: UsageKind::Query,
            site: list.id.clone(),
            arguments: Vec::new(),
        });
        let set = files(vec![file("schema.sql", vec![orders], vec![]), list_file]);

        let config = Config {
            edge_rules: vec![EdgeRule::new(
                ElementKind::Table,
                UsageKind::Query,
                EdgeType::Validates,
                Direction::UserToTarget,
            )],
            ..Default::default()
        };
        let (graph, _) = GraphAggregator::new(&config).aggregate(&set, None, &[]);
        assert_eq!(graph.edges[0].edge_type, EdgeType::Validates);
        assert_eq!(graph.edges[0].from, list.id);
    }

    #[test]
    fn test_order_independent_and_reports_diff() {
        let a = data("a.bp", 0, "A");
        let b = data("b.bp", 0, "B");
        let set = files(vec![
            file(
                "b.bp",
                vec![b.clone()],
                vec![Edge::new(b.id.clone(), a.id.clone(), EdgeType::FlowsTo)],
            ),
            file("a.bp", vec![a.clone()], vec![]),
        ]);

        let (first, report) = aggregator().aggregate(&set, None, &[]);
        assert_eq!(report.elements_added.get(&ElementKind::DataPoint), Some(&2));
        assert_eq!(report.edges_added, 1);
        assert_eq!(first.metadata.source_files, 2);
        assert_eq!(first.metadata.counts.get(&ElementKind::DataPoint), Some(&2));
        assert_eq!(first.metadata.counts.get(&ElementKind::Screen), Some(&0));

        let (second, report) = aggregator().aggregate(&set, Some(&first), &["c.bp".to_string()]);
        assert_eq!(first, second);
        assert!(report.elements_added.is_empty());
        assert_eq!(report.edges_added, 0);
        assert_eq!(report.failed_files, vec!["c.bp".to_string()]);
    }
}
