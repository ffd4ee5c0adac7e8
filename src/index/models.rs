use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IndexError;

/// Version of the persisted index document layout.
pub const STORE_VERSION: u32 = 1;

/// Milliseconds since the Unix epoch; clocks before the epoch collapse to 0.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}

// =====================================================
// Identifiers
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    DataPoint,
    Component,
    Transform,
    Table,
    Image,
    Screen,
}

impl ElementKind {
    pub const ALL: [ElementKind; 6] = [
        ElementKind::DataPoint,
        ElementKind::Component,
        ElementKind::Transform,
        ElementKind::Table,
        ElementKind::Image,
        ElementKind::Screen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::DataPoint => "DataPoint",
            ElementKind::Component => "Component",
            ElementKind::Transform => "Transform",
            ElementKind::Table => "Table",
            ElementKind::Image => "Image",
            ElementKind::Screen => "Screen",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementKind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ElementKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| IndexError::Parse(format!("unknown element kind: {}", s)))
    }
}

/// Stable, file-scoped identifier of an element.
///
/// Serialized as `{scope}:{path}#{Kind}:{ordinal}`. The ordinal is the
/// position of the element among same-kind elements of the same file, so
/// re-extracting an unchanged file reproduces the same identifiers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementId {
    pub scope: String,
    pub path: String,
    pub kind: ElementKind,
    pub ordinal: u32,
}

impl ElementId {
    pub fn new(
        scope: impl Into<String>,
        path: impl Into<String>,
        kind: ElementKind,
        ordinal: u32,
    ) -> Self {
        Self {
            scope: scope.into(),
            path: path.into(),
            kind,
            ordinal,
        }
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}:{}", self.scope, self.path, self.kind, self.ordinal)
    }
}

impl FromStr for ElementId {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IndexError::InvalidIdentifier(s.to_string());

        let (scope, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (path, tail) = rest.rsplit_once('#').ok_or_else(invalid)?;
        let (kind, ordinal) = tail.split_once(':').ok_or_else(invalid)?;
        if scope.is_empty() || path.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scope: scope.to_string(),
            path: path.to_string(),
            kind: kind.parse().map_err(|_| invalid())?,
            ordinal: ordinal.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for ElementId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ElementId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =====================================================
// Elements
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Captured,
    #[default]
    Inferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_description: Option<String>,
    #[serde(default)]
    pub constraints: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Data shown by the component
    #[serde(default)]
    pub displays: Vec<ElementId>,
    /// Data entered through the component
    #[serde(default)]
    pub captures: Vec<ElementId>,
    /// Nested components or images
    #[serde(default)]
    pub children: Vec<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    #[default]
    Formula,
    Validation,
    Workflow,
}

impl FromStr for TransformKind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "formula" => Ok(TransformKind::Formula),
            "validation" => Ok(TransformKind::Validation),
            "workflow" => Ok(TransformKind::Workflow),
            other => Err(IndexError::Parse(format!("unknown transform kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    #[serde(default)]
    pub transform_kind: TransformKind,
    #[serde(default)]
    pub inputs: Vec<ElementId>,
    #[serde(default)]
    pub outputs: Vec<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceKind {
    #[default]
    Database,
    Api,
    File,
    Manual,
}

impl FromStr for PersistenceKind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(PersistenceKind::Database),
            "api" => Ok(PersistenceKind::Api),
            "file" => Ok(PersistenceKind::File),
            "manual" => Ok(PersistenceKind::Manual),
            other => Err(IndexError::Parse(format!("unknown persistence kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    #[serde(default)]
    pub persistence_kind: PersistenceKind,
    #[serde(default)]
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Image {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    #[serde(default)]
    pub elements: Vec<ElementId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Screen {
    #[serde(default)]
    pub regions: Vec<Region>,
}

/// Kind-specific part of an element, tagged by `kind` in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ElementPayload {
    DataPoint(DataPoint),
    Component(Component),
    Transform(Transform),
    Table(Table),
    Image(Image),
    Screen(Screen),
}

impl ElementPayload {
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementPayload::DataPoint(_) => ElementKind::DataPoint,
            ElementPayload::Component(_) => ElementKind::Component,
            ElementPayload::Transform(_) => ElementKind::Transform,
            ElementPayload::Table(_) => ElementKind::Table,
            ElementPayload::Image(_) => ElementKind::Image,
            ElementPayload::Screen(_) => ElementKind::Screen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub label: String,
    #[serde(flatten)]
    pub payload: ElementPayload,
}

impl Element {
    pub fn kind(&self) -> ElementKind {
        self.payload.kind()
    }

    /// Every element id held in the payload, tagged with the field holding it.
    pub fn references(&self) -> Vec<(&'static str, &ElementId)> {
        let mut refs = Vec::new();
        match &self.payload {
            ElementPayload::Component(c) => {
                refs.extend(c.displays.iter().map(|id| ("displays", id)));
                refs.extend(c.captures.iter().map(|id| ("captures", id)));
                refs.extend(c.children.iter().map(|id| ("children", id)));
            }
            ElementPayload::Transform(t) => {
                refs.extend(t.inputs.iter().map(|id| ("inputs", id)));
                refs.extend(t.outputs.iter().map(|id| ("outputs", id)));
            }
            ElementPayload::Screen(s) => {
                for region in &s.regions {
                    refs.extend(region.elements.iter().map(|id| ("regions", id)));
                }
            }
            _ => {}
        }
        refs
    }

    /// Visits every payload reference; `keep` may rewrite the id in place and
    /// returns `false` to remove it.
    pub fn retain_references<F>(&mut self, mut keep: F)
    where
        F: FnMut(&'static str, &mut ElementId) -> bool,
    {
        match &mut self.payload {
            ElementPayload::Component(c) => {
                c.displays.retain_mut(|id| keep("displays", id));
                c.captures.retain_mut(|id| keep("captures", id));
                c.children.retain_mut(|id| keep("children", id));
            }
            ElementPayload::Transform(t) => {
                t.inputs.retain_mut(|id| keep("inputs", id));
                t.outputs.retain_mut(|id| keep("outputs", id));
            }
            ElementPayload::Screen(s) => {
                for region in &mut s.regions {
                    region.elements.retain_mut(|id| keep("regions", id));
                }
            }
            _ => {}
        }
        self.dedup_references();
    }

    /// Records `target` in the payload slot matching `usage`. Returns false
    /// when this kind of element has no such slot.
    pub fn bind(&mut self, usage: UsageKind, target: &ElementId) -> bool {
        let slot = match (&mut self.payload, usage) {
            (ElementPayload::Component(c), UsageKind::Render) => &mut c.children,
            (ElementPayload::Component(c), UsageKind::Capture) => &mut c.captures,
            (ElementPayload::Component(c), UsageKind::Display) => &mut c.displays,
            (ElementPayload::Transform(t), UsageKind::Input) => &mut t.inputs,
            (ElementPayload::Transform(t), UsageKind::Output) => &mut t.outputs,
            _ => return false,
        };
        if !slot.contains(target) {
            slot.push(target.clone());
        }
        true
    }

    /// Structural edges implied by the payload.
    pub fn payload_edges(&self) -> Vec<Edge> {
        let id = &self.id;
        let mut edges = Vec::new();
        match &self.payload {
            ElementPayload::Component(c) => {
                for d in &c.captures {
                    edges.push(Edge::new(id.clone(), d.clone(), EdgeType::FlowsTo));
                }
                for d in &c.displays {
                    edges.push(Edge::new(d.clone(), id.clone(), EdgeType::FlowsTo));
                }
                for child in &c.children {
                    edges.push(Edge::new(id.clone(), child.clone(), EdgeType::Contains));
                }
            }
            ElementPayload::Transform(t) => {
                for input in &t.inputs {
                    edges.push(Edge::new(input.clone(), id.clone(), EdgeType::Transforms));
                }
                for output in &t.outputs {
                    edges.push(Edge::new(id.clone(), output.clone(), EdgeType::DerivesFrom));
                }
            }
            ElementPayload::Screen(s) => {
                for region in &s.regions {
                    for e in &region.elements {
                        edges.push(
                            Edge::new(id.clone(), e.clone(), EdgeType::Contains)
                                .with_label(region.name.clone()),
                        );
                    }
                }
            }
            _ => {}
        }
        edges
    }

    fn dedup_references(&mut self) {
        fn dedup(ids: &mut Vec<ElementId>) {
            let mut seen = BTreeSet::new();
            ids.retain(|id| seen.insert(id.clone()));
        }
        match &mut self.payload {
            ElementPayload::Component(c) => {
                dedup(&mut c.displays);
                dedup(&mut c.captures);
                dedup(&mut c.children);
            }
            ElementPayload::Transform(t) => {
                dedup(&mut t.inputs);
                dedup(&mut t.outputs);
            }
            ElementPayload::Screen(s) => {
                for region in &mut s.regions {
                    dedup(&mut region.elements);
                }
            }
            _ => {}
        }
    }
}

// =====================================================
// Edges
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeType {
    FlowsTo,
    DerivesFrom,
    Transforms,
    Validates,
    Contains,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::FlowsTo => "flows-to",
            EdgeType::DerivesFrom => "derives-from",
            EdgeType::Transforms => "transforms",
            EdgeType::Validates => "validates",
            EdgeType::Contains => "contains",
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeType {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flows-to" => Ok(EdgeType::FlowsTo),
            "derives-from" => Ok(EdgeType::DerivesFrom),
            "transforms" => Ok(EdgeType::Transforms),
            "validates" => Ok(EdgeType::Validates),
            "contains" => Ok(EdgeType::Contains),
            other => Err(IndexError::Parse(format!("unknown edge type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from: ElementId,
    pub to: ElementId,
    pub edge_type: EdgeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(from: ElementId, to: ElementId, edge_type: EdgeType) -> Self {
        Self {
            from,
            to,
            edge_type,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Identity of the edge for deduplication.
    pub fn key(&self) -> (ElementId, ElementId, EdgeType) {
        (self.from.clone(), self.to.clone(), self.edge_type)
    }
}

// =====================================================
// Cross-file references
// =====================================================

/// How an importing file uses an imported name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    Render,
    Invoke,
    Query,
    Mutate,
    Capture,
    Display,
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedName {
    /// Name exported by the target file (`*` for namespace imports)
    pub name: String,
    /// Name bound in the importing file
    pub local: String,
}

impl ImportedName {
    pub fn new(name: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: local.into(),
        }
    }
}

/// An import-like statement naming another file or module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub source: String,
    #[serde(default)]
    pub names: Vec<ImportedName>,
    /// Re-exports make the names available to importers of this file
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reexport: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Local name as written at the use site (`ns.name` for namespace members)
    pub local: String,
    pub usage: UsageKind,
    /// Element of the importing file performing the use
    pub site: ElementId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<ElementId>,
}

// =====================================================
// Index document
// =====================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedFile {
    pub relative_path: String,
    #[serde(rename = "lastIndexed")]
    pub last_indexed_at: u64,
    #[serde(rename = "fileModified")]
    pub file_modified_at: u64,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub local_edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<Import>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<Usage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetadata {
    pub counts: BTreeMap<ElementKind, usize>,
    pub total_edges: usize,
    pub source_files: usize,
}

/// Derived project graph; recomputed from the file entries on every run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub metadata: GraphMetadata,
}

impl Graph {
    pub fn element(&self, id: &ElementId) -> Option<&Element> {
        self.elements
            .binary_search_by(|e| e.id.cmp(id))
            .ok()
            .map(|i| &self.elements[i])
    }

    pub fn labels(&self) -> BTreeMap<ElementId, String> {
        self.elements
            .iter()
            .map(|e| (e.id.clone(), e.label.clone()))
            .collect()
    }
}

/// The configuration that shaped the stored entries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub version: u32,
    pub created_at: u64,
    pub last_run_at: u64,
    pub project_root: String,
    #[serde(default)]
    pub config: StoredConfig,
    #[serde(default)]
    pub files: BTreeMap<String, IndexedFile>,
    #[serde(default)]
    pub graph: Graph,
}

impl Index {
    pub fn new(project_root: impl Into<String>, now: u64) -> Self {
        Self {
            version: STORE_VERSION,
            created_at: now,
            last_run_at: now,
            project_root: project_root.into(),
            config: StoredConfig::default(),
            files: BTreeMap::new(),
            graph: Graph::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
