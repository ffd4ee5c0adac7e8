//! Line-oriented blueprint notation.
//!
//! ```text
//! import Email, Total from "./form"
//! data Amount type=number origin=captured constraints=required,positive desc="Order amount"
//! component Checkout captures=Amount displays=Total children=Header layout=column
//! transform ComputeTotal kind=formula inputs=Amount outputs=Total logic="amount * 1.2"
//! table Orders persistence=database columns=id:int,amount:number
//! image Logo source=assets/logo.svg
//! screen Home regions=header:Logo+Header,body:Checkout
//! invoke ComputeTotal args=Amount by=Checkout
//! query Orders by=Checkout
//! mutate Orders by=Checkout
//! edge Amount -> Orders flows-to "persisted"
//! ```
//!
//! One statement per line, `#` starts a comment, double quotes group words.
//! Element declarations come first in ordinal order; references are resolved
//! in a second pass so they may point forward. A reference names a local
//! label, an imported name (recorded as a usage) or an explicit
//! `path#Kind:ordinal` identifier.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{IndexError, Result};
use crate::index::{
    Column, Component, DataPoint, EdgeType, ElementId, ElementKind, ElementPayload, Image,
    Import, ImportedName, Origin, PersistenceKind, Region, Screen, Table, Transform,
    TransformKind, Usage, UsageKind,
};
use crate::indexer::extractor::{Extraction, ExtractionBuilder, Extractor};

const KEYWORDS: &[&str] = &[
    "import",
    "export",
    "data",
    "component",
    "transform",
    "table",
    "image",
    "screen",
    "invoke",
    "query",
    "mutate",
    "edge",
];

pub struct BlueprintExtractor;

impl Extractor for BlueprintExtractor {
    fn name(&self) -> &'static str {
        "blueprint"
    }

    fn file_extensions(&self) -> &[&'static str] {
        &["bp", "blueprint"]
    }

    fn extract(&self, scope: &str, path: &str, content: &str) -> Result<Extraction> {
        let statements = parse(path, content)?;
        Builder::new(scope, path).build(&statements)
    }
}

struct Token {
    text: String,
    /// Byte offset of the first unquoted `=`
    split: Option<usize>,
}

struct Statement {
    line: usize,
    keyword: String,
    words: Vec<String>,
    attrs: Vec<(String, String)>,
}

impl Statement {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.attr(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn label(&self, path: &str) -> Result<&str> {
        self.words
            .first()
            .map(String::as_str)
            .ok_or_else(|| self.error(path, "missing label"))
    }

    fn error(&self, path: &str, message: impl std::fmt::Display) -> IndexError {
        IndexError::Parse(format!("{}:{}: {}", path, self.line, message))
    }
}

fn tokenize(line: &str) -> std::result::Result<Vec<Token>, &'static str> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut split = None;
    let mut in_token = false;
    let mut in_quote = false;

    for c in line.chars() {
        if in_quote {
            if c == '"' {
                in_quote = false;
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            '"' => {
                in_quote = true;
                in_token = true;
            }
            '#' if !in_token => break,
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(Token {
                        text: std::mem::take(&mut current),
                        split: split.take(),
                    });
                    in_token = false;
                }
            }
            '=' if split.is_none() => {
                split = Some(current.len());
                current.push(c);
                in_token = true;
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_quote {
        return Err("unterminated string");
    }
    if in_token {
        tokens.push(Token {
            text: current,
            split,
        });
    }
    Ok(tokens)
}

fn parse(path: &str, content: &str) -> Result<Vec<Statement>> {
    let mut statements = Vec::new();

    for (i, line) in content.lines().enumerate() {
        let tokens = tokenize(line)
            .map_err(|e| IndexError::Parse(format!("{}:{}: {}", path, i + 1, e)))?;
        let mut tokens = tokens.into_iter();
        let Some(first) = tokens.next() else {
            continue;
        };

        let keyword = first.text.to_ascii_lowercase();
        if !KEYWORDS.contains(&keyword.as_str()) {
            return Err(IndexError::Parse(format!(
                "{}:{}: unknown statement {:?}",
                path,
                i + 1,
                first.text
            )));
        }

        let mut statement = Statement {
            line: i + 1,
            keyword,
            words: Vec::new(),
            attrs: Vec::new(),
        };
        for token in tokens {
            match token.split {
                Some(at) => statement.attrs.push((
                    token.text[..at].to_string(),
                    token.text[at + 1..].to_string(),
                )),
                None => statement.words.push(token.text),
            }
        }
        statements.push(statement);
    }

    Ok(statements)
}

/// Payload slot a reference list fills.
#[derive(Clone, Copy)]
enum Field {
    Captures,
    Displays,
    Children,
    Inputs,
    Outputs,
    Region(usize),
}

impl Field {
    fn kinds(&self) -> &'static [ElementKind] {
        match self {
            Field::Captures | Field::Displays | Field::Inputs | Field::Outputs => {
                &[ElementKind::DataPoint]
            }
            Field::Children => &[ElementKind::Component, ElementKind::Image],
            Field::Region(_) => &[],
        }
    }

    fn usage(&self) -> UsageKind {
        match self {
            Field::Captures => UsageKind::Capture,
            Field::Displays => UsageKind::Display,
            Field::Children | Field::Region(_) => UsageKind::Render,
            Field::Inputs => UsageKind::Input,
            Field::Outputs => UsageKind::Output,
        }
    }
}

enum Target {
    Local(ElementId),
    Imported(String),
    Unknown,
}

struct Builder {
    builder: ExtractionBuilder,
    /// Local names bound by imports; namespace bindings are marked
    imported: BTreeMap<String, bool>,
}

impl Builder {
    fn new(scope: &str, path: &str) -> Self {
        Self {
            builder: ExtractionBuilder::new(scope, path),
            imported: BTreeMap::new(),
        }
    }

    fn build(mut self, statements: &[Statement]) -> Result<Extraction> {
        let mut pending: Vec<(ElementId, Field, Vec<String>, usize)> = Vec::new();

        // declarations
        for st in statements {
            match st.keyword.as_str() {
                "import" | "export" => self.declare_import(st)?,
                "data" | "component" | "transform" | "table" | "image" | "screen" => {
                    pending.extend(self.declare_element(st)?);
                }
                _ => {}
            }
        }

        // references
        for (id, field, names, line) in pending {
            for name in names {
                self.attach(&id, field, &name, line);
            }
        }
        for st in statements {
            match st.keyword.as_str() {
                "invoke" => self.invoke(st)?,
                "query" | "mutate" => self.access(st)?,
                "edge" => self.edge(st)?,
                _ => {}
            }
        }

        Ok(self.builder.finish())
    }

    fn path(&self) -> String {
        self.builder.path().to_string()
    }

    fn declare_import(&mut self, st: &Statement) -> Result<()> {
        let reexport = st.keyword == "export";
        let from = st.words.iter().position(|w| w.eq_ignore_ascii_case("from"));

        let (specs, source) = match from {
            Some(at) => {
                let source = st
                    .words
                    .get(at + 1)
                    .ok_or_else(|| st.error(&self.path(), "missing import source"))?;
                (st.words[..at].join(" "), source.clone())
            }
            None if st.words.len() == 1 && !reexport => (String::new(), st.words[0].clone()),
            None => return Err(st.error(&self.path(), "expected `from \"source\"`")),
        };

        let mut names = Vec::new();
        for spec in specs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let parts: Vec<&str> = spec.split_whitespace().collect();
            let name = match parts.as_slice() {
                [name] => ImportedName::new(*name, *name),
                [name, alias, local] if alias.eq_ignore_ascii_case("as") => {
                    ImportedName::new(*name, *local)
                }
                _ => return Err(st.error(&self.path(), format!("invalid import {:?}", spec))),
            };
            if !reexport {
                self.imported
                    .insert(name.local.clone(), name.name == "*");
            }
            names.push(name);
        }

        self.builder.import(Import {
            source,
            names,
            reexport,
        });
        Ok(())
    }

    fn declare_element(
        &mut self,
        st: &Statement,
    ) -> Result<Vec<(ElementId, Field, Vec<String>, usize)>> {
        let path = self.path();
        let label = st.label(&path)?.to_string();
        let mut refs = Vec::new();

        let payload = match st.keyword.as_str() {
            "data" => ElementPayload::DataPoint(DataPoint {
                value_type: st.attr("type").map(str::to_string),
                origin: match st.attr("origin") {
                    Some(o) if o.eq_ignore_ascii_case("captured") => Origin::Captured,
                    Some(o) if o.eq_ignore_ascii_case("inferred") => Origin::Inferred,
                    Some(o) => return Err(st.error(&path, format!("unknown origin {:?}", o))),
                    None => Origin::Inferred,
                },
                origin_description: st.attr("desc").map(str::to_string),
                constraints: st.list("constraints").into_iter().collect::<BTreeSet<_>>(),
            }),
            "component" => {
                refs.push((Field::Captures, st.list("captures")));
                refs.push((Field::Displays, st.list("displays")));
                refs.push((Field::Children, st.list("children")));
                ElementPayload::Component(Component {
                    layout_hint: st.attr("layout").map(str::to_string),
                    ..Default::default()
                })
            }
            "transform" => {
                refs.push((Field::Inputs, st.list("inputs")));
                refs.push((Field::Outputs, st.list("outputs")));
                let transform_kind = match st.attr("kind") {
                    Some(k) => k.parse::<TransformKind>().map_err(|e| st.error(&path, e))?,
                    None => Default::default(),
                };
                ElementPayload::Transform(Transform {
                    transform_kind,
                    logic_description: st.attr("logic").map(str::to_string),
                    ..Default::default()
                })
            }
            "table" => {
                let persistence_kind = match st.attr("persistence") {
                    Some(p) => p.parse::<PersistenceKind>().map_err(|e| st.error(&path, e))?,
                    None => Default::default(),
                };
                let columns = st
                    .list("columns")
                    .into_iter()
                    .map(|c| match c.split_once(':') {
                        Some((name, ty)) => Column {
                            name: name.to_string(),
                            value_type: Some(ty.to_string()),
                        },
                        None => Column {
                            name: c,
                            value_type: None,
                        },
                    })
                    .collect();
                ElementPayload::Table(Table {
                    persistence_kind,
                    columns,
                })
            }
            "image" => ElementPayload::Image(Image {
                source: st.attr("source").map(str::to_string),
            }),
            _ => {
                let mut regions = Vec::new();
                for (i, spec) in st.list("regions").into_iter().enumerate() {
                    let (name, members) = match spec.split_once(':') {
                        Some((name, members)) => (name.to_string(), members.to_string()),
                        None => (spec, String::new()),
                    };
                    let members = members
                        .split('+')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect();
                    refs.push((Field::Region(i), members));
                    regions.push(Region {
                        name,
                        elements: Vec::new(),
                    });
                }
                ElementPayload::Screen(Screen { regions })
            }
        };

        let id = self.builder.push(label, payload);
        Ok(refs
            .into_iter()
            .filter(|(_, names)| !names.is_empty())
            .map(|(field, names)| (id.clone(), field, names, st.line))
            .collect())
    }

    fn resolve(&self, kinds: &[ElementKind], name: &str) -> Target {
        if let Some(id) = self.builder.explicit_id(name) {
            return Target::Local(id);
        }
        let local = if kinds.is_empty() {
            self.builder.find_label(name)
        } else {
            kinds
                .iter()
                .find_map(|kind| self.builder.find_label_of_kind(*kind, name))
        };
        if let Some(id) = local {
            return Target::Local(id);
        }

        let imported = self.imported.contains_key(name)
            || name
                .split_once('.')
                .is_some_and(|(ns, _)| self.imported.get(ns) == Some(&true));
        if imported {
            Target::Imported(name.to_string())
        } else {
            Target::Unknown
        }
    }

    fn resolve_local(&self, kinds: &[ElementKind], name: &str, line: usize) -> Option<ElementId> {
        match self.resolve(kinds, name) {
            Target::Local(id) => Some(id),
            _ => {
                tracing::debug!(
                    "{}:{}: unresolved reference {:?}",
                    self.builder.path(),
                    line,
                    name
                );
                None
            }
        }
    }

    fn attach(&mut self, site: &ElementId, field: Field, name: &str, line: usize) {
        match self.resolve(field.kinds(), name) {
            Target::Local(target) => {
                let Some(element) = self.builder.element_mut(site) else {
                    return;
                };
                let slot = match (&mut element.payload, field) {
                    (ElementPayload::Component(c), Field::Captures) => &mut c.captures,
                    (ElementPayload::Component(c), Field::Displays) => &mut c.displays,
                    (ElementPayload::Component(c), Field::Children) => &mut c.children,
                    (ElementPayload::Transform(t), Field::Inputs) => &mut t.inputs,
                    (ElementPayload::Transform(t), Field::Outputs) => &mut t.outputs,
                    (ElementPayload::Screen(s), Field::Region(i)) => match s.regions.get_mut(i) {
                        Some(region) => &mut region.elements,
                        None => return,
                    },
                    _ => return,
                };
                if !slot.contains(&target) {
                    slot.push(target);
                }
            }
            Target::Imported(local) => self.builder.usage(Usage {
                local,
                usage: field.usage(),
                site: site.clone(),
                arguments: Vec::new(),
            }),
            Target::Unknown => {
                tracing::debug!("{}:{}: unresolved reference {:?}", self.builder.path(), line, name)
            }
        }
    }

    fn site(&self, st: &Statement) -> Option<ElementId> {
        st.attr("by").and_then(|by| self.resolve_local(&[], by, st.line))
    }

    fn invoke(&mut self, st: &Statement) -> Result<()> {
        let target = st.label(&self.path())?.to_string();
        let args: Vec<ElementId> = st
            .list("args")
            .iter()
            .filter_map(|a| self.resolve_local(&[ElementKind::DataPoint], a, st.line))
            .collect();

        match self.resolve(&[ElementKind::Transform], &target) {
            Target::Local(transform) => {
                for arg in args {
                    self.builder.edge(arg, transform.clone(), EdgeType::Transforms, None);
                }
            }
            Target::Imported(local) => {
                let Some(site) = self.site(st).or_else(|| args.first().cloned()) else {
                    tracing::debug!("{}:{}: invoke without site", self.builder.path(), st.line);
                    return Ok(());
                };
                self.builder.usage(Usage {
                    local,
                    usage: UsageKind::Invoke,
                    site,
                    arguments: args,
                });
            }
            Target::Unknown => {
                tracing::debug!(
                    "{}:{}: unknown transform {:?}",
                    self.builder.path(),
                    st.line,
                    target
                )
            }
        }
        Ok(())
    }

    fn access(&mut self, st: &Statement) -> Result<()> {
        let target = st.label(&self.path())?.to_string();
        let Some(site) = self.site(st) else {
            tracing::debug!("{}:{}: {} without site", self.builder.path(), st.line, st.keyword);
            return Ok(());
        };
        let query = st.keyword == "query";

        match self.resolve(&[ElementKind::Table], &target) {
            Target::Local(table) if query => {
                self.builder.edge(table, site, EdgeType::FlowsTo, None)
            }
            Target::Local(table) => self.builder.edge(site, table, EdgeType::FlowsTo, None),
            Target::Imported(local) => self.builder.usage(Usage {
                local,
                usage: if query { UsageKind::Query } else { UsageKind::Mutate },
                site,
                arguments: Vec::new(),
            }),
            Target::Unknown => {
                tracing::debug!("{}:{}: unknown table {:?}", self.builder.path(), st.line, target)
            }
        }
        Ok(())
    }

    fn edge(&mut self, st: &Statement) -> Result<()> {
        let path = self.path();
        let (from, to) = match st.words.as_slice() {
            [from, arrow, to, ..] if arrow == "->" => (from, to),
            _ => return Err(st.error(&path, "expected `edge A -> B [type] [label]`")),
        };
        let edge_type = match st.words.get(3) {
            Some(t) => t.parse::<EdgeType>().map_err(|e| st.error(&path, e))?,
            None => EdgeType::FlowsTo,
        };
        let label = st
            .words
            .get(4)
            .map(String::as_str)
            .or_else(|| st.attr("label"))
            .map(str::to_string);

        let from = self.resolve_local(&[], from, st.line);
        let to = self.resolve_local(&[], to, st.line);
        if let (Some(from), Some(to)) = (from, to) {
            self.builder.edge(from, to, edge_type, label);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Element;

    fn extract(path: &str, content: &str) -> Extraction {
        BlueprintExtractor.extract("local", path, content).unwrap()
    }

    fn element<'a>(extraction: &'a Extraction, label: &str) -> &'a Element {
        extraction
            .elements
            .iter()
            .find(|e| e.label == label)
            .unwrap()
    }

    #[test]
    fn test_declarations_and_payload_edges() {
        let extraction = extract(
            "form.bp",
            r#"
# signup form
data Email type=string origin=captured constraints=required,email desc="Login address"
component Signup captures=Email layout=column
"#,
        );

        assert_eq!(extraction.elements.len(), 2);
        let email = element(&extraction, "Email");
        assert_eq!(email.id.to_string(), "local:form.bp#DataPoint:0");
        match &email.payload {
            ElementPayload::DataPoint(d) => {
                assert_eq!(d.value_type.as_deref(), Some("string"));
                assert_eq!(d.origin, Origin::Captured);
                assert_eq!(d.origin_description.as_deref(), Some("Login address"));
                assert!(d.constraints.contains("email"));
            }
            _ => unreachable!(),
        }

        assert_eq!(extraction.local_edges.len(), 1);
        let edge = &extraction.local_edges[0];
        assert_eq!(edge.from.to_string(), "local:form.bp#Component:0");
        assert_eq!(edge.to, email.id);
        assert_eq!(edge.edge_type, EdgeType::FlowsTo);
    }

    #[test]
    fn test_forward_references_resolve() {
        let extraction = extract(
            "calc.bp",
            "transform Sum inputs=A,B outputs=Total\ndata A\ndata B\ndata Total\n",
        );
        let sum = element(&extraction, "Sum");
        assert_eq!(sum.references().len(), 3);
        assert_eq!(extraction.local_edges.len(), 3);
    }

    #[test]
    fn test_imports_become_usages() {
        let extraction = extract(
            "calc.bp",
            r#"
import Email from "./form"
import Users as Accounts, * as db from "./schema"
data Total
transform Compute inputs=Email outputs=Total
component Admin children=db.Panel
query Accounts by=Admin
"#,
        );

        assert_eq!(extraction.imports.len(), 2);
        assert_eq!(extraction.imports[1].names[0], ImportedName::new("Users", "Accounts"));
        assert_eq!(extraction.imports[1].names[1], ImportedName::new("*", "db"));

        let usages: Vec<(&str, UsageKind)> = extraction
            .usages
            .iter()
            .map(|u| (u.local.as_str(), u.usage))
            .collect();
        assert_eq!(
            usages,
            vec![
                ("Email", UsageKind::Input),
                ("db.Panel", UsageKind::Render),
                ("Accounts", UsageKind::Query),
            ]
        );
        // only the local output produces an edge here
        assert_eq!(extraction.local_edges.len(), 1);
    }

    #[test]
    fn test_explicit_identifier_reference() {
        let extraction = extract("a.bp", "component Form captures=b.bp#DataPoint:3\n");
        let form = element(&extraction, "Form");
        assert_eq!(form.references()[0].1.to_string(), "local:b.bp#DataPoint:3");
    }

    #[test]
    fn test_statements_create_edges() {
        let extraction = extract(
            "ops.bp",
            r#"
data Price
data Qty
data "Grand total"
component Cart
transform Multiply
table Orders persistence=db columns=id:int,total
invoke Multiply args=Price,Qty
query Orders by=Cart
mutate Orders by=Cart
edge "Grand total" -> Orders derives-from "snapshot"
"#,
        );

        let edges: Vec<(String, String, EdgeType)> = extraction
            .local_edges
            .iter()
            .map(|e| (e.from.to_string(), e.to.to_string(), e.edge_type))
            .collect();
        assert!(edges.contains(&(
            "local:ops.bp#DataPoint:0".into(),
            "local:ops.bp#Transform:0".into(),
            EdgeType::Transforms
        )));
        assert!(edges.contains(&(
            "local:ops.bp#Table:0".into(),
            "local:ops.bp#Component:0".into(),
            EdgeType::FlowsTo
        )));
        assert!(edges.contains(&(
            "local:ops.bp#Component:0".into(),
            "local:ops.bp#Table:0".into(),
            EdgeType::FlowsTo
        )));
        let last = extraction.local_edges.last().unwrap();
        assert_eq!(last.edge_type, EdgeType::DerivesFrom);
        assert_eq!(last.label.as_deref(), Some("snapshot"));

        match &element(&extraction, "Orders").payload {
            ElementPayload::Table(t) => {
                assert_eq!(t.columns.len(), 2);
                assert_eq!(t.columns[0].value_type.as_deref(), Some("int"));
                assert_eq!(t.columns[1].value_type, None);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_screen_regions() {
        let extraction = extract(
            "home.bp",
            "image Logo source=logo.svg\ncomponent Nav\nscreen Home regions=header:Logo+Nav,footer\n",
        );
        match &element(&extraction, "Home").payload {
            ElementPayload::Screen(s) => {
                assert_eq!(s.regions.len(), 2);
                assert_eq!(s.regions[0].name, "header");
                assert_eq!(s.regions[0].elements.len(), 2);
                assert!(s.regions[1].elements.is_empty());
            }
            _ => unreachable!(),
        }
        let contains: Vec<_> = extraction
            .local_edges
            .iter()
            .filter(|e| e.label.as_deref() == Some("header"))
            .collect();
        assert_eq!(contains.len(), 2);
    }

    #[test]
    fn test_reexports() {
        let extraction = extract(
            "index.bp",
            "export * from \"./form\"\nexport Total as Sum from \"./calc\"\n",
        );
        assert!(extraction.imports.iter().all(|i| i.reexport));
        assert_eq!(extraction.imports[0].names[0].name, "*");
        assert_eq!(extraction.imports[1].names[0], ImportedName::new("Total", "Sum"));
        assert!(extraction.elements.is_empty());
    }

    #[test]
    fn test_deterministic() {
        let content = "data A\ndata B\ncomponent C captures=A displays=B\n";
        assert_eq!(extract("x.bp", content), extract("x.bp", content));
    }

    #[test]
    fn test_unknown_statement_is_error() {
        let err = BlueprintExtractor
            .extract("local", "bad.bp", "data A\nwidget B\n")
            .unwrap_err();
        assert!(err.to_string().contains("bad.bp:2"));
    }

    #[test]
    fn test_unterminated_string_is_error() {
        assert!(BlueprintExtractor
            .extract("local", "bad.bp", "data \"Oops\n")
            .is_err());
    }

    #[test]
    fn test_unresolved_reference_ignored() {
        let extraction = extract("a.bp", "component Form captures=Missing\n");
        assert!(extraction.local_edges.is_empty());
        assert!(extraction.usages.is_empty());
    }
}
