//! TypeScript / JavaScript strategy on top of tree-sitter.
//!
//! Heuristics, applied to top-level declarations only:
//! - a capitalized function whose body contains JSX is a Component
//! - `<input|textarea|select name="x">` inside it captures DataPoint `x`
//! - `{x}` in JSX displays DataPoint `x` when one is declared in the file
//! - every other function is a formula Transform, its parameters become
//!   inferred input DataPoints
//! - capitalized JSX tags render local components, or imported ones (usage)
//! - calls to imported functions become invoke usages

use std::collections::BTreeMap;

use tree_sitter::{Node, Parser};

use crate::error::{IndexError, Result};
use crate::index::{
    Component, DataPoint, EdgeType, ElementId, ElementKind, ElementPayload, Import, ImportedName,
    Origin, Transform, TransformKind, Usage, UsageKind,
};
use crate::indexer::extractor::{Extraction, ExtractionBuilder, Extractor};
use crate::languages::collect_kind;

const CAPTURE_TAGS: &[&str] = &["input", "textarea", "select"];

pub struct TypeScriptExtractor;

impl Extractor for TypeScriptExtractor {
    fn name(&self) -> &'static str {
        "typescript"
    }

    fn file_extensions(&self) -> &[&'static str] {
        &["ts", "tsx", "js", "jsx"]
    }

    fn extract(&self, scope: &str, path: &str, content: &str) -> Result<Extraction> {
        // plain .ts cannot hold JSX, and the TSX grammar rejects `<T>x` casts
        let language: tree_sitter::Language = if path.to_ascii_lowercase().ends_with(".ts") {
            tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
        } else {
            tree_sitter_typescript::LANGUAGE_TSX.into()
        };

        let mut parser = Parser::new();
        parser
            .set_language(&language)
            .map_err(|e| IndexError::Parse(e.to_string()))?;
        let tree = parser
            .parse(content, None)
            .ok_or_else(|| IndexError::Parse(format!("{}: failed to parse source", path)))?;

        let mut walker = Walker::new(scope, path, content.as_bytes());
        walker.visit_program(tree.root_node());
        Ok(walker.finish())
    }
}

struct Function<'t> {
    name: String,
    params: Option<Node<'t>>,
    body: Node<'t>,
}

enum Pending {
    Child { site: ElementId, name: String },
    Display { site: ElementId, name: String },
    Call { site: ElementId, callee: String, args: Vec<String> },
}

struct Walker<'s> {
    source: &'s [u8],
    builder: ExtractionBuilder,
    /// Local import bindings; `true` for namespace imports
    imported: BTreeMap<String, bool>,
    pending: Vec<Pending>,
}

impl<'s> Walker<'s> {
    fn new(scope: &str, path: &str, source: &'s [u8]) -> Self {
        Self {
            source,
            builder: ExtractionBuilder::new(scope, path),
            imported: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    fn text(&self, node: Node) -> &'s str {
        node.utf8_text(self.source).unwrap_or("")
    }

    fn string_value(&self, node: Node) -> String {
        self.text(node)
            .trim_matches(|c| c == '"' || c == '\'' || c == '`')
            .to_string()
    }

    fn visit_program(&mut self, root: Node) {
        let mut functions = Vec::new();
        let mut cursor = root.walk();
        let children: Vec<Node> = root.named_children(&mut cursor).collect();
        for child in children {
            self.top_level(child, &mut functions);
        }

        for function in functions {
            if starts_uppercase(&function.name) && contains_jsx(function.body) {
                let id = self
                    .builder
                    .push(function.name.clone(), ElementPayload::Component(Component::default()));
                self.walk(&id, function.body);
            } else {
                self.transform(&function);
            }
        }
    }

    fn top_level<'t>(&mut self, node: Node<'t>, functions: &mut Vec<Function<'t>>) {
        match node.kind() {
            "import_statement" => self.import(node),
            "export_statement" => {
                if node.child_by_field_name("source").is_some() {
                    self.reexport(node);
                } else if let Some(declaration) = node.child_by_field_name("declaration") {
                    self.top_level(declaration, functions);
                }
            }
            "function_declaration" | "generator_function_declaration" => {
                let (Some(name), Some(body)) = (
                    node.child_by_field_name("name"),
                    node.child_by_field_name("body"),
                ) else {
                    return;
                };
                functions.push(Function {
                    name: self.text(name).to_string(),
                    params: node.child_by_field_name("parameters"),
                    body,
                });
            }
            "lexical_declaration" | "variable_declaration" => {
                let mut cursor = node.walk();
                for declarator in node.named_children(&mut cursor) {
                    if declarator.kind() != "variable_declarator" {
                        continue;
                    }
                    let (Some(name), Some(value)) = (
                        declarator.child_by_field_name("name"),
                        declarator.child_by_field_name("value"),
                    ) else {
                        continue;
                    };
                    if !matches!(
                        value.kind(),
                        "arrow_function" | "function_expression" | "function"
                    ) {
                        continue;
                    }
                    let Some(body) = value.child_by_field_name("body") else {
                        continue;
                    };
                    functions.push(Function {
                        name: self.text(name).to_string(),
                        params: value
                            .child_by_field_name("parameters")
                            .or_else(|| value.child_by_field_name("parameter")),
                        body,
                    });
                }
            }
            _ => {}
        }
    }

    fn import(&mut self, node: Node) {
        let Some(source) = node.child_by_field_name("source") else {
            return;
        };
        let source = self.string_value(source);
        let mut names = Vec::new();

        let mut cursor = node.walk();
        for clause in node.named_children(&mut cursor) {
            if clause.kind() != "import_clause" {
                continue;
            }
            let mut inner = clause.walk();
            for part in clause.named_children(&mut inner) {
                match part.kind() {
                    "identifier" => {
                        let local = self.text(part);
                        names.push(ImportedName::new(local, local));
                    }
                    "named_imports" => {
                        let mut specs = part.walk();
                        for spec in part.named_children(&mut specs) {
                            if spec.kind() == "import_specifier" {
                                names.extend(self.specifier(spec));
                            }
                        }
                    }
                    "namespace_import" => {
                        let mut idents = part.walk();
                        let ident = part
                            .named_children(&mut idents)
                            .find(|n| n.kind() == "identifier");
                        if let Some(ident) = ident {
                            names.push(ImportedName::new("*", self.text(ident)));
                        }
                    }
                    _ => {}
                }
            }
        }

        for name in &names {
            self.imported.insert(name.local.clone(), name.name == "*");
        }
        self.builder.import(Import {
            source,
            names,
            reexport: false,
        });
    }

    fn reexport(&mut self, node: Node) {
        let Some(source) = node.child_by_field_name("source") else {
            return;
        };
        let source = self.string_value(source);
        let mut names = Vec::new();

        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "export_clause" => {
                    let mut specs = child.walk();
                    for spec in child.named_children(&mut specs) {
                        if spec.kind() == "export_specifier" {
                            names.extend(self.specifier(spec));
                        }
                    }
                }
                "namespace_export" => {
                    let mut idents = child.walk();
                    let ident = child.named_children(&mut idents).next();
                    if let Some(ident) = ident {
                        names.push(ImportedName::new("*", self.string_value(ident)));
                    }
                }
                _ => {}
            }
        }
        if names.is_empty() {
            names.push(ImportedName::new("*", "*"));
        }

        self.builder.import(Import {
            source,
            names,
            reexport: true,
        });
    }

    fn specifier(&self, spec: Node) -> Option<ImportedName> {
        let name = self.string_value(spec.child_by_field_name("name")?);
        let local = spec
            .child_by_field_name("alias")
            .map(|a| self.string_value(a))
            .unwrap_or_else(|| name.clone());
        Some(ImportedName::new(name, local))
    }

    fn transform(&mut self, function: &Function) {
        let params = function
            .params
            .map(|p| self.parameters(p))
            .unwrap_or_default();

        let id = self.builder.push(
            function.name.clone(),
            ElementPayload::Transform(Transform {
                transform_kind: TransformKind::Formula,
                ..Default::default()
            }),
        );

        let mut inputs = Vec::new();
        for (name, value_type) in params {
            let input = match self.builder.find_label_of_kind(ElementKind::DataPoint, &name) {
                Some(existing) => existing,
                None => self.builder.push(
                    name,
                    ElementPayload::DataPoint(DataPoint {
                        value_type,
                        origin: Origin::Inferred,
                        ..Default::default()
                    }),
                ),
            };
            if !inputs.contains(&input) {
                inputs.push(input);
            }
        }
        if let Some(element) = self.builder.element_mut(&id) {
            if let ElementPayload::Transform(t) = &mut element.payload {
                t.inputs = inputs;
            }
        }

        self.walk(&id, function.body);
    }

    /// Parameter names with their type annotation, destructured names flattened.
    fn parameters(&self, node: Node) -> Vec<(String, Option<String>)> {
        if node.kind() == "identifier" {
            return vec![(self.text(node).to_string(), None)];
        }

        let mut params = Vec::new();
        let mut cursor = node.walk();
        for param in node.named_children(&mut cursor) {
            let (pattern, annotation) = match param.kind() {
                "required_parameter" | "optional_parameter" => (
                    param.child_by_field_name("pattern"),
                    param.child_by_field_name("type"),
                ),
                "identifier" => (Some(param), None),
                _ => (None, None),
            };
            let Some(pattern) = pattern else {
                continue;
            };
            let value_type = annotation.map(|t| {
                self.text(t)
                    .trim_start_matches(':')
                    .trim()
                    .to_string()
            });

            match pattern.kind() {
                "identifier" => params.push((self.text(pattern).to_string(), value_type)),
                "object_pattern" | "array_pattern" => {
                    let kinds = ["shorthand_property_identifier_pattern", "identifier"];
                    for name in collect_kind(pattern, &kinds) {
                        params.push((self.text(name).to_string(), None));
                    }
                }
                _ => {}
            }
        }
        params
    }

    /// Visits the subtree in source order. Iterative, so arbitrarily deep
    /// expressions cannot exhaust the worker's stack.
    fn walk(&mut self, site: &ElementId, root: Node) {
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            self.visit(site, node);
            let mut cursor = node.walk();
            let children: Vec<Node> = node.named_children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }
    }

    fn visit(&mut self, site: &ElementId, node: Node) {
        match node.kind() {
            "jsx_opening_element" | "jsx_self_closing_element" => self.jsx_tag(site, node),
            "jsx_expression" => {
                let in_attribute = node.parent().is_some_and(|p| p.kind() == "jsx_attribute");
                let mut cursor = node.walk();
                let only: Vec<Node> = node.named_children(&mut cursor).collect();
                if let [ident] = only.as_slice() {
                    if ident.kind() == "identifier" && !in_attribute {
                        self.pending.push(Pending::Display {
                            site: site.clone(),
                            name: self.text(*ident).to_string(),
                        });
                    }
                }
            }
            "call_expression" => self.call(site, node),
            _ => {}
        }
    }

    fn jsx_tag(&mut self, site: &ElementId, node: Node) {
        let Some(name) = node.child_by_field_name("name") else {
            return;
        };
        let tag = self.text(name);

        if CAPTURE_TAGS.contains(&tag) {
            let attrs = self.jsx_attributes(node);
            let Some(Some(field)) = attrs.get("name") else {
                return;
            };
            let value_type = match attrs.get("type") {
                Some(Some(t)) => t.clone(),
                _ if tag == "select" => "enum".to_string(),
                _ => "string".to_string(),
            };
            self.capture(site, field, value_type);
        } else if starts_uppercase(tag) || tag.contains('.') {
            self.pending.push(Pending::Child {
                site: site.clone(),
                name: tag.to_string(),
            });
        }
    }

    /// Attribute name to string value (`None` for expression values).
    fn jsx_attributes(&self, node: Node) -> BTreeMap<String, Option<String>> {
        let mut attrs = BTreeMap::new();
        let mut cursor = node.walk();
        for attr in node.named_children(&mut cursor) {
            if attr.kind() != "jsx_attribute" {
                continue;
            }
            let mut inner = attr.walk();
            let parts: Vec<Node> = attr.named_children(&mut inner).collect();
            let Some(key) = parts.first() else {
                continue;
            };
            let value = parts
                .get(1)
                .filter(|v| v.kind() == "string")
                .map(|v| self.string_value(*v));
            attrs.insert(self.text(*key).to_string(), value);
        }
        attrs
    }

    fn capture(&mut self, site: &ElementId, field: &str, value_type: String) {
        let id = match self.builder.find_label_of_kind(ElementKind::DataPoint, field) {
            Some(id) => {
                if let Some(element) = self.builder.element_mut(&id) {
                    if let ElementPayload::DataPoint(d) = &mut element.payload {
                        d.origin = Origin::Captured;
                    }
                }
                id
            }
            None => self.builder.push(
                field,
                ElementPayload::DataPoint(DataPoint {
                    value_type: Some(value_type),
                    origin: Origin::Captured,
                    ..Default::default()
                }),
            ),
        };

        if let Some(element) = self.builder.element_mut(site) {
            if let ElementPayload::Component(c) = &mut element.payload {
                if !c.captures.contains(&id) {
                    c.captures.push(id);
                }
            }
        }
    }

    fn call(&mut self, site: &ElementId, node: Node) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let callee = match function.kind() {
            "identifier" | "member_expression" => self.text(function).to_string(),
            _ => return,
        };

        let mut args = Vec::new();
        if let Some(arguments) = node.child_by_field_name("arguments") {
            let mut cursor = arguments.walk();
            for arg in arguments.named_children(&mut cursor) {
                if arg.kind() == "identifier" {
                    args.push(self.text(arg).to_string());
                }
            }
        }

        self.pending.push(Pending::Call {
            site: site.clone(),
            callee,
            args,
        });
    }

    fn is_imported(&self, name: &str) -> bool {
        self.imported.contains_key(name)
            || name
                .split_once('.')
                .is_some_and(|(ns, _)| self.imported.get(ns) == Some(&true))
    }

    fn finish(mut self) -> Extraction {
        for pending in std::mem::take(&mut self.pending) {
            match pending {
                Pending::Child { site, name } => {
                    let local = self
                        .builder
                        .find_label_of_kind(ElementKind::Component, &name)
                        .or_else(|| self.builder.find_label_of_kind(ElementKind::Image, &name));
                    match local {
                        Some(child) if child != site => {
                            if let Some(element) = self.builder.element_mut(&site) {
                                if let ElementPayload::Component(c) = &mut element.payload {
                                    if !c.children.contains(&child) {
                                        c.children.push(child);
                                    }
                                }
                            }
                        }
                        Some(_) => {}
                        None if self.is_imported(&name) => self.builder.usage(Usage {
                            local: name,
                            usage: UsageKind::Render,
                            site,
                            arguments: Vec::new(),
                        }),
                        None => {}
                    }
                }
                Pending::Display { site, name } => {
                    match self.builder.find_label_of_kind(ElementKind::DataPoint, &name) {
                        Some(data) => {
                            if let Some(element) = self.builder.element_mut(&site) {
                                if let ElementPayload::Component(c) = &mut element.payload {
                                    if !c.displays.contains(&data) {
                                        c.displays.push(data);
                                    }
                                }
                            }
                        }
                        None if self.is_imported(&name) => self.builder.usage(Usage {
                            local: name,
                            usage: UsageKind::Display,
                            site,
                            arguments: Vec::new(),
                        }),
                        None => {}
                    }
                }
                Pending::Call { site, callee, args } => {
                    let args: Vec<ElementId> = args
                        .iter()
                        .filter_map(|a| self.builder.find_label_of_kind(ElementKind::DataPoint, a))
                        .collect();
                    if let Some(transform) =
                        self.builder.find_label_of_kind(ElementKind::Transform, &callee)
                    {
                        for arg in args {
                            self.builder
                                .edge(arg, transform.clone(), EdgeType::Transforms, None);
                        }
                    } else if self.is_imported(&callee) {
                        self.builder.usage(Usage {
                            local: callee,
                            usage: UsageKind::Invoke,
                            site,
                            arguments: args,
                        });
                    }
                }
            }
        }
        self.builder.finish()
    }
}

fn starts_uppercase(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn contains_jsx(node: Node) -> bool {
    !collect_kind(node, &["jsx_element", "jsx_self_closing_element"]).is_empty()
}
