//! SQL schema strategy on top of tree-sitter-sequel.
//!
//! `CREATE TABLE` becomes a database Table with its columns. A view becomes
//! a Table fed by every local table it reads from. Table-level constraints
//! are not columns.

use tree_sitter::{Node, Parser};

use crate::error::{IndexError, Result};
use crate::index::{Column, EdgeType, ElementKind, ElementPayload, PersistenceKind, Table};
use crate::indexer::extractor::{Extraction, ExtractionBuilder, Extractor};
use crate::languages::collect_kind;

const VIEW_KINDS: &[&str] = &["create_view", "create_materialized_view"];

pub struct SqlExtractor;

impl Extractor for SqlExtractor {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn file_extensions(&self) -> &[&'static str] {
        &["sql"]
    }

    fn extract(&self, scope: &str, path: &str, content: &str) -> Result<Extraction> {
        let language: tree_sitter::Language = tree_sitter_sequel::LANGUAGE.into();
        let mut parser = Parser::new();
        parser
            .set_language(&language)
            .map_err(|e| IndexError::Parse(e.to_string()))?;
        let tree = parser
            .parse(content, None)
            .ok_or_else(|| IndexError::Parse(format!("{}: failed to parse source", path)))?;

        let source = content.as_bytes();
        let mut builder = ExtractionBuilder::new(scope, path);
        let mut views = Vec::new();

        let mut kinds = vec!["create_table"];
        kinds.extend_from_slice(VIEW_KINDS);
        for statement in collect_kind(tree.root_node(), &kinds) {
            let Some(reference) = first_child_of_kind(statement, "object_reference") else {
                continue;
            };
            let name = object_name(reference, source);
            if name.is_empty() {
                continue;
            }

            if statement.kind() == "create_table" {
                builder.push(
                    name,
                    ElementPayload::Table(Table {
                        persistence_kind: PersistenceKind::Database,
                        columns: columns(statement, source),
                    }),
                );
            } else {
                let id = builder.push(name, ElementPayload::Table(Table::default()));
                views.push((id, view_sources(statement, reference, source)));
            }
        }

        for (view, sources) in views {
            for source in sources {
                let Some(table) = builder.find_label_of_kind(ElementKind::Table, &source) else {
                    continue;
                };
                if table != view {
                    builder.edge(table, view.clone(), EdgeType::FlowsTo, None);
                }
            }
        }

        Ok(builder.finish())
    }
}

fn first_child_of_kind<'t>(node: Node<'t>, kind: &str) -> Option<Node<'t>> {
    let mut cursor = node.walk();
    let found = node.named_children(&mut cursor).find(|n| n.kind() == kind);
    found
}

fn text<'s>(node: Node, source: &'s [u8]) -> &'s str {
    node.utf8_text(source).unwrap_or("")
}

/// Unqualified, unquoted name of an `object_reference`.
fn object_name(reference: Node, source: &[u8]) -> String {
    let name = reference
        .child_by_field_name("name")
        .map(|n| text(n, source))
        .unwrap_or_else(|| text(reference, source));
    unquote(name.rsplit('.').next().unwrap_or(name))
}

fn columns(table: Node, source: &[u8]) -> Vec<Column> {
    let Some(definitions) = first_child_of_kind(table, "column_definitions") else {
        return Vec::new();
    };

    let mut cursor = definitions.walk();
    let columns = definitions
        .named_children(&mut cursor)
        .filter(|n| n.kind() == "column_definition")
        .filter_map(|definition| {
            let name = definition
                .child_by_field_name("name")
                .or_else(|| definition.named_child(0))?;
            let value_type = definition
                .child_by_field_name("type")
                .or_else(|| definition.named_child(1))
                .map(|t| text(t, source).to_ascii_lowercase());
            Some(Column {
                name: unquote(text(name, source)),
                value_type,
            })
        })
        .collect();
    columns
}

/// Tables a view reads from, in source order without repeats. The view's
/// own name reference is not a source.
fn view_sources(view: Node, name: Node, source: &[u8]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for relation in collect_kind(view, &["relation"]) {
        let Some(reference) = first_child_of_kind(relation, "object_reference") else {
            continue;
        };
        if reference.id() == name.id() {
            continue;
        }
        let table = object_name(reference, source);
        if !table.is_empty() && !sources.iter().any(|s| s.eq_ignore_ascii_case(&table)) {
            sources.push(table);
        }
    }
    sources
}

fn unquote(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '"' | '`' | '[' | ']'))
        .collect()
}
