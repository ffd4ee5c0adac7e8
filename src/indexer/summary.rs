use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::indexer::aggregator::AggregationReport;

/// A file-level problem that did not stop the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileWarning {
    /// Relative path, empty when the walker could not name the entry
    pub path: String,
    pub reason: String,
}

impl FileWarning {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.reason)
        } else {
            write!(f, "{}: {}", self.path, self.reason)
        }
    }
}

/// Outcome of one indexing run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub store_path: PathBuf,
    pub new: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Touched files whose content hash matched, extraction reused
    pub reused: usize,
    /// Files whose extraction failed; previous entries retained
    pub failed: usize,
    pub elements: usize,
    pub edges: usize,
    /// Whether unchanged files were re-extracted too
    pub full: bool,
    pub duration_ms: u64,
    pub warnings: Vec<FileWarning>,
    pub report: AggregationReport,
}

impl Summary {
    pub fn recovered_edges(&self) -> usize {
        self.report.recovered_edges()
    }

    pub fn dropped_edges(&self) -> usize {
        self.report.dropped_edges.len()
    }

    pub fn is_clean(&self) -> bool {
        self.new == 0 && self.modified == 0 && self.deleted == 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Indexed {} new, {} modified, {} unchanged, {} deleted{} in {}ms",
            self.new,
            self.modified,
            self.unchanged,
            self.deleted,
            if self.reused > 0 {
                format!(" ({} reused by content hash)", self.reused)
            } else {
                String::new()
            },
            self.duration_ms
        )?;
        writeln!(f, "Graph: {} elements, {} edges", self.elements, self.edges)?;

        let report = &self.report;
        if !report.recovered.is_empty() {
            writeln!(f, "Recovered {} stale references by label", report.recovered.len())?;
        }
        if !report.ambiguous.is_empty() {
            writeln!(f, "Ambiguous recoveries: {}", report.ambiguous.len())?;
            for a in &report.ambiguous {
                writeln!(f, "  {} -> {} ({} candidates)", a.stale, a.chosen, a.candidates)?;
            }
        }
        if !report.dropped_edges.is_empty() {
            writeln!(f, "Dropped {} dangling edges", report.dropped_edges.len())?;
            for d in &report.dropped_edges {
                writeln!(
                    f,
                    "  {} -[{}]-> {} (missing {})",
                    d.edge.from, d.edge.edge_type, d.edge.to, d.missing
                )?;
            }
        }
        if !report.stale_references.is_empty() {
            writeln!(f, "Removed {} stale payload references", report.stale_references.len())?;
        }
        if report.duplicate_edges > 0 || report.self_edges > 0 {
            writeln!(
                f,
                "Dropped {} duplicate and {} self edges",
                report.duplicate_edges, report.self_edges
            )?;
        }
        if !report.unresolved_imports.is_empty() {
            writeln!(f, "Unresolved imports: {}", report.unresolved_imports.len())?;
            for u in &report.unresolved_imports {
                writeln!(f, "  {}: {}", u.file, u.source)?;
            }
        }
        if !self.warnings.is_empty() {
            writeln!(f, "Skipped {} files:", self.warnings.len())?;
            for w in &self.warnings {
                writeln!(f, "  {}", w)?;
            }
        }
        write!(f, "Store: {}", self.store_path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> Summary {
        Summary {
            store_path: PathBuf::from("/p/.graph-index.json"),
            new: 2,
            modified: 0,
            unchanged: 3,
            deleted: 1,
            reused: 0,
            failed: 0,
            elements: 7,
            edges: 4,
            full: false,
            duration_ms: 12,
            warnings: vec![FileWarning::new("big.sql", "exceeds hard size limit")],
            report: AggregationReport::default(),
        }
    }

    #[test]
    fn test_display_lists_counts_and_warnings() {
        let text = summary().to_string();
        assert!(text.contains("2 new, 0 modified, 3 unchanged, 1 deleted in 12ms"));
        assert!(text.contains("7 elements, 4 edges"));
        assert!(text.contains("big.sql: exceeds hard size limit"));
        assert!(text.ends_with("/p/.graph-index.json"));
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(summary()).unwrap();
        assert_eq!(json["storePath"], "/p/.graph-index.json");
        assert_eq!(json["durationMs"], 12);
        assert_eq!(json["warnings"][0]["path"], "big.sql");
    }
}
