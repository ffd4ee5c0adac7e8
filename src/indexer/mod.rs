pub mod aggregator;
pub mod change;
pub mod extractor;
pub mod import_resolver;
pub mod pipeline;
pub mod summary;
pub mod walker;
pub mod watcher;

pub use aggregator::{
    repair_entries, AggregationReport, Direction, EdgeRule, EdgeRules, GraphAggregator,
    ReferenceGraph,
};
pub use change::{ChangeDetector, ChangeSet};
pub use extractor::{Extraction, ExtractionBuilder, Extractor};
pub use import_resolver::{ImportResolver, ResolveConfig};
pub use pipeline::{run, run_with_cancel, Indexer};
pub use summary::{FileWarning, Summary};
pub use walker::{FileStat, FileWalker, PathSet};
pub use watcher::{watch, FileWatcher};
