pub mod config;
pub mod error;
pub mod index;
pub mod indexer;
pub mod languages;

use once_cell::sync::Lazy;

pub use config::Config;
pub use error::{IndexError, Result};
pub use index::{
    Edge, EdgeType, Element, ElementId, ElementKind, ElementPayload, Graph, GraphMetadata, Index,
    IndexStore, IndexedFile, LoadStatus,
};
pub use indexer::{
    run, run_with_cancel, AggregationReport, Direction, EdgeRule, Extractor, FileWarning,
    GraphAggregator, Indexer, Summary,
};
pub use languages::ExtractorRegistry;

/// Built-in extraction strategies (lazily initialized)
pub static REGISTRY: Lazy<ExtractorRegistry> = Lazy::new(ExtractorRegistry::new);
