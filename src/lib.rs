// Planometric Updates - Core Library
// Exposes the pipeline stages for the CLI and for tests

pub mod error;
pub mod config;
pub mod query;
pub mod backend;
pub mod extract;
pub mod workspace;
pub mod export;
pub mod map;
pub mod audit;
pub mod manifest;
pub mod pipeline;

// Re-export commonly used types
pub use error::{BackendError, ConfigError, PipelineError};
pub use config::{
    BackendConfig, Config, FieldConfig, FilterConfig, MapsConfig, RendererConfig,
    DEFAULT_EXCLUDED_TYPES,
};
pub use query::{FieldValue, Predicate, Record, SqlClause};
pub use backend::{AttributeTable, Feature, JoinSummary, SqliteBackend};
pub use extract::{distinct_parcel_ids, ParcelId, ParcelIdSet};
pub use workspace::{RunDate, RunWorkspace};
pub use export::{export_spreadsheet, SpreadsheetArtifact};
pub use map::{CommandExporter, Extent, LayerSource, MapDocument, MapPage, MapTemplate, PdfExporter};
pub use audit::{get_events_for_run, insert_event, RunEvent};
pub use manifest::{ArtifactEntry, ArtifactKind, RunCounts, RunManifest};
pub use pipeline::{
    change_filter, overview_filter, preflight, FilteredChangeSet, MapArtifacts, ParcelAreaSelection,
    Pipeline, RunSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
