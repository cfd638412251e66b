// ⚠️ Error types for the planometric update pipeline
// One enum per seam: config, backend, and the run as a whole

use std::path::PathBuf;

/// Errors raised while loading or validating the run configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required path option is empty.
    #[error("configuration option '{0}' must not be empty")]
    EmptyPath(&'static str),

    /// A table or field option is not a plain SQL identifier.
    #[error("invalid identifier for '{option}': '{value}'")]
    InvalidIdentifier {
        /// The option that holds the identifier.
        option: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The excluded building-type list is malformed.
    #[error("invalid excluded type list: {0}")]
    InvalidExcludedTypes(String),

    /// The run date given on the command line could not be parsed.
    #[error("invalid run date '{0}' (expected YYYY-MM-DD)")]
    InvalidDate(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised by the spatial database backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A per-run object already exists under the requested name.
    #[error("an object named '{0}' already exists in the output geodatabase")]
    NameCollision(String),

    #[error("source database not found: {}", .0.display())]
    SourceUnavailable(PathBuf),

    #[error("table '{schema}.{table}' not found")]
    MissingTable { schema: String, table: String },

    #[error("field '{field}' not found in '{table}'")]
    MissingField { table: String, field: String },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors that abort a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The dated run folder already exists; runs never merge into old output.
    #[error("run folder already exists: {}", .0.display())]
    WorkspaceExists(PathBuf),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A map template does not have the single layer / `Layers` frame layout.
    #[error("map template '{template}': {reason}")]
    TemplateLayout { template: String, reason: String },

    /// The external renderer failed to produce a PDF.
    #[error("rendering '{}' failed: {reason}", .output.display())]
    Render { output: PathBuf, reason: String },

    /// Two artifacts would be written to the same path.
    #[error("artifact already exists: {}", .0.display())]
    ArtifactCollision(PathBuf),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("spreadsheet export failed: {0}")]
    Spreadsheet(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Backend(BackendError::Sqlite(err))
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
