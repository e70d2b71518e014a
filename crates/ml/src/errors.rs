use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating a dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("row {row}, column {column}: invalid number {value:?}")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },

    #[error("dataset is empty")]
    Empty,

    #[error("column {0} has no values to impute from")]
    ColumnAllMissing(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while fitting or applying a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing feature column: {0}")]
    MissingFeature(&'static str),

    #[error("feature width mismatch: expected {expected}, got {actual}")]
    Shape { expected: usize, actual: usize },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("not enough samples: {0}")]
    InsufficientData(String),

    #[error("unknown class label: {0}")]
    UnknownLabel(String),

    #[error("pipeline task mismatch: {0}")]
    TaskMismatch(String),
}

/// Errors raised while persisting or loading artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unsupported artifact format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("artifact encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("metadata serialization error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by a training run.
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("training error: {0}")]
    Training(#[from] PipelineError),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("prediction export error: {0}")]
    Export(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
