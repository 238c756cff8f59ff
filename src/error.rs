use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Table error: {0}")]
    Table(String),

    #[error("Merge error: {0}")]
    Merge(String),

    /// Another writer committed the same version first. Safe to re-plan and retry.
    #[error("Commit conflict: version {version} of {table} already exists")]
    Conflict { table: String, version: u64 },

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
}

impl TransformError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, TransformError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransformError>;
