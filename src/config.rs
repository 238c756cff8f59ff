//! Pipeline configuration
//!
//! Loaded from a JSON file. Relative paths are resolved against the file's
//! directory, and `SILVER_WAREHOUSE_ROOT` overrides the warehouse root.

use crate::error::{Result, TransformError};
use crate::payment::PaymentRules;
use crate::table::store::{DEFAULT_CATALOG, DEFAULT_MAX_COMMIT_RETRIES, DEFAULT_SCHEMA};
use crate::table::MergeOptions;
use crate::transform::KeepStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const WAREHOUSE_ROOT_ENV: &str = "SILVER_WAREHOUSE_ROOT";

fn default_catalog() -> String {
    DEFAULT_CATALOG.to_string()
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

fn default_max_commit_retries() -> u32 {
    DEFAULT_MAX_COMMIT_RETRIES
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub warehouse_root: PathBuf,
    #[serde(default = "default_catalog")]
    pub catalog: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,
    #[serde(default)]
    pub payment_rules: Option<PaymentRules>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub source: PathBuf,
    pub table: String,
    pub key_columns: Vec<String>,
    pub cdc_column: String,
    /// Defaults to `key_columns`.
    #[serde(default)]
    pub dedup_columns: Option<Vec<String>>,
    #[serde(default)]
    pub keep: KeepStrategy,
    #[serde(default)]
    pub uppercase_columns: Vec<String>,
    #[serde(default)]
    pub payment_check: bool,
    #[serde(default = "default_true")]
    pub processed_timestamp: bool,
    #[serde(default)]
    pub schema_evolution: bool,
    #[serde(default)]
    pub create_if_missing: bool,
}

impl JobConfig {
    pub fn dedup_columns(&self) -> &[String] {
        self.dedup_columns.as_deref().unwrap_or(&self.key_columns)
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            schema_evolution: self.schema_evolution,
            create_if_missing: self.create_if_missing,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| TransformError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let mut config: PipelineConfig = serde_json::from_str(&content)
            .map_err(|e| TransformError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

        if let Ok(root) = std::env::var(WAREHOUSE_ROOT_ENV) {
            if !root.is_empty() {
                config.warehouse_root = PathBuf::from(root);
            }
        }
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.warehouse_root.is_relative() {
            self.warehouse_root = base.join(&self.warehouse_root);
        }
        for job in &mut self.jobs {
            if job.source.is_relative() {
                job.source = base.join(&job.source);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(TransformError::Config("Job with an empty name".to_string()));
            }
            if !names.insert(job.name.as_str()) {
                return Err(TransformError::Config(format!("Duplicate job name '{}'", job.name)));
            }
            if job.key_columns.is_empty() {
                return Err(TransformError::Config(format!("Job '{}' has no key columns", job.name)));
            }
            if job.dedup_columns().is_empty() {
                return Err(TransformError::Config(format!(
                    "Job '{}' has an empty dedup column list",
                    job.name
                )));
            }
            if job.cdc_column.trim().is_empty() {
                return Err(TransformError::Config(format!("Job '{}' has no CDC column", job.name)));
            }
        }
        Ok(())
    }

    pub fn payment_rules(&self) -> PaymentRules {
        self.payment_rules.clone().unwrap_or_default()
    }
}
