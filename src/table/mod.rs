//! Transactional table format
//!
//! A table is a directory of immutable parquet files plus a commit log.
//! Each commit adds and removes files; replaying the log up to a version
//! yields that version's snapshot.
//!
//! Layout: `<root>/<catalog>/<schema>/<table>/{_commit_log/, part-*.parquet}`

pub mod log;
pub mod merge;
pub mod store;

pub use log::{Commit, CommitLog, Operation, Snapshot, WriteMode};
pub use merge::{MergeMetrics, MergeOptions, MergePlan};
pub use store::TableStore;

use crate::error::{Result, TransformError};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Fully qualified `catalog.schema.table` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(catalog: &str, schema: &str, table: &str) -> Result<Self> {
        for part in [catalog, schema, table] {
            if !IDENTIFIER.is_match(part) {
                return Err(TransformError::Table(format!(
                    "Invalid identifier '{}' in table name",
                    part
                )));
            }
        }
        Ok(Self {
            catalog: catalog.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    /// Parse `table`, `schema.table` or `catalog.schema.table`, filling the
    /// missing leading parts from the defaults.
    pub fn parse(name: &str, default_catalog: &str, default_schema: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('.').collect();
        match parts.as_slice() {
            [table] => Self::new(default_catalog, default_schema, table),
            [schema, table] => Self::new(default_catalog, schema, table),
            [catalog, schema, table] => Self::new(catalog, schema, table),
            _ => Err(TransformError::Table(format!(
                "Table name '{}' has too many parts",
                name
            ))),
        }
    }

    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.catalog)
            .join(&self.schema)
            .join(&self.table)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.schema, self.table)
    }
}
