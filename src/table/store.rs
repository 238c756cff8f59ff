use crate::config::PipelineConfig;
use crate::error::{Result, TransformError};
use crate::table::log::{Commit, CommitLog, Operation, Snapshot, WriteMode};
use crate::table::TableName;
use chrono::Utc;
use polars::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_CATALOG: &str = "uberproject";
pub const DEFAULT_SCHEMA: &str = "silver";
pub const DEFAULT_MAX_COMMIT_RETRIES: u32 = 3;

/// Entry point for every table under one warehouse root.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
    default_catalog: String,
    default_schema: String,
    max_commit_retries: u32,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            default_catalog: DEFAULT_CATALOG.to_string(),
            default_schema: DEFAULT_SCHEMA.to_string(),
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.warehouse_root)
            .with_namespace(&config.catalog, &config.schema)
            .with_max_commit_retries(config.max_commit_retries)
    }

    pub fn with_namespace(mut self, catalog: &str, schema: &str) -> Self {
        self.default_catalog = catalog.to_string();
        self.default_schema = schema.to_string();
        self
    }

    pub fn with_max_commit_retries(mut self, retries: u32) -> Self {
        self.max_commit_retries = retries;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn max_commit_retries(&self) -> u32 {
        self.max_commit_retries
    }

    pub fn resolve(&self, name: &str) -> Result<TableName> {
        TableName::parse(name, &self.default_catalog, &self.default_schema)
    }

    fn table_dir(&self, name: &TableName) -> PathBuf {
        self.root.join(name.relative_path())
    }

    pub(crate) fn log(&self, name: &TableName) -> CommitLog {
        CommitLog::new(&self.table_dir(name), name.to_string())
    }

    pub fn exists(&self, table: &str) -> Result<bool> {
        let name = self.resolve(table)?;
        Ok(self.log(&name).exists())
    }

    /// Create a table whose version 0 holds `df`. An empty frame just fixes the schema.
    pub fn create_table(&self, table: &str, df: &DataFrame) -> Result<u64> {
        let name = self.resolve(table)?;
        if self.log(&name).exists() {
            return Err(TransformError::Table(format!("Table {} already exists", name)));
        }
        self.commit_create(&name, df, BTreeMap::new())
    }

    /// Commit `df` as version 0. Losing the race to another creator is a `Conflict`.
    pub(crate) fn commit_create(
        &self,
        name: &TableName,
        df: &DataFrame,
        metrics: BTreeMap<String, u64>,
    ) -> Result<u64> {
        let file = self.write_data_file(name, df)?;
        self.publish(name, &Commit {
            version: 0,
            timestamp: Utc::now(),
            operation: Operation::Create,
            added: vec![file],
            removed: Vec::new(),
            columns: column_names(df),
            metrics,
        })?;
        info!("Created table {} with {} rows", name, df.height());
        Ok(0)
    }

    /// Append to or overwrite an existing table. Returns the new version.
    pub fn write(&self, table: &str, df: &DataFrame, mode: WriteMode) -> Result<u64> {
        let name = self.resolve(table)?;
        let snapshot = self.log(&name).snapshot(None)?;

        let (df, removed) = match mode {
            WriteMode::Append => {
                let schema = self.snapshot_schema(&name, &snapshot)?;
                (conform_to_schema(df, &schema)?, Vec::new())
            }
            WriteMode::Overwrite => (df.clone(), snapshot.files.clone()),
        };

        let file = self.write_data_file(&name, &df)?;
        let version = snapshot.version + 1;
        let mut metrics = BTreeMap::new();
        metrics.insert("rows_written".to_string(), df.height() as u64);
        self.publish(&name, &Commit {
            version,
            timestamp: Utc::now(),
            operation: Operation::Write { mode },
            added: vec![file],
            removed,
            columns: column_names(&df),
            metrics,
        })?;
        info!("Wrote {} rows to {} ({:?}), version {}", df.height(), name, mode, version);
        Ok(version)
    }

    pub fn read(&self, table: &str) -> Result<DataFrame> {
        let name = self.resolve(table)?;
        let snapshot = self.log(&name).snapshot(None)?;
        self.load_snapshot(&name, &snapshot)
    }

    /// Time travel: the table as it was after `version` was committed.
    pub fn read_version(&self, table: &str, version: u64) -> Result<DataFrame> {
        let name = self.resolve(table)?;
        let snapshot = self.log(&name).snapshot(Some(version))?;
        self.load_snapshot(&name, &snapshot)
    }

    pub fn latest_version(&self, table: &str) -> Result<u64> {
        let name = self.resolve(table)?;
        self.log(&name)
            .latest_version()?
            .ok_or_else(|| TransformError::Table(format!("Table {} does not exist", name)))
    }

    /// Commits, newest first.
    pub fn history(&self, table: &str) -> Result<Vec<Commit>> {
        let name = self.resolve(table)?;
        let log = self.log(&name);
        let latest = log
            .latest_version()?
            .ok_or_else(|| TransformError::Table(format!("Table {} does not exist", name)))?;
        let mut commits = log.commits_until(latest)?;
        commits.reverse();
        Ok(commits)
    }

    pub(crate) fn load_snapshot(&self, name: &TableName, snapshot: &Snapshot) -> Result<DataFrame> {
        let dir = self.table_dir(name);
        let frames = snapshot
            .files
            .iter()
            .map(|file| {
                LazyFrame::scan_parquet(dir.join(file), ScanArgsParquet::default()).map_err(|e| {
                    TransformError::Table(format!("Failed to scan {} of {}: {}", file, name, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if frames.is_empty() {
            return Err(TransformError::Table(format!(
                "Version {} of {} has no data files",
                snapshot.version, name
            )));
        }
        Ok(concat(frames, UnionArgs::default())?.collect()?)
    }

    fn snapshot_schema(&self, name: &TableName, snapshot: &Snapshot) -> Result<SchemaRef> {
        let first = snapshot.files.first().ok_or_else(|| {
            TransformError::Table(format!("Version {} of {} has no data files", snapshot.version, name))
        })?;
        let path = self.table_dir(name).join(first);
        Ok(LazyFrame::scan_parquet(path, ScanArgsParquet::default())?.schema()?)
    }

    /// Write `df` as a new immutable parquet file; returns its file name.
    pub(crate) fn write_data_file(&self, name: &TableName, df: &DataFrame) -> Result<String> {
        let dir = self.table_dir(name);
        fs::create_dir_all(&dir)?;
        let file_name = format!("part-{}.parquet", uuid::Uuid::new_v4());
        let mut file = File::create(dir.join(&file_name))?;
        ParquetWriter::new(&mut file).finish(&mut df.clone())?;
        Ok(file_name)
    }

    /// Commit to the log of `name`. When the commit fails its data files are
    /// deleted again, since no snapshot can reference them.
    pub(crate) fn publish(&self, name: &TableName, commit: &Commit) -> Result<()> {
        self.log(name).commit(commit).map_err(|e| {
            let dir = self.table_dir(name);
            for file in &commit.added {
                if let Err(remove_err) = fs::remove_file(dir.join(file)) {
                    warn!("Could not remove uncommitted file {} of {}: {}", file, name, remove_err);
                }
            }
            e
        })
    }
}

pub(crate) fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names().iter().map(|c| c.to_string()).collect()
}

/// Reorder and cast `df` to exactly the columns of `schema`.
pub(crate) fn conform_to_schema(df: &DataFrame, schema: &Schema) -> Result<DataFrame> {
    let expected: Vec<&str> = schema.iter_names().map(|n| n.as_str()).collect();
    let actual = df.get_column_names();
    let missing: Vec<&str> = expected.iter().filter(|c| !actual.contains(*c)).copied().collect();
    let extra: Vec<&str> = actual.iter().filter(|c| !expected.contains(*c)).copied().collect();
    if !missing.is_empty() || !extra.is_empty() {
        return Err(TransformError::Schema(format!(
            "Schema mismatch: missing [{}], unexpected [{}]",
            missing.join(", "),
            extra.join(", ")
        )));
    }

    cast_columns(df, schema.iter().map(|(name, dtype)| (name.as_str(), dtype)))
}

/// Select `columns` from `df`, each cast to its given type. A value that does
/// not convert fails with `Schema` rather than turning into a null.
pub(crate) fn cast_columns<'a>(
    df: &DataFrame,
    columns: impl IntoIterator<Item = (&'a str, &'a DataType)>,
) -> Result<DataFrame> {
    let exprs: Vec<Expr> = columns
        .into_iter()
        .map(|(name, dtype)| col(name).strict_cast(dtype.clone()).alias(name))
        .collect();
    df.clone()
        .lazy()
        .select(exprs)
        .collect()
        .map_err(|e| TransformError::Schema(format!("Data does not fit the table schema: {}", e)))
}
