//! Commit log
//!
//! One JSON file per version under `_commit_log/`. A version file is only
//! ever published through a hard link from a fully written temp file, so
//! readers never observe a partial commit and two writers racing for the
//! same version cannot both succeed.

use crate::error::{Result, TransformError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const COMMIT_LOG_DIR: &str = "_commit_log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Append,
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Create,
    Write {
        mode: WriteMode,
    },
    Merge {
        key_columns: Vec<String>,
        cdc_column: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    /// Column names of the table after this commit.
    pub columns: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, u64>,
}

/// Files that make up a table at a given version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u64,
    pub files: Vec<String>,
    pub columns: Vec<String>,
}

pub struct CommitLog {
    dir: PathBuf,
    table: String,
}

impl CommitLog {
    pub fn new(table_dir: &Path, table: impl Into<String>) -> Self {
        Self {
            dir: table_dir.join(COMMIT_LOG_DIR),
            table: table.into(),
        }
    }

    fn version_path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{:020}.json", version))
    }

    pub fn exists(&self) -> bool {
        self.version_path(0).exists()
    }

    /// All committed versions, ascending.
    pub fn versions(&self) -> Result<Vec<u64>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stem) = file_name.strip_suffix(".json") {
                if let Ok(version) = stem.parse::<u64>() {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn latest_version(&self) -> Result<Option<u64>> {
        Ok(self.versions()?.last().copied())
    }

    pub fn read(&self, version: u64) -> Result<Commit> {
        let path = self.version_path(version);
        let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => TransformError::Table(format!(
                "Version {} of {} does not exist",
                version, self.table
            )),
            _ => TransformError::Io(e),
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Commits up to and including `version`, ascending.
    pub fn commits_until(&self, version: u64) -> Result<Vec<Commit>> {
        self.versions()?
            .into_iter()
            .take_while(|v| *v <= version)
            .map(|v| self.read(v))
            .collect()
    }

    /// Publish `commit` as its version. Fails with `Conflict` if that version
    /// is already taken.
    pub fn commit(&self, commit: &Commit) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let target = self.version_path(commit.version);
        let staging = self
            .dir
            .join(format!(".{:020}.{}.tmp", commit.version, uuid::Uuid::new_v4()));
        fs::write(&staging, serde_json::to_vec_pretty(commit)?)?;

        let published = fs::hard_link(&staging, &target);
        if let Err(e) = fs::remove_file(&staging) {
            warn!("Could not remove staging file {}: {}", staging.display(), e);
        }
        match published {
            Ok(()) => {
                debug!("Committed version {} of {}", commit.version, self.table);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(TransformError::Conflict {
                table: self.table.clone(),
                version: commit.version,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Replay the log up to `version` (latest when `None`).
    pub fn snapshot(&self, version: Option<u64>) -> Result<Snapshot> {
        let latest = self
            .latest_version()?
            .ok_or_else(|| TransformError::Table(format!("Table {} does not exist", self.table)))?;
        let version = match version {
            Some(v) if v > latest => {
                return Err(TransformError::Table(format!(
                    "Version {} of {} does not exist (latest is {})",
                    v, self.table, latest
                )))
            }
            Some(v) => v,
            None => latest,
        };

        let mut files: Vec<String> = Vec::new();
        let mut columns = Vec::new();
        for commit in self.commits_until(version)? {
            files.retain(|f| !commit.removed.contains(f));
            files.extend(commit.added);
            columns = commit.columns;
        }
        Ok(Snapshot {
            version,
            files,
            columns,
        })
    }
}
