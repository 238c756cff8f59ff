//! Input readers
//!
//! Bronze inputs arrive as CSV or parquet files; the format is picked from the
//! file extension.

use crate::error::{Result, TransformError};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceFile {
    Csv(PathBuf),
    Parquet(PathBuf),
}

impl SourceFile {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Ok(SourceFile::Csv(path.to_path_buf())),
            Some(ext) if ext.eq_ignore_ascii_case("parquet") => {
                Ok(SourceFile::Parquet(path.to_path_buf()))
            }
            _ => Err(TransformError::Config(format!(
                "Unsupported source file {} (expected .csv or .parquet)",
                path.display()
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            SourceFile::Csv(p) | SourceFile::Parquet(p) => p,
        }
    }

    pub fn read(&self) -> Result<DataFrame> {
        if !self.path().exists() {
            return Err(TransformError::Config(format!(
                "Source file not found: {}",
                self.path().display()
            )));
        }
        let df = match self {
            SourceFile::Csv(path) => LazyCsvReader::new(path)
                .with_has_header(true)
                .with_infer_schema_length(Some(10000))
                .finish()?
                .collect()?,
            SourceFile::Parquet(path) => {
                LazyFrame::scan_parquet(path, ScanArgsParquet::default())?.collect()?
            }
        };
        debug!("Read {} rows from {}", df.height(), self.path().display());
        Ok(df)
    }
}

pub fn read_source(path: impl AsRef<Path>) -> Result<DataFrame> {
    SourceFile::from_path(path)?.read()
}
