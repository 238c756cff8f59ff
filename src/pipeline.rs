//! Bronze-to-silver pipeline
//!
//! Each job reads one source file, cleans it and merges it into its silver
//! table. Jobs are independent and run concurrently; jobs that target the
//! same table are serialised by the commit log's conflict retry.

use crate::config::{JobConfig, PipelineConfig};
use crate::error::{Result, TransformError};
use crate::source::read_source;
use crate::table::{MergeMetrics, TableStore};
use crate::transform::Transform;
use polars::prelude::DataFrame;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub table: String,
    pub duration_ms: u64,
    pub metrics: Option<MergeMetrics>,
    pub error: Option<String>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Pipeline {
    store: TableStore,
    transform: Transform,
}

impl Pipeline {
    pub fn new(store: TableStore, transform: Transform) -> Self {
        Self { store, transform }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            TableStore::from_config(config),
            Transform::with_payment_rules(config.payment_rules()),
        )
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    /// Apply the job's cleaning steps in order: dedup, payment status,
    /// uppercasing, processed timestamp.
    pub fn prepare(&self, job: &JobConfig, df: &DataFrame) -> Result<DataFrame> {
        let mut df = self
            .transform
            .deduplicate(df, job.dedup_columns(), &job.cdc_column, job.keep)?;
        if job.payment_check {
            df = self.transform.payment_check(&df)?;
        }
        for column in &job.uppercase_columns {
            df = self.transform.uppercase(&df, column)?;
        }
        if job.processed_timestamp {
            df = self.transform.processed_timestamp(&df)?;
        }
        Ok(df)
    }

    /// Run a single job to completion on the calling thread.
    pub fn run_job(&self, job: &JobConfig) -> Result<MergeMetrics> {
        let raw = read_source(&job.source)?;
        let prepared = self.prepare(job, &raw)?;
        self.store.upsert(
            &prepared,
            &job.key_columns,
            &job.table,
            &job.cdc_column,
            job.merge_options(),
        )
    }

    /// Run every job concurrently. A failed job is reported, not propagated.
    pub async fn run(self: Arc<Self>, jobs: Vec<JobConfig>) -> Vec<JobReport> {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let pipeline = Arc::clone(&self);
                let name = job.name.clone();
                let table = job.table.clone();
                let handle = tokio::task::spawn_blocking(move || {
                    let started = Instant::now();
                    let result = pipeline.run_job(&job);
                    (result, started.elapsed().as_millis() as u64)
                });
                (name, table, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (job, table, handle) in handles {
            let (result, duration_ms) = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => (Err(TransformError::Pipeline(format!("Job task failed: {}", e))), 0),
            };
            let report = match result {
                Ok(metrics) => {
                    info!(
                        "Job '{}' merged into {} in {} ms: {} inserted, {} updated",
                        job, table, duration_ms, metrics.rows_inserted, metrics.rows_updated
                    );
                    JobReport { job, table, duration_ms, metrics: Some(metrics), error: None }
                }
                Err(e) => {
                    error!("Job '{}' failed: {}", job, e);
                    JobReport { job, table, duration_ms, metrics: None, error: Some(e.to_string()) }
                }
            };
            reports.push(report);
        }
        reports
    }
}
