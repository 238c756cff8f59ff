//! Conditional merge (upsert) into a table.
//!
//! Source rows are matched to target rows on equality of every key column.
//! A matched target row takes all of the source row's values when the source
//! CDC value is greater than or equal to the target's. Unmatched source rows
//! are inserted. Null keys never match and null CDC comparisons never update.

use crate::error::{Result, TransformError};
use crate::table::log::{Commit, Operation, Snapshot};
use crate::table::store::{cast_columns, column_names, TableStore};
use crate::table::TableName;
use crate::transform::require_columns;
use chrono::Utc;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const SOURCE_PREFIX: &str = "__src_";
const SOURCE_PRESENT: &str = "__src_present";
const SOURCE_CDC: &str = "__merge_source_cdc";
const TARGET_PRESENT: &str = "__tgt_present";
const MATCHED: &str = "__matched";
const SHOULD_UPDATE: &str = "__should_update";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Add source columns the target lacks instead of rejecting the merge.
    #[serde(default)]
    pub schema_evolution: bool,
    /// Create the table from the source when it does not exist yet.
    #[serde(default)]
    pub create_if_missing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMetrics {
    pub source_rows: usize,
    pub target_rows_before: usize,
    pub rows_matched: usize,
    pub rows_updated: usize,
    pub rows_inserted: usize,
    /// Version of the table after the merge.
    pub version: u64,
}

impl MergeMetrics {
    /// Matched rows whose source CDC value was older than the target's.
    pub fn rows_stale(&self) -> usize {
        self.rows_matched - self.rows_updated
    }

    fn to_commit_metrics(&self) -> BTreeMap<String, u64> {
        let mut metrics = BTreeMap::new();
        metrics.insert("source_rows".to_string(), self.source_rows as u64);
        metrics.insert("target_rows_before".to_string(), self.target_rows_before as u64);
        metrics.insert("rows_matched".to_string(), self.rows_matched as u64);
        metrics.insert("rows_updated".to_string(), self.rows_updated as u64);
        metrics.insert("rows_inserted".to_string(), self.rows_inserted as u64);
        metrics
    }
}

/// Column layout of a merge, resolved against both schemas before any data moves.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub key_columns: Vec<String>,
    pub cdc_column: String,
    /// Target columns, in table order, with their table types.
    pub target_columns: Vec<(String, DataType)>,
    /// Source-only columns appended to the table by schema evolution.
    pub added_columns: Vec<(String, DataType)>,
}

impl MergePlan {
    pub fn new(
        target: &Schema,
        source: &Schema,
        key_columns: &[String],
        cdc_column: &str,
        options: &MergeOptions,
    ) -> Result<Self> {
        if key_columns.is_empty() {
            return Err(TransformError::Merge("merge needs at least one key column".to_string()));
        }
        let missing_in_target: Vec<&str> = key_columns
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(cdc_column))
            .filter(|c| target.get(c).is_none())
            .collect();
        if !missing_in_target.is_empty() {
            return Err(TransformError::Schema(format!(
                "Target table lacks merge column(s): {}",
                missing_in_target.join(", ")
            )));
        }

        let target_columns: Vec<(String, DataType)> = target
            .iter()
            .map(|(name, dtype)| (name.to_string(), dtype.clone()))
            .collect();
        let missing_in_source: Vec<&str> = target_columns
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| source.get(name).is_none())
            .collect();
        if !missing_in_source.is_empty() {
            return Err(TransformError::Schema(format!(
                "Source lacks target column(s): {}",
                missing_in_source.join(", ")
            )));
        }

        let added_columns: Vec<(String, DataType)> = source
            .iter()
            .filter(|(name, _)| target.get(name.as_str()).is_none())
            .map(|(name, dtype)| (name.to_string(), dtype.clone()))
            .collect();
        if !added_columns.is_empty() && !options.schema_evolution {
            let names: Vec<&str> = added_columns.iter().map(|(n, _)| n.as_str()).collect();
            return Err(TransformError::Schema(format!(
                "Source has column(s) not in the target: {} (enable schema evolution to add them)",
                names.join(", ")
            )));
        }

        Ok(Self {
            key_columns: key_columns.to_vec(),
            cdc_column: cdc_column.to_string(),
            target_columns,
            added_columns,
        })
    }

    /// Every column of the merged table, in order.
    pub fn output_columns(&self) -> impl Iterator<Item = &(String, DataType)> {
        self.target_columns.iter().chain(self.added_columns.iter())
    }

    fn is_key(&self, column: &str) -> bool {
        self.key_columns.iter().any(|k| k == column)
    }

    fn key_exprs(&self) -> Vec<Expr> {
        self.key_columns.iter().map(|k| col(k)).collect()
    }

    /// Merge `source` into `target`; returns the new table contents and metrics
    /// (`version` left at zero for the caller to fill in).
    pub fn execute(&self, target: &DataFrame, source: &DataFrame) -> Result<(DataFrame, MergeMetrics)> {
        let keys = self.key_exprs();

        // Source with every output column cast to its table type
        let source_aligned = cast_columns(
            source,
            self.output_columns().map(|(name, dtype)| (name.as_str(), dtype)),
        )?
        .lazy();

        // Target widened with null columns for anything schema evolution adds
        let target_aligned = target.clone().lazy().select(
            self.output_columns()
                .enumerate()
                .map(|(idx, (name, dtype))| {
                    if idx < self.target_columns.len() {
                        col(name)
                    } else {
                        Expr::Literal(LiteralValue::Null).cast(dtype.clone()).alias(name)
                    }
                })
                .collect::<Vec<_>>(),
        );

        // Matched side: every target row, joined to at most one source row.
        // The CDC column may itself be a key, so its source value gets its own column.
        let source_renamed = source_aligned.clone().select(
            self.output_columns()
                .map(|(name, _)| {
                    if self.is_key(name) {
                        col(name)
                    } else {
                        col(name).alias(&format!("{}{}", SOURCE_PREFIX, name))
                    }
                })
                .chain([
                    col(&self.cdc_column).alias(SOURCE_CDC),
                    lit(true).alias(SOURCE_PRESENT),
                ])
                .collect::<Vec<_>>(),
        );
        let joined = target_aligned
            .join(source_renamed, keys.clone(), keys.clone(), JoinArgs::new(JoinType::Left))
            .collect()?;
        if joined.height() > target.height() {
            return Err(TransformError::Merge(format!(
                "{} source rows matched the same target rows; deduplicate the source on {:?} first",
                joined.height() - target.height(),
                self.key_columns
            )));
        }

        let matched = col(SOURCE_PRESENT).is_not_null();
        let should_update = matched
            .clone()
            .and(col(SOURCE_CDC).gt_eq(col(&self.cdc_column)))
            .fill_null(lit(false));
        let flagged = joined
            .lazy()
            .with_columns([
                matched.alias(MATCHED),
                should_update.alias(SHOULD_UPDATE),
            ])
            .collect()?;
        let rows_matched = count_true(&flagged, MATCHED)?;
        let rows_updated = count_true(&flagged, SHOULD_UPDATE)?;

        let updated = flagged.lazy().select(
            self.output_columns()
                .map(|(name, _)| {
                    if self.is_key(name) {
                        col(name)
                    } else {
                        when(col(SHOULD_UPDATE))
                            .then(col(&format!("{}{}", SOURCE_PREFIX, name)))
                            .otherwise(col(name))
                            .alias(name)
                    }
                })
                .collect::<Vec<_>>(),
        );

        // Insert side: source rows with no target row on the same key
        let target_keys = target
            .clone()
            .lazy()
            .select(keys.clone())
            .unique(None, UniqueKeepStrategy::Any)
            .with_column(lit(true).alias(TARGET_PRESENT));
        let inserts = source_aligned
            .join(target_keys, keys.clone(), keys, JoinArgs::new(JoinType::Left))
            .filter(col(TARGET_PRESENT).is_null())
            .select(
                self.output_columns()
                    .map(|(name, _)| col(name))
                    .collect::<Vec<_>>(),
            )
            .collect()?;
        let rows_inserted = inserts.height();

        let merged = concat([updated, inserts.lazy()], UnionArgs::default())?.collect()?;
        debug!(
            "Merge plan on {:?}: {} matched, {} updated, {} inserted, {} column(s) added",
            self.key_columns,
            rows_matched,
            rows_updated,
            rows_inserted,
            self.added_columns.len()
        );

        Ok((
            merged,
            MergeMetrics {
                source_rows: source.height(),
                target_rows_before: target.height(),
                rows_matched,
                rows_updated,
                rows_inserted,
                version: 0,
            },
        ))
    }
}

fn count_true(df: &DataFrame, column: &str) -> Result<usize> {
    Ok(df.column(column)?.bool()?.into_iter().flatten().filter(|b| *b).count())
}

/// A merge computed against one snapshot but not committed yet.
pub(crate) enum StagedMerge {
    /// The table does not exist; the source becomes version 0.
    Create,
    /// Nothing to commit.
    Unchanged(MergeMetrics),
    Merge {
        base: Snapshot,
        operation: Operation,
        merged: DataFrame,
        metrics: MergeMetrics,
    },
}

impl TableStore {
    /// Upsert `source` into `table`, re-planning against the new snapshot
    /// when another writer commits first.
    pub fn upsert(
        &self,
        source: &DataFrame,
        key_columns: &[String],
        table: &str,
        cdc_column: &str,
        options: MergeOptions,
    ) -> Result<MergeMetrics> {
        require_columns(source, key_columns.iter().map(String::as_str))?;
        require_columns(source, [cdc_column])?;
        let name = self.resolve(table)?;

        self.retry_on_conflict(&name, || {
            let staged = self.stage_upsert(&name, source, key_columns, cdc_column, &options)?;
            self.commit_staged(&name, source, staged)
        })
    }

    /// Run `attempt` until it succeeds, fails with anything but `Conflict`, or
    /// has been retried `max_commit_retries` times.
    pub(crate) fn retry_on_conflict<T>(
        &self,
        name: &TableName,
        mut attempt: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut retries = 0;
        loop {
            match attempt() {
                Err(e) if e.is_conflict() && retries < self.max_commit_retries() => {
                    retries += 1;
                    warn!("{}; re-planning merge into {} (retry {})", e, name, retries);
                }
                result => return result,
            }
        }
    }

    /// Plan and compute the merge against the latest snapshot.
    pub(crate) fn stage_upsert(
        &self,
        name: &TableName,
        source: &DataFrame,
        key_columns: &[String],
        cdc_column: &str,
        options: &MergeOptions,
    ) -> Result<StagedMerge> {
        let log = self.log(name);
        if !log.exists() {
            if !options.create_if_missing {
                return Err(TransformError::Table(format!("Table {} does not exist", name)));
            }
            return Ok(StagedMerge::Create);
        }

        let snapshot = log.snapshot(None)?;
        let target = self.load_snapshot(name, &snapshot)?;
        let plan = MergePlan::new(&target.schema(), &source.schema(), key_columns, cdc_column, options)?;

        if source.height() == 0 && plan.added_columns.is_empty() {
            debug!("Empty source, nothing to merge into {}", name);
            return Ok(StagedMerge::Unchanged(MergeMetrics {
                target_rows_before: target.height(),
                version: snapshot.version,
                ..Default::default()
            }));
        }

        let (merged, metrics) = plan.execute(&target, source)?;
        Ok(StagedMerge::Merge {
            base: snapshot,
            operation: Operation::Merge {
                key_columns: key_columns.to_vec(),
                cdc_column: cdc_column.to_string(),
            },
            merged,
            metrics,
        })
    }

    /// Commit a staged merge as the version after its base snapshot. Fails
    /// with `Conflict` if that version was taken in the meantime.
    pub(crate) fn commit_staged(
        &self,
        name: &TableName,
        source: &DataFrame,
        staged: StagedMerge,
    ) -> Result<MergeMetrics> {
        match staged {
            StagedMerge::Create => {
                let metrics = MergeMetrics {
                    source_rows: source.height(),
                    rows_inserted: source.height(),
                    ..Default::default()
                };
                self.commit_create(name, source, metrics.to_commit_metrics())?;
                info!("Merge created {} with {} rows", name, source.height());
                Ok(metrics)
            }
            StagedMerge::Unchanged(metrics) => Ok(metrics),
            StagedMerge::Merge {
                base,
                operation,
                merged,
                mut metrics,
            } => {
                let file = self.write_data_file(name, &merged)?;
                metrics.version = base.version + 1;
                self.publish(
                    name,
                    &Commit {
                        version: metrics.version,
                        timestamp: Utc::now(),
                        operation,
                        added: vec![file],
                        removed: base.files,
                        columns: column_names(&merged),
                        metrics: metrics.to_commit_metrics(),
                    },
                )?;

                info!(
                    "Merged into {} at version {}: {} updated, {} stale, {} inserted",
                    name,
                    metrics.version,
                    metrics.rows_updated,
                    metrics.rows_stale(),
                    metrics.rows_inserted
                );
                Ok(metrics)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn target() -> DataFrame {
        df! [
            "trip_id" => ["t1", "t2", "t3"],
            "fare" => [10.0, 20.0, 30.0],
            "updated_at" => [5i64, 5, 5]
        ]
        .unwrap()
    }

    fn data_files(store: &TableStore, table: &str) -> usize {
        let name = store.resolve(table).unwrap();
        std::fs::read_dir(store.root().join(name.relative_path()))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".parquet"))
            .count()
    }

    fn fare_of(df: &DataFrame, trip: &str) -> Option<f64> {
        let ids = df.column("trip_id").unwrap().str().unwrap();
        let fares = df.column("fare").unwrap().f64().unwrap();
        (0..df.height()).find(|i| ids.get(*i) == Some(trip)).and_then(|i| fares.get(i))
    }

    #[test]
    fn test_plan_schema_checks() {
        let t = target();
        let opts = MergeOptions::default();

        let missing = df! ["trip_id" => ["t1"], "updated_at" => [1i64]].unwrap();
        assert!(matches!(
            MergePlan::new(&t.schema(), &missing.schema(), &keys(&["trip_id"]), "updated_at", &opts),
            Err(TransformError::Schema(_))
        ));

        let wider = df! [
            "trip_id" => ["t1"], "fare" => [1.0], "updated_at" => [1i64], "tip" => [2.0]
        ]
        .unwrap();
        assert!(MergePlan::new(&t.schema(), &wider.schema(), &keys(&["trip_id"]), "updated_at", &opts).is_err());

        let evolve = MergeOptions { schema_evolution: true, ..Default::default() };
        let plan = MergePlan::new(&t.schema(), &wider.schema(), &keys(&["trip_id"]), "updated_at", &evolve).unwrap();
        assert_eq!(plan.added_columns, vec![("tip".to_string(), DataType::Float64)]);

        assert!(matches!(
            MergePlan::new(&t.schema(), &t.schema(), &[], "updated_at", &opts),
            Err(TransformError::Merge(_))
        ));
    }

    #[test]
    fn test_execute_updates_only_newer_and_inserts_new() {
        let source = df! [
            "trip_id" => ["t1", "t2", "t4"],
            "fare" => [11.0, 99.0, 40.0],
            "updated_at" => [6i64, 4, 1]
        ]
        .unwrap();
        let plan = MergePlan::new(
            &target().schema(),
            &source.schema(),
            &keys(&["trip_id"]),
            "updated_at",
            &MergeOptions::default(),
        )
        .unwrap();
        let (merged, metrics) = plan.execute(&target(), &source).unwrap();

        assert_eq!(merged.height(), 4);
        assert_eq!(fare_of(&merged, "t1"), Some(11.0));
        // Older change for t2 is ignored
        assert_eq!(fare_of(&merged, "t2"), Some(20.0));
        assert_eq!(fare_of(&merged, "t3"), Some(30.0));
        assert_eq!(fare_of(&merged, "t4"), Some(40.0));
        assert_eq!(metrics.rows_matched, 2);
        assert_eq!(metrics.rows_updated, 1);
        assert_eq!(metrics.rows_stale(), 1);
        assert_eq!(metrics.rows_inserted, 1);
    }

    #[test]
    fn test_execute_equal_cdc_updates() {
        let source = df! [
            "trip_id" => ["t3"], "fare" => [33.0], "updated_at" => [5i64]
        ]
        .unwrap();
        let plan = MergePlan::new(
            &target().schema(),
            &source.schema(),
            &keys(&["trip_id"]),
            "updated_at",
            &MergeOptions::default(),
        )
        .unwrap();
        let (merged, metrics) = plan.execute(&target(), &source).unwrap();
        assert_eq!(fare_of(&merged, "t3"), Some(33.0));
        assert_eq!(metrics.rows_updated, 1);
    }

    #[test]
    fn test_execute_rejects_ambiguous_source() {
        let source = df! [
            "trip_id" => ["t1", "t1"], "fare" => [1.0, 2.0], "updated_at" => [9i64, 9]
        ]
        .unwrap();
        let plan = MergePlan::new(
            &target().schema(),
            &source.schema(),
            &keys(&["trip_id"]),
            "updated_at",
            &MergeOptions::default(),
        )
        .unwrap();
        assert!(matches!(plan.execute(&target(), &source), Err(TransformError::Merge(_))));
    }

    #[test]
    fn test_null_keys_and_null_cdc() {
        let source = df! [
            "trip_id" => [None, Some("t1")],
            "fare" => [Some(1.0), Some(2.0)],
            "updated_at" => [Some(9i64), None]
        ]
        .unwrap();
        let plan = MergePlan::new(
            &target().schema(),
            &source.schema(),
            &keys(&["trip_id"]),
            "updated_at",
            &MergeOptions::default(),
        )
        .unwrap();
        let (merged, metrics) = plan.execute(&target(), &source).unwrap();
        // Null key never matches so it is inserted; null cdc never updates
        assert_eq!(metrics.rows_inserted, 1);
        assert_eq!(metrics.rows_matched, 1);
        assert_eq!(metrics.rows_updated, 0);
        assert_eq!(fare_of(&merged, "t1"), Some(10.0));
        assert_eq!(merged.height(), 4);
    }

    #[test]
    fn test_schema_evolution_adds_null_column() {
        let source = df! [
            "trip_id" => ["t1", "t9"],
            "fare" => [12.0, 90.0],
            "updated_at" => [7i64, 7],
            "tip" => [1.5, 2.5]
        ]
        .unwrap();
        let plan = MergePlan::new(
            &target().schema(),
            &source.schema(),
            &keys(&["trip_id"]),
            "updated_at",
            &MergeOptions { schema_evolution: true, ..Default::default() },
        )
        .unwrap();
        let (merged, _) = plan.execute(&target(), &source).unwrap();

        assert_eq!(merged.get_column_names(), vec!["trip_id", "fare", "updated_at", "tip"]);
        assert_eq!(merged.column("tip").unwrap().null_count(), 2);
    }

    #[test]
    fn test_upsert_commits_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        store.create_table("trips", &target()).unwrap();

        let source = df! [
            "trip_id" => ["t1", "t4"],
            "fare" => [15.0, 40.0],
            "updated_at" => [8i64, 8]
        ]
        .unwrap();
        let first = store
            .upsert(&source, &keys(&["trip_id"]), "trips", "updated_at", MergeOptions::default())
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.rows_inserted, 1);
        let after_first = store.read("trips").unwrap();

        let second = store
            .upsert(&source, &keys(&["trip_id"]), "trips", "updated_at", MergeOptions::default())
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.rows_inserted, 0);
        assert_eq!(second.rows_updated, 2);
        assert!(store.read("trips").unwrap().equals(&after_first));

        let history = store.history("trips").unwrap();
        assert!(matches!(history[0].operation, Operation::Merge { .. }));
        assert_eq!(history[0].metrics.get("rows_updated"), Some(&2));
    }

    #[test]
    fn test_upsert_missing_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let source = target();

        assert!(matches!(
            store.upsert(&source, &keys(&["trip_id"]), "trips", "updated_at", MergeOptions::default()),
            Err(TransformError::Table(_))
        ));

        let metrics = store
            .upsert(
                &source,
                &keys(&["trip_id"]),
                "trips",
                "updated_at",
                MergeOptions { create_if_missing: true, ..Default::default() },
            )
            .unwrap();
        assert_eq!(metrics.version, 0);
        assert_eq!(metrics.rows_inserted, 3);
        assert_eq!(store.read("trips").unwrap().height(), 3);
    }

    #[test]
    fn test_upsert_empty_source_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        store.create_table("trips", &target()).unwrap();

        let metrics = store
            .upsert(&target().head(Some(0)), &keys(&["trip_id"]), "trips", "updated_at", MergeOptions::default())
            .unwrap();
        assert_eq!(metrics.version, 0);
        assert_eq!(store.latest_version("trips").unwrap(), 0);
    }

    #[test]
    fn test_cdc_column_in_keys() {
        let source = df! [
            "trip_id" => ["t1", "t2"],
            "fare" => [11.0, 99.0],
            "updated_at" => [5i64, 6]
        ]
        .unwrap();
        let plan = MergePlan::new(
            &target().schema(),
            &source.schema(),
            &keys(&["trip_id", "updated_at"]),
            "updated_at",
            &MergeOptions::default(),
        )
        .unwrap();
        let (merged, metrics) = plan.execute(&target(), &source).unwrap();

        // (t1, 5) matches and updates; (t2, 6) is a new key and is inserted
        assert_eq!(metrics.rows_matched, 1);
        assert_eq!(metrics.rows_updated, 1);
        assert_eq!(metrics.rows_inserted, 1);
        assert_eq!(merged.height(), 4);
        assert_eq!(fare_of(&merged, "t1"), Some(11.0));
        assert_eq!(merged.get_column_names(), vec!["trip_id", "fare", "updated_at"]);
    }

    #[test]
    fn test_execute_rejects_values_that_do_not_cast() {
        let source = df! [
            "trip_id" => ["t1"],
            "fare" => ["not-a-number"],
            "updated_at" => [9i64]
        ]
        .unwrap();
        let plan = MergePlan::new(
            &target().schema(),
            &source.schema(),
            &keys(&["trip_id"]),
            "updated_at",
            &MergeOptions::default(),
        )
        .unwrap();
        assert!(matches!(plan.execute(&target(), &source), Err(TransformError::Schema(_))));
    }

    #[test]
    fn test_upsert_replans_after_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        store.create_table("trips", &target()).unwrap();
        let name = store.resolve("trips").unwrap();
        let opts = MergeOptions::default();

        let ours = df! ["trip_id" => ["t1"], "fare" => [15.0], "updated_at" => [8i64]].unwrap();
        let theirs = df! ["trip_id" => ["t5"], "fare" => [50.0], "updated_at" => [8i64]].unwrap();

        let mut attempts = 0;
        let metrics = store
            .retry_on_conflict(&name, || {
                attempts += 1;
                let staged = store.stage_upsert(&name, &ours, &keys(&["trip_id"]), "updated_at", &opts)?;
                if attempts == 1 {
                    // Another writer commits version 1 between our snapshot and our commit
                    store
                        .upsert(&theirs, &keys(&["trip_id"]), "trips", "updated_at", opts)
                        .unwrap();
                }
                store.commit_staged(&name, &ours, staged)
            })
            .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(metrics.version, 2);
        assert_eq!(metrics.target_rows_before, 4);
        let table = store.read("trips").unwrap();
        assert_eq!(table.height(), 4);
        assert_eq!(fare_of(&table, "t1"), Some(15.0));
        assert_eq!(fare_of(&table, "t5"), Some(50.0));
        // The file written by the losing attempt was cleaned up
        assert_eq!(data_files(&store, "trips"), 3);
    }

    #[test]
    fn test_upsert_without_retries_surfaces_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path()).with_max_commit_retries(0);
        store.create_table("trips", &target()).unwrap();
        let name = store.resolve("trips").unwrap();
        let opts = MergeOptions::default();

        let ours = df! ["trip_id" => ["t1"], "fare" => [15.0], "updated_at" => [8i64]].unwrap();
        let theirs = df! ["trip_id" => ["t5"], "fare" => [50.0], "updated_at" => [8i64]].unwrap();

        let mut attempts = 0;
        let err = store
            .retry_on_conflict(&name, || {
                attempts += 1;
                let staged = store.stage_upsert(&name, &ours, &keys(&["trip_id"]), "updated_at", &opts)?;
                store
                    .upsert(&theirs, &keys(&["trip_id"]), "trips", "updated_at", opts)
                    .unwrap();
                store.commit_staged(&name, &ours, staged)
            })
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(attempts, 1);
        assert_eq!(store.latest_version("trips").unwrap(), 1);
        assert_eq!(fare_of(&store.read("trips").unwrap(), "t1"), Some(10.0));
        assert_eq!(data_files(&store, "trips"), 2);
    }

    #[test]
    fn test_create_if_missing_race_merges_into_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let name = store.resolve("trips").unwrap();
        let opts = MergeOptions { create_if_missing: true, ..Default::default() };

        let ours = df! ["trip_id" => ["t1"], "fare" => [15.0], "updated_at" => [8i64]].unwrap();

        let mut attempts = 0;
        let metrics = store
            .retry_on_conflict(&name, || {
                attempts += 1;
                let staged = store.stage_upsert(&name, &ours, &keys(&["trip_id"]), "updated_at", &opts)?;
                if attempts == 1 {
                    assert!(matches!(staged, StagedMerge::Create));
                    store.create_table("trips", &target()).unwrap();
                }
                store.commit_staged(&name, &ours, staged)
            })
            .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(metrics.version, 1);
        assert_eq!(metrics.rows_updated, 1);
        let table = store.read("trips").unwrap();
        assert_eq!(table.height(), 3);
        assert_eq!(fare_of(&table, "t1"), Some(15.0));
        assert_eq!(data_files(&store, "trips"), 2);
    }

    #[test]
    fn test_upsert_with_schema_evolution_commits_new_column() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        store.create_table("trips", &target()).unwrap();

        let source = df! [
            "trip_id" => ["t1", "t9"],
            "fare" => [12.0, 90.0],
            "updated_at" => [7i64, 7],
            "tip" => [1.5, 2.5]
        ]
        .unwrap();
        let metrics = store
            .upsert(
                &source,
                &keys(&["trip_id"]),
                "trips",
                "updated_at",
                MergeOptions { schema_evolution: true, ..Default::default() },
            )
            .unwrap();
        assert_eq!(metrics.version, 1);
        assert_eq!(metrics.rows_updated, 1);
        assert_eq!(metrics.rows_inserted, 1);

        let table = store.read("trips").unwrap();
        assert_eq!(table.get_column_names(), vec!["trip_id", "fare", "updated_at", "tip"]);
        assert_eq!(table.height(), 4);
        // t2 and t3 predate the column
        assert_eq!(table.column("tip").unwrap().null_count(), 2);
        assert_eq!(store.history("trips").unwrap()[0].columns.last().map(String::as_str), Some("tip"));

        // A later source without the new column no longer fits the table
        assert!(matches!(
            store.upsert(&target(), &keys(&["trip_id"]), "trips", "updated_at", MergeOptions::default()),
            Err(TransformError::Schema(_))
        ));
    }
}
