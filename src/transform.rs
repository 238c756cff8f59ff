//! Row-level transformations applied before data lands in a silver table.

use crate::error::{Result, TransformError};
use crate::payment::{PaymentRules, PAYMENT_METHOD_COLUMN, PAYMENT_STATUS_COLUMN};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const PROCESSED_TIMESTAMP_COLUMN: &str = "processed_timestamp";

const ROW_INDEX_COLUMN: &str = "__row_index";

/// Which record survives when several share a dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepStrategy {
    /// Lowest CDC value wins.
    #[default]
    Earliest,
    /// Highest CDC value wins.
    Latest,
}

#[derive(Debug, Clone, Default)]
pub struct Transform {
    payment_rules: PaymentRules,
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payment_rules(payment_rules: PaymentRules) -> Self {
        Self { payment_rules }
    }

    pub fn payment_rules(&self) -> &PaymentRules {
        &self.payment_rules
    }

    /// Keep one row per distinct combination of `dedup_columns`.
    ///
    /// Rows are ranked inside each key by `cdc_column` (nulls last) and then by
    /// input position, so ties resolve to the row seen first. The surviving
    /// rows keep their input order.
    pub fn deduplicate(
        &self,
        df: &DataFrame,
        dedup_columns: &[String],
        cdc_column: &str,
        keep: KeepStrategy,
    ) -> Result<DataFrame> {
        if dedup_columns.is_empty() {
            return Err(TransformError::Schema(
                "deduplicate needs at least one key column".to_string(),
            ));
        }
        require_columns(df, dedup_columns.iter().map(String::as_str))?;
        require_columns(df, [cdc_column])?;

        let output_columns: Vec<Expr> = df
            .get_column_names()
            .into_iter()
            .map(col)
            .collect();
        let descending = keep == KeepStrategy::Latest;

        let result = df
            .clone()
            .lazy()
            .with_row_index(ROW_INDEX_COLUMN, None)
            .sort(
                vec![cdc_column.to_string(), ROW_INDEX_COLUMN.to_string()],
                SortMultipleOptions::default()
                    .with_order_descendings([descending, false])
                    .with_nulls_last(true)
                    .with_maintain_order(true),
            )
            .unique_stable(Some(dedup_columns.to_vec()), UniqueKeepStrategy::First)
            .sort(vec![ROW_INDEX_COLUMN.to_string()], SortMultipleOptions::default())
            .select(output_columns)
            .collect()?;

        debug!(
            "Deduplicated {} rows to {} on {:?} by {} ({:?})",
            df.height(),
            result.height(),
            dedup_columns,
            cdc_column,
            keep
        );
        Ok(result)
    }

    /// Stamp every row with the current UTC time.
    pub fn processed_timestamp(&self, df: &DataFrame) -> Result<DataFrame> {
        self.processed_timestamp_at(df, Utc::now())
    }

    pub fn processed_timestamp_at(&self, df: &DataFrame, at: DateTime<Utc>) -> Result<DataFrame> {
        let stamp = lit(at.timestamp_micros())
            .cast(DataType::Datetime(TimeUnit::Microseconds, None))
            .alias(PROCESSED_TIMESTAMP_COLUMN);
        Ok(df.clone().lazy().with_column(stamp).collect()?)
    }

    /// Derive `online_payment_status` from the payment method and status.
    pub fn payment_check(&self, df: &DataFrame) -> Result<DataFrame> {
        require_columns(df, [PAYMENT_METHOD_COLUMN, PAYMENT_STATUS_COLUMN])?;
        Ok(df
            .clone()
            .lazy()
            .with_column(self.payment_rules.status_expr())
            .collect()?)
    }

    pub fn uppercase(&self, df: &DataFrame, column: &str) -> Result<DataFrame> {
        let series = df
            .column(column)
            .map_err(|_| TransformError::Schema(format!("Column '{}' not found", column)))?;
        if series.dtype() != &DataType::String {
            return Err(TransformError::Schema(format!(
                "Column '{}' is {:?}, expected a string column",
                column,
                series.dtype()
            )));
        }
        Ok(df
            .clone()
            .lazy()
            .with_column(col(column).str().to_uppercase().alias(column))
            .collect()?)
    }
}

pub(crate) fn require_columns<'a>(
    df: &DataFrame,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let missing: Vec<&str> = columns
        .into_iter()
        .filter(|c| df.column(c).is_err())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TransformError::Schema(format!(
            "Missing column(s): {}",
            missing.join(", ")
        )))
    }
}
