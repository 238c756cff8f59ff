//! Payment categorisation rules
//!
//! Maps `(payment_method, payment_status)` pairs onto a single status label.
//! The first matching rule wins; rows that match no rule (or carry nulls in
//! either input column) get the fallback label.

use polars::prelude::*;
use serde::{Deserialize, Serialize};

pub const PAYMENT_METHOD_COLUMN: &str = "payment_method";
pub const PAYMENT_STATUS_COLUMN: &str = "payment_status";
pub const ONLINE_PAYMENT_STATUS_COLUMN: &str = "online_payment_status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRule {
    pub method: String,
    pub status: String,
    pub label: String,
}

impl PaymentRule {
    pub fn new(method: &str, status: &str, label: &str) -> Self {
        Self {
            method: method.to_string(),
            status: status.to_string(),
            label: label.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRules {
    pub rules: Vec<PaymentRule>,
    pub fallback: String,
}

impl Default for PaymentRules {
    fn default() -> Self {
        Self {
            rules: vec![
                PaymentRule::new("Card", "Success", "Online-Success"),
                PaymentRule::new("Card", "Failed", "Online-Failed"),
                PaymentRule::new("Card", "Pending", "Online-Pending"),
            ],
            fallback: "Offline".to_string(),
        }
    }
}

impl PaymentRules {
    /// Build the status expression.
    ///
    /// Folded from the fallback outwards so the first rule is the outermost
    /// `when`, which keeps first-match-wins ordering.
    pub fn status_expr(&self) -> Expr {
        self.rules
            .iter()
            .rev()
            .fold(lit(self.fallback.clone()), |otherwise, rule| {
                let matches = col(PAYMENT_METHOD_COLUMN)
                    .eq(lit(rule.method.clone()))
                    .and(col(PAYMENT_STATUS_COLUMN).eq(lit(rule.status.clone())));
                when(matches)
                    .then(lit(rule.label.clone()))
                    .otherwise(otherwise)
            })
            .alias(ONLINE_PAYMENT_STATUS_COLUMN)
    }
}
