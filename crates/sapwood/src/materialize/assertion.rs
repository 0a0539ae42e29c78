//! Assertion reports compiled from assertion query rows.

use crate::value::{Options, Value};
use crate::warehouse::Row;
use serde::Serialize;

const RESERVED: &[&str] = &["success", "description"];

/// Outcome of one assertion row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssertionResult {
    /// `None` when the row carried no boolean `success` column.
    pub success: Option<bool>,
    pub description: Option<String>,
    /// Every other column of the row.
    pub other_asserted_values: Options,
}

impl AssertionResult {
    pub fn passed(&self) -> bool {
        self.success == Some(true)
    }
}

/// Every row of an assertion query, in result order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AssertionReport {
    pub results: Vec<AssertionResult>,
}

impl AssertionReport {
    pub fn from_rows(rows: &[Row]) -> Self {
        let results = rows
            .iter()
            .map(|row| AssertionResult {
                success: row.get("success").and_then(Value::as_bool),
                description: row.get("description").and_then(Value::as_str).map(str::to_string),
                other_asserted_values: row
                    .iter()
                    .filter(|(key, _)| !RESERVED.contains(&key.as_str()))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            })
            .collect();
        Self { results }
    }

    pub fn has_failure(&self) -> bool {
        self.results.iter().any(|r| !r.passed())
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.passed()).count()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// YAML rendering used in logs.
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| format!("<unrenderable report: {}>", e))
    }
}
