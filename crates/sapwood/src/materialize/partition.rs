//! Execution-time partition configuration.

use crate::value::{Options, OptionsExt, Value};
use std::fmt;

/// Integer range partitioning bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub start: i64,
    pub end: i64,
    pub interval: i64,
}

/// Partitioning of a materialized table, resolved from task options.
///
/// Read from `partition_key`, `partition_data_type` and, for `int64`,
/// `partition_range: {start, end, interval}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    pub field: String,
    pub data_type: String,
    pub range: Option<PartitionRange>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PartitionConfigError {
    #[error("int64 partitioning on `{field}` requires partition_range with integer start, end and interval")]
    IncompleteRange { field: String },

    #[error("partition data type `{0}` is not supported")]
    Unsupported(String),
}

impl PartitionConfig {
    /// Resolve from task options. `None` unless both a key and a data type
    /// are supplied.
    pub fn create(options: &Options) -> Result<Option<Self>, PartitionConfigError> {
        let field = options
            .get("partition_key")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        let data_type = options
            .get("partition_data_type")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());

        let (Some(field), Some(data_type)) = (field, data_type) else {
            return Ok(None);
        };

        let range = match data_type {
            "int64" => Some(range(options).ok_or_else(|| PartitionConfigError::IncompleteRange {
                field: field.to_string(),
            })?),
            "date" | "timestamp" | "datetime" => None,
            other => return Err(PartitionConfigError::Unsupported(other.to_string())),
        };

        Ok(Some(Self {
            field: field.to_string(),
            data_type: data_type.to_string(),
            range,
        }))
    }

    /// Expression naming the partition of a row, optionally qualified by a
    /// table alias.
    pub fn expression(&self, alias: Option<&str>) -> String {
        let column = match alias {
            Some(alias) => format!("{}.{}", alias, self.field),
            None => self.field.clone(),
        };

        match (self.data_type.as_str(), self.range) {
            ("timestamp" | "datetime", _) => format!("DATE({})", column),
            ("int64", Some(r)) => format!(
                "RANGE_BUCKET({}, GENERATE_ARRAY({}, {}, {}))",
                column, r.start, r.end, r.interval
            ),
            _ => column,
        }
    }

    /// Whether an existing partitioning column matches this config.
    ///
    /// Warehouse metadata reports types in upper case.
    pub fn matches_column(&self, column_name: &str, data_type: &str) -> bool {
        self.field == column_name && self.data_type.eq_ignore_ascii_case(data_type)
    }

    /// Structured form handed to template renderers.
    pub fn to_options(&self) -> Options {
        let mut options = Options::new()
            .with("field", self.field.as_str())
            .with("data_type", self.data_type.as_str());
        if let Some(r) = self.range {
            options.insert(
                "range".into(),
                Value::Object(
                    Options::new()
                        .with("start", r.start)
                        .with("end", r.end)
                        .with("interval", r.interval),
                ),
            );
        }
        options
    }
}

impl fmt::Display for PartitionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.field, self.data_type)
    }
}

fn range(options: &Options) -> Option<PartitionRange> {
    let range = options.get("partition_range")?.as_object()?;
    let bound = |key: &str| range.get(key).and_then(Value::as_i64);
    Some(PartitionRange {
        start: bound("start")?,
        end: bound("end")?,
        interval: bound("interval")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_options(range: Options) -> Options {
        Options::new()
            .with("partition_key", "bucket")
            .with("partition_data_type", "int64")
            .with("partition_range", range)
    }

    #[test]
    fn test_none_without_key_and_type() {
        assert_eq!(PartitionConfig::create(&Options::new()), Ok(None));
        assert_eq!(
            PartitionConfig::create(&Options::new().with("partition_key", "created")),
            Ok(None)
        );
        assert_eq!(
            PartitionConfig::create(&Options::new().with("partition_data_type", "date")),
            Ok(None)
        );
    }

    #[test]
    fn test_time_partitioning() {
        let config = PartitionConfig::create(
            &Options::new()
                .with("partition_key", "created_at")
                .with("partition_data_type", "timestamp"),
        )
        .unwrap()
        .unwrap();

        assert_eq!(config.range, None);
        assert_eq!(config.expression(None), "DATE(created_at)");
        assert_eq!(config.expression(Some("T")), "DATE(T.created_at)");
        assert!(config.matches_column("created_at", "TIMESTAMP"));
        assert!(!config.matches_column("created_at", "DATE"));
    }

    #[test]
    fn test_int64_requires_full_range() {
        let incomplete = range_options(Options::new().with("start", 0).with("end", 100));
        assert_eq!(
            PartitionConfig::create(&incomplete),
            Err(PartitionConfigError::IncompleteRange {
                field: "bucket".into()
            })
        );

        let missing = Options::new()
            .with("partition_key", "bucket")
            .with("partition_data_type", "int64");
        assert!(PartitionConfig::create(&missing).is_err());

        let complete = range_options(
            Options::new()
                .with("start", 0)
                .with("end", 100)
                .with("interval", 10),
        );
        let config = PartitionConfig::create(&complete).unwrap().unwrap();
        assert_eq!(
            config.expression(None),
            "RANGE_BUCKET(bucket, GENERATE_ARRAY(0, 100, 10))"
        );
    }

    #[test]
    fn test_unsupported_type() {
        let options = Options::new()
            .with("partition_key", "name")
            .with("partition_data_type", "string");
        assert_eq!(
            PartitionConfig::create(&options),
            Err(PartitionConfigError::Unsupported("string".into()))
        );
    }
}
