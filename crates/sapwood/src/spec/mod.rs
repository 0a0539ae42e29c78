//! Pipeline specifications: typed entities built from a pipeline document.
//!
//! A document is loaded into a raw [`Value`](crate::Value) by the
//! [`loader`], then turned into an immutable [`PipelineConfig`] by the
//! [`validator`]. Nothing here is mutated after validation.

pub mod error;
pub mod loader;
pub mod validator;

use crate::value::{Options, Value};
use indexmap::IndexSet;
use serde::Serialize;
use std::fmt;

/// A validated pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub timezone: String,
    /// Cron expression as written in the document.
    pub schedule: Option<String>,
    pub params: Options,
    pub database: String,
    pub schema: String,
    /// Tasks in declaration order. Never empty.
    pub tasks: Vec<Task>,
}

impl PipelineConfig {
    /// Look up a task by identifier.
    pub fn task(&self, identifier: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.identifier == identifier)
    }
}

/// One unit of work in a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub kind: Kind,
    pub database: String,
    pub schema: String,
    pub identifier: String,
    pub partitioning: Option<Partitioning>,
    /// Identifiers of upstream tasks, de-duplicated in declaration order.
    pub dependencies: IndexSet<String>,
    pub options: Options,
}

impl Task {
    /// Whether this task reads its body from `sql/<identifier>.sql`.
    pub fn needs_sql(&self) -> bool {
        match &self.kind {
            Kind::Materialize(MaterializeTarget::Schema) => false,
            Kind::Materialize(_) | Kind::Invoke(_) | Kind::Assert(_) => true,
            Kind::ExternalTransform(_) | Kind::NamedAdapter(_) => false,
        }
    }

    /// The external project an external-transform task runs against.
    pub fn external_project(&self) -> Option<&str> {
        match self.kind {
            Kind::ExternalTransform(_) => self.options.get("project").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// What a task does, with only the targets legal for each action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "target", rename_all = "kebab-case")]
pub enum Kind {
    Materialize(MaterializeTarget),
    Invoke(InvokeTarget),
    Assert(AssertTarget),
    ExternalTransform(ExternalTarget),
    /// An adapter registered under an arbitrary name.
    NamedAdapter(String),
}

impl Kind {
    pub const ACTIONS: &'static [&'static str] = &[
        "materialize",
        "invoke",
        "assert",
        "external-transform",
        "named-adapter",
    ];

    pub fn action(&self) -> &'static str {
        match self {
            Kind::Materialize(_) => "materialize",
            Kind::Invoke(_) => "invoke",
            Kind::Assert(_) => "assert",
            Kind::ExternalTransform(_) => "external-transform",
            Kind::NamedAdapter(_) => "named-adapter",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Kind::Materialize(t) => t.as_str(),
            Kind::Invoke(t) => t.as_str(),
            Kind::Assert(t) => t.as_str(),
            Kind::ExternalTransform(t) => t.as_str(),
            Kind::NamedAdapter(name) => name,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.action(), self.target())
    }
}

macro_rules! target_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [&'static str] = &[$($text),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

target_enum!(
    /// Objects a `materialize` task can create or replace.
    MaterializeTarget {
        Table => "table",
        View => "view",
        Udf => "udf",
        StoredProcedure => "stored_procedure",
        Schema => "schema",
    }
);

target_enum!(
    /// Objects an `invoke` task can call.
    InvokeTarget {
        StoredProcedure => "stored_procedure",
    }
);

target_enum!(
    /// Flavours of `assert` task.
    AssertTarget {
        Assertion => "assertion",
        AssertionSensor => "assertion_sensor",
    }
);

target_enum!(
    /// Commands of the external transformation tool.
    ExternalTarget {
        Run => "run",
        Test => "test",
    }
);

target_enum!(
    /// Column types a table can be partitioned on by a document.
    PartitionDataType {
        Date => "date",
        Timestamp => "timestamp",
        Datetime => "datetime",
    }
);

/// Time partitioning of a materialized table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partitioning {
    pub field: String,
    pub data_type: PartitionDataType,
}

/// One `{option, value}` entry of an external-transform task's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalArgument {
    pub option: String,
    pub value: Option<String>,
}

impl ExternalArgument {
    /// Flags that may be passed to the external tool.
    pub const ALLOWED_OPTIONS: &'static [&'static str] = &[
        "-m",
        "-x",
        "--fail-fast",
        "--threads",
        "--exclude",
        "--full-refresh",
    ];

    /// Parse the validated `options.arguments` list of a task.
    ///
    /// Entries that are not mappings with a string `option` are skipped; the
    /// validator has already rejected them for validated tasks.
    pub fn from_options(options: &Options) -> Vec<ExternalArgument> {
        options
            .get("arguments")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(Value::as_object)
                    .filter_map(|arg| {
                        let option = arg.get("option").and_then(Value::as_str)?;
                        let value = arg.get("value").filter(|v| !v.is_null()).map(|v| v.to_string());
                        Some(ExternalArgument {
                            option: option.to_string(),
                            value,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::OptionsExt;

    #[test]
    fn test_kind_display() {
        let kind = Kind::Materialize(MaterializeTarget::StoredProcedure);
        assert_eq!(kind.to_string(), "materialize/stored_procedure");
        assert_eq!(
            Kind::NamedAdapter("slack.notify".into()).to_string(),
            "named-adapter/slack.notify"
        );
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(MaterializeTarget::parse("udf"), Some(MaterializeTarget::Udf));
        assert_eq!(MaterializeTarget::parse("assertion"), None);
        assert_eq!(ExternalTarget::ALL, &["run", "test"]);
    }

    #[test]
    fn test_external_arguments_from_options() {
        let options = Options::new().with(
            "arguments",
            Value::Array(vec![
                Value::Object(Options::new().with("option", "-m").with("value", "orders")),
                Value::Object(Options::new().with("option", "--fail-fast")),
            ]),
        );

        let args = ExternalArgument::from_options(&options);
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].value.as_deref(), Some("orders"));
        assert_eq!(args[1].value, None);
    }
}
