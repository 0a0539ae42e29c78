//! Validation: raw pipeline document → [`PipelineConfig`].
//!
//! Validation is a pure transform. The whole document is walked and every
//! problem is recorded before failing, so one run reports structural errors
//! (missing fields, bad cron, unknown actions) and kind-specific domain
//! errors (illegal targets, old tool versions, disallowed flags) together.

use crate::spec::error::{ConfigIssue, ExternalTransformError, InvalidPipelineConfig, TaskConfigError};
use crate::spec::{
    AssertTarget, ExternalArgument, ExternalTarget, InvokeTarget, Kind, MaterializeTarget,
    Partitioning, PartitionDataType, PipelineConfig, Task,
};
use crate::value::{Options, Value};
use indexmap::{IndexMap, IndexSet};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::str::FromStr;

/// Oldest external transformation tool release a task may pin.
pub const MINIMUM_EXTERNAL_VERSION: &str = "0.18.1";

const MISSING: &str = "Missing data for required field.";
const NOT_A_CHOICE: &str = "Not a valid choice.";
const NOT_A_STRING: &str = "Not a valid string.";
const NOT_A_BOOL: &str = "Not a valid boolean.";
const NOT_A_MAPPING: &str = "Not a valid mapping type.";
const NOT_A_LIST: &str = "Not a valid list.";
const EMPTY: &str = "Shorter than minimum length 1.";

const CRON_PRESETS: &[&str] = &[
    "@yearly",
    "@annually",
    "@monthly",
    "@weekly",
    "@daily",
    "@hourly",
];

/// Validates pipeline documents.
#[derive(Debug, Clone, Default)]
pub struct SpecValidator {
    default_database: Option<String>,
    default_schema: Option<String>,
}

impl SpecValidator {
    /// Create a validator with no defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Database used when the document does not name one.
    pub fn default_database(mut self, database: impl Into<String>) -> Self {
        self.default_database = Some(database.into());
        self
    }

    /// Schema used when the document does not name one.
    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }

    /// Validate a raw document.
    pub fn validate(&self, document: &Value) -> Result<PipelineConfig, InvalidPipelineConfig> {
        let mut issues = Issues::default();

        let Some(root) = document.as_object() else {
            issues.field("<root>", NOT_A_MAPPING);
            return Err(issues.into_error());
        };

        let enabled = match root.get("enabled") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                issues.field("enabled", NOT_A_BOOL);
                true
            }
        };

        let timezone = required_string(root, "timezone", "timezone", &mut issues);
        let schedule = self.schedule(root, &mut issues);

        let params = match root.get("params") {
            None | Some(Value::Null) => Options::new(),
            Some(Value::Object(obj)) => obj.clone(),
            Some(_) => {
                issues.field("params", NOT_A_MAPPING);
                Options::new()
            }
        };

        let database = defaulted_string(root, "database", self.default_database.as_deref(), &mut issues);
        let schema = defaulted_string(root, "schema", self.default_schema.as_deref(), &mut issues);

        let tasks = match root.get("tasks") {
            None | Some(Value::Null) => {
                issues.field("tasks", MISSING);
                Vec::new()
            }
            Some(Value::Array(items)) if items.is_empty() => {
                issues.field("tasks", EMPTY);
                Vec::new()
            }
            Some(Value::Array(items)) => self.tasks(
                items,
                database.as_deref().unwrap_or_default(),
                schema.as_deref().unwrap_or_default(),
                &mut issues,
            ),
            Some(_) => {
                issues.field("tasks", NOT_A_LIST);
                Vec::new()
            }
        };

        if !issues.is_empty() {
            return Err(issues.into_error());
        }

        // Every required field is present once no issue was recorded.
        Ok(PipelineConfig {
            enabled,
            timezone: timezone.unwrap_or_default(),
            schedule,
            params,
            database: database.unwrap_or_default(),
            schema: schema.unwrap_or_default(),
            tasks,
        })
    }

    fn schedule(&self, root: &IndexMap<String, Value>, issues: &mut Issues) -> Option<String> {
        let key = if root.contains_key("schedule") {
            "schedule"
        } else {
            "schedule_interval"
        };

        match root.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(expr)) => {
                if is_valid_cron(expr) {
                    Some(expr.clone())
                } else {
                    issues.field(
                        key,
                        format!(
                            "The schedule expression `{}` must be a valid CRON expression",
                            expr
                        ),
                    );
                    None
                }
            }
            Some(_) => {
                issues.field(key, NOT_A_STRING);
                None
            }
        }
    }

    fn tasks(
        &self,
        items: &[Value],
        database: &str,
        schema: &str,
        issues: &mut Issues,
    ) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(items.len());
        let mut seen = HashSet::new();

        for (i, item) in items.iter().enumerate() {
            let path = format!("tasks[{}]", i);
            let Some(obj) = item.as_object() else {
                issues.field(path, NOT_A_MAPPING);
                continue;
            };

            if let Some(task) = self.task(obj, &path, database, schema, issues) {
                if !seen.insert(task.identifier.clone()) {
                    issues.field(
                        format!("{}.identifier", path),
                        format!("Duplicate task identifier `{}`.", task.identifier),
                    );
                    continue;
                }
                tasks.push(task);
            }
        }

        tasks
    }

    fn task(
        &self,
        obj: &IndexMap<String, Value>,
        path: &str,
        database: &str,
        schema: &str,
        issues: &mut Issues,
    ) -> Option<Task> {
        let before = issues.len();

        let identifier = required_string(obj, "identifier", &format!("{}.identifier", path), issues);
        let task_database = optional_string(obj, "database", &format!("{}.database", path), issues)
            .unwrap_or_else(|| database.to_string());
        let task_schema = optional_string(obj, "schema", &format!("{}.schema", path), issues)
            .unwrap_or_else(|| schema.to_string());

        let raw_kind = raw_kind(obj.get("kind"), &format!("{}.kind", path), issues);

        let dependencies = match obj.get("dependencies") {
            None | Some(Value::Null) => IndexSet::new(),
            Some(Value::Array(deps)) => {
                let mut set = IndexSet::new();
                for (j, dep) in deps.iter().enumerate() {
                    match dep.as_str() {
                        Some(name) => {
                            set.insert(name.to_string());
                        }
                        None => issues.field(format!("{}.dependencies[{}]", path, j), NOT_A_STRING),
                    }
                }
                set
            }
            Some(_) => {
                issues.field(format!("{}.dependencies", path), NOT_A_LIST);
                IndexSet::new()
            }
        };

        let options = match obj.get("options") {
            None | Some(Value::Null) => Options::new(),
            Some(Value::Object(options)) => options.clone(),
            Some(_) => {
                issues.field(format!("{}.options", path), NOT_A_MAPPING);
                Options::new()
            }
        };

        let partitioning = partitioning(obj.get("partitioning"), &format!("{}.partitioning", path), issues);

        // Domain rules only run once the kind is structurally sound.
        let task_name = identifier.clone().unwrap_or_else(|| path.to_string());
        let kind = raw_kind.and_then(|(action, target)| {
            match domain_kind(&action, &target, &options) {
                Ok(kind) => Some(kind),
                Err(error) => {
                    issues.task(task_name.clone(), error);
                    None
                }
            }
        });

        if let (Some(kind), Some(_)) = (&kind, &partitioning) {
            if *kind != Kind::Materialize(MaterializeTarget::Table) {
                issues.field(
                    format!("{}.partitioning", path),
                    "partitioning is only supported for materialize/table tasks",
                );
            }
        }

        if issues.len() > before {
            return None;
        }

        Some(Task {
            kind: kind?,
            database: task_database,
            schema: task_schema,
            identifier: identifier?,
            partitioning,
            dependencies,
            options,
        })
    }
}

/// Validate a document with no loader defaults.
pub fn validate(document: &Value) -> Result<PipelineConfig, InvalidPipelineConfig> {
    SpecValidator::new().validate(document)
}

#[derive(Default)]
struct Issues(Vec<ConfigIssue>);

impl Issues {
    fn field(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(ConfigIssue::Field {
            path: path.into(),
            message: message.into(),
        });
    }

    fn task(&mut self, task: String, error: TaskConfigError) {
        self.0.push(ConfigIssue::Task { task, error });
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn into_error(self) -> InvalidPipelineConfig {
        InvalidPipelineConfig::new(self.0)
    }
}

fn required_string(
    obj: &IndexMap<String, Value>,
    key: &str,
    path: &str,
    issues: &mut Issues,
) -> Option<String> {
    match obj.get(key) {
        None | Some(Value::Null) => {
            issues.field(path, MISSING);
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            issues.field(path, EMPTY);
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            issues.field(path, NOT_A_STRING);
            None
        }
    }
}

/// A required string that falls back to a loader default when absent.
fn defaulted_string(
    obj: &IndexMap<String, Value>,
    key: &str,
    default: Option<&str>,
    issues: &mut Issues,
) -> Option<String> {
    match (obj.get(key), default) {
        (None | Some(Value::Null), Some(default)) => Some(default.to_string()),
        _ => required_string(obj, key, key, issues),
    }
}

fn optional_string(
    obj: &IndexMap<String, Value>,
    key: &str,
    path: &str,
    issues: &mut Issues,
) -> Option<String> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => {
            issues.field(path, EMPTY);
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            issues.field(path, NOT_A_STRING);
            None
        }
    }
}

/// Structural check of `kind`: returns `(action, target)` with a known action.
fn raw_kind(value: Option<&Value>, path: &str, issues: &mut Issues) -> Option<(String, String)> {
    let obj = match value {
        None | Some(Value::Null) => {
            issues.field(path, MISSING);
            return None;
        }
        Some(Value::Object(obj)) => obj,
        Some(_) => {
            issues.field(path, NOT_A_MAPPING);
            return None;
        }
    };

    let action_path = format!("{}.action", path);
    let action = match obj.get("action") {
        None | Some(Value::Null) => {
            issues.field(action_path, MISSING);
            None
        }
        Some(Value::String(action)) if Kind::ACTIONS.contains(&action.as_str()) => Some(action.clone()),
        Some(Value::String(_)) => {
            issues.field(action_path, NOT_A_CHOICE);
            None
        }
        Some(_) => {
            issues.field(action_path, NOT_A_STRING);
            None
        }
    };

    let target = match obj.get("target") {
        None | Some(Value::Null) => Some(String::new()),
        Some(Value::String(target)) => Some(target.clone()),
        Some(_) => {
            issues.field(format!("{}.target", path), NOT_A_STRING);
            None
        }
    };

    Some((action?, target?))
}

fn partitioning(value: Option<&Value>, path: &str, issues: &mut Issues) -> Option<Partitioning> {
    let obj = match value {
        None | Some(Value::Null) => return None,
        Some(Value::Object(obj)) => obj,
        Some(_) => {
            issues.field(path, NOT_A_MAPPING);
            return None;
        }
    };

    let field = required_string(obj, "field", &format!("{}.field", path), issues);

    let type_path = format!("{}.data_type", path);
    let data_type = match obj.get("data_type") {
        None | Some(Value::Null) => {
            issues.field(type_path, MISSING);
            None
        }
        Some(Value::String(s)) => match PartitionDataType::parse(s) {
            Some(data_type) => Some(data_type),
            None => {
                issues.field(type_path, NOT_A_CHOICE);
                None
            }
        },
        Some(_) => {
            issues.field(type_path, NOT_A_STRING);
            None
        }
    };

    Some(Partitioning {
        field: field?,
        data_type: data_type?,
    })
}

/// Kind-specific domain rules.
fn domain_kind(action: &str, target: &str, options: &Options) -> Result<Kind, TaskConfigError> {
    match action {
        "materialize" => MaterializeTarget::parse(target)
            .map(Kind::Materialize)
            .ok_or_else(|| TaskConfigError::Materialization {
                target: target.to_string(),
                allowed: MaterializeTarget::ALL,
            }),
        "invoke" => InvokeTarget::parse(target)
            .map(Kind::Invoke)
            .ok_or_else(|| TaskConfigError::Invocation {
                target: target.to_string(),
                allowed: InvokeTarget::ALL,
            }),
        "assert" => AssertTarget::parse(target)
            .map(Kind::Assert)
            .ok_or_else(|| TaskConfigError::Assertion {
                target: target.to_string(),
                allowed: AssertTarget::ALL,
            }),
        "external-transform" => Ok(Kind::ExternalTransform(external_transform(target, options)?)),
        "named-adapter" if target.trim().is_empty() => Err(TaskConfigError::NamedAdapter),
        "named-adapter" => Ok(Kind::NamedAdapter(target.to_string())),
        // Unknown actions are rejected structurally before domain rules run.
        other => Err(TaskConfigError::Materialization {
            target: format!("{}/{}", other, target),
            allowed: &[],
        }),
    }
}

fn external_transform(target: &str, options: &Options) -> Result<ExternalTarget, ExternalTransformError> {
    let target = ExternalTarget::parse(target).ok_or_else(|| ExternalTransformError::Target {
        target: target.to_string(),
        allowed: ExternalTarget::ALL,
    })?;

    let version = options
        .get("version")
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ExternalTransformError::MissingVersion)?;
    check_version(version)?;

    if options
        .get("project")
        .and_then(Value::as_str)
        .is_none_or(|p| p.trim().is_empty())
    {
        return Err(ExternalTransformError::MissingProject);
    }

    match options.get("arguments") {
        None | Some(Value::Null) => {}
        Some(Value::Array(arguments)) => {
            for argument in arguments {
                let option = argument
                    .as_object()
                    .and_then(|arg| arg.get("option"))
                    .and_then(Value::as_str)
                    .ok_or(ExternalTransformError::MalformedArguments)?;
                if !ExternalArgument::ALLOWED_OPTIONS.contains(&option) {
                    return Err(ExternalTransformError::DisallowedArgument {
                        option: option.to_string(),
                        allowed: ExternalArgument::ALLOWED_OPTIONS,
                    });
                }
            }
        }
        Some(_) => return Err(ExternalTransformError::MalformedArguments),
    }

    Ok(target)
}

/// Check a `major.minor.patch` version against [`MINIMUM_EXTERNAL_VERSION`].
///
/// Majors compare numerically. Within the floor's major, `minor.patch` is
/// read as one decimal number, so `0.18.10` equals `0.18.1`.
pub fn check_version(version: &str) -> Result<(), ExternalTransformError> {
    let malformed = || ExternalTransformError::MalformedVersion(version.to_string());
    let (major, minor, patch) = split_version(version).ok_or_else(malformed)?;
    let (floor_major, floor_minor, floor_patch) =
        split_version(MINIMUM_EXTERNAL_VERSION).ok_or_else(malformed)?;

    let ordering = major
        .cmp(&floor_major)
        .then_with(|| decimal_cmp(minor, patch, floor_minor, floor_patch));

    if ordering == Ordering::Less {
        return Err(ExternalTransformError::VersionTooOld {
            version: version.to_string(),
            minimum: MINIMUM_EXTERNAL_VERSION,
        });
    }
    Ok(())
}

/// Split into numeric major and minor, keeping the patch digits as written.
fn split_version(version: &str) -> Option<(u64, u64, &str)> {
    let parts: Vec<&str> = version.trim().split('.').collect();
    let [major, minor, patch] = parts.as_slice() else {
        return None;
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(patch) {
        return None;
    }
    let parse = |s: &str| if digits(s) { u64::from_str(s).ok() } else { None };
    Some((parse(major)?, parse(minor)?, patch))
}

/// Compare `minor.patch` as decimals: integer part, then fractional digits.
fn decimal_cmp(minor: u64, patch: &str, floor_minor: u64, floor_patch: &str) -> Ordering {
    minor.cmp(&floor_minor).then_with(|| {
        let width = patch.len().max(floor_patch.len());
        let a = format!("{:0<width$}", patch, width = width);
        let b = format!("{:0<width$}", floor_patch, width = width);
        a.cmp(&b)
    })
}

/// Whether a schedule is a valid five- or six-field cron expression.
///
/// Five-field expressions run at second zero. Day-of-week numbers use the
/// classic `0-7` numbering (both 0 and 7 are Sunday).
pub fn is_valid_cron(expr: &str) -> bool {
    let expr = expr.trim();
    if CRON_PRESETS.contains(&expr) {
        return true;
    }

    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!("0 {} {}", fields[..4].join(" "), day_of_week_names(fields[4])),
        6 => format!("{} {}", fields[..5].join(" "), day_of_week_names(fields[5])),
        _ => return false,
    };

    cron::Schedule::from_str(&normalized).is_ok()
}

/// Rewrite numeric day-of-week values as names.
fn day_of_week_names(field: &str) -> String {
    const NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

    let map = |s: &str| -> String {
        match s.parse::<usize>() {
            Ok(n) if n < NAMES.len() => NAMES[n].to_string(),
            _ => s.to_string(),
        }
    };

    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = match range.split_once('-') {
                Some((from, to)) => format!("{}-{}", map(from), map(to)),
                None => map(range),
            };
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
