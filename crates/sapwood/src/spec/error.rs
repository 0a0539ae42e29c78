//! Validation errors for pipeline documents.

/// A pipeline document failed validation.
///
/// Carries every problem found in the document, never just the first.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid pipeline config:{}", list_issues(.issues))]
pub struct InvalidPipelineConfig {
    pub issues: Vec<ConfigIssue>,
}

fn list_issues(issues: &[ConfigIssue]) -> String {
    issues.iter().map(|issue| format!("\n  - {}", issue)).collect()
}

/// One problem in a pipeline document.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigIssue {
    /// A structural problem at a field path such as `tasks[0].kind.action`.
    #[error("{path}: {message}")]
    Field { path: String, message: String },
    /// A domain rule of the task's kind was violated.
    #[error("task `{task}`: {error}")]
    Task {
        task: String,
        error: TaskConfigError,
    },
}

/// Kind-specific validation failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskConfigError {
    #[error("materialize task.kind.target must be one of {allowed:?}, `{target}` supplied")]
    Materialization {
        target: String,
        allowed: &'static [&'static str],
    },

    #[error("invoke task.kind.target must be one of {allowed:?}, `{target}` supplied")]
    Invocation {
        target: String,
        allowed: &'static [&'static str],
    },

    #[error("assert task.kind.target must be one of {allowed:?}, `{target}` supplied")]
    Assertion {
        target: String,
        allowed: &'static [&'static str],
    },

    #[error("named-adapter task.kind.target must name an adapter")]
    NamedAdapter,

    #[error(transparent)]
    ExternalTransform(#[from] ExternalTransformError),
}

/// Failures specific to external-transform tasks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExternalTransformError {
    #[error("external-transform task.kind.target must be one of {allowed:?}, `{target}` supplied")]
    Target {
        target: String,
        allowed: &'static [&'static str],
    },

    #[error("external-transform version must be supplied in options.version")]
    MissingVersion,

    #[error("external-transform version `{0}` is not of the form major.minor.patch")]
    MalformedVersion(String),

    #[error("external-transform version must be >= {minimum}, `{version}` supplied")]
    VersionTooOld {
        version: String,
        minimum: &'static str,
    },

    #[error("external-transform project must be supplied in options.project")]
    MissingProject,

    #[error("external-transform arguments must be a list of {{option, value}} entries")]
    MalformedArguments,

    #[error("supported command line argument options are {allowed:?}, `{option}` supplied")]
    DisallowedArgument {
        option: String,
        allowed: &'static [&'static str],
    },
}

impl InvalidPipelineConfig {
    pub fn new(issues: Vec<ConfigIssue>) -> Self {
        Self { issues }
    }

    /// Messages recorded against a field path.
    pub fn field(&self, path: &str) -> Vec<&str> {
        self.issues
            .iter()
            .filter_map(|issue| match issue {
                ConfigIssue::Field { path: p, message } if p == path => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether any field error was recorded under `path`.
    pub fn has_field(&self, path: &str) -> bool {
        !self.field(path).is_empty()
    }

    /// Domain errors, with the task they were raised for.
    pub fn task_errors(&self) -> impl Iterator<Item = (&str, &TaskConfigError)> {
        self.issues.iter().filter_map(|issue| match issue {
            ConfigIssue::Task { task, error } => Some((task.as_str(), error)),
            ConfigIssue::Field { .. } => None,
        })
    }
}
