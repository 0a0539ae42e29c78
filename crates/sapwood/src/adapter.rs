//! Adapter declarations and traits.

use crate::executor::RunParams;
use crate::materialize::{MaterializeError, QueryRunner};
use crate::relation::{Relation, RelationValueError};
use crate::spec::Task;
use crate::template::{TemplateError, TemplateRenderer};
use crate::value::{Options, OptionsExt};
use crate::warehouse::WarehouseClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What a registered unit of work is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterRole {
    /// Runs a task to completion.
    #[default]
    Task,
    /// Waits for a condition, then completes.
    Sensor,
    /// Reacts to run events; cannot execute a task.
    Hook,
}

/// Declaration of an adapter's interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterDecl {
    /// Unique identifier for this adapter.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role: AdapterRole,
}

impl AdapterDecl {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            role: AdapterRole::Task,
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn role(mut self, role: AdapterRole) -> Self {
        self.role = role;
        self
    }

    /// Whether the adapter can execute a task.
    pub fn runs_tasks(&self) -> bool {
        self.role != AdapterRole::Hook
    }
}

/// Capabilities handed to adapters.
#[derive(Clone)]
pub struct Services {
    pub warehouse: Arc<dyn WarehouseClient>,
    pub templates: Arc<dyn TemplateRenderer>,
    pub dry_run: bool,
}

impl Services {
    pub fn new(warehouse: Arc<dyn WarehouseClient>, templates: Arc<dyn TemplateRenderer>) -> Self {
        Self {
            warehouse,
            templates,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn query_runner(&self) -> QueryRunner {
        QueryRunner::new(self.warehouse.clone(), self.templates.clone()).dry_run(self.dry_run)
    }
}

/// Everything an adapter sees of the task it runs.
pub struct TaskContext<'a> {
    pub pipeline_id: &'a str,
    pub task: &'a Task,
    /// Body of `sql/<identifier>.sql`, for tasks that have one.
    pub sql: Option<&'a str>,
    /// Pipeline `params`.
    pub pipeline_params: &'a Options,
    pub params: &'a RunParams,
    pub services: &'a Services,
}

impl TaskContext<'_> {
    pub fn relation(&self) -> Result<Relation, RelationValueError> {
        Relation::from_task(self.task)
    }

    /// The task body, rendered against [`template_vars`](Self::template_vars).
    pub fn sql(&self) -> Result<String, AdapterError> {
        let body = self
            .sql
            .ok_or_else(|| AdapterError::MissingSql(self.task.identifier.clone()))?;
        let sql = self
            .services
            .templates
            .render_body(body, &self.template_vars())?;
        debug!(task = %self.task.identifier, sql = %sql, "rendered task body");
        Ok(sql)
    }

    /// Variables visible to task bodies: every trigger var at the top level,
    /// then `params`, `task`, `full_refresh` and `is_incremental`.
    pub fn template_vars(&self) -> Options {
        let task = Options::new()
            .with("identifier", self.task.identifier.as_str())
            .with("database", self.task.database.as_str())
            .with("schema", self.task.schema.as_str());

        let mut vars = self.params.vars.clone();
        vars.insert("params".into(), self.pipeline_params.clone().into());
        vars.insert("task".into(), task.into());
        vars.insert("full_refresh".into(), self.params.full_refresh.into());
        vars.insert("is_incremental".into(), (!self.params.full_refresh).into());
        vars
    }
}

/// Result of running an adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutput {
    Completed,
    /// Completed, with output captured from an external command.
    Captured(String),
}

/// Trait for implementing adapters.
///
/// Adapters execute one task; they are stateless between calls.
pub trait Adapter: Send + Sync {
    /// Get the declaration for this adapter.
    fn decl(&self) -> &AdapterDecl;

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AdapterOutput, AdapterError>;
}

/// Errors that can occur while running a task.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error(transparent)]
    Relation(#[from] RelationValueError),

    #[error("task `{0}` has no SQL body")]
    MissingSql(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("external command failed: {0}")]
    External(String),

    #[error("gave up waiting after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}
