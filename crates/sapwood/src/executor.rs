//! Executor: runs a compiled pipeline's tasks.
//!
//! Scheduling, retries and concurrency across pipelines belong to an
//! external scheduler. The executors here run one pipeline at a time in
//! dependency order, which is enough for local runs, dry runs and tests.

use crate::adapter::{Adapter, AdapterError, AdapterOutput, Services, TaskContext};
use crate::compile::CompiledPipeline;
use crate::gate::{GateState, MutualExclusionGate, RunStateService};
use crate::registry::{DispatchError, Registry};
use crate::spec::Task;
use crate::value::{Options, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Parameters of one run, taken from its trigger configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunParams {
    pub full_refresh: bool,
    /// Remaining trigger keys, handed to templates and external tools.
    pub vars: Options,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunParamsError {
    #[error("full_refresh must be a boolean, got {0}")]
    FullRefreshNotBoolean(&'static str),
}

impl RunParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full_refresh(mut self, full_refresh: bool) -> Self {
        self.full_refresh = full_refresh;
        self
    }

    /// Read a trigger configuration. `full_refresh` defaults to false and
    /// must otherwise be a boolean.
    pub fn from_trigger_conf(conf: &Options) -> Result<Self, RunParamsError> {
        let full_refresh = match conf.get("full_refresh") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => return Err(RunParamsError::FullRefreshNotBoolean(other.type_name())),
        };

        let vars = conf
            .iter()
            .filter(|(key, _)| key.as_str() != "full_refresh")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self { full_refresh, vars })
    }
}

/// Context for executing pipelines.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Registry of available adapters.
    pub registry: Arc<Registry>,
    pub services: Services,
    pub run_state: Arc<dyn RunStateService>,
}

impl ExecutionContext {
    pub fn new(registry: Arc<Registry>, services: Services, run_state: Arc<dyn RunStateService>) -> Self {
        Self {
            registry,
            services,
            run_state,
        }
    }
}

/// How one task ended.
#[derive(Debug)]
pub enum TaskStatus {
    Succeeded(AdapterOutput),
    Failed(AdapterError),
    /// An earlier task failed or the gate skipped the run.
    NotRun,
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub task: String,
    pub adapter: String,
    pub status: TaskStatus,
    pub duration: Duration,
}

/// Result of running a pipeline.
#[derive(Debug)]
pub struct RunReport {
    pub pipeline: String,
    /// Gate decision, for pipelines that have a gate.
    pub gate: Option<GateState>,
    /// One outcome per task, in execution order.
    pub outcomes: Vec<TaskOutcome>,
    pub duration: Duration,
}

impl RunReport {
    pub fn skipped(&self) -> bool {
        self.gate == Some(GateState::Skip)
    }

    pub fn succeeded(&self) -> bool {
        !self.skipped()
            && self
                .outcomes
                .iter()
                .all(|o| matches!(o.status, TaskStatus::Succeeded(_)))
    }

    /// The failing task and its error.
    pub fn failure(&self) -> Option<(&str, &AdapterError)> {
        self.outcomes.iter().find_map(|o| match &o.status {
            TaskStatus::Failed(e) => Some((o.task.as_str(), e)),
            _ => None,
        })
    }
}

/// Errors that stop a pipeline before any task runs.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("cannot dispatch task `{task}`: {source}")]
    Dispatch {
        task: String,
        #[source]
        source: DispatchError,
    },
}

/// Executor determines HOW a pipeline runs.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        ctx: &ExecutionContext,
        pipeline: &CompiledPipeline,
        params: &RunParams,
    ) -> Result<RunReport, ExecuteError>;
}

/// Runs tasks one at a time in execution order, stopping at the first
/// failure.
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for SequentialExecutor {
    fn execute(
        &self,
        ctx: &ExecutionContext,
        pipeline: &CompiledPipeline,
        params: &RunParams,
    ) -> Result<RunReport, ExecuteError> {
        let start = Instant::now();
        let graph = &pipeline.graph;

        // Every task must dispatch before anything runs.
        let plan: Vec<(&Task, Arc<dyn Adapter>)> = graph
            .execution_order()
            .into_iter()
            .map(|task| {
                ctx.registry
                    .resolve(&task.kind)
                    .map(|adapter| (task, adapter))
                    .map_err(|source| ExecuteError::Dispatch {
                        task: task.identifier.clone(),
                        source,
                    })
            })
            .collect::<Result<_, _>>()?;

        let gate = graph.gate.as_ref().map(|gate_plan| {
            let mut gate = MutualExclusionGate::new(graph.id.clone(), gate_plan.projects.clone());
            gate.evaluate(ctx.run_state.as_ref())
        });

        if gate == Some(GateState::Skip) {
            info!(pipeline = %graph.id, "gate closed, run skipped");
            return Ok(RunReport {
                pipeline: graph.id.clone(),
                gate,
                outcomes: plan
                    .iter()
                    .map(|(task, adapter)| TaskOutcome {
                        task: task.identifier.clone(),
                        adapter: adapter.decl().id.clone(),
                        status: TaskStatus::NotRun,
                        duration: Duration::ZERO,
                    })
                    .collect(),
                duration: start.elapsed(),
            });
        }

        // A gate that let the run proceed has already marked it running.
        if gate.is_none() {
            ctx.run_state.mark_running(&graph.id);
        }
        info!(pipeline = %graph.id, tasks = plan.len(), "pipeline started");

        let mut outcomes = Vec::with_capacity(plan.len());
        let mut failed = false;
        for (task, adapter) in plan {
            let adapter_id = adapter.decl().id.clone();
            if failed {
                outcomes.push(TaskOutcome {
                    task: task.identifier.clone(),
                    adapter: adapter_id,
                    status: TaskStatus::NotRun,
                    duration: Duration::ZERO,
                });
                continue;
            }

            let task_ctx = TaskContext {
                pipeline_id: &graph.id,
                task,
                sql: pipeline.sql.get(&task.identifier).map(String::as_str),
                pipeline_params: &graph.config.params,
                params,
                services: &ctx.services,
            };

            info!(task = %task.identifier, adapter = %adapter_id, "running task");
            let task_start = Instant::now();
            let status = match adapter.execute(&task_ctx) {
                Ok(output) => TaskStatus::Succeeded(output),
                Err(e) => {
                    error!(task = %task.identifier, error = %e, "task failed");
                    failed = true;
                    TaskStatus::Failed(e)
                }
            };

            outcomes.push(TaskOutcome {
                task: task.identifier.clone(),
                adapter: adapter_id,
                status,
                duration: task_start.elapsed(),
            });
        }

        ctx.run_state.mark_finished(&graph.id);
        info!(pipeline = %graph.id, failed, "pipeline finished");

        Ok(RunReport {
            pipeline: graph.id.clone(),
            gate,
            outcomes,
            duration: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::OptionsExt;

    #[test]
    fn test_run_params_defaults() {
        let params = RunParams::from_trigger_conf(&Options::new()).unwrap();
        assert!(!params.full_refresh);
        assert!(params.vars.is_empty());
    }

    #[test]
    fn test_run_params_full_refresh() {
        let params = RunParams::from_trigger_conf(
            &Options::new()
                .with("full_refresh", true)
                .with("run_date", "2024-01-01"),
        )
        .unwrap();

        assert!(params.full_refresh);
        assert_eq!(params.vars.len(), 1);
        assert_eq!(params.vars.get("run_date").and_then(Value::as_str), Some("2024-01-01"));
    }

    #[test]
    fn test_run_params_rejects_non_boolean() {
        let err = RunParams::from_trigger_conf(&Options::new().with("full_refresh", "yes")).unwrap_err();
        assert_eq!(err, RunParamsError::FullRefreshNotBoolean("string"));
    }
}
