//! Sapwood: declarative warehouse pipelines.
//!
//! Sapwood compiles a pipeline document (named tasks, what each one
//! materializes, and how they depend on each other) into a dependency graph,
//! and runs warehouse tasks through a stage-then-merge protocol that never
//! exposes a half-written table.

mod adapter;
mod compile;
mod executor;
mod gate;
mod graph;
mod materialize;
mod registry;
mod relation;
pub mod spec;
mod template;
mod value;
mod warehouse;

pub use adapter::{
    Adapter, AdapterDecl, AdapterError, AdapterOutput, AdapterRole, Services, TaskContext,
};
pub use compile::{BuildOutcome, CompileError, CompiledPipeline, Compiler, compile};
pub use executor::{
    ExecuteError, ExecutionContext, Executor, RunParams, RunParamsError, RunReport,
    SequentialExecutor, TaskOutcome, TaskStatus,
};
pub use gate::{GateState, InMemoryRunState, MutualExclusionGate, RunStateService};
pub use graph::{Assembler, AssemblyError, Edge, GatePlan, PipelineGraph};
pub use materialize::{
    AssertionReport, AssertionResult, MaterializeError, PartitionColumn, PartitionConfig,
    PartitionConfigError, PartitionRange, QueryRunner, RelationHelper, STAGING_EXPIRATION_HOURS,
    STAGING_PREFIX, normalize_query,
};
pub use registry::{
    ASSERTION_SENSOR, CALL_STORED_PROCEDURE, CREATE_SCHEMA, DispatchError, EXTERNAL_LOCAL_PROCESS,
    EXTERNAL_REMOTE_POD, ExternalMode, RECREATE_STORED_PROCEDURE, RECREATE_UDF, RECREATE_VIEW,
    REPLACE_OR_UPSERT, RUN_ASSERTION, Registry, builtin_adapter_id,
};
pub use relation::{Relation, RelationValueError};
pub use spec::error::{ConfigIssue, ExternalTransformError, InvalidPipelineConfig, TaskConfigError};
pub use spec::loader::{DocumentFormat, LoadError, PipelineLoader, PipelineSource, load_document};
pub use spec::validator::{MINIMUM_EXTERNAL_VERSION, SpecValidator, validate};
pub use spec::{
    AssertTarget, ExternalArgument, ExternalTarget, InvokeTarget, Kind, MaterializeTarget,
    PartitionDataType, Partitioning, PipelineConfig, Task,
};
pub use template::{
    SqlTemplates, TABLE_CREATE_OR_REPLACE, TABLE_UPSERT, TemplateError, TemplateRenderer,
};
pub use value::{Options, OptionsExt, Value};
pub use warehouse::{
    Call, JobConfig, JobResult, QueryJob, RecordingWarehouse, Row, WarehouseClient,
    WarehouseError, WriteDisposition,
};
