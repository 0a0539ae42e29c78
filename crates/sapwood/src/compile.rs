//! Compilation: pipeline document → validated, assembled pipeline.

use crate::gate::RunStateService;
use crate::graph::{Assembler, AssemblyError, PipelineGraph};
use crate::spec::error::InvalidPipelineConfig;
use crate::spec::loader::{LoadError, PipelineLoader, PipelineSource, read_sql};
use crate::spec::validator::SpecValidator;
use crate::value::Value;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("pipeline `{pipeline}`: {source}")]
    Invalid {
        pipeline: String,
        #[source]
        source: InvalidPipelineConfig,
    },

    #[error("pipeline `{pipeline}`: {source}")]
    Assembly {
        pipeline: String,
        #[source]
        source: AssemblyError,
    },
}

/// A pipeline ready to run: its graph and the SQL bodies of its tasks.
#[derive(Debug, Clone)]
pub struct CompiledPipeline {
    pub graph: PipelineGraph,
    /// Task identifier → SQL body.
    pub sql: IndexMap<String, String>,
    /// Directory the pipeline was loaded from.
    pub dir: Option<PathBuf>,
}

impl CompiledPipeline {
    pub fn id(&self) -> &str {
        &self.graph.id
    }
}

/// Result of compiling every pipeline in a directory.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub compiled: Vec<CompiledPipeline>,
    /// Pipelines that failed, by id. One failure never hides the others.
    pub failures: Vec<(String, CompileError)>,
    /// Ids of disabled pipelines.
    pub disabled: Vec<String>,
}

impl BuildOutcome {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Compiles pipeline documents.
#[derive(Clone, Default)]
pub struct Compiler {
    validator: SpecValidator,
    run_state: Option<Arc<dyn RunStateService>>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database for documents that do not name one.
    pub fn default_database(mut self, database: impl Into<String>) -> Self {
        self.validator = self.validator.default_database(database);
        self
    }

    /// Schema for documents that do not name one.
    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.validator = self.validator.default_schema(schema);
        self
    }

    /// Register compiled pipelines with a run-state service.
    pub fn run_state(mut self, run_state: Arc<dyn RunStateService>) -> Self {
        self.run_state = Some(run_state);
        self
    }

    /// Validate and assemble one document.
    ///
    /// Either every check passes and a complete graph is returned, or
    /// nothing is built.
    pub fn compile(&self, id: &str, document: &Value) -> Result<PipelineGraph, CompileError> {
        let config = self
            .validator
            .validate(document)
            .map_err(|source| CompileError::Invalid {
                pipeline: id.to_string(),
                source,
            })?;

        let graph = Assembler
            .assemble(id, config)
            .map_err(|source| CompileError::Assembly {
                pipeline: id.to_string(),
                source,
            })?;

        if let (Some(run_state), Some(gate)) = (&self.run_state, &graph.gate) {
            for project in &gate.projects {
                run_state.register(project, &graph.id);
            }
        }

        Ok(graph)
    }

    /// Compile a loaded source, reading its task SQL.
    pub fn compile_source(&self, source: &PipelineSource) -> Result<CompiledPipeline, CompileError> {
        let graph = self.compile(&source.id, &source.document)?;
        let tasks: Vec<_> = graph.tasks.values().cloned().collect();
        let sql = read_sql(&source.dir, &tasks)?;

        Ok(CompiledPipeline {
            graph,
            sql,
            dir: Some(source.dir.clone()),
        })
    }

    /// Compile every pipeline below the loader's root.
    ///
    /// Fails only if the root itself cannot be read.
    pub fn build_all(&self, loader: &PipelineLoader) -> Result<BuildOutcome, LoadError> {
        let mut outcome = BuildOutcome::default();

        for dir in loader.discover()? {
            let id = loader.pipeline_id(&dir);
            let compiled = loader
                .load_dir(&dir)
                .map_err(CompileError::from)
                .and_then(|source| self.compile_source(&source));

            match compiled {
                Ok(pipeline) if !pipeline.graph.config.enabled => {
                    info!(pipeline = %id, "pipeline disabled, skipping");
                    outcome.disabled.push(id);
                }
                Ok(pipeline) => {
                    info!(pipeline = %id, tasks = pipeline.graph.tasks.len(), "pipeline compiled");
                    outcome.compiled.push(pipeline);
                }
                Err(e) => {
                    warn!(pipeline = %id, error = %e, "pipeline failed to compile");
                    outcome.failures.push((id, e));
                }
            }
        }

        Ok(outcome)
    }
}

/// Validate and assemble one document with no loader defaults.
pub fn compile(id: &str, document: &Value) -> Result<PipelineGraph, CompileError> {
    Compiler::new().compile(id, document)
}
