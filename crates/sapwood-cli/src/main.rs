//! Sapwood CLI - declarative warehouse pipelines

mod config;
mod logging;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use config::Config;
use sapwood::{
    Call, CompiledPipeline, Compiler, DocumentFormat, ExecutionContext, Executor, InMemoryRunState,
    Options, PipelineLoader, RecordingWarehouse, Registry, RunParams, SequentialExecutor, Services,
    SqlTemplates, TaskStatus, Value, load_document,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sapwood")]
#[command(about = "Declarative warehouse pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log more
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log errors only
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered adapters
    List,

    /// Validate one pipeline (directory or config file)
    Validate {
        /// Pipeline directory or its config file
        pipeline: PathBuf,
    },

    /// Compile every pipeline in the pipelines directory
    Compile {
        /// Pipelines directory (overrides the configured path)
        #[arg(long)]
        pipelines: Option<PathBuf>,
    },

    /// Show a pipeline's execution order, edges and gate
    Plan {
        /// Pipeline directory or its config file
        pipeline: PathBuf,
        /// Print the assembled graph as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a pipeline against a recording warehouse, printing every statement
    DryRun {
        /// Pipeline directory or its config file
        pipeline: PathBuf,
        /// Rebuild tables from scratch
        #[arg(long)]
        full_refresh: bool,
        /// Trigger configuration as a JSON object
        #[arg(long)]
        conf: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load();

    logging::init(logging::level(
        cli.verbose || config.defaults.verbose,
        cli.quiet || config.defaults.quiet,
        config.log_level(),
    ));

    let mut registry = Registry::new();
    sapwood_adapters::register_all_with(&mut registry, &config.external_settings());
    tracing::debug!(
        adapters = registry.len(),
        external_mode = ?registry.external_mode(),
        "registry ready"
    );

    match cli.command {
        Commands::List => cmd_list(&registry),
        Commands::Validate { pipeline } => cmd_validate(&config, &pipeline),
        Commands::Compile { pipelines } => cmd_compile(&config, pipelines),
        Commands::Plan { pipeline, json } => cmd_plan(&config, &registry, &pipeline, json),
        Commands::DryRun {
            pipeline,
            full_refresh,
            conf,
        } => cmd_dry_run(&config, registry, &pipeline, full_refresh, conf.as_deref()),
    }
}

fn compiler(config: &Config) -> Compiler {
    match &config.warehouse.database {
        Some(database) => Compiler::new().default_database(database.clone()),
        None => Compiler::new(),
    }
}

fn loader(config: &Config, root: &Path) -> PipelineLoader {
    let loader = PipelineLoader::new(root);
    match &config.pipelines.id_prefix {
        Some(prefix) => loader.id_prefix(prefix.clone()),
        None => loader,
    }
}

/// Load and compile the pipeline at `path`.
fn load_pipeline(config: &Config, path: &Path) -> Result<CompiledPipeline> {
    let dir = if path.is_file() { parent(path) } else { path };
    let root = parent(dir);
    let source = loader(config, root)
        .load_dir(dir)
        .with_context(|| format!("Failed to load pipeline {}", dir.display()))?;

    Ok(compiler(config).compile_source(&source)?)
}

fn parent(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

fn cmd_list(registry: &Registry) -> Result<()> {
    println!("Available adapters:\n");

    for decl in registry.declarations() {
        println!("  {} ({:?})", decl.id, decl.role);
        if !decl.description.is_empty() {
            println!("    {}", decl.description);
        }
    }

    let names: Vec<_> = registry.names().collect();
    if !names.is_empty() {
        println!("\nNamed adapters:\n");
        for (name, id) in names {
            println!("  {} -> {}", name, id);
        }
    }

    println!("\nTotal: {} adapters", registry.len());
    Ok(())
}

fn cmd_validate(config: &Config, path: &Path) -> Result<()> {
    let pipeline = load_pipeline(config, path)?;
    let graph = &pipeline.graph;

    println!(
        "{}: valid ({} tasks, {} edges{})",
        graph.id,
        graph.tasks.len(),
        graph.edges.len(),
        if graph.config.enabled { "" } else { ", disabled" }
    );
    Ok(())
}

fn cmd_compile(config: &Config, pipelines: Option<PathBuf>) -> Result<()> {
    let root = pipelines.unwrap_or_else(|| config.pipelines_path());
    let outcome = compiler(config)
        .build_all(&loader(config, &root))
        .with_context(|| format!("Failed to read pipelines directory {}", root.display()))?;

    for pipeline in &outcome.compiled {
        println!("ok       {} ({} tasks)", pipeline.id(), pipeline.graph.tasks.len());
    }
    for id in &outcome.disabled {
        println!("disabled {}", id);
    }
    for (id, error) in &outcome.failures {
        println!("failed   {}", id);
        println!("  {}", error.to_string().replace('\n', "\n  "));
    }

    if !outcome.is_ok() {
        let total = outcome.failures.len() + outcome.compiled.len() + outcome.disabled.len();
        bail!("{} of {} pipelines failed to compile", outcome.failures.len(), total);
    }
    Ok(())
}

fn cmd_plan(config: &Config, registry: &Registry, path: &Path, json: bool) -> Result<()> {
    let pipeline = load_pipeline(config, path)?;
    let graph = &pipeline.graph;

    if json {
        println!("{}", serde_json::to_string_pretty(graph)?);
        return Ok(());
    }

    println!("Pipeline: {}", graph.id);
    if let Some(schedule) = &graph.config.schedule {
        println!("Schedule: {} ({})", schedule, graph.config.timezone);
    }
    println!();

    if let Some(gate) = &graph.gate {
        let projects: Vec<_> = gate.projects.iter().map(String::as_str).collect();
        println!("Gate: one run at a time per project [{}]", projects.join(", "));
        println!("  precedes: {}", gate.downstream.join(", "));
        println!();
    }

    println!("Steps:");
    for (i, task) in graph.execution_order().into_iter().enumerate() {
        let adapter = registry
            .adapter_id(&task.kind)
            .unwrap_or_else(|| "(unresolved)".to_string());
        println!("  {}. {} [{}] via {}", i + 1, task.identifier, task.kind, adapter);
        let upstream = graph.upstream_of(&task.identifier);
        if !upstream.is_empty() {
            println!("     after: {}", upstream.join(", "));
        }
    }

    Ok(())
}

/// Parse `--conf` into trigger options.
fn trigger_conf(conf: Option<&str>) -> Result<Options> {
    let Some(conf) = conf else {
        return Ok(Options::new());
    };
    match load_document(conf.as_bytes(), DocumentFormat::Json).context("Invalid --conf")? {
        Value::Object(options) => Ok(options),
        other => bail!("--conf must be a JSON object, got {}", other.type_name()),
    }
}

fn cmd_dry_run(
    config: &Config,
    registry: Registry,
    path: &Path,
    full_refresh: bool,
    conf: Option<&str>,
) -> Result<()> {
    let pipeline = load_pipeline(config, path)?;

    let mut params = RunParams::from_trigger_conf(&trigger_conf(conf)?)?;
    if full_refresh {
        params.full_refresh = true;
    }

    let warehouse = Arc::new(RecordingWarehouse::new());
    let ctx = ExecutionContext::new(
        Arc::new(registry),
        Services::new(warehouse.clone(), Arc::new(SqlTemplates::new())).dry_run(true),
        Arc::new(InMemoryRunState::new()),
    );

    let report = SequentialExecutor::new().execute(&ctx, &pipeline, &params)?;

    for call in warehouse.calls() {
        let mode = if call.is_dry_run() { "dry-run" } else { "metadata" };
        match call {
            Call::Query { sql, .. } => println!("-- {}\n{}\n", mode, sql.trim()),
            Call::DeleteTable { relation, .. } => println!("-- {} delete {}\n", mode, relation),
            Call::CreateView { relation, sql, .. } => {
                println!("-- {} create view {}\n{}\n", mode, relation, sql.trim())
            }
            Call::CreateDataset {
                database, schema, ..
            } => println!("-- {} create schema {}.{}\n", mode, database, schema),
        }
    }

    for outcome in &report.outcomes {
        let status = match &outcome.status {
            TaskStatus::Succeeded(_) => "ok".to_string(),
            TaskStatus::Failed(e) => format!("failed: {}", e),
            TaskStatus::NotRun => "not run".to_string(),
        };
        println!("{} ({}): {}", outcome.task, outcome.adapter, status);
    }

    if let Some((task, error)) = report.failure() {
        bail!("task `{}` failed: {}", task, error);
    }
    Ok(())
}
