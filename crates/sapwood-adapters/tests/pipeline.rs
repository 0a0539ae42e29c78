//! End-to-end runs of compiled pipelines through the builtin adapters.

use sapwood::{
    AdapterError, AdapterOutput, Call, CompiledPipeline, DocumentFormat, EXTERNAL_LOCAL_PROCESS,
    ExecutionContext, Executor, ExternalMode, InMemoryRunState, MaterializeError,
    Options, OptionsExt, RecordingWarehouse, Registry, RunParams, SequentialExecutor, Services,
    SqlTemplates, TaskStatus, compile, load_document,
};
use sapwood_adapters::{
    ExternalError, ExternalInvocation, ExternalRunner, ExternalTransformAdapter, register_all,
};
use std::sync::{Arc, Mutex};

fn pipeline(id: &str, yaml: &str, sql: &[(&str, &str)]) -> CompiledPipeline {
    let document = load_document(yaml.as_bytes(), DocumentFormat::Yaml).unwrap();
    CompiledPipeline {
        graph: compile(id, &document).unwrap(),
        sql: sql
            .iter()
            .map(|(task, body)| (task.to_string(), body.to_string()))
            .collect(),
        dir: None,
    }
}

fn context(registry: Registry, warehouse: Arc<RecordingWarehouse>) -> ExecutionContext {
    ExecutionContext::new(
        Arc::new(registry),
        Services::new(warehouse, Arc::new(SqlTemplates::new())),
        Arc::new(InMemoryRunState::new()),
    )
}

fn builtin_registry() -> Registry {
    let mut registry = Registry::new();
    register_all(&mut registry, ExternalMode::LocalProcess);
    registry
}

#[test]
fn test_table_then_assertion() {
    let pipeline = pipeline(
        "sapwood__orders",
        r#"
timezone: UTC
database: proj
schema: mart
tasks:
  - identifier: A
    kind: {action: materialize, target: table}
  - identifier: B
    kind: {action: assert, target: assertion}
    dependencies: [A]
"#,
        &[
            ("A", "SELECT 1 AS id;"),
            ("B", "SELECT COUNT(*) > 0 AS success FROM `proj.mart.A`"),
        ],
    );

    assert_eq!(pipeline.graph.edges.len(), 1);
    assert_eq!(pipeline.graph.edges[0].upstream, "A");
    assert_eq!(pipeline.graph.edges[0].downstream, "B");

    let registry = builtin_registry();
    for task in pipeline.graph.tasks.values() {
        assert!(registry.resolve(&task.kind).is_ok());
    }

    let warehouse = Arc::new(
        RecordingWarehouse::new().respond("AS success", vec![Options::new().with("success", true)]),
    );
    let report = SequentialExecutor::new()
        .execute(&context(registry, warehouse.clone()), &pipeline, &RunParams::new())
        .unwrap();

    assert!(report.succeeded());
    let queries = warehouse.queries();
    let create = queries
        .iter()
        .position(|q| q.starts_with("CREATE OR REPLACE TABLE `proj.mart.A`"))
        .unwrap();
    let assertion = queries.iter().position(|q| q.contains("AS success")).unwrap();
    assert!(create < assertion);
}

#[test]
fn test_assertion_reports_one_aggregated_failure() {
    let pipeline = pipeline(
        "sapwood__checks",
        r#"
timezone: UTC
database: proj
schema: mart
tasks:
  - {identifier: checks, kind: {action: assert, target: assertion}}
  - {identifier: after, kind: {action: invoke, target: stored_procedure}, dependencies: [checks]}
"#,
        &[
            ("checks", "SELECT * FROM checks_view"),
            ("after", "CALL `proj.mart.cleanup`()"),
        ],
    );

    let rows = vec![
        Options::new().with("success", true).with("description", "not empty"),
        Options::new().with("success", false).with("description", "no duplicates"),
        Options::new().with("success", true).with("description", "fresh"),
    ];
    let warehouse = Arc::new(RecordingWarehouse::new().respond("checks_view", rows));

    let report = SequentialExecutor::new()
        .execute(&context(builtin_registry(), warehouse.clone()), &pipeline, &RunParams::new())
        .unwrap();

    assert!(!report.succeeded());
    let (task, error) = report.failure().unwrap();
    assert_eq!(task, "checks");
    assert!(matches!(
        error,
        AdapterError::Materialize(MaterializeError::AssertionFailed { failed: 1, total: 3 })
    ));

    let failures = report
        .outcomes
        .iter()
        .filter(|o| matches!(o.status, TaskStatus::Failed(_)))
        .count();
    assert_eq!(failures, 1);
    assert!(matches!(report.outcomes[1].status, TaskStatus::NotRun));
    assert!(!warehouse.queries().iter().any(|q| q.contains("cleanup")));
}

#[test]
fn test_dry_run_reaches_the_client() {
    let pipeline = pipeline(
        "sapwood__views",
        r#"
timezone: UTC
database: proj
schema: mart
tasks:
  - {identifier: mart, kind: {action: materialize, target: schema}}
  - {identifier: v, kind: {action: materialize, target: view}, dependencies: [mart]}
  - {identifier: t, kind: {action: materialize, target: table}, dependencies: [mart]}
"#,
        &[("v", "SELECT 1"), ("t", "SELECT 2")],
    );

    let warehouse = Arc::new(RecordingWarehouse::new());
    let ctx = ExecutionContext::new(
        Arc::new(builtin_registry()),
        Services::new(warehouse.clone(), Arc::new(SqlTemplates::new())).dry_run(true),
        Arc::new(InMemoryRunState::new()),
    );

    let report = SequentialExecutor::new()
        .execute(&ctx, &pipeline, &RunParams::new())
        .unwrap();

    assert!(report.succeeded());
    let calls = warehouse.calls();
    for call in &calls {
        match call {
            Call::Query { sql, config } if sql.contains("INFORMATION_SCHEMA") => {
                assert!(!config.dry_run, "{}", sql);
            }
            other => assert!(other.is_dry_run(), "{:?}", other),
        }
    }
    assert!(calls.iter().any(|c| matches!(c, Call::CreateDataset { schema, .. } if schema == "mart")));
    assert!(calls.iter().any(|c| matches!(c, Call::DeleteTable { .. })));
    assert!(calls.iter().any(|c| matches!(c, Call::CreateView { sql, .. } if sql == "SELECT 1")));
    assert!(calls.iter().any(|c| matches!(
        c,
        Call::Query { sql, .. } if sql.starts_with("CREATE OR REPLACE TABLE `proj.mart.t`")
    )));
}

#[test]
fn test_task_bodies_rendered_before_submission() {
    let pipeline = pipeline(
        "sapwood__events",
        r#"
timezone: UTC
database: proj
schema: mart
params: {source_project: raw}
tasks:
  - identifier: A
    kind: {action: materialize, target: table}
"#,
        &[("A", "SELECT * FROM `{{ params.source_project }}.events` WHERE ds = '{{ run_date }}'")],
    );

    let warehouse = Arc::new(RecordingWarehouse::new());
    let params = RunParams::from_trigger_conf(&Options::new().with("run_date", "2024-01-01")).unwrap();
    let report = SequentialExecutor::new()
        .execute(&context(builtin_registry(), warehouse.clone()), &pipeline, &params)
        .unwrap();

    assert!(report.succeeded());
    let create = warehouse
        .queries()
        .into_iter()
        .find(|q| q.starts_with("CREATE OR REPLACE TABLE `proj.mart.A`"))
        .unwrap();
    assert_eq!(
        create,
        "CREATE OR REPLACE TABLE `proj.mart.A`\nAS (\nSELECT * FROM `raw.events` WHERE ds = '2024-01-01'\n)"
    );
}

#[derive(Default)]
struct CapturingRunner {
    invocations: Mutex<Vec<ExternalInvocation>>,
}

impl ExternalRunner for CapturingRunner {
    fn run(&self, _task_id: &str, invocation: &ExternalInvocation) -> Result<String, ExternalError> {
        self.invocations.lock().unwrap().push(invocation.clone());
        Ok("Completed successfully".into())
    }
}

#[test]
fn test_external_transform_invocation() {
    let pipeline = pipeline(
        "sapwood__dbt",
        r#"
timezone: UTC
database: proj
schema: mart
params: {region: eu}
tasks:
  - identifier: dbt_run
    kind: {action: external-transform, target: run}
    options:
      project: analytics
      version: "0.19.0"
      arguments:
        - {option: -m, value: orders}
"#,
        &[],
    );

    let runner = Arc::new(CapturingRunner::default());
    let mut registry = builtin_registry();
    registry.register(ExternalTransformAdapter::new(EXTERNAL_LOCAL_PROCESS, runner.clone()));

    let params = RunParams::from_trigger_conf(
        &Options::new()
            .with("full_refresh", true)
            .with("run_date", "2024-01-01"),
    )
    .unwrap();
    let report = SequentialExecutor::new()
        .execute(
            &context(registry, Arc::new(RecordingWarehouse::new())),
            &pipeline,
            &params,
        )
        .unwrap();

    assert!(report.gate.is_some());
    assert!(matches!(
        report.outcomes[0].status,
        TaskStatus::Succeeded(AdapterOutput::Captured(ref out)) if out == "Completed successfully"
    ));

    let invocations = runner.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].version.as_deref(), Some("0.19.0"));
    assert_eq!(invocations[0].versioned("dbt-{version}"), "dbt-0.19.0");
    let args = invocations[0].args(std::path::Path::new("/srv/projects"));
    assert_eq!(
        args,
        vec![
            "--no-use-colors",
            "run",
            "--project-dir",
            "/srv/projects/analytics",
            "--vars",
            r#"{"region":"eu","run_date":"2024-01-01"}"#,
            "-m",
            "orders",
            "--full-refresh",
        ]
    );
}
