//! Integration tests for the sapwood CLI.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn sapwood(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sapwood"))
        .args(args)
        .env("SAPWOOD_CONFIG", "/nonexistent/sapwood/config.toml")
        .env_remove("SAPWOOD_DATABASE")
        .env_remove("SAPWOOD_LOCATION")
        .env_remove("SAPWOOD_PIPELINES_PATH")
        .env_remove("SAPWOOD_SANDBOX_ENVIRONMENT")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run sapwood")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

const ORDERS: &str = r#"
timezone: Europe/London
schedule: "0 3 * * *"
database: proj
schema: mart
tasks:
  - identifier: stg_orders
    kind: {action: materialize, target: view}
  - identifier: orders_daily
    kind: {action: materialize, target: table}
    partitioning: {field: created_at, data_type: timestamp}
    dependencies: [stg_orders]
  - identifier: orders_checks
    kind: {action: assert, target: assertion}
    dependencies: [orders_daily]
"#;

fn write_pipeline(root: &Path, name: &str, config: &str, sql: &[(&str, &str)]) {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("sql")).unwrap();
    fs::write(dir.join("config.yaml"), config).unwrap();
    for (task, body) in sql {
        fs::write(dir.join("sql").join(format!("{}.sql", task)), body).unwrap();
    }
}

fn orders(root: &Path) {
    write_pipeline(
        root,
        "orders",
        ORDERS,
        &[
            ("stg_orders", "SELECT * FROM raw.orders WHERE ds <= '{{ run_date }}'"),
            ("orders_daily", "SELECT id, created_at FROM `proj.mart.stg_orders`;"),
            ("orders_checks", "SELECT COUNT(*) > 0 AS success FROM `proj.mart.orders_daily`"),
        ],
    );
}

#[test]
fn test_help() {
    let output = sapwood(&["--help"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("Declarative warehouse pipelines"));
    assert!(out.contains("dry-run"));
}

#[test]
fn test_list() {
    let output = sapwood(&["list"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("materialize.replace-or-upsert"));
    assert!(out.contains("assert.assertion-sensor (Sensor)"));
    assert!(out.contains("Total: 10 adapters"));
}

#[test]
fn test_validate() {
    let root = TempDir::new().unwrap();
    orders(root.path());

    let output = sapwood(&["validate", root.path().join("orders").to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("sapwood__orders: valid (3 tasks, 2 edges)"));
}

#[test]
fn test_validate_reports_every_issue() {
    let root = TempDir::new().unwrap();
    write_pipeline(
        root.path(),
        "bad",
        r#"
schema: mart
tasks:
  - {identifier: x, kind: {action: explode}}
"#,
        &[],
    );

    let output = sapwood(&["validate", root.path().join("bad/config.yaml").to_str().unwrap()]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("timezone"), "{}", err);
    assert!(err.contains("database"), "{}", err);
    assert!(err.contains("tasks[0].kind.action"), "{}", err);
}

#[test]
fn test_compile_lists_failures() {
    let root = TempDir::new().unwrap();
    orders(root.path());
    write_pipeline(root.path(), "broken", "timezone: UTC\n", &[]);

    let output = sapwood(&["compile", "--pipelines", root.path().to_str().unwrap()]);
    assert!(!output.status.success());
    let out = stdout(&output);
    assert!(out.contains("ok       sapwood__orders (3 tasks)"));
    assert!(out.contains("failed   sapwood__broken"));
    assert!(stderr(&output).contains("1 of 2 pipelines failed to compile"));
}

#[test]
fn test_plan() {
    let root = TempDir::new().unwrap();
    orders(root.path());

    let output = sapwood(&["plan", root.path().join("orders").to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Schedule: 0 3 * * * (Europe/London)"));
    assert!(out.contains("1. stg_orders [materialize/view] via materialize.recreate-view"));
    assert!(out.contains("2. orders_daily [materialize/table] via materialize.replace-or-upsert"));
    assert!(out.contains("after: orders_daily"));
}

#[test]
fn test_plan_json() {
    let root = TempDir::new().unwrap();
    orders(root.path());

    let output = sapwood(&["plan", "--json", root.path().join("orders").to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("\"upstream\": \"stg_orders\""));
    assert!(out.contains("\"downstream\": \"orders_daily\""));
}

#[test]
fn test_dry_run_prints_statements() {
    let root = TempDir::new().unwrap();
    orders(root.path());

    let output = sapwood(&[
        "dry-run",
        root.path().join("orders").to_str().unwrap(),
        "--conf",
        r#"{"run_date": "2024-01-01"}"#,
    ]);
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("CREATE OR REPLACE TABLE `proj.mart.orders_daily`"));
    assert!(out.contains("PARTITION BY DATE(created_at)"));
    assert!(out.contains("orders_checks (assert.run-assertion): ok"));
    assert!(out.contains("-- dry-run delete `proj.mart.stg_orders`"));
    assert!(out.contains("-- dry-run create view `proj.mart.stg_orders`\nSELECT * FROM raw.orders WHERE ds <= '2024-01-01'"));
}

#[test]
fn test_dry_run_rejects_non_boolean_full_refresh() {
    let root = TempDir::new().unwrap();
    orders(root.path());

    let output = sapwood(&[
        "dry-run",
        root.path().join("orders").to_str().unwrap(),
        "--conf",
        r#"{"full_refresh": "yes"}"#,
    ]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("full_refresh must be a boolean"));
}
