//! Adapters that drive the materialization engine.

use sapwood::{
    Adapter, AdapterDecl, AdapterError, AdapterOutput, CALL_STORED_PROCEDURE, CREATE_SCHEMA,
    Options, RECREATE_STORED_PROCEDURE, RECREATE_UDF, RECREATE_VIEW, REPLACE_OR_UPSERT,
    RUN_ASSERTION, TaskContext, Value,
};
use std::sync::OnceLock;
use tracing::info;

/// Options handed to the engine for a table task.
///
/// Task options pass through; the task's partitioning and the run's
/// `full_refresh` flag are layered on top.
pub fn table_options(ctx: &TaskContext<'_>) -> Options {
    let mut options = ctx.task.options.clone();
    if let Some(partitioning) = &ctx.task.partitioning {
        options.insert("partition_key".into(), partitioning.field.clone().into());
        options.insert(
            "partition_data_type".into(),
            partitioning.data_type.as_str().into(),
        );
    }
    options.insert("full_refresh".into(), ctx.params.full_refresh.into());
    options
}

fn arguments(ctx: &TaskContext<'_>) -> Value {
    ctx.task
        .options
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()))
}

/// Build a table from the task query, or stage and merge into it.
pub struct ReplaceOrUpsert;

impl Adapter for ReplaceOrUpsert {
    fn decl(&self) -> &AdapterDecl {
        static DECL: OnceLock<AdapterDecl> = OnceLock::new();
        DECL.get_or_init(|| {
            AdapterDecl::new(REPLACE_OR_UPSERT)
                .description("Create a table, or stage and merge into an existing one")
        })
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AdapterOutput, AdapterError> {
        let relation = ctx.relation()?;
        info!(relation = %relation, full_refresh = ctx.params.full_refresh, "materializing table");
        ctx.services
            .query_runner()
            .replace_or_upsert(&ctx.sql()?, &relation, &table_options(ctx))?;
        Ok(AdapterOutput::Completed)
    }
}

/// Drop and recreate a view.
pub struct RecreateView;

impl Adapter for RecreateView {
    fn decl(&self) -> &AdapterDecl {
        static DECL: OnceLock<AdapterDecl> = OnceLock::new();
        DECL.get_or_init(|| AdapterDecl::new(RECREATE_VIEW).description("Drop and recreate a view"))
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AdapterOutput, AdapterError> {
        let relation = ctx.relation()?;
        ctx.services
            .query_runner()
            .recreate_view(&ctx.sql()?, &relation)?;
        Ok(AdapterOutput::Completed)
    }
}

/// Create or replace a user-defined function.
pub struct RecreateUdf;

impl Adapter for RecreateUdf {
    fn decl(&self) -> &AdapterDecl {
        static DECL: OnceLock<AdapterDecl> = OnceLock::new();
        DECL.get_or_init(|| {
            AdapterDecl::new(RECREATE_UDF).description("Create or replace a user-defined function")
        })
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AdapterOutput, AdapterError> {
        let relation = ctx.relation()?;
        ctx.services
            .query_runner()
            .recreate_udf(&arguments(ctx), &ctx.sql()?, &relation)?;
        Ok(AdapterOutput::Completed)
    }
}

/// Create or replace a stored procedure.
pub struct RecreateStoredProcedure;

impl Adapter for RecreateStoredProcedure {
    fn decl(&self) -> &AdapterDecl {
        static DECL: OnceLock<AdapterDecl> = OnceLock::new();
        DECL.get_or_init(|| {
            AdapterDecl::new(RECREATE_STORED_PROCEDURE)
                .description("Create or replace a stored procedure")
        })
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AdapterOutput, AdapterError> {
        let relation = ctx.relation()?;
        ctx.services
            .query_runner()
            .recreate_stored_procedure(&arguments(ctx), &ctx.sql()?, &relation)?;
        Ok(AdapterOutput::Completed)
    }
}

/// Create the task's schema if it does not exist.
pub struct CreateSchema;

impl Adapter for CreateSchema {
    fn decl(&self) -> &AdapterDecl {
        static DECL: OnceLock<AdapterDecl> = OnceLock::new();
        DECL.get_or_init(|| {
            AdapterDecl::new(CREATE_SCHEMA).description("Create a schema if it does not exist")
        })
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AdapterOutput, AdapterError> {
        ctx.services
            .query_runner()
            .create_schema(&ctx.task.database, &ctx.task.schema, true)?;
        Ok(AdapterOutput::Completed)
    }
}

/// Run the task body as a procedural block.
pub struct CallStoredProcedure;

impl Adapter for CallStoredProcedure {
    fn decl(&self) -> &AdapterDecl {
        static DECL: OnceLock<AdapterDecl> = OnceLock::new();
        DECL.get_or_init(|| {
            AdapterDecl::new(CALL_STORED_PROCEDURE).description("Call stored procedures in a block")
        })
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AdapterOutput, AdapterError> {
        ctx.services.query_runner().call_stored_procedure(&ctx.sql()?)?;
        Ok(AdapterOutput::Completed)
    }
}

/// Run an assertion query once; any failing row fails the task.
pub struct RunAssertion;

impl Adapter for RunAssertion {
    fn decl(&self) -> &AdapterDecl {
        static DECL: OnceLock<AdapterDecl> = OnceLock::new();
        DECL.get_or_init(|| {
            AdapterDecl::new(RUN_ASSERTION).description("Run an assertion query and check every row")
        })
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AdapterOutput, AdapterError> {
        ctx.services.query_runner().assertion(&ctx.sql()?)?;
        Ok(AdapterOutput::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapwood::{
        Call, InvokeTarget, Kind, MaterializeTarget, OptionsExt, PartitionDataType, Partitioning,
        RecordingWarehouse, RunParams, Services, SqlTemplates, Task,
    };
    use std::sync::Arc;

    fn task(kind: Kind) -> Task {
        Task {
            kind,
            database: "proj".into(),
            schema: "mart".into(),
            identifier: "orders".into(),
            partitioning: None,
            dependencies: Default::default(),
            options: Options::new(),
        }
    }

    fn services(warehouse: Arc<RecordingWarehouse>) -> Services {
        Services::new(warehouse, Arc::new(SqlTemplates::new()))
    }

    #[test]
    fn test_table_options_layering() {
        let mut task = task(Kind::Materialize(MaterializeTarget::Table));
        task.partitioning = Some(Partitioning {
            field: "created_at".into(),
            data_type: PartitionDataType::Timestamp,
        });
        task.options.insert("full_refresh".into(), false.into());

        let params = RunParams::new().full_refresh(true);
        let services = services(Arc::new(RecordingWarehouse::new()));
        let ctx = TaskContext {
            pipeline_id: "p",
            task: &task,
            sql: Some("SELECT 1"),
            pipeline_params: &Options::new(),
            params: &params,
            services: &services,
        };

        let options = table_options(&ctx);
        assert_eq!(options.get("partition_key").and_then(Value::as_str), Some("created_at"));
        assert_eq!(
            options.get("partition_data_type").and_then(Value::as_str),
            Some("timestamp")
        );
        assert_eq!(options.get("full_refresh").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn test_create_schema_uses_task_location() {
        let warehouse = Arc::new(RecordingWarehouse::new());
        let task = task(Kind::Materialize(MaterializeTarget::Schema));
        let services = services(warehouse.clone());
        let ctx = TaskContext {
            pipeline_id: "p",
            task: &task,
            sql: None,
            pipeline_params: &Options::new(),
            params: &RunParams::new(),
            services: &services,
        };

        assert_eq!(CreateSchema.execute(&ctx).unwrap(), AdapterOutput::Completed);
        assert_eq!(
            warehouse.calls(),
            vec![Call::CreateDataset {
                database: "proj".into(),
                schema: "mart".into(),
                exists_ok: true,
                dry_run: false,
            }]
        );
    }

    #[test]
    fn test_body_rendered_with_params() {
        let warehouse = Arc::new(RecordingWarehouse::new());
        let task = task(Kind::Materialize(MaterializeTarget::Table));
        let services = services(warehouse.clone());
        let params = RunParams::new();
        let pipeline_params = Options::new().with("source_project", "raw");
        let ctx = TaskContext {
            pipeline_id: "p",
            task: &task,
            sql: Some("SELECT * FROM `{{ params.source_project }}.events`"),
            pipeline_params: &pipeline_params,
            params: &params,
            services: &services,
        };

        ReplaceOrUpsert.execute(&ctx).unwrap();

        let create = warehouse
            .queries()
            .into_iter()
            .find(|q| q.starts_with("CREATE OR REPLACE TABLE `proj.mart.orders`"))
            .unwrap();
        assert!(create.contains("SELECT * FROM `raw.events`"));
        assert!(!create.contains("{{"));
    }

    #[test]
    fn test_body_sees_run_vars_and_full_refresh() {
        let task = task(Kind::Invoke(InvokeTarget::StoredProcedure));
        let services = services(Arc::new(RecordingWarehouse::new()));
        let mut params = RunParams::new().full_refresh(true);
        params.vars.insert("run_date".into(), "2024-01-01".into());
        let ctx = TaskContext {
            pipeline_id: "p",
            task: &task,
            sql: Some(
                "CALL {{ task.schema }}.load('{{ run_date }}'){{#if is_incremental}} -- incremental{{/if}}",
            ),
            pipeline_params: &Options::new(),
            params: &params,
            services: &services,
        };

        assert_eq!(ctx.sql().unwrap(), "CALL mart.load('2024-01-01')");
    }

    #[test]
    fn test_missing_sql() {
        let task = task(Kind::Materialize(MaterializeTarget::View));
        let services = services(Arc::new(RecordingWarehouse::new()));
        let ctx = TaskContext {
            pipeline_id: "p",
            task: &task,
            sql: None,
            pipeline_params: &Options::new(),
            params: &RunParams::new(),
            services: &services,
        };

        assert!(matches!(
            RecreateView.execute(&ctx),
            Err(AdapterError::MissingSql(ref id)) if id == "orders"
        ));
    }
}
