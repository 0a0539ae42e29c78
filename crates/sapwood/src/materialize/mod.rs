//! Atomic materialization engine.
//!
//! Tables are written in two phases. The query is first staged into a
//! temporary `_tmp_<identifier>` table that expires on its own; only once
//! staging succeeded, the partition definitions agree and the staged
//! schema matches the target is it merged into the target in one
//! statement. A failure anywhere before the merge leaves the target as it
//! was.
//!
//! Every warehouse call goes through the same wrapper: it is logged, run,
//! and on failure the remote error and its structured detail are logged
//! before the error is returned unchanged. Nothing is retried here.
//!
//! Dry runs are a setting of the job config handed to the client. The
//! engine takes the same steps either way; a dry-run client plans and
//! checks each call without writing.

mod assertion;
mod partition;
mod relation_helper;

pub use assertion::{AssertionReport, AssertionResult};
pub use partition::{PartitionConfig, PartitionConfigError, PartitionRange};
pub use relation_helper::{PartitionColumn, RelationHelper};

use crate::relation::{Relation, RelationValueError};
use crate::template::{TABLE_CREATE_OR_REPLACE, TABLE_UPSERT, TemplateError, TemplateRenderer};
use crate::value::{Options, OptionsExt, Value};
use crate::warehouse::{JobConfig, JobResult, WarehouseClient, WarehouseError, WriteDisposition};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Lifetime of staging tables.
pub const STAGING_EXPIRATION_HOURS: i64 = 12;

/// Prefix of staging table identifiers.
pub const STAGING_PREFIX: &str = "_tmp_";

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("query must hold a single statement without a trailing `;`: {0}")]
    MalformedQuery(String),

    #[error(transparent)]
    Partition(#[from] PartitionConfigError),

    #[error(transparent)]
    Relation(#[from] RelationValueError),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("partitioning of {relation} differs from `{requested}`, a full refresh is required")]
    PartitionMismatch { relation: Relation, requested: String },

    #[error("schema of staged data differs from {relation}, a full refresh is required")]
    SchemaDrift { relation: Relation },

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("assertion failed: {failed} of {total} checks did not pass")]
    AssertionFailed { failed: usize, total: usize },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Runs materializations against a warehouse.
#[derive(Clone)]
pub struct QueryRunner {
    client: Arc<dyn WarehouseClient>,
    templates: Arc<dyn TemplateRenderer>,
    helper: RelationHelper,
    dry_run: bool,
}

impl QueryRunner {
    pub fn new(client: Arc<dyn WarehouseClient>, templates: Arc<dyn TemplateRenderer>) -> Self {
        Self {
            helper: RelationHelper::new(client.clone()),
            client,
            templates,
            dry_run: false,
        }
    }

    /// Hand every call to the client as a dry run.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Create the target from `query`, or stage and merge into it.
    ///
    /// Recognised options: `full_refresh` (bool), `partition_key`,
    /// `partition_data_type`, `partition_range`.
    pub fn replace_or_upsert(
        &self,
        query: &str,
        relation: &Relation,
        options: &Options,
    ) -> Result<(), MaterializeError> {
        let query = normalize_query(query)?;

        let full_refresh = match options.get("full_refresh") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(MaterializeError::InvalidArguments(format!(
                    "full_refresh must be a boolean, got {}",
                    other.type_name()
                )));
            }
        };
        let partition = PartitionConfig::create(options)?;
        let tmp_relation = relation.with_identifier(format!("{}{}", STAGING_PREFIX, relation.identifier()))?;

        let staged = !full_refresh
            && self.logged("look up target", self.helper.relation_exists(relation))?;

        if staged
            && !self.logged(
                "read partitioning",
                self.helper
                    .has_same_partition_definition(partition.as_ref(), relation),
            )?
        {
            return Err(MaterializeError::PartitionMismatch {
                relation: relation.clone(),
                requested: partition.map(|p| p.to_string()).unwrap_or_default(),
            });
        }

        let destination = if staged { &tmp_relation } else { relation };
        let mut create_options = Options::new()
            .with("query", query)
            .with("destination", destination.to_string())
            .with("relation", relation.to_string())
            .with("tmp_relation", tmp_relation.to_string())
            .with("full_refresh", full_refresh);
        if staged {
            create_options.insert("expiration_hours".into(), STAGING_EXPIRATION_HOURS.into());
        }
        if let Some(partition) = &partition {
            create_options.insert("partition".into(), partition.to_options().into());
            create_options.insert("partition_expression".into(), partition.expression(None).into());
        }

        let statement = self.templates.render(TABLE_CREATE_OR_REPLACE, &create_options)?;
        info!(relation = %destination, "staging query results");
        self.execute(&statement, self.job_config())?;

        if !staged {
            info!(relation = %relation, full_refresh, "table created");
            return Ok(());
        }

        // The staged table is read with the run's config: a dry run staged
        // nothing, so there is nothing to compare.
        let schemas_match = self
            .helper
            .schemas_match(&tmp_relation, relation, &self.job_config());
        if !self.logged("compare staged schema", schemas_match)? {
            return Err(MaterializeError::SchemaDrift {
                relation: relation.clone(),
            });
        }

        let columns = self.logged("read columns", self.helper.columns(relation))?;
        let mut upsert_options = Options::new()
            .with("relation", relation.to_string())
            .with("tmp_relation", tmp_relation.to_string())
            .with("columns", columns);
        if let Some(partition) = &partition {
            upsert_options.insert("partition".into(), partition.to_options().into());
            upsert_options.insert(
                "partition_target_expression".into(),
                partition.expression(Some("T")).into(),
            );
            upsert_options.insert(
                "partition_source_expression".into(),
                partition.expression(None).into(),
            );
        }

        let statement = self.templates.render(TABLE_UPSERT, &upsert_options)?;
        info!(relation = %relation, staged = %tmp_relation, "merging staged data");
        self.execute(&statement, self.job_config())?;
        Ok(())
    }

    /// Append query results to `relation`.
    pub fn write_append(&self, query: &str, relation: &Relation) -> Result<(), MaterializeError> {
        let config = JobConfig {
            dry_run: self.dry_run,
            destination: Some(relation.clone()),
            write_disposition: WriteDisposition::WriteAppend,
        };
        info!(relation = %relation, "appending query results");
        self.execute(query, config)?;
        Ok(())
    }

    /// Drop the view if it exists, then create it from `query`.
    pub fn recreate_view(&self, query: &str, relation: &Relation) -> Result<(), MaterializeError> {
        let config = self.job_config();
        info!(relation = %relation, query, dry_run = config.dry_run, "recreating view");

        match self.client.delete_table(relation, &config) {
            Err(WarehouseError::NotFound(_)) => {
                info!(relation = %relation, "view not found, nothing to delete");
            }
            deleted => self.logged("delete view", deleted)?,
        }

        self.logged("create view", self.client.create_view(relation, query, &config))?;
        info!(relation = %relation, "view created");
        Ok(())
    }

    pub fn create_schema(
        &self,
        database: &str,
        schema: &str,
        exists_ok: bool,
    ) -> Result<(), MaterializeError> {
        let config = self.job_config();
        info!(database, schema, dry_run = config.dry_run, "creating schema");
        self.logged(
            "create schema",
            self.client.create_dataset(database, schema, exists_ok, &config),
        )?;
        info!(database, schema, "schema exists or has been created");
        Ok(())
    }

    /// `arguments` must be a list of `{name, type}` entries.
    pub fn recreate_udf(
        &self,
        arguments: &Value,
        query: &str,
        relation: &Relation,
    ) -> Result<(), MaterializeError> {
        let arguments = parse_arguments("UDF", arguments)?;
        let statement = format!(
            "CREATE OR REPLACE FUNCTION {}({}) AS\n(\n{}\n)",
            relation, arguments, query
        );
        info!(relation = %relation, "creating UDF");
        self.execute(&statement, self.job_config())?;
        info!(relation = %relation, "UDF created");
        Ok(())
    }

    /// `arguments` must be a list of `{name, type}` entries.
    pub fn recreate_stored_procedure(
        &self,
        arguments: &Value,
        query: &str,
        relation: &Relation,
    ) -> Result<(), MaterializeError> {
        let arguments = parse_arguments("stored procedure", arguments)?;
        let statement = format!(
            "CREATE OR REPLACE PROCEDURE {}({})\nBEGIN\n{};\nEND;",
            relation,
            arguments,
            query.trim().trim_end_matches(';')
        );
        info!(relation = %relation, "creating stored procedure");
        self.execute(&statement, self.job_config())?;
        info!(relation = %relation, "stored procedure created");
        Ok(())
    }

    /// Run `query` inside a transaction block.
    pub fn call_stored_procedure(&self, query: &str) -> Result<(), MaterializeError> {
        let statement = format!("BEGIN\n{}\nEND;", query.trim());
        info!("calling stored procedure(s)");
        self.execute(&statement, self.job_config())?;
        Ok(())
    }

    /// Run an assertion query and fail if any row did not pass.
    ///
    /// Every row is collected and the whole report logged before failing.
    pub fn assertion(&self, query: &str) -> Result<AssertionReport, MaterializeError> {
        info!("running assertion");
        let result = self.execute(query, self.job_config())?;
        let report = AssertionReport::from_rows(&result.rows);

        info!(
            "\n\n#### Assertion Report ####\n\n{}\n#### Assertion Report ####\n",
            report.to_yaml()
        );

        if report.has_failure() {
            warn!(failed = report.failed(), total = report.len(), "assertion failed");
            return Err(MaterializeError::AssertionFailed {
                failed: report.failed(),
                total: report.len(),
            });
        }
        Ok(report)
    }

    fn job_config(&self) -> JobConfig {
        JobConfig::dry_run(self.dry_run)
    }

    /// Log a failed warehouse call with its detail, then hand the error back.
    fn logged<T>(&self, step: &str, result: Result<T, WarehouseError>) -> Result<T, MaterializeError> {
        result.map_err(|e| {
            error!(step, error = %e, detail = ?e.detail(), "warehouse call failed");
            e.into()
        })
    }

    /// Submit a statement and wait for it, logging failures in full.
    ///
    /// Dry-run jobs are not waited on; their byte estimate is logged.
    fn execute(&self, statement: &str, config: JobConfig) -> Result<JobResult, MaterializeError> {
        info!(statement, dry_run = config.dry_run, "running query");

        let job = self.logged("submit query", self.client.submit(statement, &config))?;

        if job.is_dry_run() {
            let bytes = job.total_bytes_processed().unwrap_or_default();
            info!(
                bytes,
                gigabytes = bytes as f64 / 1024.0 / 1024.0 / 1024.0,
                "dry run estimate"
            );
            return Ok(JobResult::default());
        }

        match job.wait() {
            Ok(result) => {
                info!(affected_rows = ?result.affected_rows, "job completed");
                Ok(result)
            }
            Err(e) => {
                let detail = job.error_detail().or_else(|| e.detail().cloned());
                error!(step = "wait for query", error = %e, detail = ?detail, "warehouse call failed");
                Err(e.into())
            }
        }
    }
}

/// Strip one trailing `;`; any `;` left after that is an error.
pub fn normalize_query(query: &str) -> Result<&str, MaterializeError> {
    let trimmed = query.trim();
    let stripped = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
    if stripped.ends_with(';') {
        return Err(MaterializeError::MalformedQuery(query.to_string()));
    }
    Ok(stripped)
}

/// Render `{name, type}` entries as `name type, ...`.
fn parse_arguments(object: &str, arguments: &Value) -> Result<String, MaterializeError> {
    let invalid = || {
        MaterializeError::InvalidArguments(format!(
            "arguments for {} must be a list of entries with `name` and `type`",
            object
        ))
    };

    let entries = match arguments {
        Value::Null => return Ok(String::new()),
        Value::Array(entries) => entries,
        _ => return Err(invalid()),
    };

    let parsed = entries
        .iter()
        .map(|entry| {
            let entry = entry.as_object().ok_or_else(invalid)?;
            let name = entry.get("name").and_then(Value::as_str).ok_or_else(invalid)?;
            let ty = entry.get("type").and_then(Value::as_str).ok_or_else(invalid)?;
            Ok(format!("{} {}", name, ty))
        })
        .collect::<Result<Vec<_>, MaterializeError>>()?;

    Ok(parsed.join(","))
}
