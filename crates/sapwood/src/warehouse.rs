//! Warehouse execution client capability.
//!
//! The engine only talks to the warehouse through [`WarehouseClient`]: submit
//! a query, wait for the job, inspect its error detail. Connection handling,
//! credentials and retries belong to the implementation.

use crate::relation::Relation;
use crate::value::{Options, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, PoisonError};

/// One result row, column name → value.
pub type Row = Options;

/// How a query job writes into its destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Fail if the destination holds data.
    #[default]
    WriteEmpty,
    /// Append to the destination.
    WriteAppend,
    /// Overwrite the destination.
    WriteTruncate,
}

/// Per-job configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobConfig {
    /// Plan and estimate only, never write.
    pub dry_run: bool,
    pub destination: Option<Relation>,
    pub write_disposition: WriteDisposition,
}

impl JobConfig {
    pub fn dry_run(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }
}

/// Outcome of a completed job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobResult {
    pub rows: Vec<Row>,
    /// Rows touched by a DML statement.
    pub affected_rows: Option<u64>,
}

/// A submitted query.
pub trait QueryJob: Send {
    /// Block until the job completes.
    fn wait(&self) -> Result<JobResult, WarehouseError>;

    /// Structured error detail reported by the warehouse, if any.
    fn error_detail(&self) -> Option<Value>;

    fn is_dry_run(&self) -> bool;

    /// Bytes the query will scan, known for dry-run jobs.
    fn total_bytes_processed(&self) -> Option<u64>;
}

/// Warehouse execution client.
pub trait WarehouseClient: Send + Sync {
    /// Submit a query; the returned job may still be running.
    fn submit(&self, query: &str, config: &JobConfig) -> Result<Box<dyn QueryJob>, WarehouseError>;

    /// Delete a table or view. Fails with [`WarehouseError::NotFound`] if absent.
    ///
    /// A dry-run config checks the request without deleting anything.
    fn delete_table(&self, relation: &Relation, config: &JobConfig) -> Result<(), WarehouseError>;

    /// Create a view over `query`.
    fn create_view(
        &self,
        relation: &Relation,
        query: &str,
        config: &JobConfig,
    ) -> Result<(), WarehouseError>;

    /// Create a schema (dataset) in `database`.
    fn create_dataset(
        &self,
        database: &str,
        schema: &str,
        exists_ok: bool,
        config: &JobConfig,
    ) -> Result<(), WarehouseError>;
}

/// Errors reported by a warehouse client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WarehouseError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("query failed: {message}")]
    Query {
        message: String,
        detail: Option<Value>,
    },

    #[error("warehouse request failed: {0}")]
    Request(String),
}

impl WarehouseError {
    /// Structured detail attached by the warehouse.
    pub fn detail(&self) -> Option<&Value> {
        match self {
            WarehouseError::Query { detail, .. } => detail.as_ref(),
            _ => None,
        }
    }
}

/// A call made against a [`RecordingWarehouse`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Query { sql: String, config: JobConfig },
    DeleteTable { relation: Relation, dry_run: bool },
    CreateView {
        relation: Relation,
        sql: String,
        dry_run: bool,
    },
    CreateDataset {
        database: String,
        schema: String,
        exists_ok: bool,
        dry_run: bool,
    },
}

impl Call {
    pub fn is_dry_run(&self) -> bool {
        match self {
            Call::Query { config, .. } => config.dry_run,
            Call::DeleteTable { dry_run, .. }
            | Call::CreateView { dry_run, .. }
            | Call::CreateDataset { dry_run, .. } => *dry_run,
        }
    }
}

/// In-memory client that records every call and answers from a script.
///
/// Queries are answered by the first scripted response whose needle occurs
/// in the statement; unmatched queries succeed with no rows. Dry-run calls
/// are recorded and checked but change nothing. Used for dry runs and in
/// tests.
#[derive(Debug, Default)]
pub struct RecordingWarehouse {
    calls: Mutex<Vec<Call>>,
    responses: Mutex<Vec<(String, VecDeque<Result<JobResult, WarehouseError>>)>>,
    failures: Mutex<Vec<(String, WarehouseError)>>,
    tables: Mutex<BTreeSet<String>>,
    datasets: Mutex<BTreeSet<String>>,
}

impl RecordingWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries containing `needle` with `rows`.
    pub fn respond(self, needle: impl Into<String>, rows: Vec<Row>) -> Self {
        self.respond_with(
            needle,
            Ok(JobResult {
                rows,
                affected_rows: None,
            }),
        )
    }

    /// Answer queries containing `needle` with `result`.
    ///
    /// Several results for one needle are consumed in order; the last one
    /// repeats.
    pub fn respond_with(
        self,
        needle: impl Into<String>,
        result: Result<JobResult, WarehouseError>,
    ) -> Self {
        {
            let needle = needle.into();
            let mut responses = lock(&self.responses);
            match responses.iter_mut().find(|(n, _)| *n == needle) {
                Some((_, queue)) => queue.push_back(result),
                None => responses.push((needle, VecDeque::from([result]))),
            }
        }
        self
    }

    /// Fail every delete or create of `name` with `error`. Tables and views
    /// are named `database.schema.identifier`, datasets `database.schema`.
    pub fn fail_on(self, name: impl Into<String>, error: WarehouseError) -> Self {
        lock(&self.failures).push((name.into(), error));
        self
    }

    /// Mark a table or view as existing, so deleting it succeeds.
    pub fn with_table(self, relation: &Relation) -> Self {
        lock(&self.tables).insert(relation.qualified_name());
        self
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// SQL of every submitted query, in order.
    pub fn queries(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                Call::Query { sql, .. } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    fn scripted_failure(&self, name: &str) -> Result<(), WarehouseError> {
        match lock(&self.failures).iter().find(|(n, _)| n == name) {
            Some((_, error)) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn answer(&self, sql: &str) -> Result<JobResult, WarehouseError> {
        let mut responses = lock(&self.responses);
        let Some((_, queue)) = responses.iter_mut().find(|(needle, _)| sql.contains(needle.as_str()))
        else {
            return Ok(JobResult::default());
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or_else(|| Ok(JobResult::default()))
        } else {
            queue.front().cloned().unwrap_or_else(|| Ok(JobResult::default()))
        }
    }
}

impl WarehouseClient for RecordingWarehouse {
    fn submit(&self, query: &str, config: &JobConfig) -> Result<Box<dyn QueryJob>, WarehouseError> {
        lock(&self.calls).push(Call::Query {
            sql: query.to_string(),
            config: config.clone(),
        });

        let result = if config.dry_run {
            Ok(JobResult::default())
        } else {
            self.answer(query)
        };

        Ok(Box::new(RecordedJob {
            result,
            dry_run: config.dry_run,
        }))
    }

    fn delete_table(&self, relation: &Relation, config: &JobConfig) -> Result<(), WarehouseError> {
        lock(&self.calls).push(Call::DeleteTable {
            relation: relation.clone(),
            dry_run: config.dry_run,
        });
        let name = relation.qualified_name();
        self.scripted_failure(&name)?;

        let mut tables = lock(&self.tables);
        if !tables.contains(&name) {
            return Err(WarehouseError::NotFound(name));
        }
        if !config.dry_run {
            tables.remove(&name);
        }
        Ok(())
    }

    fn create_view(
        &self,
        relation: &Relation,
        query: &str,
        config: &JobConfig,
    ) -> Result<(), WarehouseError> {
        lock(&self.calls).push(Call::CreateView {
            relation: relation.clone(),
            sql: query.to_string(),
            dry_run: config.dry_run,
        });
        let name = relation.qualified_name();
        self.scripted_failure(&name)?;

        if config.dry_run {
            return Ok(());
        }
        if !lock(&self.tables).insert(name.clone()) {
            return Err(WarehouseError::AlreadyExists(name));
        }
        Ok(())
    }

    fn create_dataset(
        &self,
        database: &str,
        schema: &str,
        exists_ok: bool,
        config: &JobConfig,
    ) -> Result<(), WarehouseError> {
        lock(&self.calls).push(Call::CreateDataset {
            database: database.to_string(),
            schema: schema.to_string(),
            exists_ok,
            dry_run: config.dry_run,
        });
        let id = format!("{}.{}", database, schema);
        self.scripted_failure(&id)?;

        let mut datasets = lock(&self.datasets);
        if datasets.contains(&id) && !exists_ok {
            return Err(WarehouseError::AlreadyExists(id));
        }
        if !config.dry_run {
            datasets.insert(id);
        }
        Ok(())
    }
}

struct RecordedJob {
    result: Result<JobResult, WarehouseError>,
    dry_run: bool,
}

impl QueryJob for RecordedJob {
    fn wait(&self) -> Result<JobResult, WarehouseError> {
        self.result.clone()
    }

    fn error_detail(&self) -> Option<Value> {
        self.result.as_ref().err().and_then(WarehouseError::detail).cloned()
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn total_bytes_processed(&self) -> Option<u64> {
        self.dry_run.then_some(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
