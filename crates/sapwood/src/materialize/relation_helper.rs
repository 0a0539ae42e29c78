//! Metadata lookups against the warehouse information schema.

use crate::materialize::partition::PartitionConfig;
use crate::relation::Relation;
use crate::value::Value;
use crate::warehouse::{JobConfig, Row, WarehouseClient, WarehouseError};
use std::sync::Arc;
use tracing::debug;

/// An existing partitioning column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionColumn {
    pub column_name: String,
    pub data_type: String,
}

/// Reads table metadata through the warehouse client.
#[derive(Clone)]
pub struct RelationHelper {
    client: Arc<dyn WarehouseClient>,
}

impl RelationHelper {
    pub fn new(client: Arc<dyn WarehouseClient>) -> Self {
        Self { client }
    }

    pub fn relation_exists(&self, relation: &Relation) -> Result<bool, WarehouseError> {
        let rows = self.query(&format!(
            "SELECT table_name FROM `{}.{}`.INFORMATION_SCHEMA.TABLES WHERE table_name = '{}'",
            relation.database(),
            relation.schema(),
            relation.identifier()
        ))?;
        Ok(!rows.is_empty())
    }

    /// The partitioning column of an existing table, if it has one.
    pub fn partition_column(&self, relation: &Relation) -> Result<Option<PartitionColumn>, WarehouseError> {
        let rows = self.query(&format!(
            "SELECT column_name, data_type FROM `{}.{}`.INFORMATION_SCHEMA.COLUMNS WHERE table_name = '{}' AND is_partitioning_column = 'YES' LIMIT 1",
            relation.database(),
            relation.schema(),
            relation.identifier()
        ))?;

        Ok(rows.first().map(|row| PartitionColumn {
            column_name: text(row, "column_name"),
            data_type: text(row, "data_type"),
        }))
    }

    /// Whether `config` agrees with the partitioning of `relation`.
    ///
    /// A missing config or an unpartitioned table always agrees.
    pub fn has_same_partition_definition(
        &self,
        config: Option<&PartitionConfig>,
        relation: &Relation,
    ) -> Result<bool, WarehouseError> {
        let Some(config) = config else {
            return Ok(true);
        };
        Ok(match self.partition_column(relation)? {
            Some(existing) => config.matches_column(&existing.column_name, &existing.data_type),
            None => true,
        })
    }

    /// Column signatures (name, nullability, type, partitioning flag) in
    /// ordinal order.
    pub fn column_signatures(
        &self,
        relation: &Relation,
        config: &JobConfig,
    ) -> Result<Vec<String>, WarehouseError> {
        let rows = self.query_with(
            &format!(
                "SELECT CONCAT(COALESCE(column_name, ''), COALESCE(is_nullable, ''), COALESCE(data_type, ''), COALESCE(is_partitioning_column, '')) AS col_signature FROM `{}.{}`.INFORMATION_SCHEMA.COLUMNS WHERE table_name = '{}' ORDER BY ordinal_position",
                relation.database(),
                relation.schema(),
                relation.identifier()
            ),
            config,
        )?;
        Ok(rows.iter().map(|row| text(row, "col_signature")).collect())
    }

    /// Both signature reads use `config`; a dry-run client answers neither.
    pub fn schemas_match(
        &self,
        staged: &Relation,
        target: &Relation,
        config: &JobConfig,
    ) -> Result<bool, WarehouseError> {
        Ok(self.column_signatures(staged, config)? == self.column_signatures(target, config)?)
    }

    /// Column names in ordinal order.
    pub fn columns(&self, relation: &Relation) -> Result<Vec<String>, WarehouseError> {
        let rows = self.query(&format!(
            "SELECT column_name FROM `{}.{}`.INFORMATION_SCHEMA.COLUMNS WHERE table_name = '{}' ORDER BY ordinal_position",
            relation.database(),
            relation.schema(),
            relation.identifier()
        ))?;
        Ok(rows.iter().map(|row| text(row, "column_name")).collect())
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>, WarehouseError> {
        self.query_with(sql, &JobConfig::default())
    }

    fn query_with(&self, sql: &str, config: &JobConfig) -> Result<Vec<Row>, WarehouseError> {
        debug!(query = sql, dry_run = config.dry_run, "reading metadata");
        let job = self.client.submit(sql, config)?;
        Ok(job.wait()?.rows)
    }
}

fn text(row: &Row, column: &str) -> String {
    row.get(column)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Options, OptionsExt};
    use crate::warehouse::RecordingWarehouse;

    fn relation() -> Relation {
        Relation::new("p", "s", "orders").unwrap()
    }

    #[test]
    fn test_relation_exists() {
        let warehouse = RecordingWarehouse::new().respond(
            "TABLES WHERE table_name = 'orders'",
            vec![Row::new().with("table_name", "orders")],
        );
        let helper = RelationHelper::new(Arc::new(warehouse));

        assert!(helper.relation_exists(&relation()).unwrap());
        assert!(!helper.relation_exists(&relation().with_identifier("other").unwrap()).unwrap());
    }

    #[test]
    fn test_partition_definition() {
        let warehouse = RecordingWarehouse::new().respond(
            "is_partitioning_column = 'YES'",
            vec![
                Row::new()
                    .with("column_name", "created")
                    .with("data_type", "DATE"),
            ],
        );
        let helper = RelationHelper::new(Arc::new(warehouse));

        let same = PartitionConfig::create(
            &Options::new()
                .with("partition_key", "created")
                .with("partition_data_type", "date"),
        )
        .unwrap();
        let other = PartitionConfig::create(
            &Options::new()
                .with("partition_key", "updated")
                .with("partition_data_type", "date"),
        )
        .unwrap();

        assert!(helper.has_same_partition_definition(same.as_ref(), &relation()).unwrap());
        assert!(!helper.has_same_partition_definition(other.as_ref(), &relation()).unwrap());
        assert!(helper.has_same_partition_definition(None, &relation()).unwrap());
    }

    #[test]
    fn test_schemas_match() {
        let warehouse = RecordingWarehouse::new()
            .respond(
                "COLUMNS WHERE table_name = '_tmp_orders' ORDER BY",
                vec![Row::new().with("col_signature", "idNOINT64NO")],
            )
            .respond(
                "COLUMNS WHERE table_name = 'orders' ORDER BY",
                vec![Row::new().with("col_signature", "idNOSTRINGNO")],
            );
        let helper = RelationHelper::new(Arc::new(warehouse));
        let tmp = relation().with_identifier("_tmp_orders").unwrap();

        let config = JobConfig::default();

        assert!(!helper.schemas_match(&tmp, &relation(), &config).unwrap());
        assert!(helper.schemas_match(&tmp, &tmp, &config).unwrap());
        assert!(helper.schemas_match(&tmp, &relation(), &JobConfig::dry_run(true)).unwrap());
    }
}
