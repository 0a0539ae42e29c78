//! Relations: fully qualified addresses of warehouse objects.

use crate::spec::Task;
use serde::Serialize;
use std::fmt;

/// A warehouse object addressed by database, schema and identifier.
///
/// All three parts are non-empty; construction fails otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Relation {
    database: String,
    schema: String,
    identifier: String,
}

/// Raised when a relation is built from an empty part.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "database: `{database}`, schema: `{schema}` and identifier: `{identifier}` must not be empty"
)]
pub struct RelationValueError {
    pub database: String,
    pub schema: String,
    pub identifier: String,
}

impl Relation {
    /// Create a relation, rejecting empty or blank parts.
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Result<Self, RelationValueError> {
        let database = database.into();
        let schema = schema.into();
        let identifier = identifier.into();

        if [&database, &schema, &identifier]
            .iter()
            .any(|part| part.trim().is_empty())
        {
            return Err(RelationValueError {
                database,
                schema,
                identifier,
            });
        }

        Ok(Self {
            database,
            schema,
            identifier,
        })
    }

    /// The object a task writes to.
    pub fn from_task(task: &Task) -> Result<Self, RelationValueError> {
        Self::new(
            task.database.as_str(),
            task.schema.as_str(),
            task.identifier.as_str(),
        )
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// A sibling relation in the same database and schema.
    pub fn with_identifier(&self, identifier: impl Into<String>) -> Result<Self, RelationValueError> {
        Self::new(self.database.clone(), self.schema.clone(), identifier)
    }

    /// Unquoted `database.schema.identifier`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.identifier)
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`", self.qualified_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_display() {
        let relation = Relation::new("proj", "analytics", "orders").unwrap();
        assert_eq!(relation.to_string(), "`proj.analytics.orders`");
        assert_eq!(relation.qualified_name(), "proj.analytics.orders");
    }

    #[test]
    fn test_empty_parts_rejected() {
        for (db, schema, id) in [
            ("", "analytics", "orders"),
            ("proj", "", "orders"),
            ("proj", "analytics", ""),
            ("proj", "  ", "orders"),
        ] {
            let err = Relation::new(db, schema, id).unwrap_err();
            assert_eq!(err.identifier, id);
        }
    }

    #[test]
    fn test_with_identifier() {
        let relation = Relation::new("proj", "analytics", "orders").unwrap();
        let tmp = relation.with_identifier("_tmp_orders").unwrap();

        assert_eq!(tmp.database(), "proj");
        assert_eq!(tmp.schema(), "analytics");
        assert_eq!(tmp.identifier(), "_tmp_orders");
    }
}
