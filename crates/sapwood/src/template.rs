//! Templating capability: named template + options → literal statement.
//!
//! Task bodies are templates too. They are rendered with handlebars before
//! they reach the engine, e.g. `{{ params.source_project }}` or
//! `{{#if is_incremental}} ... {{/if}}`.

use crate::value::{Options, Value};
use handlebars::Handlebars;

pub const TABLE_CREATE_OR_REPLACE: &str = "materialization/table_create_or_replace";
pub const TABLE_UPSERT: &str = "materialization/table_upsert";

/// Renders named templates into statement text.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, options: &Options) -> Result<String, TemplateError>;

    /// Render a task body against `vars`.
    fn render_body(&self, body: &str, vars: &Options) -> Result<String, TemplateError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown template: {0}")]
    Unknown(String),

    #[error("template `{template}` requires option `{option}`")]
    MissingOption {
        template: String,
        option: &'static str,
    },

    #[error("failed to render task body: {0}")]
    Body(String),
}

/// Builtin renderer for the materialization templates.
///
/// Options read by `table_create_or_replace`:
/// - `query`, `destination`: the statement and the table it populates
/// - `partition_expression`: optional `PARTITION BY` expression
/// - `expiration_hours`: optional lifetime of the created table
///
/// Options read by `table_upsert`:
/// - `relation`, `tmp_relation`: target and staged table
/// - `columns`: target column names, in order
/// - `partition_target_expression`, `partition_source_expression`:
///   optional partition expressions over the target (alias `T`) and the
///   staged table
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlTemplates;

impl SqlTemplates {
    pub fn new() -> Self {
        Self
    }

    fn create_or_replace(&self, options: &Options) -> Result<String, TemplateError> {
        let query = required(TABLE_CREATE_OR_REPLACE, options, "query")?;
        let destination = required(TABLE_CREATE_OR_REPLACE, options, "destination")?;

        let mut sql = format!("CREATE OR REPLACE TABLE {}", destination);
        if let Some(expression) = optional(options, "partition_expression") {
            sql.push_str(&format!("\nPARTITION BY {}", expression));
        }
        if let Some(hours) = options.get("expiration_hours").and_then(Value::as_i64) {
            sql.push_str(&format!(
                "\nOPTIONS(expiration_timestamp=TIMESTAMP_ADD(CURRENT_TIMESTAMP(), INTERVAL {} HOUR))",
                hours
            ));
        }
        sql.push_str(&format!("\nAS (\n{}\n)", query));
        Ok(sql)
    }

    fn upsert(&self, options: &Options) -> Result<String, TemplateError> {
        let relation = required(TABLE_UPSERT, options, "relation")?;
        let tmp_relation = required(TABLE_UPSERT, options, "tmp_relation")?;
        let columns: Vec<&str> = options
            .get("columns")
            .and_then(Value::as_array)
            .map(|cols| cols.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let insert = if columns.is_empty() {
            "INSERT ROW".to_string()
        } else {
            let list = columns
                .iter()
                .map(|c| format!("`{}`", c))
                .collect::<Vec<_>>()
                .join(", ");
            format!("INSERT ({list}) VALUES ({list})")
        };

        let partitioned = optional(options, "partition_target_expression")
            .zip(optional(options, "partition_source_expression"));

        let sql = match partitioned {
            // Replace every partition present in the staged data.
            Some((target_expr, source_expr)) => format!(
                "MERGE {relation} T\n\
                 USING {tmp_relation} S\n\
                 ON FALSE\n\
                 WHEN NOT MATCHED BY SOURCE AND {target_expr} IN (SELECT DISTINCT {source_expr} FROM {tmp_relation}) THEN DELETE\n\
                 WHEN NOT MATCHED THEN {insert}"
            ),
            None => format!(
                "MERGE {relation} T\n\
                 USING {tmp_relation} S\n\
                 ON TO_JSON_STRING(T) = TO_JSON_STRING(S)\n\
                 WHEN NOT MATCHED BY SOURCE THEN DELETE\n\
                 WHEN NOT MATCHED THEN {insert}"
            ),
        };
        Ok(sql)
    }
}

impl TemplateRenderer for SqlTemplates {
    fn render(&self, name: &str, options: &Options) -> Result<String, TemplateError> {
        match name {
            TABLE_CREATE_OR_REPLACE => self.create_or_replace(options),
            TABLE_UPSERT => self.upsert(options),
            other => Err(TemplateError::Unknown(other.to_string())),
        }
    }

    /// Unknown variables render as nothing. Output is never escaped.
    fn render_body(&self, body: &str, vars: &Options) -> Result<String, TemplateError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .render_template(body, &Value::Object(vars.clone()).to_json())
            .map_err(|e| TemplateError::Body(e.to_string()))
    }
}

fn required<'a>(
    template: &str,
    options: &'a Options,
    option: &'static str,
) -> Result<&'a str, TemplateError> {
    options
        .get(option)
        .and_then(Value::as_str)
        .ok_or_else(|| TemplateError::MissingOption {
            template: template.to_string(),
            option,
        })
}

fn optional<'a>(options: &'a Options, option: &str) -> Option<&'a str> {
    options.get(option).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::OptionsExt;

    #[test]
    fn test_create_or_replace_with_partition_and_expiration() {
        let sql = SqlTemplates
            .render(
                TABLE_CREATE_OR_REPLACE,
                &Options::new()
                    .with("query", "SELECT 1 AS id")
                    .with("destination", "`p.s._tmp_t`")
                    .with("partition_expression", "DATE(created_at)")
                    .with("expiration_hours", 12),
            )
            .unwrap();

        assert!(sql.starts_with("CREATE OR REPLACE TABLE `p.s._tmp_t`"));
        assert!(sql.contains("PARTITION BY DATE(created_at)"));
        assert!(sql.contains("INTERVAL 12 HOUR"));
        assert!(sql.ends_with("AS (\nSELECT 1 AS id\n)"));
    }

    #[test]
    fn test_upsert_keyed_by_full_row() {
        let sql = SqlTemplates
            .render(
                TABLE_UPSERT,
                &Options::new()
                    .with("relation", "`p.s.t`")
                    .with("tmp_relation", "`p.s._tmp_t`")
                    .with("columns", vec!["id", "name"]),
            )
            .unwrap();

        assert!(sql.contains("ON TO_JSON_STRING(T) = TO_JSON_STRING(S)"));
        assert!(sql.contains("INSERT (`id`, `name`) VALUES (`id`, `name`)"));
    }

    #[test]
    fn test_upsert_keyed_by_partition() {
        let sql = SqlTemplates
            .render(
                TABLE_UPSERT,
                &Options::new()
                    .with("relation", "`p.s.t`")
                    .with("tmp_relation", "`p.s._tmp_t`")
                    .with("partition_target_expression", "DATE(T.created_at)")
                    .with("partition_source_expression", "DATE(created_at)"),
            )
            .unwrap();

        assert!(sql.contains("ON FALSE"));
        assert!(sql.contains("DATE(T.created_at) IN (SELECT DISTINCT DATE(created_at) FROM `p.s._tmp_t`)"));
        assert!(sql.contains("INSERT ROW"));
    }

    #[test]
    fn test_render_body() {
        let vars = Options::new()
            .with("params", Options::new().with("source_project", "raw"))
            .with("is_incremental", true);
        let sql = SqlTemplates
            .render_body(
                "SELECT * FROM `{{ params.source_project }}.events`{{#if is_incremental}} WHERE ds > 'x'{{/if}}",
                &vars,
            )
            .unwrap();

        assert_eq!(sql, "SELECT * FROM `raw.events` WHERE ds > 'x'");
    }

    #[test]
    fn test_render_body_does_not_escape() {
        let vars = Options::new().with("op", "<>");
        let sql = SqlTemplates.render_body("SELECT a {{op}} 'b&c'", &vars).unwrap();
        assert_eq!(sql, "SELECT a <> 'b&c'");
    }

    #[test]
    fn test_render_body_syntax_error() {
        let err = SqlTemplates.render_body("SELECT {{#if x}}1", &Options::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Body(_)));
    }

    #[test]
    fn test_unknown_template() {
        let err = SqlTemplates.render("materialization/view", &Options::new()).unwrap_err();
        assert_eq!(err, TemplateError::Unknown("materialization/view".into()));
    }

    #[test]
    fn test_missing_option() {
        let err = SqlTemplates
            .render(TABLE_UPSERT, &Options::new().with("relation", "`p.s.t`"))
            .unwrap_err();
        assert!(matches!(err, TemplateError::MissingOption { option: "tmp_relation", .. }));
    }
}
