//! DDL Generation for Dynamic Resources
//!
//! Generates the PostgreSQL statements that create and reshape resource
//! tables, their column comments, triggers, indexes and alias views.

use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::config::StoreConfig;
use crate::error::{DatastoreError, Result};
use crate::plugin::FieldPolicy;
use crate::resource::FunctionDefinition;
use crate::sql::query::cast_type;
use crate::sql::sanitize::{identifier, literal_string};
use crate::types::{Field, is_nested_type};

/// Trigger function that fills `_full_text` from every public column
pub const FULL_TEXT_TRIGGER_FUNCTION_SQL: &str = r#"
CREATE OR REPLACE FUNCTION populate_full_text_trigger() RETURNS trigger
AS $body$
    BEGIN
        IF NEW._full_text IS NOT NULL THEN
            RETURN NEW;
        END IF;
        NEW._full_text := (
            SELECT to_tsvector(string_agg(value, ' '))
            FROM json_each_text(row_to_json(NEW.*))
            WHERE key NOT LIKE '\_%');
        RETURN NEW;
    END;
$body$ LANGUAGE plpgsql
"#;

/// Catalog view listing resources (`alias_of` NULL) and their alias views
pub const TABLE_METADATA_VIEW_SQL: &str = r#"
CREATE OR REPLACE VIEW "_table_metadata" AS
    SELECT DISTINCT
        substr(md5(dependee.relname || COALESCE(dependent.relname, '')), 0, 17) AS "_id",
        dependee.relname AS name,
        dependee.oid AS oid,
        dependent.relname AS alias_of
    FROM
        pg_class AS dependee
        LEFT OUTER JOIN pg_rewrite AS r ON r.ev_class = dependee.oid
        LEFT OUTER JOIN pg_depend AS d ON d.objid = r.oid
        LEFT OUTER JOIN pg_class AS dependent ON d.refobjid = dependent.oid
    WHERE
        (dependee.oid != dependent.oid OR dependent.oid IS NULL)
        AND (dependee.relkind = 'r'::"char" OR dependee.relkind = 'v'::"char")
        AND dependee.relnamespace = (
            SELECT oid FROM pg_namespace WHERE nspname = 'public')
    ORDER BY dependee.oid DESC
"#;

/// Name of the trigger that keeps `_full_text` current
pub const FULL_TEXT_TRIGGER: &str = "zfulltext";

/// Hex characters kept from the index-name digest
const INDEX_NAME_LENGTH: usize = 40;

/// An index as it exists on the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveIndex {
    pub name: String,
    pub unique: bool,
    pub primary: bool,
}

/// Index statements to run, drops first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexPlan {
    pub drop: Vec<String>,
    /// `(index name, CREATE INDEX statement)`
    pub create: Vec<(String, String)>,
}

impl IndexPlan {
    pub fn is_empty(&self) -> bool {
        self.drop.is_empty() && self.create.is_empty()
    }
}

/// Index declarations of one `create_indexes` pass
#[derive(Debug, Clone, Copy)]
pub struct IndexRequest<'a> {
    pub resource_id: &'a str,
    /// Live public fields of the resource
    pub fields: &'a [Field],
    /// Declared secondary indexes; `None` leaves undeclared indexes alone
    pub indexes: Option<&'a [Vec<String>]>,
    pub primary_key: Option<&'a [String]>,
    pub language: &'a str,
}

/// DDL Generator for resource tables
pub struct DdlGenerator<'a> {
    config: &'a StoreConfig,
}

impl<'a> DdlGenerator<'a> {
    /// Create a new DDL generator with the given configuration
    pub fn new(config: &'a StoreConfig) -> Self {
        Self { config }
    }

    /// Generate CREATE TABLE with the `_id` and `_full_text` system columns
    pub fn generate_create_table(&self, resource_id: &str, fields: &[Field]) -> String {
        let mut column_defs = vec![
            "\"_id\" serial primary key".to_string(),
            "\"_full_text\" tsvector".to_string(),
        ];
        column_defs.extend(fields.iter().map(Self::format_column_definition));

        format!(
            "CREATE TABLE {} ({})",
            identifier(resource_id),
            column_defs.join(", ")
        )
    }

    /// Generate ALTER TABLE .. ADD for one new column
    pub fn generate_add_column(&self, resource_id: &str, field: &Field) -> String {
        format!(
            "ALTER TABLE {} ADD {}",
            identifier(resource_id),
            Self::format_column_definition(field)
        )
    }

    pub fn generate_drop_column(&self, resource_id: &str, field_id: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            identifier(resource_id),
            identifier(field_id)
        )
    }

    /// Generate COMMENT ON COLUMN carrying the field's metadata
    pub fn generate_column_comment(
        &self,
        resource_id: &str,
        field_id: &str,
        comment: &Map<String, JsonValue>,
    ) -> String {
        format!(
            "COMMENT ON COLUMN {}.{} IS {}",
            identifier(resource_id),
            identifier(field_id),
            literal_string(&render_comment(comment))
        )
    }

    pub fn generate_drop_table(&self, resource_id: &str) -> String {
        format!("DROP TABLE {} CASCADE", identifier(resource_id))
    }

    /// Generate DELETE with an already rendered WHERE clause
    pub fn generate_delete(&self, resource_id: &str, where_sql: &str) -> String {
        format!("DELETE FROM {} {}", identifier(resource_id), where_sql)
            .trim_end()
            .to_string()
    }

    // ==================== Triggers ====================

    pub fn generate_fulltext_trigger(&self, resource_id: &str) -> String {
        format!(
            "CREATE TRIGGER {} BEFORE INSERT OR UPDATE ON {} \
             FOR EACH ROW EXECUTE PROCEDURE populate_full_text_trigger()",
            FULL_TEXT_TRIGGER,
            identifier(resource_id)
        )
    }

    pub fn generate_drop_trigger(&self, resource_id: &str, name: &str) -> String {
        format!(
            "DROP TRIGGER {} ON {}",
            identifier(name),
            identifier(resource_id)
        )
    }

    /// Generate the `position`-th caller trigger (`t000`, `t001`, ...)
    pub fn generate_create_trigger(&self, resource_id: &str, position: usize, function: &str) -> String {
        format!(
            "CREATE TRIGGER {} BEFORE INSERT OR UPDATE ON {} \
             FOR EACH ROW EXECUTE PROCEDURE {}()",
            identifier(&format!("t{:03}", position)),
            identifier(resource_id),
            identifier(function)
        )
    }

    // ==================== Functions ====================

    pub fn generate_create_function(&self, function: &FunctionDefinition) -> String {
        let args: Vec<String> = function
            .arguments
            .iter()
            .map(|arg| {
                let mode = arg.argmode.map(|m| m.as_sql()).unwrap_or("");
                format!(
                    "{} {} {}",
                    mode,
                    identifier(&arg.argname),
                    identifier(&arg.argtype)
                )
                .trim_start()
                .to_string()
            })
            .collect();

        format!(
            "CREATE {}FUNCTION {}({}) RETURNS {} AS {} LANGUAGE plpgsql",
            if function.or_replace { "OR REPLACE " } else { "" },
            identifier(&function.name),
            args.join(", "),
            identifier(&function.rettype),
            literal_string(&function.definition)
        )
    }

    pub fn generate_drop_function(&self, name: &str, if_exists: bool) -> String {
        format!(
            "DROP FUNCTION {}{}()",
            if if_exists { "IF EXISTS " } else { "" },
            identifier(name)
        )
    }

    // ==================== Aliases ====================

    pub fn generate_create_alias(&self, alias: &str, resource_id: &str) -> String {
        format!(
            "CREATE VIEW {} AS SELECT * FROM {}",
            identifier(alias),
            identifier(resource_id)
        )
    }

    pub fn generate_drop_alias(&self, alias: &str) -> String {
        format!("DROP VIEW {}", identifier(alias))
    }

    // ==================== Indexes ====================

    pub fn generate_create_index(
        &self,
        resource_id: &str,
        name: &str,
        expression: &str,
        unique: bool,
        method: Option<&str>,
    ) -> String {
        let using = match method {
            Some(method) => format!(" USING {}", identifier(method)),
            None => String::new(),
        };
        format!(
            "CREATE {}INDEX {} ON {}{} ({})",
            if unique { "UNIQUE " } else { "" },
            identifier(name),
            identifier(resource_id),
            using,
            expression
        )
    }

    pub fn generate_drop_index(&self, name: &str) -> String {
        format!("DROP INDEX {} CASCADE", identifier(name))
    }

    /// Full-text index statements, plus the names of indexes that should
    /// not exist because their field type is no longer indexable
    pub fn fts_indexes(
        &self,
        resource_id: &str,
        fields: &[Field],
        language: &str,
        policy: &dyn FieldPolicy,
    ) -> (Vec<(String, String)>, Vec<String>) {
        let mut create = Vec::new();
        let mut noindex = Vec::new();
        let lang = literal_string(language);

        let full_text = Field::typed("_full_text", "tsvector");
        for field in std::iter::once(&full_text).chain(fields) {
            let type_name = field.type_name();
            let expression = match type_name {
                "tsvector" => identifier(&field.id),
                "text" => format!("to_tsvector({}, {})", lang, identifier(&field.id)),
                _ => format!(
                    "to_tsvector({}, cast({} AS text))",
                    lang,
                    identifier(&field.id)
                ),
            };
            let name = index_name(resource_id, &expression);

            if field.id != "_full_text" && !policy.should_fts_index_field_type(type_name) {
                noindex.push(name);
                continue;
            }
            let sql = self.generate_create_index(
                resource_id,
                &name,
                &expression,
                false,
                Some(&self.config.default_fts_index_method),
            );
            create.push((name, sql));
        }
        (create, noindex)
    }

    /// Work out which indexes to drop and create so the table matches the
    /// declarations. Running the plan and planning again yields an empty
    /// plan.
    pub fn plan_indexes(
        &self,
        request: IndexRequest<'_>,
        live_unique_key: &[String],
        live: &[LiveIndex],
        policy: &dyn FieldPolicy,
    ) -> Result<IndexPlan> {
        let (fts, noindex) =
            self.fts_indexes(request.resource_id, request.fields, request.language, policy);
        // (name, statement, unique)
        let mut planned: Vec<(String, String, bool)> =
            fts.into_iter().map(|(name, sql)| (name, sql, false)).collect();

        let mut indexes: Vec<Vec<String>> = request.indexes.map(<[_]>::to_vec).unwrap_or_default();
        let mut replace_unique = false;
        if let Some(primary_key) = request.primary_key {
            let mut wanted = primary_key.to_vec();
            let mut current = live_unique_key.to_vec();
            wanted.sort();
            current.sort();
            if wanted != current {
                replace_unique = true;
                indexes.push(primary_key.to_vec());
            }
        }

        for index in indexes.iter().filter(|i| !i.is_empty()) {
            let mut parts = Vec::with_capacity(index.len());
            for field_id in index {
                let field = request
                    .fields
                    .iter()
                    .find(|f| &f.id == field_id)
                    .ok_or_else(|| {
                        DatastoreError::validation(
                            "index",
                            format!("The field \"{}\" is not a valid column name.", field_id),
                        )
                    })?;
                parts.push(if is_nested_type(field.type_name()) {
                    format!("(({}).json::text)", identifier(field_id))
                } else {
                    identifier(field_id)
                });
            }
            let expression = parts.join(", ");
            let name = index_name(request.resource_id, &expression);
            let unique = index.as_slice() == request.primary_key.unwrap_or(live_unique_key);
            let sql =
                self.generate_create_index(request.resource_id, &name, &expression, unique, None);
            planned.push((name, sql, unique));
        }

        let mut plan = IndexPlan::default();
        for index in live.iter().filter(|i| !i.primary) {
            let planned_unique = planned
                .iter()
                .find(|(name, _, _)| *name == index.name)
                .map(|(_, _, unique)| *unique);
            let stale = noindex.contains(&index.name)
                || (request.indexes.is_some() && !index.unique && planned_unique.is_none())
                || (replace_unique && index.unique)
                || planned_unique.is_some_and(|unique| unique != index.unique);
            if stale {
                plan.drop.push(index.name.clone());
            }
        }

        for (name, sql, unique) in planned {
            let kept = live.iter().any(|i| i.name == name && i.unique == unique)
                && !plan.drop.contains(&name);
            if !kept && !plan.create.iter().any(|(n, _)| *n == name) {
                plan.create.push((name, sql));
            }
        }
        Ok(plan)
    }

    /// Format a single column definition for CREATE TABLE or ALTER TABLE ADD
    pub fn format_column_definition(field: &Field) -> String {
        format!("{} {}", identifier(&field.id), cast_type(field.type_name()))
    }
}

/// Deterministic index name: hex digest of resource id and expression
pub fn index_name(resource_id: &str, expression: &str) -> String {
    let digest = Sha256::digest(format!("{}{}", resource_id, expression).as_bytes());
    let mut hex = format!("{:x}", digest);
    hex.truncate(INDEX_NAME_LENGTH);
    hex
}

/// Encode column-comment data; the leading space marks the versioned format
pub fn render_comment(comment: &Map<String, JsonValue>) -> String {
    format!(" {}", JsonValue::Object(comment.clone()))
}

/// Decode a column comment.
///
/// Versioned comments hold the full object with caller info under `_info`;
/// legacy comments (starting with `{`) are the caller info itself. Anything
/// that is not a JSON object yields `None`.
pub fn parse_comment(raw: &str) -> Option<Map<String, JsonValue>> {
    if let Some(body) = raw.strip_prefix(' ') {
        match serde_json::from_str(body) {
            Ok(JsonValue::Object(map)) => Some(map),
            _ => None,
        }
    } else if raw.starts_with('{') {
        match serde_json::from_str(raw) {
            Ok(info @ JsonValue::Object(_)) => {
                let mut map = Map::new();
                map.insert("_info".to_string(), info);
                Some(map)
            }
            _ => None,
        }
    } else {
        None
    }
}
