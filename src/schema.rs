//! Schema management for resource tables
//!
//! Reads the live shape of a resource from the engine catalogs and applies
//! `create` requests to it: new tables, added or dropped columns, column
//! comments, triggers, indexes and alias views. Every function works on a
//! caller-provided connection so that the whole `create` call shares one
//! transaction.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value as JsonValue};
use sqlx::PgConnection;
use tracing::{debug, info};

use crate::catalog::TypeCatalog;
use crate::config::StoreConfig;
use crate::error::{DatastoreError, Result, pg_code, sql_state, summary};
use crate::plugin::FieldPolicy;
use crate::resource::{ColumnSchema, CreateRequest, IndexChanges, ResourceMeta, TriggerSpec};
use crate::sql::ddl::{DdlGenerator, IndexRequest, LiveIndex, parse_comment};
use crate::sql::sanitize::{MAX_IDENTIFIER_LENGTH, identifier};
use crate::types::{Field, FieldTypes, guess_type};

// =============================================================================
// Catalog reads
// =============================================================================

/// Whether a base table named `resource_id` exists
pub async fn table_exists(conn: &mut PgConnection, resource_id: &str) -> Result<bool> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM pg_tables WHERE tablename = $1")
        .bind(resource_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

/// Public columns of a table or alias view, in column order.
///
/// Underscore-prefixed system columns are left out. A missing relation is
/// an undefined-table error.
pub async fn live_fields(conn: &mut PgConnection, resource_id: &str) -> Result<Vec<Field>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT a.attname::text, t.typname::text
        FROM pg_attribute a
        JOIN pg_type t ON t.oid = a.atttypid
        WHERE a.attrelid = $1::regclass
          AND a.attnum > 0
          AND NOT a.attisdropped
        ORDER BY a.attnum
        "#,
    )
    .bind(identifier(resource_id))
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .map(|(name, type_name)| Field::typed(name, type_name))
        .collect())
}

/// Column types including `_id`, as used to validate and compile requests
pub async fn fields_types(conn: &mut PgConnection, resource_id: &str) -> Result<FieldTypes> {
    Ok(FieldTypes::with_id(&live_fields(conn, resource_id).await?))
}

/// Columns of the non-primary unique indexes, the key used by update/upsert
pub async fn unique_key(conn: &mut PgConnection, resource_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT a.attname::text
        FROM pg_class t, pg_index idx, pg_attribute a
        WHERE t.oid = idx.indrelid
          AND a.attrelid = t.oid
          AND a.attnum = ANY(idx.indkey)
          AND t.relkind = 'r'
          AND idx.indisunique = true
          AND idx.indisprimary = false
          AND t.relname = $1
        "#,
    )
    .bind(resource_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

pub async fn live_indexes(conn: &mut PgConnection, resource_id: &str) -> Result<Vec<LiveIndex>> {
    let rows: Vec<(String, bool, bool)> = sqlx::query_as(
        r#"
        SELECT i.relname::text, idx.indisunique, idx.indisprimary
        FROM pg_class t, pg_class i, pg_index idx
        WHERE t.oid = idx.indrelid
          AND i.oid = idx.indexrelid
          AND t.relkind = 'r'
          AND t.relname = $1
        "#,
    )
    .bind(resource_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(name, unique, primary)| LiveIndex {
            name,
            unique,
            primary,
        })
        .collect())
}

/// Decoded column comments keyed by column name.
///
/// Comments that are not JSON objects are skipped.
pub async fn raw_field_info(
    conn: &mut PgConnection,
    resource_id: &str,
) -> Result<BTreeMap<String, Map<String, JsonValue>>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT pa.attname::text, pd.description
        FROM pg_class pc, pg_attribute pa, pg_description pd
        WHERE pa.attrelid = pc.oid
          AND pd.objoid = pc.oid
          AND pd.objsubid = pa.attnum
          AND pc.relname = $1
          AND pa.attnum > 0
        "#,
    )
    .bind(resource_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(name, comment)| parse_comment(&comment).map(|map| (name, map)))
        .collect())
}

/// Caller-supplied `info` of each column that has one
pub async fn field_info(
    conn: &mut PgConnection,
    resource_id: &str,
) -> Result<BTreeMap<String, JsonValue>> {
    Ok(raw_field_info(conn, resource_id)
        .await?
        .into_iter()
        .filter_map(|(name, mut comment)| comment.remove("_info").map(|info| (name, info)))
        .collect())
}

/// Alias views pointing at `resource_id`
pub async fn aliases(conn: &mut PgConnection, resource_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT name::text FROM \"_table_metadata\" WHERE alias_of = $1")
            .bind(resource_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Resources an alias name is already bound to
async fn alias_targets(conn: &mut PgConnection, alias: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT alias_of::text FROM \"_table_metadata\" WHERE name = $1 AND alias_of IS NOT NULL",
    )
    .bind(alias)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Row count, table type and sizes of a resource
pub async fn resource_meta(conn: &mut PgConnection, resource_id: &str) -> Result<ResourceMeta> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT count(_id) FROM {}",
        identifier(resource_id)
    ))
    .fetch_one(&mut *conn)
    .await?;

    let mut table_type: String = sqlx::query_scalar(
        "SELECT table_type::text FROM information_schema.tables WHERE table_name = $1",
    )
    .bind(resource_id)
    .fetch_one(&mut *conn)
    .await?;
    // materialized views report as base tables
    let matviews: i64 = sqlx::query_scalar("SELECT count(*) FROM pg_matviews WHERE matviewname = $1")
        .bind(resource_id)
        .fetch_one(&mut *conn)
        .await?;
    if matviews > 0 {
        table_type = "MATERIALIZED VIEW".to_string();
    }

    let (size, db_size, idx_size): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT pg_relation_size($1::regclass),
               pg_database_size(current_database()),
               pg_indexes_size($1::regclass)
        "#,
    )
    .bind(identifier(resource_id))
    .fetch_one(&mut *conn)
    .await?;

    Ok(ResourceMeta {
        id: resource_id.to_string(),
        count,
        table_type,
        size,
        db_size,
        idx_size,
        aliases: aliases(conn, resource_id).await?,
    })
}

/// Physical details of each public column
pub async fn column_schemas(
    conn: &mut PgConnection,
    resource_id: &str,
) -> Result<BTreeMap<String, ColumnSchema>> {
    let rows: Vec<(String, String, bool, Option<String>, bool, bool)> = sqlx::query_as(
        r#"
        SELECT
            f.attname::text AS column_name,
            pg_catalog.format_type(f.atttypid, f.atttypmod) AS native_type,
            f.attnotnull AS notnull,
            i.relname::text AS index_name,
            CASE WHEN i.oid <> 0 THEN true ELSE false END AS is_index,
            CASE WHEN p.contype IN ('u', 'p') THEN true ELSE false END AS uniquekey
        FROM pg_attribute f
        JOIN pg_class c ON c.oid = f.attrelid
        LEFT JOIN pg_constraint p ON p.conrelid = c.oid AND f.attnum = ANY (p.conkey)
        LEFT JOIN pg_index AS ix ON f.attnum = ANY(ix.indkey) AND c.oid = ix.indrelid
        LEFT JOIN pg_class AS i ON ix.indexrelid = i.oid
        WHERE c.relkind = 'r'::char
          AND c.relname = $1
          AND f.attnum > 0
          AND NOT f.attisdropped
        ORDER BY f.attnum
        "#,
    )
    .bind(resource_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut schemas = BTreeMap::new();
    for (column, native_type, notnull, index_name, is_index, uniquekey) in rows {
        if column.starts_with('_') {
            continue;
        }
        schemas.insert(
            column,
            ColumnSchema {
                native_type,
                notnull,
                index_name,
                is_index,
                uniquekey,
            },
        );
    }
    Ok(schemas)
}

// =============================================================================
// Schema changes
// =============================================================================

/// Applies `create` requests to the engine
pub(crate) struct SchemaManager<'a> {
    config: &'a StoreConfig,
    catalog: &'a TypeCatalog,
    policy: &'a dyn FieldPolicy,
}

impl<'a> SchemaManager<'a> {
    pub(crate) fn new(
        config: &'a StoreConfig,
        catalog: &'a TypeCatalog,
        policy: &'a dyn FieldPolicy,
    ) -> Self {
        Self {
            config,
            catalog,
            policy,
        }
    }

    fn ddl(&self) -> DdlGenerator<'a> {
        DdlGenerator::new(self.config)
    }

    /// Reject unknown types and unacceptable field names
    pub(crate) async fn check_fields(&self, conn: &mut PgConnection, fields: &[Field]) -> Result<()> {
        for field in fields {
            let type_name = field.type_name();
            if !type_name.is_empty() && !self.is_valid_type(conn, type_name).await? {
                return Err(DatastoreError::validation(
                    "fields",
                    format!("\"{}\" is not a valid field type", type_name),
                ));
            }
            if !self.policy.is_valid_field_name(&field.id) {
                return Err(DatastoreError::validation(
                    "fields",
                    format!("\"{}\" is not a valid field name", field.id),
                ));
            }
        }
        Ok(())
    }

    /// Catalog lookup, falling back to a cast check inside a savepoint
    async fn is_valid_type(&self, conn: &mut PgConnection, type_name: &str) -> Result<bool> {
        if self.catalog.is_known(type_name) {
            return Ok(true);
        }

        sqlx::raw_sql("SAVEPOINT check_field_type")
            .execute(&mut *conn)
            .await?;
        let checked = sqlx::query("SELECT CAST($1 AS regtype)::text")
            .bind(type_name)
            .execute(&mut *conn)
            .await;
        match checked {
            Ok(_) => {
                sqlx::raw_sql("RELEASE SAVEPOINT check_field_type")
                    .execute(&mut *conn)
                    .await?;
                debug!(type_name, "Type passed cast check");
                self.catalog.remember(type_name);
                Ok(true)
            }
            Err(err) if is_bad_type_name(&err) => {
                sqlx::raw_sql("ROLLBACK TO SAVEPOINT check_field_type")
                    .execute(&mut *conn)
                    .await?;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Create the table, its column comments and the full-text trigger.
    ///
    /// Returns every public field of the new table.
    pub(crate) async fn create_table(
        &self,
        conn: &mut PgConnection,
        request: &CreateRequest,
    ) -> Result<Vec<Field>> {
        self.check_fields(conn, &request.fields).await?;
        let (fields, statements) = self.create_table_statements(request)?;

        info!(resource_id = %request.resource_id, columns = fields.len(), "Creating resource table");
        let batch = statements.join(";\n");
        debug!(sql = %batch, "create_table");
        sqlx::raw_sql(&batch).execute(&mut *conn).await?;
        Ok(fields)
    }

    fn create_table_statements(&self, request: &CreateRequest) -> Result<(Vec<Field>, Vec<String>)> {
        let supplied = resolve_supplied_fields(&request.fields, &request.records)?;

        let mut fields = supplied.clone();
        fields.extend(extra_record_fields(&supplied, &request.records)?);

        let ddl = self.ddl();
        let mut statements = vec![ddl.generate_create_table(&request.resource_id, &fields)];
        for (position, field) in supplied.iter().enumerate() {
            let mut comment = request
                .plugin_data
                .get(&position)
                .cloned()
                .unwrap_or_default();
            if let Some(info @ JsonValue::Object(_)) = &field.info {
                comment.insert("_info".to_string(), info.clone());
            }
            if !comment.is_empty() {
                statements.push(ddl.generate_column_comment(
                    &request.resource_id,
                    &field.id,
                    &comment,
                ));
            }
        }
        statements.push(ddl.generate_fulltext_trigger(&request.resource_id));
        Ok((fields, statements))
    }

    /// Add new columns, merge column comments and optionally drop columns
    /// missing from the request
    pub(crate) async fn alter_table(
        &self,
        conn: &mut PgConnection,
        request: &CreateRequest,
    ) -> Result<()> {
        let current = live_fields(conn, &request.resource_id).await?;
        let supplied = if request.fields.is_empty() {
            current.clone()
        } else {
            request.fields.clone()
        };
        self.check_fields(conn, &supplied).await?;

        let raw_info = if !request.plugin_data.is_empty() || supplied.iter().any(|f| f.info.is_some())
        {
            Some(raw_field_info(conn, &request.resource_id).await?)
        } else {
            None
        };

        let statements = self.alter_statements(request, &supplied, &current, raw_info.as_ref())?;
        if statements.is_empty() {
            return Ok(());
        }
        let batch = statements.join(";\n");
        debug!(sql = %batch, "alter_table");
        sqlx::raw_sql(&batch).execute(&mut *conn).await?;
        Ok(())
    }

    fn alter_statements(
        &self,
        request: &CreateRequest,
        supplied: &[Field],
        current: &[Field],
        raw_info: Option<&BTreeMap<String, Map<String, JsonValue>>>,
    ) -> Result<Vec<String>> {
        let resource_id = &request.resource_id;
        let current_ids: HashSet<&str> = current.iter().map(|f| f.id.as_str()).collect();
        let first = request.records.first().and_then(JsonValue::as_object);

        let mut new_fields = Vec::new();
        for field in supplied.iter().filter(|f| !current_ids.contains(f.id.as_str())) {
            new_fields.push(guess_field_type(field, first)?);
        }
        new_fields.extend(extra_record_fields(supplied, &request.records)?);

        let ddl = self.ddl();
        let mut statements: Vec<String> = new_fields
            .iter()
            .map(|field| ddl.generate_add_column(resource_id, field))
            .collect();

        if let Some(raw_info) = raw_info {
            for (position, field) in supplied.iter().enumerate() {
                let mut comment = raw_info.get(&field.id).cloned().unwrap_or_default();
                if let Some(info @ JsonValue::Object(_)) = &field.info {
                    comment.insert("_info".to_string(), info.clone());
                }
                if let Some(data) = request.plugin_data.get(&position) {
                    comment.extend(data.clone());
                }
                statements.push(ddl.generate_column_comment(resource_id, &field.id, &comment));
            }
        }

        if request.delete_fields {
            let keep: HashSet<&str> = supplied
                .iter()
                .chain(&new_fields)
                .map(|f| f.id.as_str())
                .collect();
            for field in current.iter().filter(|f| !keep.contains(f.id.as_str())) {
                statements.push(ddl.generate_drop_column(resource_id, &field.id));
            }
        }
        Ok(statements)
    }

    /// Replace the caller triggers (`t000`, `t001`, ...) on a resource
    pub(crate) async fn create_triggers(
        &self,
        conn: &mut PgConnection,
        resource_id: &str,
        triggers: &[TriggerSpec],
    ) -> Result<()> {
        let existing: Vec<(String,)> = sqlx::query_as(
            "SELECT tgname::text FROM pg_trigger WHERE tgrelid = $1::regclass AND tgname LIKE 't___'",
        )
        .bind(identifier(resource_id))
        .fetch_all(&mut *conn)
        .await?;

        let ddl = self.ddl();
        let statements: Vec<String> = existing
            .iter()
            .map(|(name,)| ddl.generate_drop_trigger(resource_id, name))
            .chain(
                triggers
                    .iter()
                    .enumerate()
                    .map(|(position, t)| ddl.generate_create_trigger(resource_id, position, &t.function)),
            )
            .collect();
        if statements.is_empty() {
            return Ok(());
        }

        sqlx::raw_sql(&statements.join(";\n"))
            .execute(&mut *conn)
            .await
            .map_err(|err| DatastoreError::validation("triggers", summary(&err)))?;
        Ok(())
    }

    /// Bring full-text, unique and declared indexes in line with the request
    pub(crate) async fn create_indexes(
        &self,
        conn: &mut PgConnection,
        request: &CreateRequest,
    ) -> Result<IndexChanges> {
        let resource_id = &request.resource_id;
        let fields = live_fields(conn, resource_id).await?;
        let key = unique_key(conn, resource_id).await?;
        let live = live_indexes(conn, resource_id).await?;
        let language = request
            .language
            .as_deref()
            .unwrap_or(&self.config.default_fts_lang);

        let ddl = self.ddl();
        let plan = ddl.plan_indexes(
            IndexRequest {
                resource_id,
                fields: &fields,
                indexes: request.indexes.as_deref(),
                primary_key: request.primary_key.as_deref(),
                language,
            },
            &key,
            &live,
            self.policy,
        )?;

        for name in &plan.drop {
            debug!(index = %name, "Dropping index");
            sqlx::raw_sql(&ddl.generate_drop_index(name))
                .execute(&mut *conn)
                .await?;
        }
        for (name, sql) in &plan.create {
            debug!(index = %name, sql = %sql, "Creating index");
            sqlx::raw_sql(sql).execute(&mut *conn).await?;
        }

        Ok(IndexChanges {
            created: plan.create.into_iter().map(|(name, _)| name).collect(),
            dropped: plan.drop,
        })
    }

    /// Replace every alias of a resource with `names`
    pub(crate) async fn create_aliases(
        &self,
        conn: &mut PgConnection,
        resource_id: &str,
        names: &[String],
    ) -> Result<()> {
        let ddl = self.ddl();
        for previous in aliases(conn, resource_id).await? {
            sqlx::raw_sql(&ddl.generate_drop_alias(&previous))
                .execute(&mut *conn)
                .await?;
        }

        for alias in names {
            if !self.policy.is_valid_table_name(alias) {
                return Err(DatastoreError::validation(
                    "alias",
                    format!("\"{}\" is not a valid alias name", alias),
                ));
            }
            if !alias_targets(conn, alias).await?.is_empty() {
                return Err(DatastoreError::validation(
                    "alias",
                    format!("The alias \"{}\" already exists.", alias),
                ));
            }
            match sqlx::raw_sql(&ddl.generate_create_alias(alias, resource_id))
                .execute(&mut *conn)
                .await
            {
                Ok(_) => {}
                Err(err)
                    if matches!(
                        sql_state(&err).as_deref(),
                        Some(pg_code::DUPLICATE_TABLE) | Some(pg_code::DUPLICATE_ALIAS)
                    ) =>
                {
                    return Err(DatastoreError::validation(
                        "alias",
                        format!("\"{}\" already exists", alias),
                    ));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn is_bad_type_name(err: &sqlx::Error) -> bool {
    match sql_state(err).as_deref() {
        Some(pg_code::UNDEFINED_OBJECT) | Some(pg_code::SYNTAX_ERROR) => true,
        Some(code) => code.starts_with("22"),
        None => false,
    }
}

/// Give every supplied field a type and check names.
///
/// Missing types are guessed from the first record; ids must fit the
/// identifier limit and be unique.
fn resolve_supplied_fields(supplied: &[Field], records: &[JsonValue]) -> Result<Vec<Field>> {
    let too_long: Vec<String> = supplied
        .iter()
        .filter(|f| f.id.len() > MAX_IDENTIFIER_LENGTH)
        .map(|f| {
            format!(
                "Column heading \"{}\" exceeds limit of {} characters.",
                f.id, MAX_IDENTIFIER_LENGTH
            )
        })
        .collect();
    if !too_long.is_empty() {
        return Err(DatastoreError::validation("fields", too_long.join(" ")));
    }

    let first = records.first().and_then(JsonValue::as_object);
    let fields = supplied
        .iter()
        .map(|field| guess_field_type(field, first))
        .collect::<Result<Vec<_>>>()?;

    let unique: HashSet<&str> = fields.iter().map(|f| f.id.as_str()).collect();
    if unique.len() != fields.len() {
        return Err(DatastoreError::validation(
            "field",
            "Duplicate column names are not supported",
        ));
    }
    Ok(fields)
}

fn guess_field_type(field: &Field, first: Option<&Map<String, JsonValue>>) -> Result<Field> {
    if field.field_type.is_some() {
        return Ok(field.clone());
    }
    match first.and_then(|record| record.get(&field.id)) {
        Some(value) => Ok(Field {
            field_type: Some(guess_type(value).to_string()),
            ..field.clone()
        }),
        None => Err(DatastoreError::validation(
            "fields",
            format!("\"{}\" type not guessable", field.id),
        )),
    }
}

/// Fields for keys of the first record that no supplied field covers
fn extra_record_fields(supplied: &[Field], records: &[JsonValue]) -> Result<Vec<Field>> {
    let Some(first) = records.first() else {
        return Ok(Vec::new());
    };
    let first = first.as_object().ok_or_else(|| {
        DatastoreError::validation("records", "The first row is not a json object")
    })?;

    Ok(first
        .iter()
        .filter(|(key, _)| !supplied.iter().any(|f| &f.id == *key))
        .map(|(key, value)| Field::typed(key.clone(), guess_type(value)))
        .collect())
}
