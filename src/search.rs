//! Search execution
//!
//! Runs compiled searches in every records format, computes exact or
//! estimated totals and builds pagination links. Also hosts the guarded
//! passthrough used by `search_sql`.

use std::sync::Arc;

use futures::TryStreamExt;
use serde_json::{Map, Value as JsonValue};
use sqlx::{Column, Executor, PgConnection, Row, Statement, TypeInfo};
use tracing::debug;

use crate::catalog::TypeCatalog;
use crate::config::StoreConfig;
use crate::error::{DatastoreError, Result, pg_code, sql_state, summary};
use crate::plugin::{AccessCheck, CoreSearch, DatastorePlugin, FieldPolicy, RequestRef};
use crate::records::{DeleteRequest, Links, Records, RecordsFormat, SearchRequest, SearchResult};
use crate::schema::{field_info, fields_types};
use crate::sql::introspect::{SqlIntrospector, is_system_table};
use crate::sql::query::{ESTIMATE_SQL, ParamStyle, QueryParts};
use crate::types::{Field, FieldTypes, is_nested_type};

/// Validates, compiles and runs searches and filtered deletes
pub(crate) struct Searcher<'a> {
    config: &'a StoreConfig,
    policy: &'a dyn FieldPolicy,
    plugins: &'a [Arc<dyn DatastorePlugin>],
}

impl<'a> Searcher<'a> {
    pub(crate) fn new(
        config: &'a StoreConfig,
        policy: &'a dyn FieldPolicy,
        plugins: &'a [Arc<dyn DatastorePlugin>],
    ) -> Self {
        Self {
            config,
            policy,
            plugins,
        }
    }

    /// The built-in compiler followed by the registered plugins
    fn for_each_plugin(
        &self,
        mut f: impl FnMut(&dyn DatastorePlugin) -> Result<()>,
    ) -> Result<()> {
        let core = CoreSearch::new(self.config, self.policy);
        f(&core)?;
        for plugin in self.plugins {
            f(plugin.as_ref())?;
        }
        Ok(())
    }

    pub(crate) fn compile_search(&self, request: &SearchRequest, types: &FieldTypes) -> Result<QueryParts> {
        self.for_each_plugin(|p| p.validate(RequestRef::Search(request), types))?;

        // COPY cannot take bind parameters
        let style = match request.records_format {
            RecordsFormat::Csv | RecordsFormat::Tsv => ParamStyle::Inline,
            RecordsFormat::Objects | RecordsFormat::Lists => ParamStyle::Bound,
        };
        let mut parts = QueryParts::new(style);
        self.for_each_plugin(|p| p.contribute_search(request, types, &mut parts))?;
        Ok(parts)
    }

    pub(crate) fn compile_delete(&self, request: &DeleteRequest, types: &FieldTypes) -> Result<QueryParts> {
        self.for_each_plugin(|p| p.validate(RequestRef::Delete(request), types))?;

        let mut parts = QueryParts::new(ParamStyle::Bound);
        self.for_each_plugin(|p| p.contribute_delete(request, types, &mut parts))?;
        Ok(parts)
    }

    pub(crate) async fn search(
        &self,
        conn: &mut PgConnection,
        request: &SearchRequest,
    ) -> Result<SearchResult> {
        let resource_id = &request.resource_id;
        let mut types = fields_types(conn, resource_id).await?;
        let parts = self.compile_search(request, &types)?;

        let sql = parts.render(resource_id, request.records_format);
        debug!(sql = %sql, params = parts.params.len(), "search");
        let records = fetch_records(conn, &sql, &parts, request.records_format).await?;

        for (alias, _) in &parts.rank_columns {
            types.insert(alias, "float");
        }
        let info = field_info(conn, resource_id).await?;
        let field_ids: Vec<&str> = match &request.fields {
            Some(fields) => fields.iter().map(String::as_str).collect(),
            None => types.ids().collect(),
        };
        let fields = field_ids
            .into_iter()
            .map(|id| {
                let mut field = Field::typed(id, types.get(id).unwrap_or_default());
                field.info = info.get(id).cloned();
                field.into_display()
            })
            .collect();

        let (total, total_was_estimated) = if request.include_total {
            let (total, estimated) = self.total(conn, request, &parts).await?;
            (Some(total), Some(estimated))
        } else {
            (None, None)
        };

        Ok(SearchResult {
            resource_id: Some(resource_id.clone()),
            fields,
            records,
            total,
            total_was_estimated,
            records_truncated: false,
            limit: Some(parts.limit),
            offset: parts.offset,
            links: build_links(request.links_base.as_deref(), parts.limit, parts.offset),
        })
    }

    /// Exact count, or the planner estimate when it is allowed and large
    async fn total(
        &self,
        conn: &mut PgConnection,
        request: &SearchRequest,
        parts: &QueryParts,
    ) -> Result<(i64, bool)> {
        if let Some(threshold) = request.total_estimation_threshold {
            if parts.where_clauses.is_empty() && !parts.distinct {
                let estimate: Option<i64> = sqlx::query_scalar(ESTIMATE_SQL)
                    .bind(&request.resource_id)
                    .fetch_optional(&mut *conn)
                    .await?;
                if let Some(estimate) = estimate.filter(|e| *e >= threshold) {
                    return Ok((estimate, true));
                }
            }
        }

        let sql = parts.count_sql(&request.resource_id);
        let row = parts.params.bind_to(&sql).fetch_one(&mut *conn).await?;
        Ok((row.try_get(0)?, false))
    }
}

async fn fetch_records(
    conn: &mut PgConnection,
    sql: &str,
    parts: &QueryParts,
    format: RecordsFormat,
) -> Result<Records> {
    match format {
        RecordsFormat::Objects | RecordsFormat::Lists => {
            let row = parts.params.bind_to(sql).fetch_one(&mut *conn).await?;
            let text: Option<String> = row.try_get(0)?;
            let text = text.filter(|t| t != "[]");
            Ok(match (format, text) {
                (RecordsFormat::Objects, None) => Records::Objects(Vec::new()),
                (RecordsFormat::Objects, Some(text)) => Records::Objects(serde_json::from_str(&text)?),
                (_, None) => Records::Lists(Vec::new()),
                (_, Some(text)) => Records::Lists(serde_json::from_str(&text)?),
            })
        }
        RecordsFormat::Csv | RecordsFormat::Tsv => {
            let stream = conn.copy_out_raw(sql).await?;
            let bytes = stream
                .try_fold(Vec::new(), |mut buf, chunk| async move {
                    buf.extend_from_slice(&chunk);
                    Ok(buf)
                })
                .await?;
            Ok(Records::Delimited(String::from_utf8_lossy(&bytes).into_owned()))
        }
    }
}

/// Start, next and previous page links.
///
/// Links reuse `base` with its `offset` argument replaced. Without a base
/// they are relative query strings carrying the limit.
pub fn build_links(base: Option<&str>, limit: i64, offset: i64) -> Links {
    let limit_arg = format!("limit={}", limit);
    let (path, args): (&str, Vec<&str>) = match base {
        Some(base) => {
            let (path, query) = base.split_once('?').unwrap_or((base, ""));
            let args = query
                .split('&')
                .filter(|arg| !arg.is_empty() && arg.split('=').next() != Some("offset"))
                .collect();
            (path, args)
        }
        None => ("", vec![limit_arg.as_str()]),
    };

    let render = |offset: Option<i64>| {
        let mut query: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        if let Some(offset) = offset {
            query.push(format!("offset={}", offset));
        }
        if query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, query.join("&"))
        }
    };

    Links {
        start: Some(render(None)),
        next: offset.checked_add(limit).map(|next| render(Some(next))),
        prev: offset
            .checked_sub(limit)
            .filter(|prev| *prev > 0)
            .map(|prev| render(Some(prev))),
    }
}

// =============================================================================
// SQL passthrough
// =============================================================================

/// Collaborators consulted before passthrough SQL runs
pub(crate) struct SqlGuard<'a> {
    pub config: &'a StoreConfig,
    pub catalog: &'a TypeCatalog,
    pub introspector: &'a dyn SqlIntrospector,
    pub access: &'a dyn AccessCheck,
}

impl SqlGuard<'_> {
    /// Wrap `sql` with the row cap and authorize what it touches
    pub(crate) fn prepare(&self, sql: &str) -> Result<String> {
        if !self.config.sql_search_enabled {
            return Err(DatastoreError::not_authorized("SQL search is disabled"));
        }
        if !self.introspector.is_single_statement(sql)? {
            return Err(DatastoreError::validation(
                "query",
                "Query is not a single statement.",
            ));
        }

        let sql = sql.trim().trim_end_matches(';');
        let wrapped = format!(
            "SELECT * FROM ({}) AS blah LIMIT {}",
            sql,
            self.config.rows_max + 1
        );

        let references = self.introspector.referenced_names(&wrapped)?;
        debug!(tables = ?references.tables, functions = ?references.functions, "search_sql references");
        if references.tables.iter().any(|t| is_system_table(t)) {
            return Err(DatastoreError::not_authorized(
                "Not authorized to access system tables",
            ));
        }
        self.access.check_table_access(&references.tables)?;

        let allowed = &self.config.allowed_sql_functions;
        for function in &references.functions {
            let permitted = allowed.contains(&function.to_lowercase())
                || allowed.contains(&format!("\"{}\"", function));
            if !permitted {
                return Err(DatastoreError::not_authorized(format!(
                    "Not authorized to call function {}",
                    function
                )));
            }
        }
        Ok(wrapped)
    }

    /// Run a statement returned by [`SqlGuard::prepare`]
    pub(crate) async fn run(&self, conn: &mut PgConnection, wrapped: &str) -> Result<SearchResult> {
        let statement = (&mut *conn)
            .prepare(wrapped)
            .await
            .map_err(passthrough_error)?;
        let fields: Vec<Field> = statement
            .columns()
            .iter()
            .map(|column| {
                let type_info = column.type_info();
                let type_name = type_info
                    .oid()
                    .and_then(|oid| self.catalog.type_name(oid.0))
                    .map(str::to_string)
                    .unwrap_or_else(|| type_info.name().to_lowercase());
                Field::typed(column.name(), type_name)
            })
            .collect();

        let sql = format!("SELECT row_to_json(r)::text FROM ({}) AS r", wrapped);
        let rows: Vec<String> = sqlx::query_scalar(&sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(passthrough_error)?;

        let mut records = rows
            .iter()
            .map(|row| {
                let record: Map<String, JsonValue> = serde_json::from_str(row)?;
                Ok(unwrap_nested(record, &fields))
            })
            .collect::<Result<Vec<_>>>()?;

        let records_truncated = records.len() as i64 > self.config.rows_max;
        if records_truncated {
            records.pop();
        }

        Ok(SearchResult {
            resource_id: None,
            fields: fields.into_iter().map(Field::into_display).collect(),
            records: Records::Objects(records),
            total: None,
            total_was_estimated: None,
            records_truncated,
            limit: None,
            offset: 0,
            links: Links::default(),
        })
    }
}

/// Replace `nested` composites with their JSON payload
fn unwrap_nested(mut record: Map<String, JsonValue>, fields: &[Field]) -> Map<String, JsonValue> {
    for field in fields.iter().filter(|f| is_nested_type(f.type_name())) {
        if let Some(value) = record.get_mut(&field.id) {
            let payload = match value.get("json") {
                Some(JsonValue::String(text)) => {
                    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.clone()))
                }
                Some(json) => json.clone(),
                None => JsonValue::Null,
            };
            *value = payload;
        }
    }
    record
}

/// Errors from passthrough SQL: permission problems stay authorization
/// errors, other class 42 errors are the caller's malformed query
fn passthrough_error(err: sqlx::Error) -> DatastoreError {
    match sql_state(&err).as_deref() {
        Some(pg_code::PERMISSION_DENIED) => {
            DatastoreError::not_authorized("Not authorized to read resource.")
        }
        Some(code) if code.starts_with("42") => DatastoreError::malformed(
            summary(&err)
                .replace("EXPLAIN (VERBOSE, FORMAT JSON) ", "")
                .replace("EXPLAIN ", ""),
        ),
        _ => DatastoreError::from_sql(err, None),
    }
}
