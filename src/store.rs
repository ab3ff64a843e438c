//! Datastore - Main entry point for the dynamic-schema datastore
//!
//! Every public operation runs in its own transaction with a statement
//! timeout, and translates engine errors into [`DatastoreError`] before
//! returning.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument};

use crate::catalog::TypeCatalog;
use crate::config::StoreConfig;
use crate::error::{DatastoreError, Result, sql_state, summary};
use crate::plugin::{AccessCheck, AllowAll, DatastorePlugin, DefaultFieldPolicy, FieldPolicy};
use crate::records::{
    DeleteRequest, DeleteResult, SearchRequest, SearchResult, UpsertRequest, UpsertResult,
    WriteMethod,
};
use crate::registry::{self, PoolRole};
use crate::resource::{
    CreateRequest, FieldDescription, FunctionDefinition, IndexChanges, ResourceDescriptor,
    ResourceInfo,
};
use crate::schema::{self, SchemaManager};
use crate::search::{Searcher, SqlGuard};
use crate::sql::ddl::{DdlGenerator, FULL_TEXT_TRIGGER_FUNCTION_SQL, TABLE_METADATA_VIEW_SQL};
use crate::sql::introspect::{ParsedSqlIntrospector, SqlIntrospector};
use crate::sql::sanitize::identifier;
use crate::types::Field;
use crate::write::write_records;

/// Dynamic-schema tabular datastore on PostgreSQL
///
/// Queries go through the read pool, mutations through the write pool.
/// Pools are looked up in the process registry on every call, so a store
/// keeps working after [`Datastore::before_fork`] on fresh connections.
pub struct Datastore {
    config: StoreConfig,
    catalog: Arc<TypeCatalog>,
    policy: Arc<dyn FieldPolicy>,
    plugins: Vec<Arc<dyn DatastorePlugin>>,
    access: Arc<dyn AccessCheck>,
    introspector: Arc<dyn SqlIntrospector>,
}

impl Datastore {
    /// Create a Datastore from configuration
    ///
    /// This will:
    /// 1. Validate the connection settings
    /// 2. Load (or reuse) the type catalog, creating the `nested` type if needed
    /// 3. Install the full-text trigger function and the `_table_metadata` view
    pub async fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let write = registry::pool_for(&config.write_url, PoolRole::Write, config.max_connections)?;
        let read = registry::pool_for(&config.read_url, PoolRole::Read, config.max_connections)?;

        let catalog = TypeCatalog::load(&config.write_url, &read, &write)
            .await
            .map_err(DatastoreError::translate)?;

        sqlx::raw_sql(&format!(
            "{};\n{}",
            FULL_TEXT_TRIGGER_FUNCTION_SQL, TABLE_METADATA_VIEW_SQL
        ))
        .execute(&write)
        .await
        .map_err(|err| DatastoreError::from_sql(err, None))?;
        info!("Datastore ready");

        Ok(Self {
            config,
            catalog,
            policy: Arc::new(DefaultFieldPolicy),
            plugins: Vec::new(),
            access: Arc::new(AllowAll),
            introspector: Arc::new(ParsedSqlIntrospector),
        })
    }

    /// Replace the field name and indexing rules
    pub fn with_field_policy(mut self, policy: impl FieldPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Register a plugin; plugins run in registration order
    pub fn with_plugin(mut self, plugin: impl DatastorePlugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Replace the table authorization used by `search_sql`
    pub fn with_access_check(mut self, access: impl AccessCheck + 'static) -> Self {
        self.access = Arc::new(access);
        self
    }

    /// Replace the SQL introspection used by `search_sql`
    pub fn with_introspector(mut self, introspector: impl SqlIntrospector + 'static) -> Self {
        self.introspector = Arc::new(introspector);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Close pooled connections and drop cached catalogs before the process
    /// forks. The next operation on either side opens new connections.
    pub async fn before_fork(&self) {
        registry::dispose().await;
        TypeCatalog::reset();
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    fn pool(&self, role: PoolRole) -> Result<PgPool> {
        let url = match role {
            PoolRole::Read => &self.config.read_url,
            PoolRole::Write => &self.config.write_url,
        };
        registry::pool_for(url, role, self.config.max_connections)
    }

    async fn begin(&self, role: PoolRole) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool(role)?.begin().await?;
        sqlx::raw_sql(&format!(
            "SET LOCAL statement_timeout TO {}",
            self.config.query_timeout_ms
        ))
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }

    async fn read_conn(&self) -> Result<PoolConnection<Postgres>> {
        Ok(self.pool(PoolRole::Read)?.acquire().await?)
    }

    fn schema_manager(&self) -> SchemaManager<'_> {
        SchemaManager::new(&self.config, &self.catalog, self.policy.as_ref())
    }

    fn searcher(&self) -> Searcher<'_> {
        Searcher::new(&self.config, self.policy.as_ref(), &self.plugins)
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Create a resource, or extend an existing one
    ///
    /// Tables are created on first use and altered afterwards. Records are
    /// inserted, then indexes, triggers and aliases are brought in line with
    /// the request, all in one transaction.
    #[instrument(skip(self, request), fields(resource_id = %request.resource_id))]
    pub async fn create(&self, request: CreateRequest) -> Result<ResourceDescriptor> {
        translated(self.create_resource(request)).await
    }

    async fn create_resource(&self, mut request: CreateRequest) -> Result<ResourceDescriptor> {
        let resource_id = request.resource_id.clone();
        if !self.policy.is_valid_table_name(&resource_id) {
            return Err(DatastoreError::validation(
                "resource_id",
                format!("\"{}\" is not a valid resource id", resource_id),
            ));
        }
        request.fields = std::mem::take(&mut request.fields)
            .into_iter()
            .map(Field::into_storage)
            .collect();

        let manager = self.schema_manager();
        let mut tx = self.begin(PoolRole::Write).await?;

        if schema::table_exists(&mut tx, &resource_id).await? {
            manager.alter_table(&mut tx, &request).await?;
        } else {
            manager.create_table(&mut tx, &request).await?;
        }
        if let Some(triggers) = &request.triggers {
            manager.create_triggers(&mut tx, &resource_id, triggers).await?;
        }

        let records = std::mem::take(&mut request.records);
        let records_written = write_records(
            &mut tx,
            &UpsertRequest::new(&resource_id, WriteMethod::Insert).records(records),
        )
        .await?;

        let index_changes = manager.create_indexes(&mut tx, &request).await?;
        if let Some(names) = &request.aliases {
            manager.create_aliases(&mut tx, &resource_id, names).await?;
        }

        let fields = self.described_fields(&mut tx, &resource_id).await?;
        let aliases = schema::aliases(&mut tx, &resource_id).await?;
        tx.commit().await?;

        debug!(records_written, created = index_changes.created.len(), "Resource created");
        Ok(ResourceDescriptor {
            resource_id,
            fields,
            primary_key: request.primary_key,
            indexes: request.indexes,
            aliases,
            records_written,
            index_changes,
        })
    }

    /// Bring full-text, unique and declared indexes in line with `request`
    ///
    /// Running it twice with the same request changes nothing the second time.
    #[instrument(skip(self, request), fields(resource_id = %request.resource_id))]
    pub async fn create_indexes(&self, request: &CreateRequest) -> Result<IndexChanges> {
        translated(async {
            let mut tx = self.begin(PoolRole::Write).await?;
            let changes = self.schema_manager().create_indexes(&mut tx, request).await?;
            tx.commit().await?;
            Ok(changes)
        })
        .await
    }

    /// Drop a resource, or delete the rows matching its filters
    #[instrument(skip(self, request), fields(resource_id = %request.resource_id))]
    pub async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult> {
        translated(self.delete_resource(request)).await
    }

    async fn delete_resource(&self, request: DeleteRequest) -> Result<DeleteResult> {
        let resource_id = &request.resource_id;
        let ddl = DdlGenerator::new(&self.config);
        let mut tx = self.begin(PoolRole::Write).await?;

        let rows_deleted = match &request.filters {
            None => {
                sqlx::raw_sql(&ddl.generate_drop_table(resource_id))
                    .execute(&mut *tx)
                    .await?;
                info!(resource_id = %resource_id, "Dropped resource table");
                None
            }
            Some(_) => {
                let types = schema::fields_types(&mut tx, resource_id).await?;
                let parts = self.searcher().compile_delete(&request, &types)?;
                let sql = ddl.generate_delete(resource_id, &parts.where_sql());
                debug!(sql = %sql, "delete");
                let result = parts
                    .params
                    .bind_to(&sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| match sql_state(&err) {
                        Some(code) if code.starts_with("42") => {
                            DatastoreError::validation("filters", summary(&err))
                        }
                        _ => DatastoreError::from(err),
                    })?;
                Some(result.rows_affected())
            }
        };
        tx.commit().await?;

        Ok(DeleteResult {
            resource_id: resource_id.clone(),
            rows_deleted,
        })
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    /// Insert, update or upsert records
    ///
    /// All records are written in one transaction; a dry run rolls it back.
    #[instrument(skip(self, request), fields(resource_id = %request.resource_id, method = ?request.method))]
    pub async fn upsert(&self, request: UpsertRequest) -> Result<UpsertResult> {
        translated(self.upsert_records(request)).await
    }

    async fn upsert_records(&self, request: UpsertRequest) -> Result<UpsertResult> {
        let mut tx = self.begin(PoolRole::Write).await?;
        if !schema::table_exists(&mut tx, &request.resource_id).await? {
            return Err(DatastoreError::ResourceNotFound(format!(
                "Resource \"{}\" was not found.",
                request.resource_id
            )));
        }

        let written = write_records(&mut tx, &request).await?;
        if request.dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }
        debug!(written, dry_run = request.dry_run, "Records written");

        Ok(UpsertResult {
            resource_id: request.resource_id,
            method: request.method,
            records: request.records,
            dry_run: request.dry_run,
        })
    }

    /// Filtered, sorted and paginated search over one resource
    #[instrument(skip(self, request), fields(resource_id = %request.resource_id))]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResult> {
        translated(async {
            let mut tx = self.begin(PoolRole::Read).await?;
            let result = self.searcher().search(&mut tx, request).await?;
            tx.commit().await?;
            Ok(result)
        })
        .await
    }

    /// Run a caller-written SELECT
    ///
    /// The statement may only read tables the access check allows and call
    /// allow-listed functions. At most `rows_max` records are returned.
    #[instrument(skip(self, sql))]
    pub async fn search_sql(&self, sql: &str) -> Result<SearchResult> {
        let guard = SqlGuard {
            config: &self.config,
            catalog: &self.catalog,
            introspector: self.introspector.as_ref(),
            access: self.access.as_ref(),
        };
        translated(async {
            let wrapped = guard.prepare(sql)?;
            debug!(sql = %wrapped, "search_sql");
            let mut tx = self.begin(PoolRole::Read).await?;
            let result = guard.run(&mut tx, &wrapped).await?;
            tx.commit().await?;
            Ok(result)
        })
        .await
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Whether a table (not an alias) named `resource_id` exists
    pub async fn resource_exists(&self, resource_id: &str) -> Result<bool> {
        translated(async {
            let mut conn = self.read_conn().await?;
            let row: Option<(i32,)> = sqlx::query_as(
                "SELECT 1 FROM \"_table_metadata\" WHERE name = $1 AND alias_of IS NULL",
            )
            .bind(resource_id)
            .fetch_optional(&mut *conn)
            .await?;
            Ok(row.is_some())
        })
        .await
    }

    /// Resolve a name to a resource
    ///
    /// Returns whether the name exists at all and, for aliases, the
    /// resource it points at.
    pub async fn resource_id_from_alias(&self, alias: &str) -> Result<(bool, Option<String>)> {
        translated(async {
            let mut conn = self.read_conn().await?;
            let row: Option<(Option<String>,)> = sqlx::query_as(
                "SELECT alias_of::text FROM \"_table_metadata\" WHERE name = $1",
            )
            .bind(alias)
            .fetch_optional(&mut *conn)
            .await?;
            Ok(match row {
                Some((real_id,)) => (true, real_id),
                None => (false, None),
            })
        })
        .await
    }

    /// Column comments of a resource, keyed by column
    pub async fn resource_plugin_data(
        &self,
        resource_id: &str,
    ) -> Result<BTreeMap<String, Map<String, JsonValue>>> {
        translated(async {
            let mut conn = self.read_conn().await?;
            schema::raw_field_info(&mut conn, resource_id).await
        })
        .await
    }

    /// Fields of a resource with optional size metadata and column details
    #[instrument(skip(self))]
    pub async fn resource_fields(
        &self,
        resource_id: &str,
        include_meta: bool,
        include_schema: bool,
    ) -> Result<ResourceInfo> {
        translated(async {
            let mut conn = self.read_conn().await?;
            let meta = if include_meta {
                Some(schema::resource_meta(&mut conn, resource_id).await?)
            } else {
                None
            };

            let mut schemas = if include_schema {
                schema::column_schemas(&mut conn, resource_id).await?
            } else {
                Default::default()
            };
            let fields = self
                .described_fields(&mut conn, resource_id)
                .await?
                .into_iter()
                .map(|field| FieldDescription {
                    schema: schemas.remove(&field.id),
                    field_type: field.type_name().to_string(),
                    id: field.id,
                    info: field.info,
                })
                .collect();

            Ok(ResourceInfo { meta, fields })
        })
        .await
    }

    /// Ids of every resource table, aliases excluded
    pub async fn get_all_ids(&self) -> Result<Vec<String>> {
        translated(async {
            let mut conn = self.read_conn().await?;
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT name::text FROM \"_table_metadata\" WHERE alias_of IS NULL",
            )
            .fetch_all(&mut *conn)
            .await?;
            Ok(rows.into_iter().map(|(name,)| name).collect())
        })
        .await
    }

    /// Refresh the planner statistics used for estimated totals
    #[instrument(skip(self))]
    pub async fn calculate_record_count(&self, resource_id: &str) -> Result<()> {
        sqlx::raw_sql(&format!("ANALYZE {}", identifier(resource_id)))
            .execute(&self.pool(PoolRole::Write)?)
            .await
            .map_err(|err| DatastoreError::from_sql(err, None))?;
        Ok(())
    }

    // =========================================================================
    // Trigger Functions
    // =========================================================================

    /// Create a plpgsql function for use in resource triggers
    #[instrument(skip(self, function), fields(name = %function.name))]
    pub async fn create_function(&self, function: &FunctionDefinition) -> Result<()> {
        let sql = DdlGenerator::new(&self.config).generate_create_function(function);
        let duplicate = format!(
            "function \"{}\" already exists with same argument types",
            function.name
        );
        self.execute_function_ddl(&sql, |message| {
            if message.contains(&duplicate) {
                "name"
            } else {
                "definition"
            }
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn drop_function(&self, name: &str, if_exists: bool) -> Result<()> {
        let sql = DdlGenerator::new(&self.config).generate_drop_function(name, if_exists);
        self.execute_function_ddl(&sql, |_| "name").await
    }

    async fn execute_function_ddl(
        &self,
        sql: &str,
        error_key: impl Fn(&str) -> &'static str,
    ) -> Result<()> {
        let mut tx = self.begin(PoolRole::Write).await?;
        if let Err(err) = sqlx::raw_sql(sql).execute(&mut *tx).await {
            return Err(match sql_state(&err) {
                Some(code) if code.starts_with("42") => {
                    let message = summary(&err);
                    DatastoreError::validation(error_key(&message), message)
                }
                _ => DatastoreError::from_sql(err, None),
            });
        }
        tx.commit().await.map_err(|err| DatastoreError::from_sql(err, None))
    }

    /// Live fields with their `info`, in column order, `nested` shown as `json`
    async fn described_fields(
        &self,
        conn: &mut PgConnection,
        resource_id: &str,
    ) -> Result<Vec<Field>> {
        let mut info = schema::field_info(conn, resource_id).await?;
        Ok(schema::live_fields(conn, resource_id)
            .await?
            .into_iter()
            .map(|mut field| {
                field.info = info.remove(&field.id);
                field.into_display()
            })
            .collect())
    }
}

/// Run `operation`, translating engine errors on the way out
async fn translated<T>(operation: impl Future<Output = Result<T>>) -> Result<T> {
    operation.await.map_err(DatastoreError::translate)
}
