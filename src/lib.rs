//! # runtara-datastore
//!
//! A dynamic-schema tabular datastore on PostgreSQL.
//!
//! Callers describe tables ("resources") as lists of typed fields, push
//! batches of JSON records into them, and query them back with filters,
//! full-text search, sorting and pagination. Every identifier is quoted and
//! every value is bound, so caller input never reaches SQL text unescaped.
//!
//! ## Features
//!
//! - **Dynamic Resources**: Create tables from field lists, or let types be guessed from the first record
//! - **Insert / Update / Upsert**: Records located by `_id` or the resource's unique key, all-or-nothing per call
//! - **Full-Text Search**: Trigger-maintained `_full_text` column plus per-column text indexes
//! - **Four Output Encodings**: JSON objects, JSON lists, CSV and TSV
//! - **Estimated Totals**: Planner estimates for large unfiltered tables
//! - **SQL Passthrough**: Single SELECT statements with table and function allow-listing
//! - **Plugins**: Hooks that validate requests and add WHERE/SELECT/ORDER BY fragments
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use runtara_datastore::{CreateRequest, Datastore, Field, SearchRequest, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StoreConfig::builder(
//!         "postgres://writer@localhost/datastore",
//!         "postgres://reader@localhost/datastore",
//!     )
//!     .build();
//!     let store = Datastore::new(config).await?;
//!
//!     store
//!         .create(
//!             CreateRequest::new("trees")
//!                 .field(Field::typed("species", "text"))
//!                 .field(Field::typed("height", "numeric"))
//!                 .primary_key(["species"])
//!                 .records(vec![
//!                     serde_json::json!({"species": "oak", "height": 21.5}),
//!                     serde_json::json!({"species": "birch", "height": 12}),
//!                 ]),
//!         )
//!         .await?;
//!
//!     let result = store
//!         .search(&SearchRequest::new("trees").q("oak").sort(["height desc"]))
//!         .await?;
//!     println!("{} of {:?}", result.records.len(), result.total);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use runtara_datastore::StoreConfig;
//!
//! let config = StoreConfig::builder("postgres://w@localhost/db", "postgres://r@localhost/db")
//!     .query_timeout_ms(30_000)     // Per-statement timeout
//!     .rows_max(10_000)             // Cap on limit and on search_sql rows
//!     .sql_search(true)             // Enable search_sql
//!     .allowed_sql_functions(["upper", "lower", "count"])
//!     .build();
//! ```
//!
//! `StoreConfig::from_env()` reads the same settings from `DATASTORE_*`
//! environment variables.

pub mod catalog;
pub mod config;
pub mod error;
pub mod plugin;
pub mod records;
pub mod registry;
pub mod resource;
pub mod schema;
pub mod search;
pub mod sql;
pub mod store;
pub mod types;
mod write;

// Re-export main types for convenience
pub use catalog::TypeCatalog;
pub use config::{StoreConfig, StoreConfigBuilder, load_allowed_functions};
pub use error::{DatastoreError, Result};
pub use plugin::{AccessCheck, AllowAll, DatastorePlugin, DefaultFieldPolicy, FieldPolicy, RequestRef};
pub use records::{
    DeleteRequest, DeleteResult, Links, Records, RecordsFormat, SearchRequest, SearchResult,
    TextQuery, UpsertRequest, UpsertResult, WriteMethod,
};
pub use resource::{
    ArgMode, ColumnSchema, CreateRequest, FieldDescription, FunctionArg, FunctionDefinition,
    IndexChanges, ResourceDescriptor, ResourceInfo, ResourceMeta, TriggerSpec,
};
pub use search::build_links;
pub use store::Datastore;
pub use types::{Field, FieldTypes, Value, guess_type};

// Re-export SQL utilities for advanced users
pub use sql::introspect::{ParsedSqlIntrospector, SqlIntrospector, SqlReferences};
pub use sql::query::{ParamStyle, Params, QueryParts};
pub use sql::sanitize::{identifier, literal_string};
